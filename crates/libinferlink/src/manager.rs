use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use inferlink_protocol::{
    ClientEvent, GroupCredential, GroupId, Population, WorkerCommand,
};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info};

use crate::client::{ClientId, ClientSession};
use crate::config::BrokerConfig;
use crate::error::BrokerError;
use crate::group::Group;
use crate::worker::WorkerSession;

pub const DEFAULT_GROUP_TITLE: &str = "New chat";

/// Process-wide registries plus the FIFO of groups waiting for a worker.
///
/// Each registry has its own lock. The queue lock doubles as the dispatch
/// lock; while it is held, worker slots and group worker bindings may be
/// locked after it, never before.
pub struct ConnectionManager {
    config: BrokerConfig,
    groups: Mutex<Vec<Arc<Group>>>,
    clients: Mutex<HashMap<ClientId, Arc<ClientSession>>>,
    workers: Mutex<Vec<Arc<WorkerSession>>>,
    queue: Mutex<VecDeque<Arc<Group>>>,
}

impl ConnectionManager {
    pub fn new(config: BrokerConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            groups: Mutex::new(Vec::new()),
            clients: Mutex::new(HashMap::new()),
            workers: Mutex::new(Vec::new()),
            queue: Mutex::new(VecDeque::new()),
        })
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    // -- clients ------------------------------------------------------------

    pub async fn register_client(
        self: &Arc<Self>,
        tx: mpsc::Sender<ClientEvent>,
    ) -> Arc<ClientSession> {
        let client = Arc::new(ClientSession::new(Arc::downgrade(self), tx));
        self.clients
            .lock()
            .await
            .insert(client.id.clone(), Arc::clone(&client));
        client.start_heartbeat(self.config.heartbeat_interval()).await;
        info!(client_id = %client.id, "client connected");

        self.broadcast_population().await;
        client.send(ClientEvent::GroupDirectory(self.group_directory().await));
        client
    }

    pub async fn unregister_client(&self, client: &ClientSession) {
        let removed = self.clients.lock().await.remove(&client.id).is_some();
        if removed {
            self.broadcast_population().await;
        }
    }

    // -- workers ------------------------------------------------------------

    pub async fn register_worker(
        self: &Arc<Self>,
        tx: mpsc::Sender<WorkerCommand>,
    ) -> Arc<WorkerSession> {
        let worker = Arc::new(WorkerSession::new(Arc::downgrade(self), tx));
        self.workers.lock().await.push(Arc::clone(&worker));
        info!(worker_id = %worker.id, "worker connected");

        self.broadcast_population().await;
        self.dispatch().await;
        worker
    }

    pub async fn unregister_worker(&self, worker: &WorkerSession) {
        let removed = {
            let mut workers = self.workers.lock().await;
            let before = workers.len();
            workers.retain(|w| w.id != worker.id);
            workers.len() != before
        };
        if removed {
            self.broadcast_population().await;
        }
    }

    // -- groups -------------------------------------------------------------

    pub async fn create_group(self: &Arc<Self>, title: Option<String>) -> Arc<Group> {
        let title = title
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| DEFAULT_GROUP_TITLE.to_string());
        let group = Arc::new(Group::new(
            Arc::downgrade(self),
            title,
            &self.config.system_prompt,
        ));
        self.groups.lock().await.push(Arc::clone(&group));
        info!(group_id = %group.id(), "group created");

        self.broadcast_population().await;
        self.broadcast_directory().await;
        group
    }

    pub async fn unregister_group(&self, group: &Group) {
        let removed = {
            let mut groups = self.groups.lock().await;
            let before = groups.len();
            groups.retain(|g| g.id() != group.id());
            groups.len() != before
        };
        if removed {
            self.broadcast_population().await;
            self.broadcast_directory().await;
        }
    }

    pub async fn group_by_credential_id(&self, group_id: &str) -> Result<Arc<Group>, BrokerError> {
        self.groups
            .lock()
            .await
            .iter()
            .find(|g| g.id() == group_id)
            .cloned()
            .ok_or_else(|| BrokerError::NotFound(format!("group {group_id}")))
    }

    // -- queue --------------------------------------------------------------

    /// Append `group` to the waiting queue and try to dispatch.
    pub async fn enqueue(self: &Arc<Self>, group: &Arc<Group>) -> Result<(), BrokerError> {
        let touched = {
            let mut queue = self.queue.lock().await;
            if queue.iter().any(|g| g.id() == group.id()) {
                return Err(BrokerError::AlreadyQueued);
            }
            queue.push_back(Arc::clone(group));
            renumber(&queue)
        };
        debug!(group_id = %group.id(), position = touched.len(), "group enqueued");
        for waiting in touched {
            waiting.broadcast_infos().await;
        }
        self.broadcast_population().await;
        self.dispatch().await;
        Ok(())
    }

    /// Remove `group` from the waiting queue if it is there.
    pub async fn dequeue_if_present(&self, group: &Group) -> Result<(), BrokerError> {
        let touched = {
            let mut queue = self.queue.lock().await;
            let position = queue
                .iter()
                .position(|g| g.id() == group.id())
                .ok_or(BrokerError::NotQueued)?;
            queue.remove(position);
            group.set_queue_position(0);
            renumber(&queue)
        };
        debug!(group_id = %group.id(), "group dequeued");
        group.broadcast_infos().await;
        for waiting in touched {
            waiting.broadcast_infos().await;
        }
        self.broadcast_population().await;
        Ok(())
    }

    /// Pair waiting groups with idle workers, head of the queue first.
    ///
    /// Calling this with nothing to do is a no-op, so every event that might
    /// free capacity can simply call it.
    pub fn dispatch(self: &Arc<Self>) -> BoxFuture<'_, ()> {
        async move {
            let mut started = Vec::new();
            let touched = {
                let mut queue = self.queue.lock().await;
                if queue.is_empty() {
                    return;
                }
                let workers = self.workers.lock().await.clone();
                for worker in workers {
                    let Some(head) = queue.front().cloned() else {
                        break;
                    };
                    let Ok(ticket) = worker.reserve(&head).await else {
                        continue;
                    };
                    queue.pop_front();
                    head.bind_worker(Arc::clone(&worker)).await;
                    head.set_queue_position(0);
                    started.push((head, worker, ticket));
                }
                if started.is_empty() {
                    return;
                }
                renumber(&queue)
            };

            for (group, worker, ticket) in started {
                info!(group_id = %group.id(), worker_id = %worker.id, "dispatched group to worker");
                group.broadcast_infos().await;
                tokio::spawn(group.run_job(worker, ticket));
            }
            for waiting in touched {
                waiting.broadcast_infos().await;
            }
            self.broadcast_population().await;
        }
        .boxed()
    }

    // -- snapshots ----------------------------------------------------------

    pub async fn population(&self) -> Population {
        let clients = self.clients.lock().await.len();
        let workers = self.workers.lock().await.len();
        let groups = self.groups.lock().await.len();
        let waiting = self.queue.lock().await.len();
        Population {
            clients,
            workers,
            groups,
            waiting,
        }
    }

    pub async fn queued_group_ids(&self) -> Vec<GroupId> {
        self.queue
            .lock()
            .await
            .iter()
            .map(|g| g.id().to_string())
            .collect()
    }

    pub async fn group_directory(&self) -> Vec<GroupCredential> {
        self.groups
            .lock()
            .await
            .iter()
            .map(|g| g.credential())
            .collect()
    }

    pub async fn workers(&self) -> Vec<Arc<WorkerSession>> {
        self.workers.lock().await.clone()
    }

    async fn clients_snapshot(&self) -> Vec<Arc<ClientSession>> {
        self.clients.lock().await.values().cloned().collect()
    }

    async fn broadcast_population(&self) {
        let event = ClientEvent::Population(self.population().await);
        for client in self.clients_snapshot().await {
            client.send(event.clone());
        }
    }

    async fn broadcast_directory(&self) {
        let event = ClientEvent::GroupDirectory(self.group_directory().await);
        for client in self.clients_snapshot().await {
            client.send(event.clone());
        }
    }
}

/// Give every queued group its 1-based position. Called with the queue locked;
/// the returned groups need their infos broadcast once it is released.
fn renumber(queue: &VecDeque<Arc<Group>>) -> Vec<Arc<Group>> {
    queue
        .iter()
        .enumerate()
        .map(|(index, group)| {
            group.set_queue_position(index + 1);
            Arc::clone(group)
        })
        .collect()
}
