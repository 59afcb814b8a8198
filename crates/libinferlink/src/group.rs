use std::collections::HashMap;
use std::sync::{Arc, Weak};

use inferlink_protocol::{
    ClientEvent, GroupCredential, GroupId, GroupInfos, GroupStatus, Interaction,
    InteractionStatus, MessageModel,
};
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

use crate::client::{ClientId, ClientSession};
use crate::context::ChatContext;
use crate::error::BrokerError;
use crate::manager::ConnectionManager;
use crate::worker::{JobTicket, WorkerSession};

#[derive(Default)]
struct Members {
    sessions: HashMap<ClientId, Arc<ClientSession>>,
    /// Set once the group is deleted; no one may join afterwards.
    closed: bool,
}

/// A shared chat session: members, one interaction history, and at most one
/// job in flight.
pub struct Group {
    id: GroupId,
    infos: watch::Sender<GroupInfos>,
    context: Mutex<ChatContext>,
    members: Mutex<Members>,
    worker: Mutex<Option<Arc<WorkerSession>>>,
    manager: Weak<ConnectionManager>,
}

impl Group {
    pub(crate) fn new(manager: Weak<ConnectionManager>, title: String, system_prompt: &str) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        let (infos, _) = watch::channel(GroupInfos {
            credential: GroupCredential {
                id: id.clone(),
                title,
            },
            status: GroupStatus::Idle,
            queue_position: 0,
        });
        Self {
            id,
            infos,
            context: Mutex::new(ChatContext::new(system_prompt)),
            members: Mutex::new(Members::default()),
            worker: Mutex::new(None),
            manager,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn infos(&self) -> GroupInfos {
        self.infos.borrow().clone()
    }

    pub fn credential(&self) -> GroupCredential {
        self.infos.borrow().credential.clone()
    }

    pub async fn history(&self) -> Vec<Interaction> {
        self.context.lock().await.history().to_vec()
    }

    pub async fn active_interaction(&self) -> Option<Interaction> {
        self.context.lock().await.active().cloned()
    }

    pub async fn member_count(&self) -> usize {
        self.members.lock().await.sessions.len()
    }

    pub async fn bound_worker(&self) -> Option<Arc<WorkerSession>> {
        self.worker.lock().await.clone()
    }

    fn manager(&self) -> Result<Arc<ConnectionManager>, BrokerError> {
        self.manager.upgrade().ok_or(BrokerError::ManagerGone)
    }

    // -- membership ---------------------------------------------------------

    /// Add a client, moving it out of whatever group it was in, then bring it
    /// up to date with the current infos and full history.
    pub async fn add_member(self: &Arc<Self>, client: &Arc<ClientSession>) -> Result<(), BrokerError> {
        let previous = {
            let mut bound = client.group.lock().await;
            {
                let mut members = self.members.lock().await;
                if members.closed {
                    return Err(BrokerError::NotFound(format!("group {}", self.id)));
                }
                members
                    .sessions
                    .insert(client.id.clone(), Arc::clone(client));
            }
            bound.replace(Arc::clone(self))
        };
        if let Some(previous) = previous.filter(|p| p.id != self.id) {
            previous.forget_member(&client.id).await;
            info!(group_id = %previous.id, client_id = %client.id, "client left group");
            client.send(ClientEvent::GroupInfos(GroupInfos::default()));
        }

        info!(group_id = %self.id, client_id = %client.id, "client joined group");
        client.send(ClientEvent::GroupInfos(self.infos()));
        for interaction in self.history().await {
            client.send(ClientEvent::Interaction(interaction));
        }
        Ok(())
    }

    /// Detach a client from this group in both directions.
    pub async fn remove_member(&self, client: &Arc<ClientSession>) {
        {
            let mut bound = client.group.lock().await;
            if bound.as_ref().is_some_and(|g| g.id == self.id) {
                *bound = None;
            }
        }
        self.forget_member(&client.id).await;
        info!(group_id = %self.id, client_id = %client.id, "client left group");
        client.send(ClientEvent::GroupInfos(GroupInfos::default()));
    }

    async fn forget_member(&self, client_id: &str) {
        self.members.lock().await.sessions.remove(client_id);
    }

    /// Unregister, abort whatever is pending, and detach every member.
    pub async fn delete(self: &Arc<Self>) -> Result<(), BrokerError> {
        let manager = self.manager()?;
        manager.unregister_group(self).await;

        if self.infos().status == GroupStatus::Processing {
            match self.abort().await {
                Ok(()) | Err(BrokerError::Request(_)) => {}
                Err(err) => warn!(group_id = %self.id, error = %err, "abort during delete failed"),
            }
        }

        let members: Vec<_> = {
            let mut members = self.members.lock().await;
            members.closed = true;
            members.sessions.values().cloned().collect()
        };
        for member in &members {
            member.notify(MessageModel::info(format!(
                "group \"{}\" was deleted",
                self.credential().title
            )));
            self.remove_member(member).await;
        }
        info!(group_id = %self.id, "group deleted");
        Ok(())
    }

    // -- fan-out ------------------------------------------------------------

    pub(crate) async fn broadcast(&self, event: ClientEvent) {
        let members: Vec<_> = self.members.lock().await.sessions.values().cloned().collect();
        for member in members {
            member.send(event.clone());
        }
    }

    pub(crate) async fn broadcast_infos(&self) {
        self.broadcast(ClientEvent::GroupInfos(self.infos())).await;
    }

    pub(crate) fn set_queue_position(&self, position: usize) {
        self.infos.send_modify(|infos| infos.queue_position = position);
    }

    pub(crate) async fn bind_worker(&self, worker: Arc<WorkerSession>) {
        *self.worker.lock().await = Some(worker);
    }

    pub(crate) async fn unbind_worker(&self, worker_id: &str) {
        let mut bound = self.worker.lock().await;
        if bound.as_ref().is_some_and(|w| w.id == worker_id) {
            *bound = None;
        }
    }

    // -- interactions -------------------------------------------------------

    pub async fn create_interaction(self: &Arc<Self>, prompt: String) -> Result<(), BrokerError> {
        let manager = self.manager()?;
        let interaction = {
            let mut context = self.context.lock().await;
            let interaction = context.create_interaction(prompt)?;
            interaction.status = InteractionStatus::Queued;
            interaction.clone()
        };
        self.submit(&manager, interaction).await
    }

    pub async fn edit_interaction(
        self: &Arc<Self>,
        interaction_id: &str,
        prompt: String,
    ) -> Result<(), BrokerError> {
        let manager = self.manager()?;
        let interaction = {
            let mut context = self.context.lock().await;
            let interaction = context.edit_interaction(interaction_id, prompt)?;
            interaction.status = InteractionStatus::Queued;
            interaction.clone()
        };
        self.submit(&manager, interaction).await
    }

    async fn submit(
        self: &Arc<Self>,
        manager: &Arc<ConnectionManager>,
        interaction: Interaction,
    ) -> Result<(), BrokerError> {
        debug!(group_id = %self.id, interaction_id = %interaction.id, "interaction queued");
        self.infos
            .send_modify(|infos| infos.status = GroupStatus::Processing);
        self.broadcast(ClientEvent::Interaction(interaction)).await;
        self.broadcast_infos().await;

        if let Err(err) = manager.enqueue(self).await {
            self.conclude(InteractionStatus::Failed).await;
            return Err(err);
        }
        Ok(())
    }

    pub async fn delete_interaction(&self, interaction_id: &str) -> Result<(), BrokerError> {
        let removed = self
            .context
            .lock()
            .await
            .remove_interaction(interaction_id)?;
        debug!(group_id = %self.id, interaction_id = %removed.id, "interaction deleted");
        self.broadcast(ClientEvent::Interaction(removed)).await;
        Ok(())
    }

    pub(crate) async fn append_chunk(&self, chunk: &str) {
        let updated = self.context.lock().await.append_to_active(chunk);
        match updated {
            Some(interaction) => self.broadcast(ClientEvent::Interaction(interaction)).await,
            None => debug!(group_id = %self.id, "chunk without active interaction dropped"),
        }
    }

    /// Finish the active interaction with `status` and return the group to idle.
    async fn conclude(&self, status: InteractionStatus) -> Option<Interaction> {
        let finished = self.context.lock().await.finish_active(status);
        *self.worker.lock().await = None;
        if let Some(interaction) = &finished {
            self.broadcast(ClientEvent::Interaction(interaction.clone()))
                .await;
        }
        // Waiters on idle may detach members; they must have the result first.
        self.infos.send_modify(|infos| {
            infos.status = GroupStatus::Idle;
            infos.queue_position = 0;
        });
        self.broadcast_infos().await;
        finished
    }

    // -- jobs ---------------------------------------------------------------

    /// Drive a reserved worker through one job. Spawned by the dispatcher.
    pub(crate) async fn run_job(self: Arc<Self>, worker: Arc<WorkerSession>, ticket: JobTicket) {
        let (transcript, started) = {
            let mut context = self.context.lock().await;
            let started = context.set_active_status(InteractionStatus::Processing);
            (context.transcript(), started)
        };
        let Some(started) = started else {
            warn!(group_id = %self.id, worker_id = %worker.id, "dispatched without an active interaction");
            worker.abandon(ticket).await;
            self.conclude(InteractionStatus::Failed).await;
            return;
        };

        info!(
            group_id = %self.id,
            worker_id = %worker.id,
            interaction_id = %started.id,
            "job started"
        );
        self.broadcast(ClientEvent::Interaction(started)).await;

        let outcome = worker.execute(ticket, transcript).await;
        let status = match &outcome {
            Ok(()) => InteractionStatus::Completed,
            Err(BrokerError::AbortedByWorker) => InteractionStatus::Aborted,
            Err(_) => InteractionStatus::Failed,
        };
        self.conclude(status).await;

        match outcome {
            Ok(()) => info!(group_id = %self.id, worker_id = %worker.id, "job completed"),
            Err(BrokerError::AbortedByWorker) => {
                info!(group_id = %self.id, worker_id = %worker.id, "job aborted");
                self.broadcast(ClientEvent::Message(MessageModel::warning(
                    "interaction aborted",
                )))
                .await;
            }
            Err(err) => {
                warn!(group_id = %self.id, worker_id = %worker.id, error = %err, "job failed");
                self.broadcast(ClientEvent::Message(err.to_message())).await;
            }
        }

        if let Some(manager) = self.manager.upgrade() {
            manager.dispatch().await;
        }
    }

    /// Stop the pending interaction.
    ///
    /// A queued group leaves the queue without any worker contact. A running
    /// job gets an abort request and this call waits until the job is over,
    /// however long the worker takes.
    pub async fn abort(self: &Arc<Self>) -> Result<(), BrokerError> {
        let manager = self.manager()?;
        match manager.dequeue_if_present(self).await {
            Ok(()) => {
                info!(group_id = %self.id, "queued interaction aborted");
                self.conclude(InteractionStatus::Aborted).await;
                return Ok(());
            }
            Err(BrokerError::NotQueued) => {}
            Err(err) => return Err(err),
        }

        let mut status = self.infos.subscribe();
        let Some(worker) = self.bound_worker().await else {
            return Err(BrokerError::Request(
                "no interaction in progress".to_string(),
            ));
        };

        info!(group_id = %self.id, worker_id = %worker.id, "abort requested");
        if !worker.request_abort(self).await {
            debug!(group_id = %self.id, worker_id = %worker.id, "job already over, waiting for it to settle");
        }
        let finished = status
            .wait_for(|infos| infos.status == GroupStatus::Idle)
            .await
            .is_ok();
        if !finished {
            return Err(BrokerError::ManagerGone);
        }
        Ok(())
    }
}
