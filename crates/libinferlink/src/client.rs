use std::sync::{Arc, Weak};
use std::time::Duration;

use inferlink_protocol::{ClientAction, ClientEvent, MessageModel};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::BrokerError;
use crate::group::Group;
use crate::manager::ConnectionManager;

pub type ClientId = String;

/// A connected end user.
pub struct ClientSession {
    pub id: ClientId,
    tx: mpsc::Sender<ClientEvent>,
    /// Group this client belongs to. Locked before the group's member list.
    pub(crate) group: Mutex<Option<Arc<Group>>>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
    manager: Weak<ConnectionManager>,
}

impl ClientSession {
    pub(crate) fn new(manager: Weak<ConnectionManager>, tx: mpsc::Sender<ClientEvent>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tx,
            group: Mutex::new(None),
            heartbeat: Mutex::new(None),
            manager,
        }
    }

    /// Queue an event for this client without waiting. A full queue drops
    /// the event; every snapshot carries full state so a later one supersedes it.
    pub fn send(&self, event: ClientEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(client_id = %self.id, "outbound queue full, event dropped");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    pub fn notify(&self, message: MessageModel) -> bool {
        self.send(ClientEvent::Message(message))
    }

    pub async fn group(&self) -> Option<Arc<Group>> {
        self.group.lock().await.clone()
    }

    async fn bound_group(&self) -> Result<Arc<Group>, BrokerError> {
        self.group().await.ok_or(BrokerError::NoGroupBound)
    }

    fn manager(&self) -> Result<Arc<ConnectionManager>, BrokerError> {
        self.manager.upgrade().ok_or(BrokerError::ManagerGone)
    }

    pub(crate) async fn start_heartbeat(&self, period: Duration) {
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if tx.send(ClientEvent::Heartbeat).await.is_err() {
                    break;
                }
            }
        });
        if let Some(previous) = self.heartbeat.lock().await.replace(handle) {
            previous.abort();
        }
    }

    /// Execute one client action.
    pub async fn handle(self: &Arc<Self>, action: ClientAction) -> Result<(), BrokerError> {
        debug!(client_id = %self.id, ?action, "client action");
        match action {
            ClientAction::CreateGroup { title } => {
                let group = self.manager()?.create_group(title).await;
                group.add_member(self).await
            }
            ClientAction::JoinGroup { group_id } => {
                let group = self.manager()?.group_by_credential_id(&group_id).await?;
                group.add_member(self).await
            }
            ClientAction::LeaveGroup => {
                self.bound_group().await?.remove_member(self).await;
                Ok(())
            }
            ClientAction::DeleteGroup => self.bound_group().await?.delete().await,
            ClientAction::CreateInteraction { prompt } => {
                self.bound_group().await?.create_interaction(prompt).await
            }
            ClientAction::EditInteraction {
                interaction_id,
                prompt,
            } => {
                self.bound_group()
                    .await?
                    .edit_interaction(&interaction_id, prompt)
                    .await
            }
            ClientAction::DeleteInteraction { interaction_id } => {
                self.bound_group()
                    .await?
                    .delete_interaction(&interaction_id)
                    .await
            }
            ClientAction::AbortInteraction => self.bound_group().await?.abort().await,
        }
    }

    /// Tear down after the connection closed.
    pub async fn disconnect(self: &Arc<Self>) {
        if let Some(heartbeat) = self.heartbeat.lock().await.take() {
            heartbeat.abort();
        }
        if let Some(group) = self.group().await {
            group.remove_member(self).await;
        }
        if let Some(manager) = self.manager.upgrade() {
            manager.unregister_client(self).await;
        }
        info!(client_id = %self.id, "client disconnected");
    }
}
