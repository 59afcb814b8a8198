use inferlink_protocol::{MessageModel, StatusType};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("{0}")]
    Request(String),

    #[error("no group joined")]
    NoGroupBound,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("group is already queued")]
    AlreadyQueued,

    #[error("group is not queued")]
    NotQueued,

    #[error("worker is busy with another job")]
    WorkerBusy,

    #[error("worker error: {0}")]
    WorkerError(String),

    #[error("job aborted by worker")]
    AbortedByWorker,

    #[error("connection manager shut down")]
    ManagerGone,
}

impl BrokerError {
    /// Severity used when the error is reported back to a client.
    pub fn status_type(&self) -> StatusType {
        match self {
            BrokerError::Request(_)
            | BrokerError::NoGroupBound
            | BrokerError::NotFound(_)
            | BrokerError::AlreadyQueued
            | BrokerError::NotQueued
            | BrokerError::WorkerBusy
            | BrokerError::AbortedByWorker => StatusType::Warning,
            BrokerError::WorkerError(_) | BrokerError::ManagerGone => StatusType::Error,
        }
    }

    pub fn to_message(&self) -> MessageModel {
        MessageModel::new(self.status_type(), self.to_string())
    }
}
