use std::sync::{Arc, Weak};

use inferlink_protocol::{ChatMessage, WorkerCommand, WorkerEvent};
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::error::BrokerError;
use crate::group::Group;
use crate::manager::ConnectionManager;

pub type WorkerId = String;

/// Non-success outcome a worker reported for its current job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobFailure {
    Aborted,
    Error(String),
}

struct ActiveJob {
    group: Arc<Group>,
    /// Last failure reported before `end_job`, if any.
    failure: Option<JobFailure>,
    done: Option<oneshot::Sender<Option<JobFailure>>>,
    started: bool,
    abort_requested: bool,
}

#[derive(Default)]
struct JobSlot {
    active: Option<ActiveJob>,
    closed: bool,
}

/// Proof that a worker has been reserved for a group. Consumed by
/// [`WorkerSession::execute`].
pub struct JobTicket {
    done: oneshot::Receiver<Option<JobFailure>>,
}

/// A connected worker, able to run one job at a time.
pub struct WorkerSession {
    pub id: WorkerId,
    tx: mpsc::Sender<WorkerCommand>,
    job: Mutex<JobSlot>,
    manager: Weak<ConnectionManager>,
}

impl WorkerSession {
    pub(crate) fn new(manager: Weak<ConnectionManager>, tx: mpsc::Sender<WorkerCommand>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tx,
            job: Mutex::new(JobSlot::default()),
            manager,
        }
    }

    pub async fn is_idle(&self) -> bool {
        let slot = self.job.lock().await;
        !slot.closed && slot.active.is_none()
    }

    /// Group whose job this worker is running, if any.
    pub async fn current_group(&self) -> Option<Arc<Group>> {
        self.job
            .lock()
            .await
            .active
            .as_ref()
            .map(|job| Arc::clone(&job.group))
    }

    /// Send a command to the worker's connection. Returns false once the
    /// connection is gone.
    pub async fn send(&self, command: WorkerCommand) -> bool {
        self.tx.send(command).await.is_ok()
    }

    /// Claim this worker for `group`. Fails with [`BrokerError::WorkerBusy`]
    /// while another job holds it.
    pub(crate) async fn reserve(&self, group: &Arc<Group>) -> Result<JobTicket, BrokerError> {
        let mut slot = self.job.lock().await;
        if slot.closed {
            return Err(BrokerError::WorkerError("worker disconnected".to_string()));
        }
        if slot.active.is_some() {
            return Err(BrokerError::WorkerBusy);
        }
        let (done, rx) = oneshot::channel();
        slot.active = Some(ActiveJob {
            group: Arc::clone(group),
            failure: None,
            done: Some(done),
            started: false,
            abort_requested: false,
        });
        Ok(JobTicket { done: rx })
    }

    /// Reserve this worker and run one job to its end.
    pub async fn run_job(
        &self,
        group: &Arc<Group>,
        transcript: Vec<ChatMessage>,
    ) -> Result<(), BrokerError> {
        let ticket = self.reserve(group).await?;
        self.execute(ticket, transcript).await
    }

    /// Start a reserved job and wait for the worker to end it. The worker is
    /// released and the queue re-dispatched before this returns.
    pub(crate) async fn execute(
        &self,
        ticket: JobTicket,
        transcript: Vec<ChatMessage>,
    ) -> Result<(), BrokerError> {
        let abort_pending = {
            let mut slot = self.job.lock().await;
            match slot.active.as_mut() {
                Some(job) => {
                    job.started = true;
                    job.abort_requested
                }
                None => false,
            }
        };

        debug!(worker_id = %self.id, messages = transcript.len(), "sending start_job");
        if !self
            .send(WorkerCommand::StartJob {
                messages: transcript,
            })
            .await
        {
            self.settle(Some(JobFailure::Error(
                "worker connection closed".to_string(),
            )))
            .await;
        } else if abort_pending {
            self.send(WorkerCommand::AbortRequest).await;
        }

        let failure = ticket.done.await.unwrap_or_else(|_| {
            Some(JobFailure::Error("job ended without a result".to_string()))
        });
        self.release().await;

        match failure {
            None => Ok(()),
            Some(JobFailure::Aborted) => Err(BrokerError::AbortedByWorker),
            Some(JobFailure::Error(message)) => Err(BrokerError::WorkerError(message)),
        }
    }

    /// Give back a reservation that will never be started.
    pub(crate) async fn abandon(&self, ticket: JobTicket) {
        drop(ticket);
        self.release().await;
    }

    /// Free the slot and detach the finished group before anyone else can be
    /// dispatched here.
    async fn release(&self) {
        let finished = self.job.lock().await.active.take();
        if let Some(job) = finished {
            job.group.unbind_worker(&self.id).await;
        }
        if let Some(manager) = self.manager.upgrade() {
            manager.dispatch().await;
        }
    }

    /// Ask the worker to stop the job it runs for `group`. If the job has not
    /// been sent yet the request is forwarded right after `start_job`.
    /// Returns false when the worker is not running anything for `group`.
    pub async fn request_abort(&self, group: &Group) -> bool {
        let forward = {
            let mut slot = self.job.lock().await;
            let Some(job) = slot
                .active
                .as_mut()
                .filter(|job| job.group.id() == group.id())
            else {
                return false;
            };
            job.abort_requested = true;
            job.started
        };
        if forward {
            self.send(WorkerCommand::AbortRequest).await;
        }
        true
    }

    /// Record a failure for the current job.
    async fn record(&self, failure: JobFailure) {
        let mut slot = self.job.lock().await;
        match slot.active.as_mut() {
            Some(job) => job.failure = Some(failure),
            None => debug!(worker_id = %self.id, ?failure, "outcome without active job ignored"),
        }
    }

    /// Wake the job's runner with `override_failure`, or with whatever was
    /// recorded when none is given.
    async fn settle(&self, override_failure: Option<JobFailure>) -> bool {
        let mut slot = self.job.lock().await;
        let Some(job) = slot.active.as_mut() else {
            return false;
        };
        if override_failure.is_some() {
            job.failure = override_failure;
        }
        match job.done.take() {
            Some(done) => {
                let _ = done.send(job.failure.clone());
                true
            }
            None => false,
        }
    }

    /// Apply one event received from the worker.
    pub async fn handle_event(&self, event: WorkerEvent) {
        match event {
            WorkerEvent::Chunk { text } => match self.current_group().await {
                Some(group) => group.append_chunk(&text).await,
                None => debug!(worker_id = %self.id, "chunk without active job ignored"),
            },
            WorkerEvent::Error { message } => {
                warn!(worker_id = %self.id, %message, "worker reported an error");
                self.record(JobFailure::Error(message)).await;
            }
            WorkerEvent::Aborted => self.record(JobFailure::Aborted).await,
            WorkerEvent::EndJob => {
                if !self.settle(None).await {
                    debug!(worker_id = %self.id, "end_job without active job ignored");
                }
            }
            WorkerEvent::Log { message } => info!(worker_id = %self.id, "{message}"),
        }
    }

    /// Tear down after the connection closed. A job in flight fails.
    pub async fn disconnect(self: &Arc<Self>) {
        self.job.lock().await.closed = true;
        if let Some(manager) = self.manager.upgrade() {
            manager.unregister_worker(self).await;
        }
        if self
            .settle(Some(JobFailure::Error("worker disconnected".to_string())))
            .await
        {
            warn!(worker_id = %self.id, "worker disconnected during a job");
        }
        info!(worker_id = %self.id, "worker disconnected");
    }
}
