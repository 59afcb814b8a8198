use std::future::Future;
use std::time::Duration;

use inferlink_protocol::{ChatMessage, Role};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct BackendError(pub String);

/// Something that turns a transcript into streamed text.
///
/// Implementations push chunks into `chunks` as they are produced and return
/// once the response is complete. The runner may drop the future at any await
/// point when the job is aborted.
pub trait Backend: Send + Sync + 'static {
    fn generate(
        &self,
        messages: Vec<ChatMessage>,
        chunks: mpsc::Sender<String>,
    ) -> impl Future<Output = Result<(), BackendError>> + Send;
}

/// Streams the last user prompt back word by word.
#[derive(Debug, Clone, Default)]
pub struct EchoBackend {
    delay: Duration,
}

impl EchoBackend {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Backend for EchoBackend {
    fn generate(
        &self,
        messages: Vec<ChatMessage>,
        chunks: mpsc::Sender<String>,
    ) -> impl Future<Output = Result<(), BackendError>> + Send {
        let delay = self.delay;
        async move {
            let prompt = messages
                .into_iter()
                .rev()
                .find(|m| m.role == Role::User)
                .map(|m| m.content)
                .ok_or_else(|| BackendError("transcript has no user message".to_string()))?;

            for (index, word) in prompt.split_inclusive(' ').enumerate() {
                if index > 0 && !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                chunks
                    .send(word.to_string())
                    .await
                    .map_err(|_| BackendError("output channel closed".to_string()))?;
            }
            Ok(())
        }
    }
}
