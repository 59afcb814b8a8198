use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use inferlink_protocol::{
    ChatMessage, WORKER_ACCESS_COOKIE, WorkerCommand, WorkerEvent, decode, encode,
};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::COOKIE;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::error::WorkerClientError;

pub type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

const LOG_PREFIX: &str = "WORKER: ";

fn log(text: impl AsRef<str>) -> WorkerEvent {
    WorkerEvent::Log {
        message: format!("{LOG_PREFIX}{}", text.as_ref()),
    }
}

/// Open the worker channel, presenting `access_key` as a cookie.
pub async fn connect(url: &str, access_key: &str) -> Result<Ws, WorkerClientError> {
    let mut request = url.into_client_request()?;
    request.headers_mut().insert(
        COOKIE,
        HeaderValue::from_str(&format!("{WORKER_ACCESS_COOKIE}={access_key}"))?,
    );
    let (ws, _) = connect_async(request).await?;
    info!(url, "connected to broker");
    Ok(ws)
}

struct RunningJob {
    cancel: CancellationToken,
}

/// Serve jobs on an open worker channel until the broker closes it.
pub async fn serve<B: Backend>(ws: Ws, backend: Arc<B>) -> Result<(), WorkerClientError> {
    let (mut sink, mut stream) = ws.split();
    let (out_tx, mut out_rx) = mpsc::channel::<WorkerEvent>(256);
    let mut job: Option<RunningJob> = None;

    let result = loop {
        tokio::select! {
            Some(event) = out_rx.recv() => {
                if event == WorkerEvent::EndJob {
                    job = None;
                }
                if let Err(err) = sink.send(Message::Text(encode(&event)?.into())).await {
                    break Err(err.into());
                }
            }
            frame = stream.next() => {
                let text = match frame {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(frame))) => {
                        if frame.is_some_and(|f| f.code == CloseCode::Policy) {
                            break Err(WorkerClientError::Unauthorized);
                        }
                        info!("broker closed the connection");
                        break Ok(());
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => break Err(err.into()),
                    None => break Ok(()),
                };
                match decode::<WorkerCommand>(text.as_str()) {
                    Ok(WorkerCommand::StartJob { messages }) => {
                        if job.is_some() {
                            warn!("start_job while busy ignored");
                            let _ = out_tx.send(log("busy, start_job ignored")).await;
                            continue;
                        }
                        let cancel = CancellationToken::new();
                        tokio::spawn(run_job(
                            Arc::clone(&backend),
                            messages,
                            cancel.clone(),
                            out_tx.clone(),
                        ));
                        job = Some(RunningJob { cancel });
                    }
                    Ok(WorkerCommand::AbortRequest) => match &job {
                        Some(running) => {
                            info!("abort requested");
                            running.cancel.cancel();
                        }
                        None => debug!("abort_request without a job"),
                    },
                    Ok(WorkerCommand::Log(message)) => {
                        info!(status = ?message.status, "broker: {}", message.text);
                    }
                    Err(err) => warn!("undecodable broker frame: {err}"),
                }
            }
        }
    };

    if let Some(running) = job {
        running.cancel.cancel();
    }
    result
}

enum JobOutcome {
    Completed,
    Aborted,
    Failed(String),
}

async fn run_job<B: Backend>(
    backend: Arc<B>,
    messages: Vec<ChatMessage>,
    cancel: CancellationToken,
    out: mpsc::Sender<WorkerEvent>,
) {
    debug!(messages = messages.len(), "job started");
    let (chunk_tx, mut chunk_rx) = mpsc::channel::<String>(64);
    let generation = backend.generate(messages, chunk_tx);
    tokio::pin!(generation);

    let outcome = loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break JobOutcome::Aborted,
            Some(text) = chunk_rx.recv() => {
                let _ = out.send(WorkerEvent::Chunk { text }).await;
            }
            result = &mut generation => {
                while let Ok(text) = chunk_rx.try_recv() {
                    let _ = out.send(WorkerEvent::Chunk { text }).await;
                }
                break match result {
                    Ok(()) => JobOutcome::Completed,
                    Err(err) => JobOutcome::Failed(err.to_string()),
                };
            }
        }
    };

    match outcome {
        JobOutcome::Completed => debug!("job completed"),
        JobOutcome::Aborted => {
            let _ = out.send(WorkerEvent::Aborted).await;
        }
        JobOutcome::Failed(message) => {
            warn!(%message, "backend failed");
            let _ = out.send(WorkerEvent::Error { message }).await;
        }
    }
    let _ = out.send(WorkerEvent::EndJob).await;
}
