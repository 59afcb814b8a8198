use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, close_code};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use inferlink_protocol::{
    ClientAction, ClientEvent, Envelope, MessageModel, WorkerCommand, WorkerEvent, decode, encode,
};
use libinferlink::ConnectionManager;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const UNAUTHORIZED: &str = "Unauthorized: Invalid key";

/// Drain `rx` into the socket until either side goes away.
fn spawn_writer<T>(mut ws_tx: SplitSink<WebSocket, Message>, mut rx: mpsc::Receiver<T>) -> JoinHandle<()>
where
    T: Envelope + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            let text = match encode(&envelope) {
                Ok(text) => text,
                Err(err) => {
                    warn!("failed to encode outbound frame: {err}");
                    continue;
                }
            };
            if ws_tx.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    })
}

/// Next text frame, or `None` once the peer is gone.
async fn next_text(ws_rx: &mut SplitStream<WebSocket>) -> Option<String> {
    while let Some(frame) = ws_rx.next().await {
        match frame {
            Ok(Message::Text(text)) => return Some(text.to_string()),
            Ok(Message::Close(_)) => return None,
            Ok(Message::Binary(_)) => debug!("binary frame ignored"),
            Ok(Message::Ping(_) | Message::Pong(_)) => {}
            Err(err) => {
                debug!("websocket read failed: {err}");
                return None;
            }
        }
    }
    None
}

pub async fn serve_client(socket: WebSocket, manager: Arc<ConnectionManager>) {
    let (ws_tx, mut ws_rx) = socket.split();
    let (tx, rx) = mpsc::channel(manager.config().outbound_buffer);
    let client = manager.register_client(tx).await;
    let writer = spawn_writer(ws_tx, rx);

    while let Some(text) = next_text(&mut ws_rx).await {
        match decode::<ClientAction>(&text) {
            Ok(action) => {
                if let Err(err) = client.handle(action).await {
                    debug!(client_id = %client.id, error = %err, "client action rejected");
                    client.notify(err.to_message());
                }
            }
            Err(err) => {
                debug!(client_id = %client.id, error = %err, "undecodable client frame");
                client.notify(MessageModel::warning(err.to_string()));
            }
        }
    }

    client.disconnect().await;
    writer.abort();
}

pub async fn serve_worker(socket: WebSocket, manager: Arc<ConnectionManager>) {
    let (ws_tx, mut ws_rx) = socket.split();
    let (tx, rx) = mpsc::channel(manager.config().outbound_buffer);
    let writer = spawn_writer(ws_tx, rx);
    let worker = manager.register_worker(tx).await;

    while let Some(text) = next_text(&mut ws_rx).await {
        match decode::<WorkerEvent>(&text) {
            Ok(event) => worker.handle_event(event).await,
            Err(err) => {
                warn!(worker_id = %worker.id, error = %err, "undecodable worker frame");
                worker
                    .send(WorkerCommand::Log(MessageModel::warning(err.to_string())))
                    .await;
            }
        }
    }

    worker.disconnect().await;
    writer.abort();
}

async fn reject(mut socket: WebSocket, notice: String) {
    let _ = socket.send(Message::Text(notice.into())).await;
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: close_code::POLICY,
            reason: UNAUTHORIZED.into(),
        })))
        .await;
}

pub async fn reject_worker(socket: WebSocket) {
    warn!("worker rejected: invalid access key");
    let notice = encode(&WorkerCommand::Log(MessageModel::error(UNAUTHORIZED))).unwrap_or_default();
    reject(socket, notice).await;
}

pub async fn reject_client(socket: WebSocket) {
    warn!("client rejected by admission policy");
    let notice = encode(&ClientEvent::Message(MessageModel::error(UNAUTHORIZED))).unwrap_or_default();
    reject(socket, notice).await;
}
