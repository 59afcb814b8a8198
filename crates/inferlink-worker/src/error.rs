use inferlink_protocol::FrameError;
use thiserror::Error;
use tokio_tungstenite::tungstenite;

#[derive(Error, Debug)]
pub enum WorkerClientError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("unauthorized: the broker rejected the access key")]
    Unauthorized,

    #[error("invalid access key header: {0}")]
    InvalidHeader(#[from] tungstenite::http::header::InvalidHeaderValue),

    #[error(transparent)]
    Frame(#[from] FrameError),
}
