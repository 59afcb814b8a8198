//! Text-frame encoding shared by every channel.
//!
//! Frames are single JSON objects `{"action": ..., "content": ...}`. Decoding
//! separates "this action does not exist on this channel" from "the action is
//! known but its payload is malformed" so peers can be told which one happened.

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// A closed set of actions carried on one channel direction.
pub trait Envelope: Serialize + DeserializeOwned {
    /// Every `action` tag this envelope accepts.
    const ACTIONS: &'static [&'static str];
}

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("frame has no action")]
    MissingAction,

    #[error("unknown action: {0}")]
    UnknownAction(String),
}

/// Decode one frame. A frame without `content` is read as carrying `{}` when
/// its action only takes optional fields.
pub fn decode<T: Envelope>(text: &str) -> Result<T, FrameError> {
    let mut value: serde_json::Value = serde_json::from_str(text)?;
    let action = value
        .get("action")
        .and_then(|a| a.as_str())
        .ok_or(FrameError::MissingAction)?;
    if !T::ACTIONS.contains(&action) {
        return Err(FrameError::UnknownAction(action.to_string()));
    }
    let bare = value.get("content").is_none();
    match serde_json::from_value::<T>(value.clone()) {
        Ok(envelope) => Ok(envelope),
        Err(err) if bare => {
            value["content"] = serde_json::json!({});
            serde_json::from_value(value).map_err(|_| FrameError::Malformed(err))
        }
        Err(err) => Err(err.into()),
    }
}

pub fn encode<T: Envelope>(envelope: &T) -> Result<String, FrameError> {
    Ok(serde_json::to_string(envelope)?)
}
