//! Wire messages exchanged over the session websocket.

use crate::error::SessionError;
use serde::{Deserialize, Serialize};

/// First message of a session: what to run.
#[derive(Debug, Clone, Deserialize)]
pub struct InitRequest {
    pub code: String,
    pub language: String,
    #[serde(default)]
    pub stdin: Option<String>,
    /// Client-chosen identity, so another connection can stop this run.
    #[serde(default)]
    pub session: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Stop,
}

/// Cancellation request, either as a first message or mid-session.
#[derive(Debug, Clone, Deserialize)]
pub struct StopRequest {
    pub action: Action,
    #[serde(default)]
    pub session: Option<String>,
}

#[derive(Debug, Clone)]
pub enum ClientMessage {
    Init(InitRequest),
    Stop(StopRequest),
}

/// Decode the first message of a connection.
pub fn parse_client_message(text: &str) -> Result<ClientMessage, SessionError> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    if value.get("action").is_some() {
        return Ok(ClientMessage::Stop(serde_json::from_value(value)?));
    }
    let init: InitRequest = serde_json::from_value(value)?;
    Ok(ClientMessage::Init(init))
}

/// Whether a mid-session text message is a stop command rather than terminal input.
pub fn is_stop_command(text: &str) -> bool {
    let trimmed = text.trim_start();
    if !trimmed.starts_with('{') {
        return false;
    }
    matches!(
        serde_json::from_str::<StopRequest>(trimmed),
        Ok(StopRequest { action: Action::Stop, .. })
    )
}

/// Server → client frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Frame {
    Output { output: String },
    Error { message: String },
    Done,
}

impl Frame {
    pub fn output(text: impl Into<String>) -> Self {
        Frame::Output {
            output: text.into(),
        }
    }

    pub fn error(err: &SessionError) -> Self {
        Frame::Error {
            message: err.to_string(),
        }
    }

    pub fn to_json(&self) -> String {
        // Frame only holds strings, serialization cannot fail.
        serde_json::to_string(self).unwrap_or_else(|_| String::from(r#"{"type":"done"}"#))
    }
}
