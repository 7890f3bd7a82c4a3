//! Protocol message definitions
//!
//! Defines the message types exchanged between browser clients and the
//! bridge server. All messages are JSON-encoded and tagged by `type`; agent
//! traffic is carried opaquely inside `rpc_command` / `rpc_event` envelopes.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Protocol-related errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("JSON serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// Result type for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;

// ============================================================================
// Client Messages
// ============================================================================

/// Messages sent from client (browser) to bridge
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Attach to the session identified by the working directory and
    /// optional session-file name, spawning an agent if none is live
    StartSession {
        /// Working directory the agent is rooted at
        cwd: String,
        /// Session file to resume; omitted for a brand-new session
        #[serde(rename = "sessionFile", skip_serializing_if = "Option::is_none")]
        session_file: Option<String>,
    },

    /// Detach from the current session without stopping the agent
    DetachSession,

    /// Opaque agent command, forwarded to the attached session's process
    RpcCommand {
        /// Command payload; semantics are owned by the agent
        command: Value,
    },

    /// Connection keepalive
    Ping,
}

impl ClientMessage {
    /// Parse a client message from JSON
    pub fn from_json(json: &str) -> ProtocolResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

// ============================================================================
// Server Messages
// ============================================================================

/// Messages sent from bridge to client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// An agent event, forwarded verbatim
    RpcEvent {
        /// Event payload as emitted by the agent
        event: Value,
    },

    /// A recoverable error; the connection stays open
    Error {
        /// Human-readable description
        message: String,
    },

    /// The attached session's agent process exited
    SessionEnded {
        /// Exit code if known
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<i32>,
    },

    /// Response to Ping
    Pong,
}

impl ServerMessage {
    /// Wrap an agent event for broadcast
    pub fn rpc_event(event: Value) -> Self {
        ServerMessage::RpcEvent { event }
    }

    /// Create an Error message
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }

    /// Create a SessionEnded message
    pub fn session_ended(code: Option<i32>) -> Self {
        ServerMessage::SessionEnded { code }
    }

    /// Serialize the message to JSON
    pub fn to_json(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_start_session_deserialization() {
        let msg = ClientMessage::from_json(
            r#"{"type":"start_session","cwd":"/proj","sessionFile":"abc.jsonl"}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ClientMessage::StartSession {
                cwd: "/proj".to_string(),
                session_file: Some("abc.jsonl".to_string()),
            }
        );
    }

    #[test]
    fn test_start_session_without_file() {
        let msg = ClientMessage::from_json(r#"{"type":"start_session","cwd":"/proj"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::StartSession {
                cwd: "/proj".to_string(),
                session_file: None,
            }
        );
    }

    #[test]
    fn test_rpc_command_is_opaque() {
        let msg = ClientMessage::from_json(
            r#"{"type":"rpc_command","command":{"type":"prompt","message":"hi","images":[]}}"#,
        )
        .unwrap();
        match msg {
            ClientMessage::RpcCommand { command } => {
                assert_eq!(command["type"], "prompt");
                assert_eq!(command["message"], "hi");
            }
            other => panic!("Expected RpcCommand, got {:?}", other),
        }
    }

    #[test]
    fn test_ping_and_detach_deserialization() {
        assert_eq!(
            ClientMessage::from_json(r#"{"type":"ping"}"#).unwrap(),
            ClientMessage::Ping
        );
        assert_eq!(
            ClientMessage::from_json(r#"{"type":"detach_session"}"#).unwrap(),
            ClientMessage::DetachSession
        );
    }

    #[test]
    fn test_malformed_message_is_an_error() {
        assert!(ClientMessage::from_json("not json").is_err());
        assert!(ClientMessage::from_json(r#"{"type":"unknown_thing"}"#).is_err());
    }

    #[test]
    fn test_rpc_event_serialization() {
        let msg = ServerMessage::rpc_event(json!({"type": "agent_start"}));
        let json = msg.to_json().unwrap();
        assert!(json.contains("\"type\":\"rpc_event\""));
        assert!(json.contains("\"agent_start\""));
    }

    #[test]
    fn test_session_ended_serialization() {
        let json = ServerMessage::session_ended(Some(0)).to_json().unwrap();
        assert!(json.contains("\"type\":\"session_ended\""));
        assert!(json.contains("\"code\":0"));

        let json = ServerMessage::session_ended(None).to_json().unwrap();
        assert!(!json.contains("code"));
    }

    #[test]
    fn test_pong_serialization() {
        let json = ServerMessage::Pong.to_json().unwrap();
        assert_eq!(json, r#"{"type":"pong"}"#);
    }

    #[test]
    fn test_error_serialization() {
        let json = ServerMessage::error("boom").to_json().unwrap();
        assert!(json.contains("\"type\":\"error\""));
        assert!(json.contains("\"message\":\"boom\""));
    }
}
