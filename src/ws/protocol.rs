//! Wire protocol shared by the bridge server and client
//!
//! Every JSON frame is `{"type", "payload", "timestamp"}`. Heartbeats are the
//! bare text frames `"ping"` and `"pong"`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::EngineError;
use crate::sync::{Event, StateSnapshot};

pub const PING: &str = "ping";
pub const PONG: &str = "pong";

/// Raw frame as it appears on the socket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl WireMessage {
    pub fn new(kind: &str, payload: Value) -> Self {
        Self {
            kind: kind.to_string(),
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn encode(&self) -> Result<String, EngineError> {
        serde_json::to_string(self).map_err(|e| EngineError::Protocol(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, EngineError> {
        serde_json::from_str(text).map_err(|e| EngineError::Protocol(format!("malformed frame: {}", e)))
    }
}

fn payload_field<T: serde::de::DeserializeOwned>(payload: Value, kind: &str) -> Result<T, EngineError> {
    serde_json::from_value(payload).map_err(|e| EngineError::Protocol(format!("bad {} payload: {}", kind, e)))
}

/// Server → client
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    Snapshot(StateSnapshot),
    Event(Event),
    Error { message: String },
}

impl ServerMessage {
    pub fn to_wire(&self) -> Result<WireMessage, EngineError> {
        let (kind, payload) = match self {
            Self::Snapshot(snapshot) => ("snapshot", serde_json::to_value(snapshot)),
            Self::Event(event) => ("event", serde_json::to_value(event)),
            Self::Error { message } => ("error", Ok(json!({ "message": message }))),
        };
        let payload = payload.map_err(|e| EngineError::Protocol(e.to_string()))?;
        Ok(WireMessage::new(kind, payload))
    }

    pub fn encode(&self) -> Result<String, EngineError> {
        self.to_wire()?.encode()
    }

    pub fn decode(text: &str) -> Result<Self, EngineError> {
        let wire = WireMessage::decode(text)?;
        match wire.kind.as_str() {
            "snapshot" => Ok(Self::Snapshot(payload_field(wire.payload, "snapshot")?)),
            "event" => Ok(Self::Event(payload_field(wire.payload, "event")?)),
            "error" => {
                #[derive(Deserialize)]
                struct ErrorPayload {
                    message: String,
                }
                let p: ErrorPayload = payload_field(wire.payload, "error")?;
                Ok(Self::Error { message: p.message })
            }
            other => Err(EngineError::Protocol(format!("unknown server message type '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TopicsPayload {
    #[serde(default)]
    pub topics: Vec<String>,
}

/// Client → server
#[derive(Debug, Clone, PartialEq)]
pub enum ClientCommand {
    Subscribe(Vec<String>),
    Unsubscribe(Vec<String>),
    SnapshotRequest,
}

impl ClientCommand {
    pub fn to_wire(&self) -> WireMessage {
        match self {
            Self::Subscribe(topics) => WireMessage::new("subscribe", json!({ "topics": topics })),
            Self::Unsubscribe(topics) => WireMessage::new("unsubscribe", json!({ "topics": topics })),
            Self::SnapshotRequest => WireMessage::new("snapshot_request", json!({})),
        }
    }

    pub fn encode(&self) -> Result<String, EngineError> {
        self.to_wire().encode()
    }

    pub fn decode(text: &str) -> Result<Self, EngineError> {
        let wire = WireMessage::decode(text)?;
        match wire.kind.as_str() {
            "subscribe" => Ok(Self::Subscribe(payload_field::<TopicsPayload>(wire.payload, "subscribe")?.topics)),
            "unsubscribe" => Ok(Self::Unsubscribe(
                payload_field::<TopicsPayload>(wire.payload, "unsubscribe")?.topics,
            )),
            "snapshot_request" => Ok(Self::SnapshotRequest),
            other => Err(EngineError::Protocol(format!("unknown client message type '{}'", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_command_wire_shape() {
        let text = ClientCommand::Subscribe(vec!["signal.*".to_string()]).encode().unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();

        assert_eq!(value["type"], "subscribe");
        assert_eq!(value["payload"]["topics"][0], "signal.*");
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn test_decode_without_timestamp_or_payload() {
        let cmd = ClientCommand::decode(r#"{"type": "snapshot_request"}"#).unwrap();
        assert_eq!(cmd, ClientCommand::SnapshotRequest);
    }

    #[test]
    fn test_server_event_decodes() {
        let event = Event {
            sequence: 7,
            topic: "signal.created".to_string(),
            payload: json!({"signal": {"id": "x"}}),
            timestamp: Utc::now(),
            source: "runner".to_string(),
        };
        let text = ServerMessage::Event(event.clone()).encode().unwrap();
        assert_eq!(ServerMessage::decode(&text).unwrap(), ServerMessage::Event(event));
    }

    #[test]
    fn test_unknown_and_malformed_frames_rejected() {
        assert!(matches!(
            ClientCommand::decode(r#"{"type": "shutdown"}"#),
            Err(EngineError::Protocol(_))
        ));
        assert!(ClientCommand::decode("not json").is_err());
        assert!(ServerMessage::decode(r#"{"type": "snapshot", "payload": 5}"#).is_err());
    }
}
