//! Phoenix channels wire format (JSON serializer v2).
//!
//! Every frame is a five element array: `[join_ref, ref, topic, event, payload]`.

use serde::de::Deserializer;
use serde::ser::{SerializeTuple, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const PHOENIX_TOPIC: &str = "phoenix";
pub const PHOENIX_VSN: &str = "2.0.0";

pub const EVENT_JOIN: &str = "phx_join";
pub const EVENT_LEAVE: &str = "phx_leave";
pub const EVENT_REPLY: &str = "phx_reply";
pub const EVENT_ERROR: &str = "phx_error";
pub const EVENT_CLOSE: &str = "phx_close";
pub const EVENT_HEARTBEAT: &str = "heartbeat";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PhoenixError {
    #[error("phoenix frame encode failed: {0}")]
    Encode(String),
    #[error("phoenix frame decode failed: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PhoenixMessage {
    pub join_ref: Option<String>,
    pub msg_ref: Option<String>,
    pub topic: String,
    pub event: String,
    pub payload: Value,
}

impl PhoenixMessage {
    pub fn join(topic: &str, params: Value, join_ref: &str) -> Self {
        Self {
            join_ref: Some(join_ref.to_string()),
            msg_ref: Some(join_ref.to_string()),
            topic: topic.to_string(),
            event: EVENT_JOIN.to_string(),
            payload: params,
        }
    }

    pub fn leave(topic: &str, join_ref: &str, msg_ref: &str) -> Self {
        Self {
            join_ref: Some(join_ref.to_string()),
            msg_ref: Some(msg_ref.to_string()),
            topic: topic.to_string(),
            event: EVENT_LEAVE.to_string(),
            payload: Value::Object(Default::default()),
        }
    }

    pub fn heartbeat(msg_ref: &str) -> Self {
        Self {
            join_ref: None,
            msg_ref: Some(msg_ref.to_string()),
            topic: PHOENIX_TOPIC.to_string(),
            event: EVENT_HEARTBEAT.to_string(),
            payload: Value::Object(Default::default()),
        }
    }

    pub fn encode(&self) -> Result<String, PhoenixError> {
        serde_json::to_string(self).map_err(|err| PhoenixError::Encode(err.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, PhoenixError> {
        serde_json::from_str(text).map_err(|err| PhoenixError::Decode(err.to_string()))
    }

    pub fn is_reply(&self) -> bool {
        self.event == EVENT_REPLY
    }

    /// Interprets a `phx_reply` payload. Returns `None` for any other event.
    pub fn reply(&self) -> Option<ReplyPayload> {
        if !self.is_reply() {
            return None;
        }
        serde_json::from_value(self.payload.clone()).ok()
    }
}

impl Serialize for PhoenixMessage {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut tuple = serializer.serialize_tuple(5)?;
        tuple.serialize_element(&self.join_ref)?;
        tuple.serialize_element(&self.msg_ref)?;
        tuple.serialize_element(&self.topic)?;
        tuple.serialize_element(&self.event)?;
        tuple.serialize_element(&self.payload)?;
        tuple.end()
    }
}

impl<'de> Deserialize<'de> for PhoenixMessage {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let (join_ref, msg_ref, topic, event, payload) =
            <(Option<String>, Option<String>, String, String, Value)>::deserialize(deserializer)?;
        Ok(Self {
            join_ref,
            msg_ref,
            topic,
            event,
            payload,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReplyPayload {
    pub status: String,
    #[serde(default)]
    pub response: Value,
}

impl ReplyPayload {
    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn join_frame_encodes_as_array() {
        let join = PhoenixMessage::join("project:lobby", json!({}), "3");
        let encoded = join.encode().expect("encode");
        assert_eq!(encoded, r#"["3","3","project:lobby","phx_join",{}]"#);
    }

    #[test]
    fn heartbeat_has_no_join_ref() {
        let encoded = PhoenixMessage::heartbeat("9").encode().expect("encode");
        assert_eq!(encoded, r#"[null,"9","phoenix","heartbeat",{}]"#);
    }

    #[test]
    fn decodes_push_without_refs() {
        let message = PhoenixMessage::decode(
            r#"[null,null,"services:lobby","service_updated",{"service":{"name":"mysql","status":"running"}}]"#,
        )
        .expect("decode");
        assert_eq!(message.topic, "services:lobby");
        assert_eq!(message.event, "service_updated");
        assert!(message.join_ref.is_none());
        assert_eq!(message.payload["service"]["name"], json!("mysql"));
        assert!(message.reply().is_none());
    }

    #[test]
    fn reply_payload_reports_status() {
        let ok = PhoenixMessage::decode(
            r#"["1","1","project:lobby","phx_reply",{"status":"ok","response":{}}]"#,
        )
        .expect("decode ok");
        assert!(ok.reply().expect("reply").is_ok());

        let denied = PhoenixMessage::decode(
            r#"["2","2","project:nope","phx_reply",{"status":"error","response":{"reason":"unmatched topic"}}]"#,
        )
        .expect("decode error");
        let reply = denied.reply().expect("reply");
        assert!(!reply.is_ok());
        assert_eq!(reply.response["reason"], json!("unmatched topic"));
    }

    #[test]
    fn rejects_object_frames() {
        let result = PhoenixMessage::decode(r#"{"topic":"phoenix","event":"heartbeat"}"#);
        assert!(matches!(result, Err(PhoenixError::Decode(_))));
    }
}
