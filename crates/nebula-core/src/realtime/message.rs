//! Realtime protocol message types
//!
//! Phoenix channel frames exchanged with the realtime service as JSON text.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::channel::ChannelSpec;
use crate::error::{SyncError, SyncResult};
use crate::provider::{ChangeEvent, EventType, Row};

/// Topic used for connection-level heartbeats
pub const PHOENIX_TOPIC: &str = "phoenix";

/// A Phoenix channel frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_ref: Option<String>,
}

impl Frame {
    /// Join a channel with a `postgres_changes` listener
    pub fn join(spec: &ChannelSpec, access_token: Option<&str>, reference: &str) -> Self {
        let mut change = Map::new();
        change.insert("event".into(), json!(spec.event_filter()));
        change.insert("schema".into(), json!(spec.schema));
        change.insert("table".into(), json!(spec.table));
        if let Some(ref filter) = spec.filter {
            change.insert("filter".into(), json!(filter.to_string()));
        }

        let mut payload = json!({
            "config": {
                "broadcast": {"self": false},
                "presence": {"key": ""},
                "postgres_changes": [Value::Object(change)],
            }
        });
        if let (Some(token), Some(obj)) = (access_token, payload.as_object_mut()) {
            obj.insert("access_token".into(), json!(token));
        }

        Self {
            topic: spec.topic(),
            event: "phx_join".to_string(),
            payload,
            reference: Some(reference.to_string()),
            join_ref: Some(reference.to_string()),
        }
    }

    /// Leave a channel
    pub fn leave(topic: &str, reference: &str) -> Self {
        Self {
            topic: topic.to_string(),
            event: "phx_leave".to_string(),
            payload: json!({}),
            reference: Some(reference.to_string()),
            join_ref: None,
        }
    }

    /// Connection heartbeat
    pub fn heartbeat(reference: &str) -> Self {
        Self {
            topic: PHOENIX_TOPIC.to_string(),
            event: "heartbeat".to_string(),
            payload: json!({}),
            reference: Some(reference.to_string()),
            join_ref: None,
        }
    }

    /// Refresh the access token of a joined channel
    pub fn access_token(topic: &str, token: &str, reference: &str) -> Self {
        Self {
            topic: topic.to_string(),
            event: "access_token".to_string(),
            payload: json!({ "access_token": token }),
            reference: Some(reference.to_string()),
            join_ref: None,
        }
    }

    /// Encode as a text frame
    pub fn encode(&self) -> SyncResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode a text frame
    pub fn decode(text: &str) -> SyncResult<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Server frames the channel task cares about
#[derive(Debug, Clone, PartialEq)]
pub enum ServerFrame {
    /// Reply to a request we sent
    Reply {
        reference: Option<String>,
        ok: bool,
        response: Value,
    },
    /// A row change
    Change(ChangeEvent),
    /// The server closed or errored the channel
    Closed { reason: String },
    /// System notice (subscription status and similar)
    System(Value),
    Other(String),
}

impl ServerFrame {
    pub fn from_frame(frame: Frame) -> SyncResult<Self> {
        Ok(match frame.event.as_str() {
            "phx_reply" => {
                let ok = frame.payload.get("status").and_then(Value::as_str) == Some("ok");
                let response = frame
                    .payload
                    .get("response")
                    .cloned()
                    .unwrap_or(Value::Null);
                ServerFrame::Reply {
                    reference: frame.reference,
                    ok,
                    response,
                }
            }
            "postgres_changes" => ServerFrame::Change(change_from_payload(&frame.payload)?),
            // Legacy servers send the change kind as the event name
            "INSERT" | "UPDATE" | "DELETE" => {
                ServerFrame::Change(change_from_payload(&frame.payload)?)
            }
            "phx_close" | "phx_error" => ServerFrame::Closed {
                reason: frame.event.clone(),
            },
            "system" => ServerFrame::System(frame.payload),
            other => ServerFrame::Other(other.to_string()),
        })
    }
}

/// Extract a change event from a `postgres_changes` payload
///
/// Accepts both `{data: {type, table, record, old_record}}` and the flat
/// `{eventType, table, new, old}` shape.
pub fn change_from_payload(payload: &Value) -> SyncResult<ChangeEvent> {
    let data = payload.get("data").unwrap_or(payload);
    let field = |names: &[&str]| names.iter().find_map(|name| data.get(*name));

    let event_type = field(&["type", "eventType"])
        .cloned()
        .ok_or_else(|| SyncError::malformed("change", "missing event type"))?;
    let event_type: EventType = serde_json::from_value(event_type)
        .map_err(|e| SyncError::malformed("change", format!("bad event type: {}", e)))?;

    let table = field(&["table"])
        .and_then(Value::as_str)
        .ok_or_else(|| SyncError::malformed("change", "missing table"))?
        .to_string();

    let as_row = |value: Option<&Value>| -> Row {
        match value {
            Some(Value::Object(map)) => map.clone(),
            _ => Row::new(),
        }
    };

    Ok(ChangeEvent {
        event_type,
        table,
        new_row: as_row(field(&["record", "new"])),
        old_row: as_row(field(&["old_record", "old"])),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelFilter;
    use crate::models::ListName;

    #[test]
    fn test_join_frame() {
        let spec = ChannelSpec::new("notifications-u1", ListName::Notifications)
            .with_filter(ChannelFilter::eq("receiver_id", "u1"));
        let frame = Frame::join(&spec, Some("jwt"), "1");
        assert_eq!(frame.topic, "realtime:notifications-u1");
        assert_eq!(frame.event, "phx_join");

        let change = &frame.payload["config"]["postgres_changes"][0];
        assert_eq!(change["table"], "notifications");
        assert_eq!(change["event"], "*");
        assert_eq!(change["filter"], "receiver_id=eq.u1");
        assert_eq!(frame.payload["access_token"], "jwt");

        let text = frame.encode().unwrap();
        assert!(text.contains("\"ref\":\"1\""));
    }

    #[test]
    fn test_heartbeat_frame() {
        let frame = Frame::heartbeat("7");
        assert_eq!(frame.topic, "phoenix");
        assert_eq!(frame.event, "heartbeat");
        assert!(frame.join_ref.is_none());
    }

    #[test]
    fn test_decode_reply() {
        let text = r#"{"topic":"realtime:posts","event":"phx_reply","payload":{"status":"ok","response":{}},"ref":"1"}"#;
        let frame = ServerFrame::from_frame(Frame::decode(text).unwrap()).unwrap();
        match frame {
            ServerFrame::Reply { reference, ok, .. } => {
                assert_eq!(reference.as_deref(), Some("1"));
                assert!(ok);
            }
            other => panic!("Expected reply, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_postgres_change() {
        let text = r#"{
            "topic":"realtime:posts","event":"postgres_changes","ref":null,
            "payload":{"data":{"type":"UPDATE","table":"posts","schema":"public",
                "record":{"id":5,"like_count":4},"old_record":{"id":5}},"ids":[1]}
        }"#;
        let frame = ServerFrame::from_frame(Frame::decode(text).unwrap()).unwrap();
        match frame {
            ServerFrame::Change(event) => {
                assert_eq!(event.event_type, EventType::Update);
                assert_eq!(event.table, "posts");
                assert_eq!(event.new_row["like_count"], 4);
                assert_eq!(event.old_row["id"], 5);
            }
            other => panic!("Expected change, got {:?}", other),
        }
    }

    #[test]
    fn test_flat_change_shape() {
        let payload = json!({"eventType": "DELETE", "table": "posts", "old": {"id": "1"}});
        let event = change_from_payload(&payload).unwrap();
        assert_eq!(event.event_type, EventType::Delete);
        assert!(event.new_row.is_empty());
        assert_eq!(event.old_row["id"], "1");
    }

    #[test]
    fn test_bad_change_is_malformed() {
        let payload = json!({"data": {"type": "TRUNCATE", "table": "posts"}});
        assert!(matches!(
            change_from_payload(&payload),
            Err(SyncError::Malformed { .. })
        ));
        assert!(change_from_payload(&json!({"data": {"type": "INSERT"}})).is_err());
    }
}
