//! # Job Notification Messages
//!
//! Outbound frames are a serde-tagged enum. Inbound frames stay raw JSON: the
//! manager never interprets them, subscribers use the accessors here.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Frames a client sends over the notification socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    /// Ask the backend to push updates for a service request.
    SubscribeToRequest { request_id: i64 },
    /// Liveness ping; sent by the manager itself on a fixed period.
    UserHeartbeat {
        timestamp: i64,
        job_id: Option<String>,
    },
    JobCancelled { job_id: Value, message: String },
    CancelRequest { request_id: i64 },
}

impl OutboundMessage {
    /// Heartbeat stamped with the current wall-clock time in epoch ms.
    pub fn heartbeat(job_id: Option<String>) -> Self {
        OutboundMessage::UserHeartbeat {
            timestamp: chrono::Utc::now().timestamp_millis(),
            job_id,
        }
    }
}

/// Turns an outbound value into the text of one frame.
///
/// Strings are taken as already serialized frames and pass through
/// unchanged; any other value is encoded as JSON.
pub fn encode_frame<M: Serialize + ?Sized>(message: &M) -> Result<String, serde_json::Error> {
    let text = serde_json::to_string(message)?;
    if text.starts_with('"') {
        return serde_json::from_str::<String>(&text);
    }
    Ok(text)
}

/// Known inbound `type` values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundKind {
    NewJob,
    MechanicAccepted,
    MechanicLocationUpdate,
    MechanicArrived,
    JobCompleted,
    /// Both `job_cancelled` and `job_cancelled_notification`.
    JobCancelled,
    NoMechanicFound,
    JobExpired,
    Other(String),
}

impl InboundKind {
    pub fn parse(kind: &str) -> Self {
        match kind {
            "new_job" => InboundKind::NewJob,
            "mechanic_accepted" => InboundKind::MechanicAccepted,
            "mechanic_location_update" => InboundKind::MechanicLocationUpdate,
            "mechanic_arrived" => InboundKind::MechanicArrived,
            "job_completed" => InboundKind::JobCompleted,
            "job_cancelled" | "job_cancelled_notification" => InboundKind::JobCancelled,
            "no_mechanic_found" => InboundKind::NoMechanicFound,
            "job_expired" => InboundKind::JobExpired,
            other => InboundKind::Other(other.to_string()),
        }
    }
}

/// One decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    raw: Value,
}

impl InboundMessage {
    /// Parses a text frame. Anything that is not JSON is rejected.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str::<Value>(text).map(|raw| Self { raw })
    }

    pub fn raw(&self) -> &Value {
        &self.raw
    }

    pub fn into_raw(self) -> Value {
        self.raw
    }

    /// The `type` field, if present and a string.
    pub fn type_name(&self) -> Option<&str> {
        self.raw.get("type").and_then(Value::as_str)
    }

    pub fn kind(&self) -> Option<InboundKind> {
        self.type_name().map(InboundKind::parse)
    }

    /// `request_id`, accepted either as a number or a numeric string.
    pub fn request_id(&self) -> Option<i64> {
        match self.raw.get("request_id")? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// `job_id` rendered as a string; the backend sends both forms.
    pub fn job_id(&self) -> Option<String> {
        match self.raw.get("job_id")? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn outbound_frames_use_snake_case_type_tags() {
        let sub = serde_json::to_value(OutboundMessage::SubscribeToRequest { request_id: 42 }).unwrap();
        assert_eq!(sub, json!({"type": "subscribe_to_request", "request_id": 42}));

        let cancel = serde_json::to_value(OutboundMessage::JobCancelled {
            job_id: json!(7),
            message: "changed my mind".into(),
        })
        .unwrap();
        assert_eq!(
            cancel,
            json!({"type": "job_cancelled", "job_id": 7, "message": "changed my mind"})
        );
    }

    #[test]
    fn strings_are_sent_as_is() {
        let raw = r#"{"type":"cancel_request","request_id":7}"#;
        assert_eq!(encode_frame(raw).unwrap(), raw);
        assert_eq!(encode_frame(&raw.to_string()).unwrap(), raw);
        assert_eq!(encode_frame("pong").unwrap(), "pong");
        assert_eq!(
            encode_frame(&OutboundMessage::CancelRequest { request_id: 7 }).unwrap(),
            raw
        );
        assert_eq!(encode_frame(&json!({"a": [1, "b"]})).unwrap(), r#"{"a":[1,"b"]}"#);
    }

    #[test]
    fn heartbeat_serializes_null_job_id() {
        let hb = serde_json::to_value(OutboundMessage::heartbeat(None)).unwrap();
        assert_eq!(hb["type"], "user_heartbeat");
        assert!(hb["job_id"].is_null());
        assert!(hb["timestamp"].as_i64().unwrap() > 0);
    }

    #[test]
    fn inbound_accessors() {
        let msg = InboundMessage::parse(
            r#"{"type":"job_cancelled_notification","request_id":"15","job_id":99}"#,
        )
        .unwrap();
        assert_eq!(msg.kind(), Some(InboundKind::JobCancelled));
        assert_eq!(msg.request_id(), Some(15));
        assert_eq!(msg.job_id().as_deref(), Some("99"));

        let odd = InboundMessage::parse(r#"{"type":"promo"}"#).unwrap();
        assert_eq!(odd.kind(), Some(InboundKind::Other("promo".into())));
        assert_eq!(odd.request_id(), None);
    }

    #[test]
    fn non_json_is_rejected() {
        assert!(InboundMessage::parse("pong").is_err());
    }
}
