//! Server-sent event framing.

use chrono::{DateTime, Utc};
use serde_json::json;
use uuid::Uuid;

use crate::models::BroadcastMessage;

/// Everything a sink can emit to one client session.
#[derive(Debug, Clone, PartialEq)]
pub enum SseEvent {
    Connected { session_id: Uuid },
    Heartbeat { timestamp: DateTime<Utc> },
    /// The event id on the wire is the UserBroadcast row id, which clients
    /// use for at-least-once dedup.
    Message(BroadcastMessage),
    MessageRead { broadcast_id: i64 },
    MessageRemoved { broadcast_id: i64 },
}

impl SseEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SseEvent::Connected { .. } => "CONNECTED",
            SseEvent::Heartbeat { .. } => "HEARTBEAT",
            SseEvent::Message(_) => "MESSAGE",
            SseEvent::MessageRead { .. } => "MESSAGE_READ",
            SseEvent::MessageRemoved { .. } => "MESSAGE_REMOVED",
        }
    }

    fn data(&self) -> String {
        match self {
            SseEvent::Connected { session_id } => json!({
                "message": "connected",
                "sessionId": session_id,
            })
            .to_string(),
            SseEvent::Heartbeat { timestamp } => json!({ "timestamp": timestamp }).to_string(),
            SseEvent::Message(message) => {
                serde_json::to_string(message).unwrap_or_else(|_| "{}".to_string())
            }
            SseEvent::MessageRead { broadcast_id } => {
                json!({ "broadcastId": broadcast_id }).to_string()
            }
            SseEvent::MessageRemoved { broadcast_id } => {
                json!({ "broadcastId": broadcast_id }).to_string()
            }
        }
    }

    /// Render the `event:`/`id:`/`data:` wire frame.
    pub fn to_frame(&self) -> String {
        match self {
            SseEvent::Message(message) => format!(
                "event: {}\nid: {}\ndata: {}\n\n",
                self.name(),
                message.user_broadcast_id,
                self.data()
            ),
            _ => format!("event: {}\ndata: {}\n\n", self.name(), self.data()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BroadcastPriority;

    fn sample_message() -> BroadcastMessage {
        BroadcastMessage {
            user_broadcast_id: 42,
            broadcast_id: 7,
            content: "hello".to_string(),
            sender_name: "ops".to_string(),
            priority: BroadcastPriority::Normal,
            category: "general".to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn message_frame_carries_row_id() {
        let frame = SseEvent::Message(sample_message()).to_frame();

        assert!(frame.starts_with("event: MESSAGE\n"));
        assert!(frame.contains("id: 42\n"));
        assert!(frame.contains("\"content\":\"hello\""));
        assert!(frame.ends_with("\n\n"));
    }

    #[test]
    fn heartbeat_frame_has_no_id_line() {
        let frame = SseEvent::Heartbeat {
            timestamp: Utc::now(),
        }
        .to_frame();

        assert!(frame.starts_with("event: HEARTBEAT\n"));
        assert!(!frame.contains("id:"));
    }

    #[test]
    fn removal_frame_names_the_broadcast() {
        let frame = SseEvent::MessageRemoved { broadcast_id: 7 }.to_frame();
        assert!(frame.contains("event: MESSAGE_REMOVED"));
        assert!(frame.contains("\"broadcastId\":7"));
    }
}
