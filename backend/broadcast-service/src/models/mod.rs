use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

/// Who a broadcast is addressed to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum TargetType {
    /// Every user in the directory
    All,
    /// The explicit user-id list in target_ids
    Selected,
    /// Members of the role named by the first target id
    Role,
}

impl TargetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetType::All => "ALL",
            TargetType::Selected => "SELECTED",
            TargetType::Role => "ROLE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ALL" => Some(TargetType::All),
            "SELECTED" => Some(TargetType::Selected),
            "ROLE" => Some(TargetType::Role),
            _ => None,
        }
    }
}

/// Broadcast lifecycle state; moves forward only
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum BroadcastStatus {
    Scheduled,
    Active,
    Expired,
    Cancelled,
}

impl BroadcastStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BroadcastStatus::Scheduled => "SCHEDULED",
            BroadcastStatus::Active => "ACTIVE",
            BroadcastStatus::Expired => "EXPIRED",
            BroadcastStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SCHEDULED" => Some(BroadcastStatus::Scheduled),
            "ACTIVE" => Some(BroadcastStatus::Active),
            "EXPIRED" => Some(BroadcastStatus::Expired),
            "CANCELLED" => Some(BroadcastStatus::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "UPPERCASE")]
pub enum BroadcastPriority {
    Low,
    Normal,
    High,
    Urgent,
}

impl BroadcastPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            BroadcastPriority::Low => "LOW",
            BroadcastPriority::Normal => "NORMAL",
            BroadcastPriority::High => "HIGH",
            BroadcastPriority::Urgent => "URGENT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "LOW" => Some(BroadcastPriority::Low),
            "NORMAL" => Some(BroadcastPriority::Normal),
            "HIGH" => Some(BroadcastPriority::High),
            "URGENT" => Some(BroadcastPriority::Urgent),
            _ => None,
        }
    }
}

/// Per-recipient delivery state.
///
/// Transitions: PENDING → DELIVERED, PENDING → FAILED, PENDING → SUPERSEDED
/// (broadcast expired before delivery). Never backwards.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Failed,
    Superseded,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "PENDING",
            DeliveryStatus::Delivered => "DELIVERED",
            DeliveryStatus::Failed => "FAILED",
            DeliveryStatus::Superseded => "SUPERSEDED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(DeliveryStatus::Pending),
            "DELIVERED" => Some(DeliveryStatus::Delivered),
            "FAILED" => Some(DeliveryStatus::Failed),
            "SUPERSEDED" => Some(DeliveryStatus::Superseded),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum ReadStatus {
    Unread,
    Read,
}

impl ReadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadStatus::Unread => "UNREAD",
            ReadStatus::Read => "READ",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "UNREAD" => Some(ReadStatus::Unread),
            "READ" => Some(ReadStatus::Read),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConnectionStatus {
    Active,
    Inactive,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Active => "ACTIVE",
            ConnectionStatus::Inactive => "INACTIVE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ACTIVE" => Some(ConnectionStatus::Active),
            "INACTIVE" => Some(ConnectionStatus::Inactive),
            _ => None,
        }
    }
}

/// An admin-authored message with a target set and lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Broadcast {
    /// Server-assigned, monotonic
    pub id: i64,

    pub sender_id: String,
    pub sender_name: String,

    /// Message body shown to recipients
    pub content: String,

    pub target_type: TargetType,

    /// Meaning depends on target_type: empty for ALL, user ids for
    /// SELECTED, role name (first element) for ROLE
    pub target_ids: Vec<String>,

    pub priority: BroadcastPriority,
    pub category: String,

    pub scheduled_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub status: BroadcastStatus,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-recipient delivery record; exactly one per (broadcast, targeted user).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserBroadcast {
    pub id: i64,
    pub broadcast_id: i64,
    pub user_id: String,
    pub delivery_status: DeliveryStatus,
    pub read_status: ReadStatus,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-broadcast delivery counters.
///
/// Monotonic non-decreasing; total_delivered <= total_targeted and
/// total_read <= total_delivered. Incremented server-side only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastStatistics {
    pub broadcast_id: i64,
    pub total_targeted: i64,
    pub total_delivered: i64,
    pub total_read: i64,
    pub total_failed: i64,
    pub calculated_at: DateTime<Utc>,
}

/// One live SSE connection. A user may hold several (one per tab);
/// each ACTIVE session is owned by exactly one pod.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSession {
    pub id: i64,
    pub user_id: String,
    pub session_id: Uuid,
    pub pod_id: String,
    pub connection_status: ConnectionStatus,
    pub connected_at: DateTime<Utc>,
    pub disconnected_at: Option<DateTime<Utc>>,
    pub last_heartbeat: DateTime<Utc>,
}

/// Quiet-hours window in the user's local timezone.
///
/// start > end means overnight: from start until midnight, or from
/// midnight until end.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuietHours {
    pub start: NaiveTime,
    pub end: NaiveTime,
    /// IANA timezone name, e.g. "Europe/Berlin"
    pub timezone: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserPreferences {
    pub user_id: String,
    pub notifications_enabled: bool,
    /// Empty means every category is accepted
    pub preferred_categories: Vec<String>,
    pub quiet_hours: Option<QuietHours>,
}

/// A quarantined bus record awaiting operator review.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DltRecord {
    pub id: Uuid,
    pub original_topic: String,
    pub original_partition: i32,
    pub original_offset: i64,
    pub exception_message: String,
    /// Raw record bytes, preserved verbatim between ingest and redrive
    #[serde(skip_serializing)]
    pub payload: Vec<u8>,
    pub failed_at: DateTime<Utc>,
}

/// Discriminator of a [`MessageDeliveryEvent`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeliveryEventType {
    Created,
    Read,
    Cancelled,
    Expired,
}

/// Bus payload; never persisted outside the outbox.
///
/// Deserialization is forward-compatible: unknown fields are ignored and
/// missing optionals default.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDeliveryEvent {
    pub event_id: Uuid,
    pub broadcast_id: i64,
    pub user_id: String,
    pub event_type: DeliveryEventType,
    pub pod_id: String,
    pub timestamp: DateTime<Utc>,
    /// Inlined message content, present for CREATED
    #[serde(default)]
    pub message: Option<String>,
    /// Fault-injection marker used by failure-path tests
    #[serde(default)]
    pub transient_failure: bool,
}

impl MessageDeliveryEvent {
    pub fn new(
        broadcast_id: i64,
        user_id: &str,
        event_type: DeliveryEventType,
        pod_id: &str,
        message: Option<String>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            broadcast_id,
            user_id: user_id.to_string(),
            event_type,
            pod_id: pod_id.to_string(),
            timestamp: Utc::now(),
            message,
            transient_failure: false,
        }
    }
}

/// What a connected client receives for one broadcast (SSE `MESSAGE` data).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastMessage {
    /// The UserBroadcast row id; doubles as the SSE event id for
    /// client-side dedup
    pub user_broadcast_id: i64,
    pub broadcast_id: i64,
    pub content: String,
    pub sender_name: String,
    pub priority: BroadcastPriority,
    pub category: String,
    pub created_at: DateTime<Utc>,
}

/// Admin request to author a broadcast.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateBroadcastRequest {
    #[validate(length(min = 1, max = 128))]
    pub sender_id: String,

    #[validate(length(min = 1, max = 256))]
    pub sender_name: String,

    #[validate(length(min = 1, max = 4096))]
    pub content: String,

    /// ALL, SELECTED or ROLE
    pub target_type: String,

    #[serde(default)]
    pub target_ids: Vec<String>,

    /// LOW, NORMAL, HIGH or URGENT; defaults to NORMAL
    pub priority: Option<String>,

    /// Defaults to "general"
    pub category: Option<String>,

    pub scheduled_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Per-pod connection statistics.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStats {
    pub pod_id: String,
    pub local_sessions: usize,
    pub local_users: usize,
    pub cluster_online_users: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enum_round_trips() {
        for s in ["ALL", "SELECTED", "ROLE"] {
            assert_eq!(TargetType::parse(s).unwrap().as_str(), s);
        }
        for s in ["SCHEDULED", "ACTIVE", "EXPIRED", "CANCELLED"] {
            assert_eq!(BroadcastStatus::parse(s).unwrap().as_str(), s);
        }
        for s in ["PENDING", "DELIVERED", "FAILED", "SUPERSEDED"] {
            assert_eq!(DeliveryStatus::parse(s).unwrap().as_str(), s);
        }
        assert!(TargetType::parse("EVERYONE").is_none());
    }

    #[test]
    fn delivery_event_json_uses_camel_case() {
        let event = MessageDeliveryEvent::new(
            7,
            "u1",
            DeliveryEventType::Created,
            "pod-a",
            Some("hello".to_string()),
        );

        let json = serde_json::to_value(&event).unwrap();
        assert!(json.get("eventId").is_some());
        assert!(json.get("broadcastId").is_some());
        assert_eq!(json["userId"], "u1");
        assert_eq!(json["eventType"], "CREATED");
        assert_eq!(json["message"], "hello");
    }

    #[test]
    fn delivery_event_decode_ignores_unknown_fields() {
        let json = r#"{
            "eventId": "6a6f43cb-1aee-4c1e-8c60-6b3a7a8f9a01",
            "broadcastId": 3,
            "userId": "u9",
            "eventType": "READ",
            "podId": "pod-b",
            "timestamp": "2026-03-01T12:00:00Z",
            "futureField": {"nested": true}
        }"#;

        let event: MessageDeliveryEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.event_type, DeliveryEventType::Read);
        assert_eq!(event.message, None);
        assert!(!event.transient_failure);
    }
}
