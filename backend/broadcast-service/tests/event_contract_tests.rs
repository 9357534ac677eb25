//! Wire-contract tests for the bus payload and the outbox rows built from
//! it. These pin the camelCase field names and the forward-compatible
//! decode that every consumer in the cluster relies on.

use broadcast_service::models::{DeliveryEventType, MessageDeliveryEvent};
use broadcast_service::services::FAIL_ME_SENTINEL;
use transactional_outbox::OutboxEvent;

#[test]
fn created_event_serializes_with_camel_case_fields() {
    let event = MessageDeliveryEvent::new(
        12,
        "user-9",
        DeliveryEventType::Created,
        "pod-a",
        Some("scheduled maintenance tonight".to_string()),
    );

    let json = serde_json::to_value(&event).unwrap();

    for field in [
        "eventId",
        "broadcastId",
        "userId",
        "eventType",
        "podId",
        "timestamp",
        "message",
        "transientFailure",
    ] {
        assert!(json.get(field).is_some(), "missing field {}", field);
    }
    assert_eq!(json["eventType"], "CREATED");
    assert_eq!(json["broadcastId"], 12);
}

#[test]
fn decode_tolerates_unknown_fields_and_missing_optionals() {
    let wire = r#"{
        "eventId": "0a0f7f93-9a3e-4a6e-9b38-0b1f6f4f8f10",
        "broadcastId": 5,
        "userId": "u2",
        "eventType": "CANCELLED",
        "podId": "pod-z",
        "timestamp": "2026-03-01T08:00:00Z",
        "introducedLater": [1, 2, 3],
        "alsoNew": {"a": true}
    }"#;

    let event: MessageDeliveryEvent = serde_json::from_str(wire).unwrap();

    assert_eq!(event.event_type, DeliveryEventType::Cancelled);
    assert_eq!(event.user_id, "u2");
    assert_eq!(event.message, None);
    assert!(!event.transient_failure);
}

#[test]
fn event_round_trips_through_an_outbox_row() {
    let event = MessageDeliveryEvent::new(
        3,
        "user-1",
        DeliveryEventType::Expired,
        "pod-b",
        None,
    );

    let row = OutboxEvent::new(
        "broadcast-group",
        &event.user_id,
        serde_json::to_value(&event).unwrap(),
    );

    // The partition key is the user id so per-user ordering holds
    assert_eq!(row.event_key, "user-1");
    assert_eq!(row.topic, "broadcast-group");

    let decoded: MessageDeliveryEvent = serde_json::from_value(row.payload).unwrap();
    assert_eq!(decoded.event_id, event.event_id);
    assert_eq!(decoded.event_type, DeliveryEventType::Expired);
}

#[test]
fn all_event_types_use_uppercase_names() {
    let cases = [
        (DeliveryEventType::Created, "\"CREATED\""),
        (DeliveryEventType::Read, "\"READ\""),
        (DeliveryEventType::Cancelled, "\"CANCELLED\""),
        (DeliveryEventType::Expired, "\"EXPIRED\""),
    ];

    for (event_type, expected) in cases {
        assert_eq!(serde_json::to_string(&event_type).unwrap(), expected);
    }
}

#[test]
fn sentinel_survives_the_wire() {
    let event = MessageDeliveryEvent::new(
        1,
        "u1",
        DeliveryEventType::Created,
        "pod-a",
        Some(format!("payload with {}", FAIL_ME_SENTINEL)),
    );

    let wire = serde_json::to_string(&event).unwrap();
    let decoded: MessageDeliveryEvent = serde_json::from_str(&wire).unwrap();

    assert!(decoded
        .message
        .as_deref()
        .is_some_and(|m| m.contains(FAIL_ME_SENTINEL)));
}
