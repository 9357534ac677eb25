//! End-to-end tests of the local sink path: registry fan-out, SSE framing
//! and the drop-and-close behavior of a stuck session.

use broadcast_service::models::{BroadcastMessage, BroadcastPriority};
use broadcast_service::sse::{ConnectionRegistry, SseEvent};
use chrono::Utc;
use uuid::Uuid;

fn message(user_broadcast_id: i64, broadcast_id: i64, content: &str) -> BroadcastMessage {
    BroadcastMessage {
        user_broadcast_id,
        broadcast_id,
        content: content.to_string(),
        sender_name: "ops".to_string(),
        priority: BroadcastPriority::High,
        category: "maintenance".to_string(),
        created_at: Utc::now(),
    }
}

#[tokio::test]
async fn every_tab_of_a_user_gets_the_message_frame() {
    let (registry, _dead) = ConnectionRegistry::new(16);

    let mut tabs = Vec::new();
    for _ in 0..3 {
        tabs.push(registry.register("u1", Uuid::new_v4()).await);
    }
    let mut other_user = registry.register("u2", Uuid::new_v4()).await;

    let event = SseEvent::Message(message(77, 9, "db failover at 22:00"));
    assert_eq!(registry.emit_to_user("u1", &event).await, 3);

    for tab in tabs.iter_mut() {
        let frame = tab.recv().await.unwrap().to_frame();
        assert!(frame.starts_with("event: MESSAGE\n"));
        assert!(frame.contains("id: 77\n"));
        assert!(frame.contains("db failover at 22:00"));
    }

    // u2 saw nothing
    assert!(other_user.try_recv().is_err());
}

#[tokio::test]
async fn read_receipt_fans_out_to_sibling_tabs() {
    let (registry, _dead) = ConnectionRegistry::new(16);

    let mut tab_a = registry.register("u1", Uuid::new_v4()).await;
    let mut tab_b = registry.register("u1", Uuid::new_v4()).await;

    registry
        .emit_to_user("u1", &SseEvent::MessageRead { broadcast_id: 9 })
        .await;

    for tab in [&mut tab_a, &mut tab_b] {
        let frame = tab.recv().await.unwrap().to_frame();
        assert!(frame.starts_with("event: MESSAGE_READ\n"));
        assert!(frame.contains("\"broadcastId\":9"));
    }
}

#[tokio::test]
async fn heartbeat_reaches_every_session_on_the_pod() {
    let (registry, _dead) = ConnectionRegistry::new(16);

    let mut rx_1 = registry.register("u1", Uuid::new_v4()).await;
    let mut rx_2 = registry.register("u2", Uuid::new_v4()).await;

    let delivered = registry
        .emit_to_all(&SseEvent::Heartbeat {
            timestamp: Utc::now(),
        })
        .await;
    assert_eq!(delivered, 2);

    for rx in [&mut rx_1, &mut rx_2] {
        let frame = rx.recv().await.unwrap().to_frame();
        assert!(frame.starts_with("event: HEARTBEAT\n"));
        assert!(frame.contains("timestamp"));
    }
}

#[tokio::test]
async fn stuck_session_is_closed_without_disturbing_siblings() {
    let (registry, mut dead) = ConnectionRegistry::new(1);

    let stuck_session = Uuid::new_v4();
    // Never drained: the single-slot buffer fills after one event
    let _stuck_rx = registry.register("u1", stuck_session).await;
    let mut healthy_rx = registry.register("u1", Uuid::new_v4()).await;

    let first = SseEvent::Message(message(1, 1, "one"));
    let second = SseEvent::Message(message(2, 1, "two"));

    assert_eq!(registry.emit_to_user("u1", &first).await, 2);
    assert_eq!(registry.emit_to_user("u1", &second).await, 1);

    // The overflowing session was queued for the close reaper
    assert_eq!(dead.recv().await.unwrap(), stuck_session);

    // The healthy tab got both messages in order
    let frames: Vec<String> = vec![
        healthy_rx.recv().await.unwrap().to_frame(),
        healthy_rx.recv().await.unwrap().to_frame(),
    ];
    assert!(frames[0].contains("id: 1\n"));
    assert!(frames[1].contains("id: 2\n"));
}

#[tokio::test]
async fn unregistered_session_receives_nothing_further() {
    let (registry, _dead) = ConnectionRegistry::new(16);

    let session = Uuid::new_v4();
    let mut rx = registry.register("u1", session).await;

    registry
        .emit_to_user("u1", &SseEvent::MessageRemoved { broadcast_id: 4 })
        .await;
    assert!(rx.recv().await.is_some());

    let (user, last) = registry.unregister(session).await.unwrap();
    assert_eq!(user, "u1");
    assert!(last);

    assert_eq!(
        registry
            .emit_to_user("u1", &SseEvent::MessageRemoved { broadcast_id: 5 })
            .await,
        0
    );
    // Sender side is gone; the stream terminates
    assert!(rx.recv().await.is_none());
}
