#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
//! Connection lifecycle tests for the Flock Link manager.
//!
//! Uses the scripted `MockConnector` from `tests/common` to play the chat
//! server: handshake, disconnects, refused connections and acknowledgements.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use flock_link::protocol::events;
use flock_link::{
    ChatRoomTracker, ConnectionManager, ConnectionState, LinkConfig, LinkError, LinkSignal,
    RejectCode,
};
use serde_json::{json, Value};
use tokio_test::{assert_pending, assert_ready};

use common::{
    buyer, connected_manager, eventually, fast_config, MockConnector, Step,
};

fn counter() -> (Arc<AtomicUsize>, impl Fn(&Value) + Send + Sync + 'static) {
    let count = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&count);
    (count, move |_: &Value| {
        c.fetch_add(1, Ordering::SeqCst);
    })
}

// ════════════════════════════════════════════════════════════════════
// Connect and handshake
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn connect_verifies_token_then_announces_online() {
    let (connector, mut server) = MockConnector::new();
    let manager = ConnectionManager::new(fast_config(), connector);
    let mut states = manager.subscribe_state();

    let attempt = manager.connect(buyer());
    assert_eq!(manager.state(), ConnectionState::Connecting);

    let mut end = server.next_connection().await;
    assert_eq!(end.credentials.user_id, "buyer-1");
    assert_eq!(end.accept_auth().await, "jwt-buyer");
    let presence = end.expect_event(events::USER_STATUS).await;
    assert_eq!(presence, json!({ "status": "online" }));

    attempt.await.unwrap();
    assert_eq!(manager.state(), ConnectionState::Connected);
    assert_eq!(*states.borrow_and_update(), ConnectionState::Connected);

    let session = manager.session().unwrap();
    assert_eq!(session.user_id, "buyer-1");
    assert_eq!(session.auth_token, "jwt-buyer");
    assert_eq!(session.current_chat_room_id, None);
    assert_eq!(manager.reconnect_attempts(), 0);
}

#[tokio::test]
async fn concurrent_connects_share_one_attempt() {
    let (connector, mut server) = MockConnector::new();
    let manager = ConnectionManager::new(fast_config(), connector);

    let first = manager.connect(buyer());
    let second = manager.connect(buyer());
    assert_eq!(first.id(), second.id());
    assert_ne!(first.id(), 0);

    let mut first = tokio_test::task::spawn(first);
    let mut second = tokio_test::task::spawn(second);
    assert_pending!(first.poll());
    assert_pending!(second.poll());

    let mut end = server.next_connection().await;
    end.accept_and_expect_online().await;

    eventually(|| manager.is_connected()).await;
    assert_ready!(first.poll()).unwrap();
    assert_ready!(second.poll()).unwrap();
    assert_eq!(server.connects(), 1);
}

#[tokio::test]
async fn connect_while_connected_is_a_no_op() {
    let (manager, server, _end) = connected_manager(fast_config()).await;

    let again = manager.connect(buyer());
    assert_eq!(again.id(), 0);
    again.await.unwrap();
    assert_eq!(server.connects(), 1);
}

#[tokio::test]
async fn events_before_auth_ack_are_delivered_after_connect() {
    let (connector, mut server) = MockConnector::new();
    let manager = ConnectionManager::new(fast_config(), connector);
    let seen = Arc::new(StdMutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    manager.registry().on(events::MESSAGE_STATUS, move |payload| {
        sink.lock().unwrap().push(payload["messageId"].clone());
    });

    let attempt = manager.connect(buyer());
    let mut end = server.next_connection().await;
    let (_, _, ack) = end.next_event().await;
    end.push_event(
        events::MESSAGE_STATUS,
        json!({ "chatId": "c1", "messageId": "m1", "status": "read" }),
    );
    end.ack(ack.unwrap(), json!({}));
    attempt.await.unwrap();

    eventually(|| !seen.lock().unwrap().is_empty()).await;
    assert_eq!(*seen.lock().unwrap(), vec![json!("m1")]);
}

// ════════════════════════════════════════════════════════════════════
// Authentication failures
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn auth_rejection_is_terminal_and_signalled() {
    let (connector, mut server) = MockConnector::new();
    let manager = ConnectionManager::new(fast_config(), connector);
    let mut signals = manager.signals();

    let attempt = manager.connect(buyer());
    let mut end = server.next_connection().await;
    end.reject_auth("token expired", Some("TOKEN_EXPIRED")).await;

    let err = attempt.await.unwrap_err();
    assert!(matches!(
        err,
        LinkError::AuthRejected {
            code: Some(RejectCode::TokenExpired),
            ..
        }
    ));
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(manager.session().is_none());

    let signal = signals.recv().await.unwrap();
    assert_eq!(
        signal,
        LinkSignal::AuthFailed {
            reason: "token expired".into(),
            code: Some(RejectCode::TokenExpired),
        }
    );

    // Never retried.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.connects(), 1);
    assert!(end.client_closed());
}

// ════════════════════════════════════════════════════════════════════
// Attempt budget
// ════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn five_failures_reach_failed_and_next_connect_starts_fresh() {
    let (connector, mut server) = MockConnector::new();
    let manager = ConnectionManager::new(LinkConfig::default(), connector);
    let mut signals = manager.signals();
    server.refuse(5);

    let err = manager.connect(buyer()).await.unwrap_err();
    assert!(matches!(err, LinkError::ConnectionExhausted { attempts: 5 }));
    assert_eq!(manager.state(), ConnectionState::Failed);
    assert_eq!(manager.reconnect_attempts(), 5);
    assert_eq!(server.connects(), 5);
    assert!(matches!(
        signals.recv().await.unwrap(),
        LinkSignal::Degraded { attempts: 5, .. }
    ));

    // Sixth call: fresh sequence.
    let attempt = manager.connect(buyer());
    assert_eq!(manager.state(), ConnectionState::Connecting);
    assert_eq!(manager.reconnect_attempts(), 0);

    let mut end = server.next_connection().await;
    end.accept_and_expect_online().await;
    attempt.await.unwrap();
    assert_eq!(manager.state(), ConnectionState::Connected);
    assert_eq!(server.connects(), 6);
}

#[tokio::test(start_paused = true)]
async fn hung_connect_times_out_and_counts_as_attempt() {
    let (connector, mut server) = MockConnector::new();
    let manager = ConnectionManager::new(LinkConfig::default(), connector);
    server.script([Step::Hang]);

    let attempt = manager.connect(buyer());
    let mut end = server.next_connection().await;
    end.accept_and_expect_online().await;
    attempt.await.unwrap();

    assert_eq!(server.connects(), 2);
    assert_eq!(manager.reconnect_attempts(), 0);
}

#[tokio::test(start_paused = true)]
async fn unanswered_handshake_counts_as_attempt() {
    let (connector, mut server) = MockConnector::new();
    let manager = ConnectionManager::new(
        LinkConfig::default().with_max_reconnect_attempts(1),
        connector,
    );

    let attempt = manager.connect(buyer());
    let mut silent = server.next_connection().await;
    silent.expect_event(events::VERIFY_AUTH).await;

    let err = attempt.await.unwrap_err();
    assert!(matches!(err, LinkError::ConnectionExhausted { attempts: 1 }));
    assert!(silent.client_closed());
}

// ════════════════════════════════════════════════════════════════════
// Reconnection
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn listeners_survive_reconnect() {
    let (connector, mut server) = MockConnector::new();
    let manager = ConnectionManager::new(fast_config(), connector);

    let (before, on_before) = counter();
    manager.registry().on(events::NEW_MESSAGE, on_before);

    let attempt = manager.connect(buyer());
    let mut first = server.next_connection().await;
    first.accept_and_expect_online().await;
    attempt.await.unwrap();

    let (during, on_during) = counter();
    manager.registry().on(events::NEW_MESSAGE, on_during);

    first.push_event(events::NEW_MESSAGE, json!({}));
    eventually(|| before.load(Ordering::SeqCst) == 1).await;

    let mut states = manager.subscribe_state();
    first.hang_up();
    states
        .wait_for(|s| *s == ConnectionState::Reconnecting)
        .await
        .unwrap();

    let mut second = server.next_connection().await;
    second.accept_and_expect_online().await;
    eventually(|| manager.is_connected()).await;

    // The dead transport no longer delivers anything.
    first.push_event(events::NEW_MESSAGE, json!({}));
    second.push_event(events::NEW_MESSAGE, json!({}));

    eventually(|| before.load(Ordering::SeqCst) == 2).await;
    eventually(|| during.load(Ordering::SeqCst) == 2).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(before.load(Ordering::SeqCst), 2);
    assert_eq!(during.load(Ordering::SeqCst), 2);
    assert_eq!(manager.session().unwrap().user_id, "buyer-1");
}

#[tokio::test]
async fn rejoins_current_room_exactly_once() {
    let (manager, mut server, mut first) = connected_manager(fast_config()).await;
    let chat = ChatRoomTracker::new(manager.clone());

    assert!(chat.join_chat("room-1"));
    assert_eq!(
        first.expect_event(events::JOIN_CHAT).await,
        json!({ "chatId": "room-1" })
    );

    first.fail("connection reset");
    let mut second = server.next_connection().await;
    second.accept_and_expect_online().await;
    assert_eq!(
        second.expect_event(events::JOIN_CHAT).await,
        json!({ "chatId": "room-1" })
    );

    tokio::time::sleep(Duration::from_millis(100)).await;
    let joins = second
        .drain_events()
        .into_iter()
        .filter(|(event, _)| event == events::JOIN_CHAT)
        .count();
    assert_eq!(joins, 0);
    assert_eq!(manager.current_chat_room().as_deref(), Some("room-1"));
}

#[tokio::test]
async fn room_joined_while_offline_is_sent_on_connect() {
    let (connector, mut server) = MockConnector::new();
    let manager = ConnectionManager::new(fast_config(), connector);
    let chat = ChatRoomTracker::new(manager.clone());

    assert!(!chat.join_chat("room-7"));
    assert_eq!(chat.current_chat().as_deref(), Some("room-7"));

    let attempt = manager.connect(buyer());
    let mut end = server.next_connection().await;
    end.accept_and_expect_online().await;
    attempt.await.unwrap();
    assert_eq!(
        end.expect_event(events::JOIN_CHAT).await,
        json!({ "chatId": "room-7" })
    );
}

#[tokio::test(start_paused = true)]
async fn reconnect_budget_exhaustion_after_drop() {
    let (manager, mut server, first) = connected_manager(
        LinkConfig::default().with_max_reconnect_attempts(3),
    )
    .await;
    let mut signals = manager.signals();
    server.refuse(10);

    first.hang_up();
    let signal = signals.recv().await.unwrap();
    assert!(matches!(signal, LinkSignal::Degraded { attempts: 3, .. }));
    assert_eq!(manager.state(), ConnectionState::Failed);
    // One scheduled reconnect plus retries up to the budget.
    assert_eq!(server.connects(), 1 + 2);
    // Session is kept so the host can retry with connect().
    assert!(manager.session().is_some());
}

// ════════════════════════════════════════════════════════════════════
// Disconnect
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn disconnect_sends_offline_and_keeps_subscribers() {
    let (manager, _server, mut end) = connected_manager(fast_config()).await;
    let (_count, listener) = counter();
    manager.registry().on(events::TYPING, listener);

    manager.disconnect().await;
    assert_eq!(
        end.expect_event(events::USER_STATUS).await,
        json!({ "status": "offline" })
    );
    assert!(end.client_closed());
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(manager.session().is_none());
    assert_eq!(manager.registry().listener_count(events::TYPING), 1);
    assert!(!manager.registry().is_attached());

    // Idempotent.
    manager.disconnect().await;
    assert_eq!(manager.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn disconnect_cancels_pending_reconnect() {
    let (manager, server, first) = connected_manager(LinkConfig::default()).await;

    let mut states = manager.subscribe_state();
    first.hang_up();
    states
        .wait_for(|s| *s == ConnectionState::Reconnecting)
        .await
        .unwrap();

    manager.disconnect().await;
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(server.connects(), 1);
    assert_eq!(manager.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn disconnect_cancels_in_flight_attempt() {
    let (connector, mut server) = MockConnector::new();
    let manager = ConnectionManager::new(fast_config(), connector);

    let attempt = manager.connect(buyer());
    let _end = server.next_connection().await;
    manager.disconnect().await;

    assert!(matches!(attempt.await, Err(LinkError::Cancelled)));
}

// ════════════════════════════════════════════════════════════════════
// Sending
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn emit_is_dropped_while_offline() {
    let (connector, _server) = MockConnector::new();
    let manager = ConnectionManager::new(fast_config(), connector);
    assert!(!manager.emit(events::USER_STATUS, &json!({ "status": "away" })));
}

#[tokio::test]
async fn request_resolves_with_matching_ack() {
    let (manager, _server, mut end) = connected_manager(fast_config()).await;

    let requester = manager.clone();
    let pending = tokio::spawn(async move {
        requester
            .request(events::SEND_MESSAGE, &json!({ "chatId": "c1" }))
            .await
    });

    let (event, data, ack) = end.next_event().await;
    assert_eq!(event, events::SEND_MESSAGE);
    assert_eq!(data, json!({ "chatId": "c1" }));
    end.ack(ack.unwrap(), json!({ "ok": true }));

    assert_eq!(pending.await.unwrap().unwrap(), json!({ "ok": true }));
}

#[tokio::test]
async fn request_fails_when_link_drops_before_ack() {
    let (manager, _server, mut end) = connected_manager(fast_config()).await;

    let requester = manager.clone();
    let pending = tokio::spawn(async move {
        requester
            .request(events::SEND_MESSAGE, &json!({ "chatId": "c1" }))
            .await
    });
    end.next_event().await;
    end.hang_up();

    assert!(matches!(
        pending.await.unwrap(),
        Err(LinkError::NotConnected)
    ));
}

#[tokio::test]
async fn malformed_frames_do_not_tear_down_the_link() {
    let (manager, _server, end) = connected_manager(fast_config()).await;
    let (count, listener) = counter();
    manager.registry().on(events::TYPING, listener);

    end.push_raw("definitely not json");
    end.push_raw(r#"{"type":"mystery"}"#);
    end.push_event(events::TYPING, json!({}));

    eventually(|| count.load(Ordering::SeqCst) == 1).await;
    assert!(manager.is_connected());
}
