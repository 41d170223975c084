//! Copy-paste handshake between two in-process devices
//!
//! ```bash
//! cargo test -p securecast-session --test manual_handshake_test -- --nocapture
//! ```

mod harness;

use std::sync::Arc;

use harness::{
    config, connected_pair, eventually, init_logging, manual_machine, manual_machine_with,
    memory_link, next_event, next_matching,
};
use securecast_session::channels::ControlMessage;
use securecast_session::connection::MemoryOptions;
use securecast_session::{Error, MemoryNetwork, SessionEvent, SessionState};
use tokio::sync::mpsc;

// ============================================================================
// Handshake
// ============================================================================

#[tokio::test]
async fn test_manual_handshake_opens_both_sides() {
    init_logging();

    let network = MemoryNetwork::new();
    let a = manual_machine(&network, "A1", "Laptop");
    let b = manual_machine(&network, "B1", "Phone");
    let mut a_events = a.subscribe();
    let mut b_events = b.subscribe();

    let offer = a.create_offer().await.unwrap();
    let answer = b.accept_offer(&offer).await.unwrap();
    assert_eq!(a.complete_with_answer(&answer).await.unwrap(), "B1");
    b.wait_open("A1").await.unwrap();

    let connected = next_event(&mut a_events, |e| matches!(e, SessionEvent::Connected { .. })).await;
    assert_eq!(
        connected,
        SessionEvent::Connected {
            peer_id: "B1".to_string(),
            device_name: Some("Phone".to_string()),
        }
    );
    let connected = next_event(&mut b_events, |e| matches!(e, SessionEvent::Connected { .. })).await;
    assert_eq!(connected.peer_id(), Some("A1"));

    let open_on_a: Vec<String> = a.list_open().await.iter().map(|s| s.peer_id()).collect();
    assert_eq!(open_on_a, vec!["B1".to_string()]);
    assert_eq!(b.list_open().await.len(), 1);

    let session = a.registry().get("B1").await.unwrap();
    assert_eq!(session.state(), SessionState::ChannelOpen);
    assert_eq!(session.display_name(), "Phone");
}

#[tokio::test]
async fn test_custom_messages_flow_both_ways() {
    init_logging();

    let network = MemoryNetwork::new();
    let (a, b) = connected_pair(&network).await;
    let mut b_inbox = b.bus().subscribe();

    assert!(a.bus().send_custom("B1", "hello phone").await);
    let inbound = next_matching(&mut b_inbox, |m| m.message.kind() == "custom_message").await;
    assert_eq!(inbound.peer_id, "A1");
    assert!(matches!(
        inbound.message,
        ControlMessage::CustomMessage { ref message, .. } if message == "hello phone"
    ));

    let (tx, mut rx) = mpsc::unbounded_channel();
    a.on_message("custom_message", move |peer_id, message| {
        let tx = tx.clone();
        async move {
            let _ = tx.send((peer_id, message));
        }
    });
    assert!(b.send("A1", &ControlMessage::custom("hello laptop")).await);

    let (from, message) = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(from, "B1");
    assert!(matches!(message, ControlMessage::CustomMessage { message, .. } if message == "hello laptop"));
}

#[tokio::test]
async fn test_send_to_unknown_peer_returns_false() {
    init_logging();

    let network = MemoryNetwork::new();
    let (a, _b) = connected_pair(&network).await;
    assert!(!a.bus().send_custom("Z9", "anyone?").await);
}

// ============================================================================
// Rejected input
// ============================================================================

#[tokio::test]
async fn test_malformed_offer_creates_no_session() {
    init_logging();

    let network = MemoryNetwork::new();
    let b = manual_machine(&network, "B1", "Phone");

    let err = b.accept_offer("definitely not an envelope").await.unwrap_err();
    assert!(matches!(err, Error::MalformedEnvelope(_)));
    assert!(b.registry().is_empty().await);
}

#[tokio::test]
async fn test_garbled_answer_keeps_pending_offer() {
    init_logging();

    let network = MemoryNetwork::new();
    let a = manual_machine(&network, "A1", "Laptop");
    let b = manual_machine(&network, "B1", "Phone");

    let offer = a.create_offer().await.unwrap();
    let err = a.complete_with_answer("{\"type\":").await.unwrap_err();
    assert!(matches!(err, Error::InvalidAnswer(_)));
    assert!(a.registry().contains("A1").await);

    // The pending offer can still be completed afterwards.
    let answer = b.accept_offer(&offer).await.unwrap();
    assert_eq!(a.complete_with_answer(&answer).await.unwrap(), "B1");
}

#[tokio::test]
async fn test_offer_pasted_back_into_its_creator_is_refused() {
    init_logging();

    let network = MemoryNetwork::new();
    let a = manual_machine(&network, "A1", "Laptop");

    let offer = a.create_offer().await.unwrap();
    let err = a.accept_offer(&offer).await.unwrap_err();
    assert!(matches!(err, Error::InvalidOffer(_)));
    assert_eq!(a.registry().len().await, 1);
}

#[tokio::test]
async fn test_second_offer_does_not_replace_pending_one() {
    init_logging();

    let network = MemoryNetwork::new();
    let a = manual_machine(&network, "A1", "Laptop");

    a.create_offer().await.unwrap();
    let first = a.registry().get("A1").await.unwrap();

    let err = a.create_offer().await.unwrap_err();
    assert!(matches!(err, Error::AlreadyExists(ref id) if id == "A1"));
    assert_eq!(a.registry().len().await, 1);
    assert!(Arc::ptr_eq(&first, &a.registry().get("A1").await.unwrap()));
}

#[tokio::test]
async fn test_repeated_offer_from_connected_peer_is_refused() {
    init_logging();

    let network = MemoryNetwork::new();
    let (_a, b) = connected_pair(&network).await;
    let c = manual_machine(&network, "A1", "Laptop again");

    let offer = c.create_offer().await.unwrap();
    let err = b.accept_offer(&offer).await.unwrap_err();
    assert!(matches!(err, Error::AlreadyExists(ref id) if id == "A1"));
    assert_eq!(b.list_open().await.len(), 1);
}

// ============================================================================
// Timeouts and teardown
// ============================================================================

#[tokio::test]
async fn test_channel_that_never_opens_times_out() {
    init_logging();

    let network = MemoryNetwork::with_options(MemoryOptions {
        stall_channel: true,
        ..MemoryOptions::default()
    });
    let mut config = config();
    config.handshake_timeout_ms = 1000;
    let a = manual_machine_with(config.clone(), &network, "A1", "Laptop");
    let b = manual_machine_with(config, &network, "B1", "Phone");

    let offer = a.create_offer().await.unwrap();
    let answer = b.accept_offer(&offer).await.unwrap();
    let err = a.complete_with_answer(&answer).await.unwrap_err();

    assert!(matches!(
        err,
        Error::HandshakeTimeout { ref peer_id, waited_ms: 1000 } if peer_id == "B1"
    ));
    assert!(err.is_retryable());
    assert!(a.registry().is_empty().await);
    assert!(eventually(|| async { b.registry().is_empty().await }).await);
}

#[tokio::test]
async fn test_disconnect_notifies_both_sides() {
    init_logging();

    let network = MemoryNetwork::new();
    let (a, b) = connected_pair(&network).await;
    let mut a_events = a.subscribe();
    let mut b_events = b.subscribe();

    assert!(a.disconnect("B1").await);
    assert!(!a.disconnect("B1").await);

    let local = next_event(&mut a_events, |e| matches!(e, SessionEvent::Disconnected { .. })).await;
    assert_eq!(
        local,
        SessionEvent::Disconnected {
            peer_id: "B1".to_string(),
            reason: Some("disconnected locally".to_string()),
        }
    );
    let remote = next_event(&mut b_events, |e| matches!(e, SessionEvent::Disconnected { .. })).await;
    assert_eq!(remote.peer_id(), Some("A1"));

    assert!(a.registry().is_empty().await);
    assert!(eventually(|| async { b.registry().is_empty().await }).await);
    assert!(!a.bus().send_custom("B1", "still there?").await);
}

#[tokio::test]
async fn test_failed_connection_ends_session() {
    init_logging();

    let network = MemoryNetwork::new();
    let (a, b) = connected_pair(&network).await;
    let mut events = a.subscribe();

    memory_link(&network, &a, "B1").await.fail();

    let ended = next_event(&mut events, |e| matches!(e, SessionEvent::Disconnected { .. })).await;
    assert_eq!(
        ended,
        SessionEvent::Disconnected {
            peer_id: "B1".to_string(),
            reason: Some("connection failed".to_string()),
        }
    );
    let failed = next_event(&mut events, |e| {
        matches!(e, SessionEvent::StateChanged { to: SessionState::Failed, .. })
    })
    .await;
    assert_eq!(failed.peer_id(), Some("B1"));
    assert!(a.registry().is_empty().await);

    b.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_closes_sessions_and_refuses_new_work() {
    init_logging();

    let network = MemoryNetwork::new();
    let (a, b) = connected_pair(&network).await;

    a.shutdown().await;
    a.shutdown().await;
    assert!(a.is_shut_down());
    assert!(a.registry().is_empty().await);
    assert!(a.create_offer().await.is_err());
    assert!(eventually(|| async { b.list_open().await.is_empty() }).await);
}

#[tokio::test]
async fn test_debug_info_counts_sessions_by_state() {
    init_logging();

    let network = MemoryNetwork::new();
    let (a, _b) = connected_pair(&network).await;

    let info = a.debug_info().await;
    assert_eq!(info.transport, "manual");
    assert_eq!(info.session_count, 1);
    assert_eq!(info.sessions_by_state.get("channel_open"), Some(&1));
    assert_eq!(info.device.name, "Laptop");
}
