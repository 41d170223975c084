//! Shared setup for the session integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use securecast_session::connection::MemoryLink;
use securecast_session::identity::DeviceIdentity;
use securecast_session::signaling::ManualTransport;
use securecast_session::{MemoryNetwork, SessionConfig, SessionEvent, SessionMachine};
use tokio::sync::broadcast;

/// Initialize test logging (call once per test)
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info,securecast_session=debug")
        .with_test_writer()
        .try_init();
}

pub fn config() -> SessionConfig {
    SessionConfig {
        stun_servers: Vec::new(),
        gather_timeout_ms: 200,
        handshake_timeout_ms: 2000,
        ..SessionConfig::default()
    }
}

pub fn manual_machine(network: &MemoryNetwork, id: &str, name: &str) -> SessionMachine {
    manual_machine_with(config(), network, id, name)
}

pub fn manual_machine_with(
    config: SessionConfig,
    network: &MemoryNetwork,
    id: &str,
    name: &str,
) -> SessionMachine {
    SessionMachine::with_identity(
        config,
        DeviceIdentity::with_id(id, Some(name)),
        Arc::new(network.clone()),
        Arc::new(ManualTransport),
    )
    .unwrap()
}

/// Run a full copy-paste handshake between `a` (offerer) and `b`
pub async fn handshake(a: &SessionMachine, b: &SessionMachine) {
    let offer = a.create_offer().await.unwrap();
    let answer = b.accept_offer(&offer).await.unwrap();
    let peer_id = a.complete_with_answer(&answer).await.unwrap();
    assert_eq!(peer_id, b.identity().device_id);
    b.wait_open(&a.identity().device_id).await.unwrap();
}

/// Laptop (A1) and Phone (B1) with an open session
pub async fn connected_pair(network: &MemoryNetwork) -> (SessionMachine, SessionMachine) {
    let a = manual_machine(network, "A1", "Laptop");
    let b = manual_machine(network, "B1", "Phone");
    handshake(&a, &b).await;
    (a, b)
}

/// Wait up to two seconds for an item matching `pred`
pub async fn next_matching<T, F>(rx: &mut broadcast::Receiver<T>, mut pred: F) -> T
where
    T: Clone,
    F: FnMut(&T) -> bool,
{
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match rx.recv().await {
                Ok(item) if pred(&item) => return item,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("channel closed"),
            }
        }
    })
    .await
    .expect("nothing matching received in time")
}

pub async fn next_event<F>(rx: &mut broadcast::Receiver<SessionEvent>, pred: F) -> SessionEvent
where
    F: FnMut(&SessionEvent) -> bool,
{
    next_matching(rx, pred).await
}

/// Poll `check` until it holds or two seconds pass
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

/// The in-memory link behind `machine`'s session with `peer_id`
pub async fn memory_link(
    network: &MemoryNetwork,
    machine: &SessionMachine,
    peer_id: &str,
) -> Arc<MemoryLink> {
    let session = machine.registry().get(peer_id).await.unwrap();
    network.link(session.link().link_id()).unwrap()
}

/// Panic if any `Error` event is waiting on `rx`
pub fn assert_no_errors(rx: &mut broadcast::Receiver<SessionEvent>) {
    while let Ok(event) = rx.try_recv() {
        assert!(
            !matches!(event, SessionEvent::Error { .. }),
            "unexpected error event: {:?}",
            event
        );
    }
}
