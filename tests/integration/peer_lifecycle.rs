//! Handshake timeout, disconnection and rediscovery flows.

use meshdag_sync::{
    MemoryHub, MemoryTransport, PeerEvent, PeerManager, PeerManagerConfig, Transport,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

#[tokio::test]
async fn handshake_timeout_fails_the_device_without_connecting() {
    let hub = MemoryHub::new();
    let transport = Arc::new(MemoryTransport::new(&hub, "mem://m", "m"));
    transport.initialize().await.unwrap();

    // a transport that receives bytes but never answers
    let silent = MemoryTransport::new(&hub, "mem://silent", "silent");
    silent.initialize().await.unwrap();

    let manager = Arc::new(PeerManager::new(
        transport.clone(),
        "peer-m",
        PeerManagerConfig::default()
            .with_auto_connect(false)
            .with_handshake_timeout(Duration::from_millis(100))
            .with_health_check_interval(Duration::from_millis(25))
            .with_discovery_interval(Duration::from_secs(60))
            .with_max_reconnect_attempts(0),
    ));
    let mut events = manager.subscribe();
    manager.start().await;
    manager.connect(&silent.device()).await.unwrap();

    let failed = timeout(Duration::from_secs(2), async {
        loop {
            match events.recv().await.unwrap() {
                PeerEvent::Failed { ref address } if address == "mem://silent" => break,
                PeerEvent::Connected(_) => panic!("silent device must never connect"),
                _ => {}
            }
        }
    })
    .await;
    assert!(failed.is_ok(), "expected a Failed event after the timeout");
    assert!(manager.connected_peers().await.is_empty());
    assert_eq!(manager.stats().await.handshakes_failed, 1);
    manager.stop().await;
}

#[tokio::test]
async fn auto_connect_discovers_and_binds_peers() {
    let hub = MemoryHub::new();

    // responder: full manager wired to its own receive loop
    let responder_transport = Arc::new(MemoryTransport::new(&hub, "mem://responder", "responder"));
    responder_transport.initialize().await.unwrap();
    let responder = Arc::new(PeerManager::new(
        responder_transport.clone(),
        "peer-responder",
        PeerManagerConfig::default().with_auto_connect(false),
    ));
    let mut responder_rx = responder_transport.incoming().await.unwrap();
    let responder_loop = {
        let responder = responder.clone();
        tokio::spawn(async move {
            while let Some(message) = responder_rx.recv().await {
                let _ = responder.handle_incoming(message).await;
            }
        })
    };

    // initiator: discovery loop with auto-connect on
    let initiator_transport = Arc::new(MemoryTransport::new(&hub, "mem://initiator", "initiator"));
    initiator_transport.initialize().await.unwrap();
    let initiator = Arc::new(PeerManager::new(
        initiator_transport.clone(),
        "peer-initiator",
        PeerManagerConfig::default()
            .with_discovery_interval(Duration::from_millis(25))
            .with_health_check_interval(Duration::from_millis(50)),
    ));
    let mut initiator_rx = initiator_transport.incoming().await.unwrap();
    let initiator_loop = {
        let initiator = initiator.clone();
        tokio::spawn(async move {
            while let Some(message) = initiator_rx.recv().await {
                let _ = initiator.handle_incoming(message).await;
            }
        })
    };

    let mut events = initiator.subscribe();
    initiator.start().await;

    let connected = timeout(Duration::from_secs(2), async {
        loop {
            if let PeerEvent::Connected(peer) = events.recv().await.unwrap() {
                return peer;
            }
        }
    })
    .await
    .expect("auto-connect should bind the responder");
    assert_eq!(connected.peer_id, "peer-responder");
    assert_eq!(responder.connected_peers().await.len(), 1);

    initiator.stop().await;
    responder_loop.abort();
    initiator_loop.abort();
}

#[tokio::test]
async fn lost_device_is_detected_by_health_check() {
    let hub = MemoryHub::new();
    let a_transport = Arc::new(MemoryTransport::new(&hub, "mem://a", "a"));
    a_transport.initialize().await.unwrap();
    let a = Arc::new(PeerManager::new(
        a_transport.clone(),
        "peer-a",
        PeerManagerConfig::default()
            .with_auto_connect(false)
            .with_discovery_interval(Duration::from_secs(60))
            .with_health_check_interval(Duration::from_millis(25)),
    ));
    let mut a_rx = a_transport.incoming().await.unwrap();
    let a_loop = {
        let a = a.clone();
        tokio::spawn(async move {
            while let Some(message) = a_rx.recv().await {
                let _ = a.handle_incoming(message).await;
            }
        })
    };

    let b_transport = Arc::new(MemoryTransport::new(&hub, "mem://b", "b"));
    b_transport.initialize().await.unwrap();
    let b = Arc::new(PeerManager::new(
        b_transport.clone(),
        "peer-b",
        PeerManagerConfig::default(),
    ));
    let mut b_rx = b_transport.incoming().await.unwrap();
    let b_loop = {
        let b = b.clone();
        tokio::spawn(async move {
            while let Some(message) = b_rx.recv().await {
                let _ = b.handle_incoming(message).await;
            }
        })
    };

    let mut events = a.subscribe();
    a.connect(&b_transport.device()).await.unwrap();
    timeout(Duration::from_secs(2), async {
        loop {
            if matches!(events.recv().await.unwrap(), PeerEvent::Connected(_)) {
                break;
            }
        }
    })
    .await
    .unwrap();

    a.start().await;
    // b vanishes; the next health probe notices
    b_transport.shutdown().await.unwrap();
    let disconnected = timeout(Duration::from_secs(2), async {
        loop {
            if let PeerEvent::Disconnected(peer_id) = events.recv().await.unwrap() {
                return peer_id;
            }
        }
    })
    .await
    .expect("health check should flag the lost device");
    assert_eq!(disconnected, "peer-b");
    let record = a.peer("peer-b").await.unwrap();
    assert!(!record.is_active);

    a.stop().await;
    a_loop.abort();
    b_loop.abort();
}
