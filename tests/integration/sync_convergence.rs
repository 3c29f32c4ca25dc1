//! Two-node block replication over the in-memory hub.

use meshdag_core_types::{codec, Block, Cid, HashAlgorithm};
use meshdag_sync::{
    MemoryHub, MemoryTransport, PeerEvent, PeerManager, PeerManagerConfig, SyncConfig, SyncEvent,
    SyncMessage, Synchronizer, Transport,
};
use meshdag_types::{BlockStore, MemoryBlockStore, MerkleDag};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::timeout;

fn raw_block(data: &[u8]) -> Block {
    Block::from_data(data, codec::RAW, HashAlgorithm::Sha2_256)
}

struct Node {
    transport: Arc<MemoryTransport>,
    manager: Arc<PeerManager>,
    sync: Synchronizer,
}

/// A full stack: transport on the hub, peer manager, store, DAG and a
/// running synchronizer loop.
async fn node(hub: &MemoryHub, name: &str) -> Node {
    let transport = Arc::new(MemoryTransport::new(
        hub,
        format!("mem://{name}"),
        name.to_string(),
    ));
    transport.initialize().await.unwrap();
    let manager = Arc::new(PeerManager::new(
        transport.clone(),
        format!("peer-{name}"),
        PeerManagerConfig::default(),
    ));
    let store: Arc<dyn BlockStore> = Arc::new(MemoryBlockStore::new());
    let dag = Arc::new(MerkleDag::new());
    let sync = Synchronizer::new(store, dag, manager.clone(), SyncConfig::default());
    sync.initialize(transport.as_ref()).await.unwrap();
    Node {
        transport,
        manager,
        sync,
    }
}

async fn wait_peer_connected(events: &mut broadcast::Receiver<PeerEvent>) {
    loop {
        let event = timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("timed out waiting for Connected")
            .expect("peer event channel closed");
        if matches!(event, PeerEvent::Connected(_)) {
            return;
        }
    }
}

/// Handshake two running nodes and wait until both sides are bound.
async fn link(a: &Node, b: &Node) {
    let mut a_events = a.manager.subscribe();
    let mut b_events = b.manager.subscribe();
    a.manager.connect(&b.transport.device()).await.unwrap();
    wait_peer_connected(&mut a_events).await;
    wait_peer_connected(&mut b_events).await;
}

async fn wait_block_received(
    events: &mut broadcast::Receiver<SyncEvent>,
    expected: &Cid,
) -> String {
    loop {
        let event = timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("timed out waiting for BlockReceived")
            .expect("sync event channel closed");
        if let SyncEvent::BlockReceived { cid, from_peer } = event {
            if &cid == expected {
                return from_peer;
            }
        }
    }
}

#[tokio::test]
async fn announce_want_respond_converges_two_peers() {
    let hub = MemoryHub::new();
    let a = node(&hub, "a").await;
    let b = node(&hub, "b").await;
    link(&a, &b).await;

    let mut b_events = b.sync.subscribe().await.unwrap();
    let block = raw_block(b"hello");
    let cid = a.sync.add_block(block.clone()).await.unwrap();

    let from_peer = wait_block_received(&mut b_events, &cid).await;
    assert_eq!(from_peer, "peer-a");

    assert!(b.sync.store().has(&cid).await.unwrap());
    let replica = b.sync.store().get(&cid).await.unwrap().unwrap();
    assert_eq!(replica.data(), b"hello");
    assert!(b.sync.dag().get_children(&cid).await.is_empty());

    let b_stats = b.sync.stats().await;
    assert_eq!(b_stats.total_blocks_received, 1);
    assert!(b_stats.last_sync_time.is_some());
    let a_stats = a.sync.stats().await;
    assert_eq!(a_stats.total_blocks_sent, 1);
}

#[tokio::test]
async fn tampered_response_is_rejected() {
    let hub = MemoryHub::new();
    let a = node(&hub, "a").await;
    let b = node(&hub, "b").await;
    link(&a, &b).await;

    let mut b_events = b.sync.subscribe().await.unwrap();
    // the CID of "hello" over the bytes "hell"
    let forged = Block::with_cid(raw_block(b"hello").cid().clone(), b"hell".to_vec());
    a.manager
        .send_to_peer("peer-b", &SyncMessage::BlockResponse { block: forged.clone() })
        .await
        .unwrap();

    let event = timeout(Duration::from_secs(2), async {
        loop {
            if let SyncEvent::SyncError { peer_id, .. } = b_events.recv().await.unwrap() {
                return peer_id;
            }
        }
    })
    .await
    .expect("expected a SyncError event");
    assert_eq!(event.as_deref(), Some("peer-a"));

    assert!(!b.sync.store().has(forged.cid()).await.unwrap());
    assert_eq!(b.sync.stats().await.total_blocks_received, 0);
}

#[tokio::test]
async fn duplicate_have_produces_no_duplicate_want() {
    let hub = MemoryHub::new();
    let a = node(&hub, "a").await;
    let b = node(&hub, "b").await;
    link(&a, &b).await;

    let mut a_events = a.sync.subscribe().await.unwrap();
    let mut b_events = b.sync.subscribe().await.unwrap();
    let block = raw_block(b"popular");
    let cid = a.sync.add_block(block.clone()).await.unwrap();
    wait_block_received(&mut b_events, &cid).await;

    // re-announce twice; b already stores the block
    let have = SyncMessage::Have {
        cids: vec![cid.clone()],
    };
    assert_eq!(a.manager.broadcast(&have).await, 1);
    assert_eq!(a.manager.broadcast(&have).await, 1);
    tokio::time::sleep(Duration::from_millis(200)).await;

    // exactly the one WANT from the original exchange reached a
    let mut want_rounds = 0;
    while let Ok(event) = a_events.try_recv() {
        if matches!(event, SyncEvent::BlocksRequested { .. }) {
            want_rounds += 1;
        }
    }
    assert_eq!(want_rounds, 1);
    assert_eq!(a.sync.stats().await.total_blocks_sent, 1);
    assert_eq!(b.sync.stats().await.total_blocks_received, 1);
}

#[tokio::test]
async fn fetch_missing_blocks_pulls_a_linked_child() {
    let hub = MemoryHub::new();
    let a = node(&hub, "a").await;
    let b = node(&hub, "b").await;
    link(&a, &b).await;

    // b holds the child; a holds only the parent that links it
    let child = raw_block(b"linked child");
    b.sync.add_block(child.clone()).await.unwrap();

    let parent = {
        use ciborium::value::Value;
        let mut bytes = vec![0x00];
        bytes.extend(child.cid().to_bytes());
        let mut buf = Vec::new();
        ciborium::ser::into_writer(
            &Value::Array(vec![Value::Tag(42, Box::new(Value::Bytes(bytes)))]),
            &mut buf,
        )
        .unwrap();
        Block::from_data(buf, codec::DAG_CBOR, HashAlgorithm::Sha2_256)
    };
    let mut a_events = a.sync.subscribe().await.unwrap();
    let parent_cid = a.sync.add_block(parent.clone()).await.unwrap();

    let missing = a.sync.fetch_missing_blocks(&parent_cid).await.unwrap();
    assert_eq!(missing, vec![child.cid().clone()]);

    let from_peer = wait_block_received(&mut a_events, child.cid()).await;
    assert_eq!(from_peer, "peer-b");
    assert!(a.sync.store().has(child.cid()).await.unwrap());
    // now nothing is missing under the parent
    assert!(a
        .sync
        .fetch_missing_blocks(&parent_cid)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn dispose_closes_events_and_refuses_work() {
    let hub = MemoryHub::new();
    let a = node(&hub, "a").await;
    let mut events = a.sync.subscribe().await.unwrap();

    a.sync.dispose().await;
    assert!(matches!(
        events.recv().await,
        Err(broadcast::error::RecvError::Closed)
    ));
    assert!(a.sync.add_block(raw_block(b"late")).await.is_err());
    assert!(a.sync.subscribe().await.is_err());
    // the transport is untouched by dispose
    assert!(a
        .transport
        .is_peer_reachable(&a.transport.device())
        .await
        .unwrap());
}
