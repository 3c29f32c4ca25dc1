//! Garbage collection and graph-shape flows through a full local stack.

use ciborium::value::Value;
use meshdag_core_types::{codec, Block, Cid, HashAlgorithm};
use meshdag_sync::{MemoryHub, MemoryTransport, PeerManager, PeerManagerConfig, SyncConfig, Synchronizer, Transport};
use meshdag_types::{BlockStore, DagError, MemoryBlockStore, MerkleDag};
use std::sync::Arc;

fn raw_block(data: &[u8]) -> Block {
    Block::from_data(data, codec::RAW, HashAlgorithm::Sha2_256)
}

fn cbor_link_payload(targets: &[&Cid]) -> Vec<u8> {
    let links: Vec<Value> = targets
        .iter()
        .map(|cid| {
            let mut bytes = vec![0x00];
            bytes.extend(cid.to_bytes());
            Value::Tag(42, Box::new(Value::Bytes(bytes)))
        })
        .collect();
    let mut buf = Vec::new();
    ciborium::ser::into_writer(&Value::Array(links), &mut buf).unwrap();
    buf
}

fn cbor_linking(targets: &[&Cid]) -> Block {
    Block::from_data(
        cbor_link_payload(targets),
        codec::DAG_CBOR,
        HashAlgorithm::Sha2_256,
    )
}

/// A peerless stack: the synchronizer still stores, indexes and (vainly)
/// announces.
async fn lone_node(hub: &MemoryHub, name: &str) -> Synchronizer {
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
    let sync = Synchronizer::new(store, dag, manager, SyncConfig::default());
    sync.initialize(transport.as_ref()).await.unwrap();
    sync
}

#[tokio::test]
async fn gc_preserves_the_rooted_chain_and_sweeps_the_stray() {
    let hub = MemoryHub::new();
    let node = lone_node(&hub, "solo").await;

    let c = raw_block(b"c: the leaf");
    let b = cbor_linking(&[c.cid()]);
    let a = cbor_linking(&[b.cid()]);
    let d = raw_block(b"d: unreferenced");
    for block in [&c, &b, &a, &d] {
        node.add_block((*block).clone()).await.unwrap();
    }

    let report = node
        .store()
        .collect_garbage(std::slice::from_ref(a.cid()))
        .await
        .unwrap();
    assert_eq!(report.blocks_removed, 1);
    assert_eq!(report.bytes_freed, d.size());

    for kept in [&a, &b, &c] {
        assert!(node.store().has(kept.cid()).await.unwrap());
    }
    assert!(!node.store().has(d.cid()).await.unwrap());
}

#[tokio::test]
async fn declared_link_cycle_is_detected_and_blocks_topo_sort() {
    let hub = MemoryHub::new();
    let node = lone_node(&hub, "solo").await;

    // two payloads whose declared links point at each other; honest
    // hashing cannot build this, so the CIDs are forged via with_cid
    let cid_a = Cid::new_v1(codec::DAG_CBOR, HashAlgorithm::Sha2_256.digest(b"slot a"));
    let cid_b = Cid::new_v1(codec::DAG_CBOR, HashAlgorithm::Sha2_256.digest(b"slot b"));
    let a = Block::with_cid(cid_a.clone(), cbor_link_payload(&[&cid_b]));
    let b = Block::with_cid(cid_b.clone(), cbor_link_payload(&[&cid_a]));

    node.dag().add_block(&a).await.unwrap();
    node.dag().add_block(&b).await.unwrap();

    assert!(node.dag().has_cycles().await);
    assert!(matches!(
        node.dag().topological_sort().await,
        Err(DagError::Cyclic)
    ));
}

#[tokio::test]
async fn added_blocks_are_indexed_with_their_links() {
    let hub = MemoryHub::new();
    let node = lone_node(&hub, "solo").await;

    let leaf = raw_block(b"leaf");
    let root = cbor_linking(&[leaf.cid()]);
    node.add_block(leaf.clone()).await.unwrap();
    node.add_block(root.clone()).await.unwrap();

    assert_eq!(
        node.dag().get_children(root.cid()).await,
        vec![leaf.cid().clone()]
    );
    assert_eq!(
        node.dag().get_parents(leaf.cid()).await,
        vec![root.cid().clone()]
    );
    let stats = node.dag().stats().await;
    assert_eq!(stats.total_blocks, 2);
    assert_eq!(stats.root_count, 1);
    assert_eq!(stats.leaf_count, 1);
    assert_eq!(stats.max_depth, 1);

    assert!(!node.dag().has_cycles().await);
    let order = node.dag().topological_sort().await.unwrap();
    assert_eq!(order, vec![root.cid().clone(), leaf.cid().clone()]);
}

#[tokio::test]
async fn adding_an_invalid_block_surfaces_to_the_caller() {
    let hub = MemoryHub::new();
    let node = lone_node(&hub, "solo").await;
    let forged = Block::with_cid(raw_block(b"real").cid().clone(), b"fake".to_vec());
    assert!(node.add_block(forged.clone()).await.is_err());
    assert!(!node.store().has(forged.cid()).await.unwrap());
    assert!(!node.dag().contains(forged.cid()).await);
}
