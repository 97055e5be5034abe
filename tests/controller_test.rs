use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use blockfs::cluster::{NodeId, NodeStatus};
use blockfs::network::{BlockTransport, NetworkError};
use blockfs::storage::MetadataStore;
use blockfs::{BlockFsError, Controller, ControllerConfig};

/// Storage nodes kept in memory, keyed by `(node, block)`.
#[derive(Default)]
struct MemoryNodes {
    blocks: Mutex<HashMap<(String, String), Bytes>>,
    down: Mutex<HashSet<String>>,
}

impl MemoryNodes {
    fn take_down(&self, node: &str) {
        self.down.lock().unwrap().insert(node.to_string());
    }

    fn holds(&self, node: &str, block: &str) -> bool {
        self.blocks
            .lock()
            .unwrap()
            .contains_key(&(node.to_string(), block.to_string()))
    }

    fn drop_block(&self, node: &str, block: &str) {
        self.blocks
            .lock()
            .unwrap()
            .remove(&(node.to_string(), block.to_string()));
    }

    fn stored(&self) -> usize {
        self.blocks.lock().unwrap().len()
    }

    fn check(&self, node: &str) -> Result<(), NetworkError> {
        if self.down.lock().unwrap().contains(node) {
            return Err(NetworkError::ConnectionFailed(format!("{} is down", node)));
        }
        Ok(())
    }
}

#[async_trait]
impl BlockTransport for MemoryNodes {
    async fn write_block(&self, node: &str, block_id: &str, data: Bytes) -> Result<(), NetworkError> {
        self.check(node)?;
        self.blocks
            .lock()
            .unwrap()
            .insert((node.to_string(), block_id.to_string()), data);
        Ok(())
    }

    async fn read_block(&self, node: &str, block_id: &str) -> Result<Option<Bytes>, NetworkError> {
        self.check(node)?;
        Ok(self
            .blocks
            .lock()
            .unwrap()
            .get(&(node.to_string(), block_id.to_string()))
            .cloned())
    }

    async fn delete_block(&self, node: &str, block_id: &str) -> Result<bool, NetworkError> {
        self.check(node)?;
        Ok(self
            .blocks
            .lock()
            .unwrap()
            .remove(&(node.to_string(), block_id.to_string()))
            .is_some())
    }
}

fn config(dir: &TempDir, quorum: usize, replication_factor: u32) -> ControllerConfig {
    ControllerConfig {
        quorum,
        replication_factor,
        metadata_path: dir.path().join("metadata.json"),
        download_dir: dir.path().join("downloads"),
        interactive: false,
        ..ControllerConfig::default()
    }
}

async fn start(config: ControllerConfig, nodes: &Arc<MemoryNodes>) -> Arc<Controller> {
    Controller::with_transport(config, nodes.clone()).await.unwrap()
}

async fn register(controller: &Controller, ports: &[u16]) -> Vec<NodeId> {
    let mut ids = Vec::new();
    for port in ports {
        ids.push(controller.registry().register("127.0.0.1", *port).await.unwrap());
    }
    ids
}

fn payload(len: usize) -> Bytes {
    Bytes::from((0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>())
}

async fn placements(dir: &TempDir) -> std::collections::BTreeMap<String, String> {
    MetadataStore::new(dir.path().join("metadata.json"))
        .load()
        .await
        .unwrap()
        .placements
}

#[tokio::test]
async fn uploads_wait_for_quorum() {
    let dir = TempDir::new().unwrap();
    let nodes = Arc::new(MemoryNodes::default());
    let controller = start(config(&dir, 3, 0), &nodes).await;

    register(&controller, &[6000, 6001]).await;
    // Re-registering a known node does not count towards the quorum.
    register(&controller, &[6001]).await;

    let result = controller.upload_bytes("early.txt", payload(10)).await;
    assert!(matches!(
        result,
        Err(BlockFsError::QuorumNotReached { registered: 2, required: 3 })
    ));
    assert_eq!(nodes.stored(), 0);

    register(&controller, &[6002]).await;
    controller.upload_bytes("early.txt", payload(10)).await.unwrap();
}

#[tokio::test]
async fn duplicate_file_names_are_rejected() {
    let dir = TempDir::new().unwrap();
    let nodes = Arc::new(MemoryNodes::default());
    let controller = start(config(&dir, 1, 0), &nodes).await;
    register(&controller, &[6000]).await;

    controller.upload_bytes("a.bin", payload(100)).await.unwrap();
    let stored = nodes.stored();

    assert!(matches!(
        controller.upload_bytes("a.bin", payload(5)).await,
        Err(BlockFsError::FileAlreadyExists(_))
    ));
    assert_eq!(nodes.stored(), stored);
}

#[tokio::test]
async fn round_robin_cycles_primaries_over_nodes() {
    let dir = TempDir::new().unwrap();
    let nodes = Arc::new(MemoryNodes::default());
    let controller = start(config(&dir, 3, 0), &nodes).await;
    let ids = register(&controller, &[6000, 6001, 6002]).await;

    let report = controller.upload_bytes("six.bin", payload(64 * 6)).await.unwrap();
    assert_eq!(report.blocks_total, 6);

    let placed = placements(&dir).await;
    for sequence in 1..=6usize {
        let expected = &ids[(sequence - 1) % 3];
        assert_eq!(
            placed.get(&format!("six.bin_block_{}", sequence)).map(String::as_str),
            Some(expected.as_str()),
            "block {}",
            sequence
        );
    }
}

#[tokio::test]
async fn concurrent_uploads_do_not_interleave() {
    let dir = TempDir::new().unwrap();
    let nodes = Arc::new(MemoryNodes::default());
    let controller = start(config(&dir, 3, 1), &nodes).await;
    register(&controller, &[6000, 6001, 6002]).await;

    let uploads: Vec<_> = ["left.bin", "right.bin"]
        .into_iter()
        .map(|name| {
            let controller = controller.clone();
            tokio::spawn(async move { controller.upload_bytes(name, payload(64 * 6)).await })
        })
        .collect();
    for upload in uploads {
        let report = upload.await.unwrap().unwrap();
        assert!(report.failures.is_empty());
    }

    let placed = placements(&dir).await;
    assert_eq!(placed.len(), 24);
    for name in ["left.bin", "right.bin"] {
        let node = |sequence: usize| placed.get(&format!("{}_block_{}", name, sequence)).unwrap();

        let first_cycle: HashSet<&String> = (1..=3).map(&node).collect();
        assert_eq!(first_cycle.len(), 3, "{} reused a node within one cycle", name);
        for sequence in 1..=3 {
            assert_eq!(node(sequence), node(sequence + 3), "{} block {}", name, sequence);
            assert!(placed.contains_key(&format!("{}_block_{}_Replica", name, sequence)));
            assert!(placed.contains_key(&format!("{}_block_{}_Replica", name, sequence + 3)));
        }
    }

    let files = controller.list_files().await;
    assert_eq!(files.len(), 2);
    assert!(files.iter().all(|file| file.blocks == 6));
}

#[tokio::test]
async fn file_names_with_the_field_delimiter_are_refused() {
    let dir = TempDir::new().unwrap();
    let nodes = Arc::new(MemoryNodes::default());
    let controller = start(config(&dir, 1, 1), &nodes).await;
    register(&controller, &[6000]).await;

    assert!(matches!(
        controller.upload_bytes("evil?>?name", payload(130)).await,
        Err(BlockFsError::InvalidFileName(_))
    ));
    assert_eq!(nodes.stored(), 0);
    assert!(controller.list_files().await.is_empty());
}

#[tokio::test]
async fn every_block_gets_the_configured_replicas() {
    let dir = TempDir::new().unwrap();
    let nodes = Arc::new(MemoryNodes::default());
    let controller = start(config(&dir, 3, 2), &nodes).await;
    register(&controller, &[6000, 6001, 6002]).await;

    let report = controller.upload_bytes("r.bin", payload(130)).await.unwrap();
    assert_eq!(report.blocks_total, 3);
    assert_eq!(report.replicas_attempted, 6);
    assert_eq!(report.replicas_written, 6);
    assert!(report.failures.is_empty());

    let placed = placements(&dir).await;
    assert_eq!(placed.len(), 9);
    for sequence in 1..=3 {
        let copies: HashSet<&String> = [
            format!("r.bin_block_{}", sequence),
            format!("r.bin_block_{}_Replica", sequence),
            format!("r.bin_block_{}_Replica2", sequence),
        ]
        .iter()
        .map(|id| placed.get(id).unwrap())
        .collect();
        assert_eq!(copies.len(), 3, "copies of block {} share a node", sequence);
    }
}

#[tokio::test]
async fn blocks_are_split_at_the_chunk_size() {
    let dir = TempDir::new().unwrap();
    let nodes = Arc::new(MemoryNodes::default());
    let controller = start(config(&dir, 1, 0), &nodes).await;
    let ids = register(&controller, &[6000]).await;

    let data = payload(130);
    controller.upload_bytes("split.bin", data.clone()).await.unwrap();

    let node = ids[0].as_str();
    let sizes: Vec<usize> = (1..=3)
        .map(|n| {
            nodes
                .blocks
                .lock()
                .unwrap()
                .get(&(node.to_string(), format!("split.bin_block_{}", n)))
                .map(Bytes::len)
                .unwrap_or(0)
        })
        .collect();
    assert_eq!(sizes, vec![64, 64, 2]);
    assert!(!nodes.holds(node, "split.bin_block_4"));

    assert_eq!(controller.download_bytes("split.bin").await.unwrap(), data);
}

#[tokio::test]
async fn empty_files_have_no_blocks() {
    let dir = TempDir::new().unwrap();
    let nodes = Arc::new(MemoryNodes::default());
    let controller = start(config(&dir, 1, 1), &nodes).await;
    register(&controller, &[6000]).await;

    let report = controller.upload_bytes("empty", Bytes::new()).await.unwrap();
    assert_eq!(report.blocks_total, 0);
    assert_eq!(nodes.stored(), 0);
    assert!(controller.download_bytes("empty").await.unwrap().is_empty());
}

#[tokio::test]
async fn metadata_survives_a_restart() {
    let dir = TempDir::new().unwrap();
    let nodes = Arc::new(MemoryNodes::default());
    let data = payload(200);

    {
        let controller = start(config(&dir, 2, 1), &nodes).await;
        register(&controller, &[6000, 6001]).await;
        controller.upload_bytes("kept.bin", data.clone()).await.unwrap();
    }

    let controller = start(config(&dir, 2, 1), &nodes).await;
    register(&controller, &[6000, 6001]).await;

    let files = controller.list_files().await;
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].name, "kept.bin");
    assert_eq!(files[0].blocks, 4);
    assert_eq!(controller.download_bytes("kept.bin").await.unwrap(), data);
}

#[tokio::test]
async fn round_robin_resumes_after_a_restart() {
    let dir = TempDir::new().unwrap();
    let nodes = Arc::new(MemoryNodes::default());

    {
        let controller = start(config(&dir, 3, 1), &nodes).await;
        register(&controller, &[6000, 6001, 6002]).await;
        controller.upload_bytes("before.bin", payload(64 * 4)).await.unwrap();
    }

    let controller = start(config(&dir, 3, 1), &nodes).await;
    let ids = register(&controller, &[6000, 6001, 6002]).await;
    controller.upload_bytes("after.bin", payload(64)).await.unwrap();

    // Four primaries were placed before the restart, so the fifth goes to the second node.
    assert_eq!(
        placements(&dir).await.get("after.bin_block_1").map(String::as_str),
        Some(ids[1].as_str())
    );
}

#[tokio::test]
async fn unknown_download_lists_known_files() {
    let dir = TempDir::new().unwrap();
    let nodes = Arc::new(MemoryNodes::default());
    let controller = start(config(&dir, 1, 0), &nodes).await;
    register(&controller, &[6000]).await;

    controller.upload_bytes("one.txt", payload(3)).await.unwrap();
    controller.upload_bytes("two.txt", payload(3)).await.unwrap();

    match controller.download_bytes("three.txt").await {
        Err(BlockFsError::FileNotFound { name, known }) => {
            assert_eq!(name, "three.txt");
            assert_eq!(known, vec!["one.txt".to_string(), "two.txt".to_string()]);
        }
        other => panic!("expected FileNotFound, got {:?}", other),
    }
}

#[tokio::test]
async fn download_writes_prefixed_copy() {
    let dir = TempDir::new().unwrap();
    let nodes = Arc::new(MemoryNodes::default());
    let config = config(&dir, 1, 0);
    let download_dir = config.download_dir.clone();
    let controller = start(config, &nodes).await;
    register(&controller, &[6000]).await;

    let source = dir.path().join("notes.txt");
    std::fs::write(&source, b"hello blocks").unwrap();
    controller.upload_file(&source, "notes.txt").await.unwrap();

    let saved = controller.download_to("notes.txt", &download_dir).await.unwrap();
    assert_eq!(saved, download_dir.join("downloaded_notes.txt"));
    assert_eq!(std::fs::read(saved).unwrap(), b"hello blocks");

    assert!(matches!(
        controller
            .upload_file(&dir.path().join("missing.txt"), "missing.txt")
            .await,
        Err(BlockFsError::SourceNotFound(_))
    ));
}

#[tokio::test]
async fn download_of_an_unknown_malformed_name_lists_known_files() {
    let dir = TempDir::new().unwrap();
    let nodes = Arc::new(MemoryNodes::default());
    let config = config(&dir, 1, 0);
    let download_dir = config.download_dir.clone();
    let controller = start(config, &nodes).await;
    register(&controller, &[6000]).await;

    controller.upload_bytes("one.txt", payload(3)).await.unwrap();

    match controller.download_to("a/b", &download_dir).await {
        Err(BlockFsError::FileNotFound { name, known }) => {
            assert_eq!(name, "a/b");
            assert_eq!(known, vec!["one.txt".to_string()]);
        }
        other => panic!("expected FileNotFound, got {:?}", other),
    }
    assert!(!download_dir.join("downloaded_a").exists());
}

#[tokio::test]
async fn upload_fails_over_to_the_next_node() {
    let dir = TempDir::new().unwrap();
    let nodes = Arc::new(MemoryNodes::default());
    let controller = start(config(&dir, 2, 0), &nodes).await;
    let ids = register(&controller, &[6000, 6001]).await;
    nodes.take_down(ids[0].as_str());

    let data = payload(100);
    let report = controller.upload_bytes("f.bin", data.clone()).await.unwrap();
    assert!(report.is_complete());
    assert!(!report.failures.is_empty());

    let placed = placements(&dir).await;
    assert!(placed.values().all(|node| node == ids[1].as_str()));
    assert_eq!(controller.download_bytes("f.bin").await.unwrap(), data);
}

#[tokio::test]
async fn upload_is_incomplete_when_no_node_accepts() {
    let dir = TempDir::new().unwrap();
    let nodes = Arc::new(MemoryNodes::default());
    let controller = start(config(&dir, 1, 0), &nodes).await;
    let ids = register(&controller, &[6000]).await;
    nodes.take_down(ids[0].as_str());

    match controller.upload_bytes("lost.bin", payload(70)).await {
        Err(BlockFsError::IncompleteUpload(report)) => {
            assert_eq!(report.blocks_total, 2);
            assert_eq!(report.blocks_placed, 0);
            assert_eq!(report.failures.len(), 2);
        }
        other => panic!("expected IncompleteUpload, got {:?}", other),
    }

    assert!(controller.list_files().await.is_empty());
    assert!(matches!(
        controller.download_bytes("lost.bin").await,
        Err(BlockFsError::FileNotFound { .. })
    ));
}

#[tokio::test]
async fn replica_failures_do_not_fail_the_upload() {
    let dir = TempDir::new().unwrap();
    let nodes = Arc::new(MemoryNodes::default());
    let controller = start(config(&dir, 2, 1), &nodes).await;
    let ids = register(&controller, &[6000, 6001]).await;

    // Block 1 lands on the first node; its replica goes to the second, which is down.
    nodes.take_down(ids[1].as_str());
    let report = controller.upload_bytes("one.bin", payload(10)).await.unwrap();

    assert_eq!(report.blocks_placed, 1);
    assert_eq!(report.replicas_attempted, 1);
    assert_eq!(report.replicas_written, 0);
    assert_eq!(report.failures.len(), 1);
    assert!(!placements(&dir).await.contains_key("one.bin_block_1_Replica"));
}

#[tokio::test]
async fn download_falls_back_to_replicas() {
    let dir = TempDir::new().unwrap();
    let nodes = Arc::new(MemoryNodes::default());
    let controller = start(config(&dir, 2, 1), &nodes).await;
    register(&controller, &[6000, 6001]).await;

    let data = payload(150);
    controller.upload_bytes("r.bin", data.clone()).await.unwrap();

    let placed = placements(&dir).await;
    let primary_node = placed.get("r.bin_block_2").unwrap();
    nodes.drop_block(primary_node, "r.bin_block_2");

    // A corrupted primary is skipped as well.
    let corrupt_node = placed.get("r.bin_block_3").unwrap();
    nodes
        .write_block(corrupt_node, "r.bin_block_3", Bytes::from_static(b"garbage"))
        .await
        .unwrap();

    assert_eq!(controller.download_bytes("r.bin").await.unwrap(), data);

    let replica_node = placed.get("r.bin_block_2_Replica").unwrap();
    nodes.drop_block(replica_node, "r.bin_block_2_Replica");
    assert!(matches!(
        controller.download_bytes("r.bin").await,
        Err(BlockFsError::BlockUnavailable(_))
    ));
}

#[tokio::test]
async fn shutdown_purges_blocks_and_metadata() {
    let dir = TempDir::new().unwrap();
    let nodes = Arc::new(MemoryNodes::default());
    let controller = start(config(&dir, 2, 1), &nodes).await;
    register(&controller, &[6000, 6001]).await;

    controller.upload_bytes("gone.bin", payload(100)).await.unwrap();
    assert_eq!(nodes.stored(), 4);

    controller.shutdown(true).await.unwrap();
    controller.wait_idle().await;

    assert_eq!(nodes.stored(), 0);
    assert!(placements(&dir).await.is_empty());
    assert!(matches!(
        controller.upload_bytes("late.bin", payload(1)).await,
        Err(BlockFsError::ShuttingDown)
    ));
}

#[tokio::test]
async fn shutdown_without_purge_keeps_blocks() {
    let dir = TempDir::new().unwrap();
    let nodes = Arc::new(MemoryNodes::default());
    let controller = start(config(&dir, 1, 0), &nodes).await;
    register(&controller, &[6000]).await;

    controller.upload_bytes("kept.bin", payload(100)).await.unwrap();
    controller.shutdown(false).await.unwrap();

    assert_eq!(nodes.stored(), 2);
    assert_eq!(placements(&dir).await.len(), 2);
}

#[tokio::test]
async fn dead_node_copies_are_re_replicated() {
    let dir = TempDir::new().unwrap();
    let nodes = Arc::new(MemoryNodes::default());
    let config = ControllerConfig {
        heartbeat_interval_ms: 20,
        ..config(&dir, 3, 1)
    };
    let cluster_config: blockfs::cluster::Config = config.clone().into();
    let controller = start(config, &nodes).await;
    let ids = register(&controller, &[6000, 6001, 6002, 6003]).await;

    let data = payload(64 * 4);
    controller.upload_bytes("heal.bin", data.clone()).await.unwrap();

    let dead = ids[0].clone();
    let lost: Vec<String> = placements(&dir)
        .await
        .into_iter()
        .filter(|(_, node)| node == dead.as_str())
        .map(|(block, _)| block)
        .collect();
    assert!(!lost.is_empty());

    tokio::time::sleep(Duration::from_millis(100)).await;
    for id in &ids[1..] {
        controller.registry().record_heartbeat(id).await.unwrap();
    }
    let changes = controller
        .registry()
        .sweep(chrono::Utc::now(), &cluster_config)
        .await;
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].node, dead);
    assert_eq!(changes[0].to, NodeStatus::Dead);
    nodes.take_down(dead.as_str());

    let repaired = controller.repair_node(&dead).await.unwrap();
    assert_eq!(repaired, lost.len());

    let placed = placements(&dir).await;
    assert!(placed.values().all(|node| node != dead.as_str()));
    for block in &lost {
        let primary = block.trim_end_matches("_Replica");
        let sibling = if block.ends_with("_Replica") {
            primary.to_string()
        } else {
            format!("{}_Replica", primary)
        };
        assert_ne!(placed.get(block), placed.get(&sibling), "{} shares a node", block);
        assert!(nodes.holds(placed.get(block).unwrap(), block));
    }

    assert_eq!(controller.download_bytes("heal.bin").await.unwrap(), data);
}
