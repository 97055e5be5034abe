// In-process cluster scenarios: one controller with the HTTP operator API
// enabled and a set of storage nodes, all on loopback.
use anyhow::{anyhow, bail, ensure, Context};
use rand::RngCore;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use blockfs::{api, network, Controller, ControllerConfig, NodeConfig, Phase, StorageNode};

const NODES: usize = 3;
const HEARTBEAT_MS: u64 = 500;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let nodes = std::env::args()
        .nth(1)
        .map(|n| n.parse::<usize>())
        .transpose()
        .context("node count must be a number")?
        .unwrap_or(NODES);

    println!("Starting BlockFS cluster test with {} storage nodes", nodes);
    let cluster = LocalCluster::start(nodes).await?;

    let mut results = TestResults::default();
    results.record("quorum", cluster.check_quorum().await);
    results.record("upload_download", cluster.check_round_trips().await);
    results.record("duplicate_upload", cluster.check_duplicate_rejected().await);
    results.record("unknown_file", cluster.check_unknown_file().await);
    results.record("node_loss", cluster.check_node_loss().await);
    results.record("shutdown", cluster.check_shutdown().await);

    results.report();
    ensure!(results.failed() == 0, "{} scenarios failed", results.failed());
    Ok(())
}

struct LocalCluster {
    controller: Arc<Controller>,
    nodes: Vec<Arc<StorageNode>>,
    http: reqwest::Client,
    base_url: String,
    _dir: TempDir,
}

impl LocalCluster {
    async fn start(node_count: usize) -> anyhow::Result<Self> {
        let dir = TempDir::new()?;
        let http_addr = free_addr().await?;

        let config = ControllerConfig {
            listen_addr: "127.0.0.1:0".to_string(),
            quorum: node_count,
            replication_factor: 1,
            metadata_path: dir.path().join("metadata.json"),
            download_dir: dir.path().join("downloads"),
            heartbeat_interval_ms: HEARTBEAT_MS,
            interactive: false,
            http: Some(api::Config {
                listen_addr: http_addr.clone(),
                ..api::Config::default()
            }),
            ..ControllerConfig::default()
        };

        let controller = Controller::new(config.clone()).await?;
        let server = network::Server::bind(&config.listen_addr, config.network.clone()).await?;
        let controller_addr = server.local_addr()?.to_string();
        tokio::spawn(controller.clone().serve(server));

        if let Some(http) = config.http.clone() {
            let service: Arc<dyn api::FileService> = controller.clone();
            let mut phase = controller.subscribe_phase();
            tokio::spawn(async move {
                let stopped = async move {
                    let _ = phase.wait_for(|p| *p == Phase::ShuttingDown).await;
                };
                api::Server::new(http, service).start(stopped).await
            });
        }

        let mut nodes = Vec::with_capacity(node_count);
        for i in 0..node_count {
            let node_config = NodeConfig {
                listen_addr: "127.0.0.1:0".to_string(),
                controller_addr: controller_addr.clone(),
                data_dir: dir.path().join(format!("node{}", i)),
                heartbeat_interval_ms: HEARTBEAT_MS,
                ..NodeConfig::default()
            };
            let (node, server) = StorageNode::bind(node_config).await?;
            tokio::spawn(node.clone().run(server));
            nodes.push(node);
        }

        Ok(Self {
            controller,
            nodes,
            http: reqwest::Client::new(),
            base_url: format!("http://{}", http_addr),
            _dir: dir,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn check_quorum(&self) -> anyhow::Result<()> {
        let deadline = Instant::now() + Duration::from_secs(15);
        loop {
            if let Ok(response) = self.http.get(self.url("/health")).send().await {
                let health: Value = response.json().await?;
                if health["quorum"]["reached"] == Value::Bool(true)
                    && health["phase"] == "operational"
                {
                    println!("  quorum reached: {}", health["quorum"]);
                    return Ok(());
                }
            }
            if Instant::now() > deadline {
                bail!("quorum not reached within 15s");
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    async fn check_round_trips(&self) -> anyhow::Result<()> {
        for size in [0usize, 1, 63, 64, 65, 130, 4096] {
            let name = format!("file-{}.bin", size);
            let mut data = vec![0u8; size];
            rand::thread_rng().fill_bytes(&mut data);

            let response = self
                .http
                .put(self.url(&format!("/files/{}", name)))
                .body(data.clone())
                .send()
                .await?;
            ensure!(
                response.status() == reqwest::StatusCode::CREATED,
                "upload of {} returned {}",
                name,
                response.status()
            );
            let summary: Value = response.json().await?;
            let expected_blocks = size.div_ceil(64);
            ensure!(
                summary["blocks"] == expected_blocks,
                "{} stored {} blocks, expected {}",
                name,
                summary["blocks"],
                expected_blocks
            );

            let body = self.download(&name).await?;
            ensure!(body == data, "{} came back different", name);
        }

        let files: Value = self.http.get(self.url("/files")).send().await?.json().await?;
        let listed = files.as_array().map(Vec::len).unwrap_or(0);
        ensure!(listed == 7, "expected 7 files listed, got {}", listed);
        Ok(())
    }

    async fn check_duplicate_rejected(&self) -> anyhow::Result<()> {
        let response = self
            .http
            .put(self.url("/files/file-1.bin"))
            .body(vec![1u8, 2, 3])
            .send()
            .await?;
        ensure!(
            response.status() == reqwest::StatusCode::CONFLICT,
            "duplicate upload returned {}",
            response.status()
        );
        Ok(())
    }

    async fn check_unknown_file(&self) -> anyhow::Result<()> {
        let response = self.http.get(self.url("/files/nope.bin")).send().await?;
        ensure!(
            response.status() == reqwest::StatusCode::NOT_FOUND,
            "unknown download returned {}",
            response.status()
        );
        let body: Value = response.json().await?;
        let message = body["message"].as_str().unwrap_or_default();
        ensure!(
            message.contains("file-64.bin"),
            "error should list known files: {}",
            message
        );
        Ok(())
    }

    async fn check_node_loss(&self) -> anyhow::Result<()> {
        let victim = self
            .nodes
            .first()
            .ok_or_else(|| anyhow!("cluster has no nodes"))?;
        victim.terminate();
        println!("  stopped {}", victim.node_id());

        let body = self.download("file-4096.bin").await?;
        ensure!(body.len() == 4096, "download after node loss returned {} bytes", body.len());

        let deadline = Instant::now() + Duration::from_millis(HEARTBEAT_MS * 6);
        loop {
            let nodes: Value = self.http.get(self.url("/nodes")).send().await?.json().await?;
            let status = nodes
                .as_array()
                .and_then(|all| all.iter().find(|n| n["id"] == victim.node_id()))
                .map(|n| n["status"].clone());
            if status == Some(Value::from("dead")) {
                return Ok(());
            }
            if Instant::now() > deadline {
                bail!("{} never marked dead (last status {:?})", victim.node_id(), status);
            }
            tokio::time::sleep(Duration::from_millis(HEARTBEAT_MS / 2)).await;
        }
    }

    async fn check_shutdown(&self) -> anyhow::Result<()> {
        let response = self.http.post(self.url("/shutdown")).send().await?;
        ensure!(
            response.status() == reqwest::StatusCode::ACCEPTED,
            "shutdown returned {}",
            response.status()
        );
        self.controller.wait_idle().await;

        ensure!(self.controller.phase() == Phase::ShuttingDown);
        ensure!(self.controller.list_files().await.is_empty());

        for node in self.nodes.iter().skip(1) {
            let stats = node.store().refresh_stats().await?;
            ensure!(
                stats.block_count == 0,
                "{} still holds {} blocks",
                node.node_id(),
                stats.block_count
            );
        }
        Ok(())
    }

    async fn download(&self, name: &str) -> anyhow::Result<Vec<u8>> {
        let response = self
            .http
            .get(self.url(&format!("/files/{}", name)))
            .send()
            .await?;
        ensure!(
            response.status().is_success(),
            "download of {} returned {}",
            name,
            response.status()
        );
        Ok(response.bytes().await?.to_vec())
    }
}

async fn free_addr() -> anyhow::Result<String> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    Ok(listener.local_addr()?.to_string())
}

#[derive(Default)]
struct TestResults {
    outcomes: Vec<(&'static str, anyhow::Result<()>)>,
}

impl TestResults {
    fn record(&mut self, name: &'static str, outcome: anyhow::Result<()>) {
        match &outcome {
            Ok(()) => println!("PASS {}", name),
            Err(e) => println!("FAIL {}: {:#}", name, e),
        }
        self.outcomes.push((name, outcome));
    }

    fn failed(&self) -> usize {
        self.outcomes.iter().filter(|(_, o)| o.is_err()).count()
    }

    fn report(&self) {
        println!(
            "\n{} scenarios, {} passed, {} failed",
            self.outcomes.len(),
            self.outcomes.len() - self.failed(),
            self.failed()
        );
    }
}
