mod common;

use cluster_diag_collector::{
    CallStatus,
    NodeStatus,
    RunError,
    RunManifest,
    RunStatus,
    MANIFEST_FILE,
};
use common::*;
use pretty_assertions::assert_eq;
use std::{
    path::PathBuf,
    time::{
        Duration,
        Instant,
    },
};

fn statuses(manifest: &RunManifest, node: usize) -> Vec<CallStatus> {
    manifest.nodes[node].outcomes.iter().map(|o| o.status).collect()
}

fn read_manifest(path: PathBuf) -> RunManifest {
    serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap()
}

async fn single_node(node: &FakeNode) -> (temp_dir::TempDir, RunManifest, PathBuf) {
    node.reply("/_nodes/http", 200, &topology(&[node]));
    let dir = temp_dir::TempDir::new().unwrap();
    let orchestrator = orchestrator(config(vec![node.url.clone()], dir.path())).await;
    let manifest = orchestrator.run().await.unwrap();
    let root = orchestrator.writer().root().to_path_buf();
    (dir, manifest, root)
}

#[tokio::test]
async fn failed_bootstrap_skips_the_remaining_queries() {
    let node = FakeNode::start().await;
    node.reply("/", 500, r#"{"error":"unavailable"}"#);
    node.reply("/a", 200, "{}");
    node.reply("/b", 200, "b");

    let (_dir, manifest, root) = single_node(&node).await;

    use CallStatus::*;
    assert_eq!(statuses(&manifest, 0), vec![Failed, Skipped, Skipped]);
    assert_eq!(manifest.nodes[0].status, NodeStatus::Failed);
    assert_eq!(manifest.nodes[0].outcomes[1].detail.as_deref(), Some("target unreachable"));
    assert_eq!(manifest.status, RunStatus::Failed);

    let key = manifest.nodes[0].target.key.to_string();
    assert_eq!(
        files(&root),
        vec![PathBuf::from(&key).join("version.json"), PathBuf::from(MANIFEST_FILE)]
    );
    assert_eq!(read_manifest(root.join(MANIFEST_FILE)), manifest);
}

#[tokio::test]
async fn critical_failure_fails_the_node_but_collection_continues() {
    let node = FakeNode::healthy(Gauge::default()).await;
    node.reply("/a", 503, r#"{"error":"no master"}"#);

    let (_dir, manifest, root) = single_node(&node).await;

    use CallStatus::*;
    assert_eq!(statuses(&manifest, 0), vec![Success, Failed, Success]);
    assert_eq!(manifest.nodes[0].status, NodeStatus::Failed);
    assert_eq!(manifest.nodes[0].version.as_deref(), Some("8.11.0"));
    assert_eq!(manifest.status, RunStatus::Failed);

    // The error body is kept as evidence.
    let failed = &manifest.nodes[0].outcomes[1];
    assert_eq!(failed.http_status, Some(503));
    assert_eq!(
        std::fs::read_to_string(root.join(failed.output.as_ref().unwrap())).unwrap(),
        r#"{"error":"no master"}"#
    );
}

#[tokio::test]
async fn non_critical_timeout_degrades_to_partial() {
    let node = FakeNode::healthy(Gauge::default()).await;
    node.reply_after("/b", 200, "late", Duration::from_secs(3));

    let (_dir, manifest, root) = single_node(&node).await;

    use CallStatus::*;
    assert_eq!(statuses(&manifest, 0), vec![Success, Success, TimedOut]);
    assert_eq!(manifest.nodes[0].status, NodeStatus::Partial);
    assert_eq!(manifest.status, RunStatus::Partial);
    assert_eq!(manifest.summary.timed_out, 1);

    let key = manifest.nodes[0].target.key.to_string();
    assert!(!root.join(&key).join("b/b.txt").exists());
}

#[tokio::test]
async fn unreachable_seeds_are_fatal() {
    let dir = temp_dir::TempDir::new().unwrap();
    let orchestrator = orchestrator(config(vec![dead_url(), dead_url()], dir.path())).await;

    let err = orchestrator.run().await.unwrap_err();

    let manifest = match err {
        RunError::Fatal { manifest, .. } => manifest,
        other => panic!("expected a fatal error, got {other}"),
    };
    assert_eq!(manifest.status, RunStatus::Fatal);
    assert!(manifest.nodes.is_empty());
    assert!(manifest.fatal_error.is_some());
    assert!(!orchestrator.writer().manifest_path().exists());
}

#[tokio::test]
async fn unreachable_discovered_members_are_fatal() {
    let seed = FakeNode::healthy(Gauge::default()).await;
    let members = [dead_url(), dead_url()].map(|url| format!("127.0.0.1:{}", url.port().unwrap()));
    seed.reply("/_nodes/http", 200, &topology_of(&members));

    let dir = temp_dir::TempDir::new().unwrap();
    let orchestrator = orchestrator(config(vec![seed.url.clone()], dir.path())).await;
    let err = orchestrator.run().await.unwrap_err();

    let (reason, manifest) = match err {
        RunError::Fatal { reason, manifest } => (reason, manifest),
        other => panic!("expected a fatal error, got {other}"),
    };
    assert_eq!(reason, "none of the 2 discovered targets answered");
    assert_eq!(manifest.status, RunStatus::Fatal);
    assert!(!orchestrator.writer().manifest_path().exists());
}

#[tokio::test]
async fn seeds_answer_the_bootstrap_query_as_declared() {
    const CATALOG: &str = r#"
variables:
  api_root: api
components:
  es:
    bootstrap:
      name: status
      request: { method: POST, path: "/{{api_root}}/status" }
      output: status.json
    queries:
      - name: a
        request: { path: "/a" }
        output: a.json
"#;
    let node = FakeNode::start().await;
    node.reply("/api/status", 200, VERSION);
    node.reply("/a", 200, "{}");

    let dir = temp_dir::TempDir::new().unwrap();
    let manifest = orchestrator_with(CATALOG, config(vec![node.url.clone()], dir.path()))
        .await
        .run()
        .await
        .unwrap();

    assert_eq!(manifest.status, RunStatus::Success);
    assert_eq!(node.seen(), vec!["POST /api/status", "POST /api/status", "GET /a"]);
}

#[tokio::test]
async fn run_timeout_cancels_the_run() {
    let gauge = Gauge::default();
    let mut nodes = Vec::new();
    for _ in 0..3 {
        let node = FakeNode::healthy(gauge.clone()).await;
        node.reply_after("/a", 200, "{}", Duration::from_secs(5));
        nodes.push(node);
    }
    let members: Vec<&FakeNode> = nodes.iter().collect();
    nodes[0].reply("/_nodes/http", 200, &topology(&members));

    let dir = temp_dir::TempDir::new().unwrap();
    let mut config = config(vec![nodes[0].url.clone()], dir.path());
    config.concurrency = 1;
    config.call_timeout_secs = 30;
    config.run_timeout_secs = 1;
    config.cancel_grace_secs = 0;

    let started = Instant::now();
    let orchestrator = orchestrator(config).await;
    let manifest = orchestrator.run().await.unwrap();
    let elapsed = started.elapsed();

    assert!(manifest.cancelled);
    assert_eq!(manifest.nodes.len(), 3);
    for node in &manifest.nodes[1..] {
        assert_eq!(node.skipped_reason.as_deref(), Some("run cancelled"));
    }
    // Timeout plus grace, with room for a slow machine.
    assert!(elapsed < Duration::from_secs(3), "run took {elapsed:?}");
    assert!(orchestrator.writer().manifest_path().exists());
}

#[tokio::test]
async fn discovered_members_are_collected_with_bounded_concurrency() {
    let gauge = Gauge::default();
    let mut nodes = Vec::new();
    for _ in 0..4 {
        let node = FakeNode::healthy(gauge.clone()).await;
        node.reply_after("/a", 200, "{}", Duration::from_millis(300));
        nodes.push(node);
    }
    let members: Vec<&FakeNode> = nodes.iter().collect();
    nodes[0].reply("/_nodes/http", 200, &topology(&members));

    let dir = temp_dir::TempDir::new().unwrap();
    let mut config = config(vec![dead_url(), nodes[0].url.clone()], dir.path());
    config.concurrency = 2;
    let manifest = orchestrator(config).await.run().await.unwrap();

    assert_eq!(manifest.status, RunStatus::Success);
    let names: Vec<_> = manifest.nodes.iter().map(|n| n.target.name.as_str()).collect();
    assert_eq!(names, vec!["node-0", "node-1", "node-2", "node-3"]);
    assert!(gauge.peak() <= 2, "peak concurrency {}", gauge.peak());
    assert_eq!(manifest.summary.succeeded, 12);
}

#[tokio::test]
async fn cancelled_runs_skip_targets_that_never_started() {
    let gauge = Gauge::default();
    let mut nodes = Vec::new();
    for _ in 0..3 {
        let node = FakeNode::healthy(gauge.clone()).await;
        node.reply_after("/a", 200, "{}", Duration::from_secs(5));
        nodes.push(node);
    }
    let members: Vec<&FakeNode> = nodes.iter().collect();
    nodes[0].reply("/_nodes/http", 200, &topology(&members));

    let dir = temp_dir::TempDir::new().unwrap();
    let mut config = config(vec![nodes[0].url.clone()], dir.path());
    config.concurrency = 1;
    config.call_timeout_secs = 30;
    let orchestrator = orchestrator(config).await;

    let cancel = orchestrator.cancellation_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        cancel.cancel();
    });
    let manifest = orchestrator.run().await.unwrap();

    use CallStatus::*;
    assert!(manifest.cancelled);
    assert_eq!(statuses(&manifest, 0), vec![Success, Skipped, Skipped]);
    for node in &manifest.nodes[1..] {
        assert_eq!(node.skipped_reason.as_deref(), Some("run cancelled"));
        assert!(node.outcomes.iter().all(|o| o.status == Skipped));
    }
    assert_eq!(manifest.nodes.len(), 3);
    assert!(orchestrator.writer().manifest_path().exists());
}

#[tokio::test]
async fn reruns_produce_the_same_tree() {
    let node = FakeNode::healthy(Gauge::default()).await;
    node.reply("/b", 404, "missing");
    node.reply("/_nodes/http", 200, &topology(&[&node]));

    let dir = temp_dir::TempDir::new().unwrap();
    let mut trees = Vec::new();
    let mut kinds = Vec::new();
    for _ in 0..2 {
        let orchestrator = orchestrator(config(vec![node.url.clone()], dir.path())).await;
        let manifest = orchestrator.run().await.unwrap();
        trees.push(files(orchestrator.writer().root()));
        kinds.push(statuses(&manifest, 0));
    }

    assert_eq!(trees[0], trees[1]);
    assert_eq!(kinds[0], kinds[1]);
    assert_eq!(kinds[0], vec![CallStatus::Success, CallStatus::Success, CallStatus::Failed]);
}
