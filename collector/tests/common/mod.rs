#![allow(dead_code)]

use axum::{
    extract::State,
    http::{
        Method,
        StatusCode,
        Uri,
    },
    response::{
        IntoResponse,
        Response,
    },
    Router,
};
use cluster_diag_collector::{
    Catalog,
    Orchestrator,
    OutputWriter,
};
use cluster_diag_config::Config;
use std::{
    collections::{
        BTreeMap,
        HashMap,
    },
    path::{
        Path,
        PathBuf,
    },
    sync::{
        atomic::{
            AtomicUsize,
            Ordering,
        },
        Arc,
        Mutex,
    },
    time::Duration,
};
use url::Url;

pub const CATALOG: &str = r#"
components:
  es:
    bootstrap:
      name: version
      request: { path: "/" }
      output: version.json
    discovery:
      path: "/_nodes/http"
      nodes_pointer: /nodes
      address_pointer: /http/publish_address
    queries:
      - name: a
        request: { path: "/a" }
        output: a.json
        critical: true
      - name: b
        request: { path: "/b" }
        output: b/b.txt
"#;

pub const VERSION: &str = r#"{"name":"node","version":{"number":"8.11.0"}}"#;

#[derive(Clone)]
struct Reply {
    status: u16,
    body: String,
    delay: Duration,
}

/// Requests in flight across every fake node sharing it, and the highest value seen.
#[derive(Clone, Default)]
pub struct Gauge {
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl Gauge {
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn enter(&self) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Clone)]
struct FakeState {
    replies: Arc<Mutex<HashMap<String, Reply>>>,
    seen: Arc<Mutex<Vec<String>>>,
    gauge: Gauge,
}

/// A management API answering scripted replies by path. Unknown paths are 404.
pub struct FakeNode {
    pub url: Url,
    pub port: u16,
    state: FakeState,
}

impl FakeNode {
    pub async fn start() -> Self {
        Self::start_with(Gauge::default()).await
    }

    /// Answers `/`, `/a` and `/b` successfully.
    pub async fn healthy(gauge: Gauge) -> Self {
        let node = Self::start_with(gauge).await;
        node.reply("/", 200, VERSION);
        node.reply("/a", 200, r#"{"a":true}"#);
        node.reply("/b", 200, "b");
        node
    }

    pub async fn start_with(gauge: Gauge) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let state = FakeState {
            replies: Arc::default(),
            seen: Arc::default(),
            gauge,
        };
        let app = Router::new().fallback(reply).with_state(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            url: Url::parse(&format!("http://127.0.0.1:{port}")).unwrap(),
            port,
            state,
        }
    }

    pub fn reply(&self, path: &str, status: u16, body: &str) {
        self.reply_after(path, status, body, Duration::ZERO);
    }

    pub fn reply_after(&self, path: &str, status: u16, body: &str, delay: Duration) {
        self.state.replies.lock().unwrap().insert(
            path.to_string(),
            Reply {
                status,
                body: body.to_string(),
                delay,
            },
        );
    }

    /// `METHOD /path` of every request received so far.
    pub fn seen(&self) -> Vec<String> {
        self.state.seen.lock().unwrap().clone()
    }

    pub fn publish_address(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }
}

async fn reply(State(state): State<FakeState>, method: Method, uri: Uri) -> Response {
    state.seen.lock().unwrap().push(format!("{method} {}", uri.path()));
    let Some(reply) = state.replies.lock().unwrap().get(uri.path()).cloned() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    state.gauge.enter();
    tokio::time::sleep(reply.delay).await;
    state.gauge.leave();
    (StatusCode::from_u16(reply.status).unwrap(), reply.body).into_response()
}

/// An address nothing listens on.
pub fn dead_url() -> Url {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    Url::parse(&format!("http://127.0.0.1:{port}")).unwrap()
}

/// Topology response listing `nodes` under stable ids `n0`, `n1`, ...
pub fn topology(nodes: &[&FakeNode]) -> String {
    let nodes: serde_json::Map<String, serde_json::Value> = nodes
        .iter()
        .enumerate()
        .map(|(i, node)| {
            (
                format!("n{i}"),
                serde_json::json!({ "name": format!("node-{i}"), "http": { "publish_address": node.publish_address() } }),
            )
        })
        .collect();
    serde_json::json!({ "nodes": nodes }).to_string()
}

/// Topology response listing raw publish addresses.
pub fn topology_of(addresses: &[String]) -> String {
    let nodes: serde_json::Map<String, serde_json::Value> = addresses
        .iter()
        .enumerate()
        .map(|(i, address)| {
            (
                format!("n{i}"),
                serde_json::json!({ "name": format!("node-{i}"), "http": { "publish_address": address } }),
            )
        })
        .collect();
    serde_json::json!({ "nodes": nodes }).to_string()
}

pub fn config(seeds: Vec<Url>, output_dir: &Path) -> Config {
    Config {
        component: "es".to_string(),
        seeds,
        output_dir: output_dir.to_path_buf(),
        concurrency: 4,
        call_timeout_secs: 1,
        retries: 0,
        retry_pause_millis: 0,
        run_timeout_secs: 60,
        cancel_grace_secs: 0,
        ..Config::default()
    }
}

pub async fn orchestrator(config: Config) -> Orchestrator {
    orchestrator_with(CATALOG, config).await
}

pub async fn orchestrator_with(catalog: &str, config: Config) -> Orchestrator {
    let catalog = Catalog::parse(catalog, &BTreeMap::new()).unwrap();
    let writer = OutputWriter::create(&config.output_dir, &config.component).await.unwrap();
    Orchestrator::new(config, catalog, writer)
}

/// Every file under `root`, relative and sorted.
pub fn files(root: &Path) -> Vec<PathBuf> {
    fn walk(root: &Path, dir: &Path, out: &mut Vec<PathBuf>) {
        for entry in std::fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                walk(root, &path, out);
            } else {
                out.push(path.strip_prefix(root).unwrap().to_path_buf());
            }
        }
    }
    let mut out = Vec::new();
    if root.exists() {
        walk(root, root, &mut out);
    }
    out.sort();
    out
}
