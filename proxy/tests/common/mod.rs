#![allow(dead_code)]

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::{Request, Response, StatusCode};
use proxy::config::Config;
use proxy::testutils::start_test_server;
use std::convert::Infallible;
use std::fmt::Write;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

pub const REALM_HEADER: &str = "x-shardgate-realm";

/// A fake shard. `/health` follows `up`; migration endpoints always succeed except
/// merge when `fail_merge` is set, and drain while `hold_drain` is set. Queue ids
/// are `<shard>:<n>`; polling a queue owned by another shard gets
/// `BAD_EVENT_QUEUE_ID`. Every other path is counted and answered with the shard's
/// name.
#[derive(Clone)]
pub struct ShardServer {
    pub port: u16,
    name: &'static str,
    state: Arc<ShardState>,
}

#[derive(Default)]
struct ShardState {
    up: AtomicBool,
    hold_drain: AtomicBool,
    hits: AtomicUsize,
    fail_merge: bool,
}

impl ShardServer {
    pub async fn start(name: &'static str, fail_merge: bool) -> ShardServer {
        let state = Arc::new(ShardState {
            up: AtomicBool::new(true),
            fail_merge,
            ..Default::default()
        });
        let handler = {
            let state = state.clone();
            move |req: Request<Incoming>| {
                let state = state.clone();
                async move { Ok::<_, Infallible>(respond(name, req, &state).await) }
            }
        };
        let port = start_test_server(handler).await;
        ShardServer { port, name, state }
    }

    pub fn set_up(&self, up: bool) {
        self.state.up.store(up, Ordering::SeqCst);
    }

    pub fn hold_drain(&self, hold: bool) {
        self.state.hold_drain.store(hold, Ordering::SeqCst);
    }

    pub fn hits(&self) -> usize {
        self.state.hits.load(Ordering::SeqCst)
    }
}

fn queue_id(query: Option<&str>, body: &[u8]) -> Option<String> {
    let from = |bytes: &[u8]| {
        url::form_urlencoded::parse(bytes)
            .find(|(key, _)| key == "queue_id")
            .map(|(_, value)| value.into_owned())
    };
    query.and_then(|q| from(q.as_bytes())).or_else(|| from(body))
}

fn owned_elsewhere(name: &str, queue_id: &str) -> bool {
    queue_id
        .split_once(':')
        .is_some_and(|(owner, _)| owner.starts_with("shard-") && owner != name)
}

async fn respond(
    name: &'static str,
    req: Request<Incoming>,
    state: &ShardState,
) -> Response<Full<Bytes>> {
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(str::to_string);
    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(_) => Bytes::new(),
    };
    let queue = queue_id(query.as_deref(), &body);

    let (status, body) = match path.as_str() {
        "/health" if state.up.load(Ordering::SeqCst) => {
            (StatusCode::OK, Bytes::from_static(b"ok"))
        }
        "/health" => (StatusCode::SERVICE_UNAVAILABLE, Bytes::new()),
        "/internal/migration/users" => (
            StatusCode::OK,
            Bytes::from_static(br#"{"users":["iago","hamlet"]}"#),
        ),
        "/internal/migration/merge" if state.fail_merge => {
            (StatusCode::INTERNAL_SERVER_ERROR, Bytes::new())
        }
        "/internal/migration/drain" => {
            while state.hold_drain.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            (StatusCode::OK, Bytes::new())
        }
        "/internal/migration/export" => (StatusCode::OK, Bytes::from_static(b"queue-state")),
        p if p.starts_with("/internal/migration/") => (StatusCode::OK, Bytes::new()),
        "/json/register" => {
            let n = state.hits.fetch_add(1, Ordering::SeqCst);
            (StatusCode::OK, Bytes::from(format!("{name}:{n}")))
        }
        _ if queue.as_deref().is_some_and(|q| owned_elsewhere(name, q)) => {
            state.hits.fetch_add(1, Ordering::SeqCst);
            let body = serde_json::json!({
                "result": "error",
                "msg": "Bad event queue id",
                "queue_id": queue,
                "code": "BAD_EVENT_QUEUE_ID",
            });
            let mut response = Response::new(Full::new(Bytes::from(body.to_string())));
            *response.status_mut() = StatusCode::BAD_REQUEST;
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            return response;
        }
        "/slow" => {
            state.hits.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(500)).await;
            (StatusCode::OK, Bytes::from_static(name.as_bytes()))
        }
        _ => {
            state.hits.fetch_add(1, Ordering::SeqCst);
            (StatusCode::OK, Bytes::from_static(name.as_bytes()))
        }
    };
    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    response
}

pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Proxy config with fast health checks and short deadlines.
pub fn config(dir: &Path, shards: &[&ShardServer], assignments: &[(&str, &str)]) -> Config {
    let mut yaml = String::new();
    writeln!(yaml, "listener:\n  host: 127.0.0.1\n  port: {}", free_port()).unwrap();
    writeln!(yaml, "admin_listener:\n  host: 127.0.0.1\n  port: {}", free_port()).unwrap();
    writeln!(yaml, "control_socket: {}", dir.join("control.sock").display()).unwrap();
    writeln!(yaml, "shards:").unwrap();
    for shard in shards {
        writeln!(
            yaml,
            "  - id: {}\n    url: http://127.0.0.1:{}",
            shard.name, shard.port
        )
        .unwrap();
    }
    writeln!(yaml, "directory:\n  store:\n    type: memory").unwrap();
    if assignments.is_empty() {
        writeln!(yaml, "    assignments: []").unwrap();
    } else {
        writeln!(yaml, "    assignments:").unwrap();
    }
    for (realm, shard) in assignments {
        writeln!(yaml, "      - realm: {realm}\n        shard: {shard}").unwrap();
    }
    yaml.push_str(
        r#"health:
  check_interval_ms: 50
  liveness_timeout_ms: 500
  degraded_after: 1
  unreachable_after: 2
buffer:
  deadline_secs: 3
  drain_rate_per_sec: 1000
migration:
  pause_timeout_ms: 2000
  invalidation_window_secs: 600
handoff:
  ready_timeout_secs: 5
  snapshot_timeout_secs: 5
  drain_deadline_secs: 3
"#,
    );
    serde_yaml::from_str(&yaml).unwrap()
}

pub async fn wait_until<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
