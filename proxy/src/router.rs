//! Per-request dispatch: realm, directory resolution, migration policy, shard
//! health, forwarding.

use crate::ProxyBody;
use crate::errors::{BAD_EVENT_QUEUE_ID, RouteError};
use crate::forward::{ForwardError, Forwarder};
use crate::health::{HealthMonitor, HoldOutcome, Liveness};
use crate::metrics_defs::{
    REQUEST_DURATION, REQUESTS_INFLIGHT, ROUTE_ERRORS, STALE_QUEUE_FROM_SHARD,
};
use crate::realm::{MAX_FORM_BODY, RealmExtractor, form_queue_id, query_queue_id};
use crate::shards::{Shard, Shards};
use directory::migration::{MigrationPhase, MigrationState, Strategy};
use directory::types::{RouteSource, RouteTarget, unix_millis};
use directory::{Directory, Resolution};
use http::header::{CONTENT_LENGTH, CONTENT_TYPE, HeaderMap};
use http::{Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Empty, Limited};
use hyper::body::Bytes;
use shared::http::full_body;
use shared::{counter, gauge, histogram};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout_at;

/// Largest shard error body inspected for a stale-queue code.
const MAX_ERROR_BODY: usize = 64 * 1024;

pub const AUDIT_TARGET: &str = "shardgate::audit";

/// What a migrating realm's requests should do in the current phase.
#[derive(Debug, PartialEq, Eq)]
pub enum MigrationPolicy {
    Old,
    New,
    /// Hold until the phase changes, bounded by the pause timeout.
    Hold,
    /// Everything goes to the new shard, which answers `BAD_EVENT_QUEUE_ID` for
    /// queues that were registered on the old one.
    Invalidate,
}

pub fn migration_policy(migration: &MigrationState) -> MigrationPolicy {
    use MigrationPhase::*;

    match (migration.strategy, migration.phase) {
        (_, Preparing | CreatingOnNew) => MigrationPolicy::Old,
        (Strategy::Transparent, DbCommitted | DrainingOld) => MigrationPolicy::Old,
        (_, Paused | Serializing | MergingOnNew) => MigrationPolicy::Hold,
        (_, Resumed) => MigrationPolicy::New,
        (Strategy::PageReload, DbCommitted | DrainingOld) | (_, Invalidating) => {
            MigrationPolicy::Invalidate
        }
    }
}

pub struct RouterOptions {
    /// Time a request may be held for its shard, counted from arrival
    pub buffer_deadline: Duration,
    /// Time a request may be held while its realm is paused mid-migration
    pub pause_timeout: Duration,
}

pub struct Router {
    directory: Directory,
    health: HealthMonitor,
    shards: Arc<Shards>,
    forwarder: Forwarder,
    realms: RealmExtractor,
    options: RouterOptions,
}

struct InflightGuard;

impl InflightGuard {
    fn new() -> Self {
        gauge!(REQUESTS_INFLIGHT).increment(1.0);
        InflightGuard
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        gauge!(REQUESTS_INFLIGHT).decrement(1.0);
    }
}

impl Router {
    pub fn new(
        directory: Directory,
        health: HealthMonitor,
        shards: Arc<Shards>,
        forwarder: Forwarder,
        realms: RealmExtractor,
        options: RouterOptions,
    ) -> Self {
        Router {
            directory,
            health,
            shards,
            forwarder,
            realms,
            options,
        }
    }

    /// Routes one client request. Always produces a response; routing failures
    /// become their distinguished client responses.
    pub async fn handle(
        &self,
        request: Request<ProxyBody>,
        client_addr: SocketAddr,
    ) -> Response<ProxyBody> {
        let _inflight = InflightGuard::new();
        let start = Instant::now();
        let arrived_ms = unix_millis();
        let deadline = tokio::time::Instant::now() + self.options.buffer_deadline;

        let (response, decision) = match self
            .route(request, client_addr, arrived_ms, deadline)
            .await
        {
            Ok((response, decision)) => (response, decision),
            Err(err) => {
                counter!(ROUTE_ERRORS, "kind" => err.as_str()).increment(1);
                (err.to_response(), err.as_str())
            }
        };

        histogram!(
            REQUEST_DURATION,
            "status" => response.status().as_u16().to_string(),
            "decision" => decision
        )
        .record(start.elapsed().as_secs_f64());
        response
    }

    async fn route(
        &self,
        request: Request<ProxyBody>,
        client_addr: SocketAddr,
        arrived_ms: u64,
        deadline: tokio::time::Instant,
    ) -> Result<(Response<ProxyBody>, &'static str), RouteError> {
        let realm = self
            .realms
            .extract(&request)
            .ok_or(RouteError::UnresolvedRealm)?;

        let (target, decision) = self.decide(&realm, request.method()).await?;
        tracing::info!(
            target: AUDIT_TARGET,
            realm = %realm,
            shard = %target.shard,
            epoch = target.epoch,
            decision,
            at = unix_millis(),
            "route"
        );

        let shard = self
            .shards
            .get(&target.shard)
            .ok_or_else(|| RouteError::BackendUnavailable(target.shard.clone()))?;
        let response = self
            .dispatch(shard, target.epoch, request, client_addr, arrived_ms, deadline)
            .await?;
        Ok((response, decision))
    }

    /// Resolves the realm and applies the migration policy. Held requests wait on
    /// the directory's change notifications and re-resolve.
    async fn decide(
        &self,
        realm: &str,
        method: &Method,
    ) -> Result<(RouteTarget, &'static str), RouteError> {
        let pause_deadline = tokio::time::Instant::now() + self.options.pause_timeout;
        let mut changes = self.directory.subscribe();
        let mut pause_expired = false;

        loop {
            changes.borrow_and_update();
            let resolution = self.directory.resolve(realm).await.map_err(|err| {
                tracing::error!(realm, error = %err, "Could not resolve realm");
                RouteError::BackendUnavailable(String::new())
            })?;

            let migration = match resolution {
                Resolution::Shard(target) => {
                    let decision = target.source.as_str();
                    return Ok((target, decision));
                }
                Resolution::Migrating(migration) => migration,
            };

            let old = RouteTarget {
                shard: migration.old.clone(),
                epoch: migration.old_epoch,
                source: RouteSource::Assigned,
            };
            let new = RouteTarget {
                shard: migration.new.clone(),
                epoch: migration.epoch,
                source: RouteSource::Assigned,
            };

            match migration_policy(&migration) {
                MigrationPolicy::Old => return Ok((old, "migrating_old")),
                MigrationPolicy::New => return Ok((new, "migrating_new")),
                MigrationPolicy::Invalidate => return Ok((new, "invalidating")),
                MigrationPolicy::Hold if pause_expired => {
                    tracing::warn!(realm, phase = %migration.phase, "Request held past pause timeout");
                    return Err(if method.is_safe() {
                        RouteError::BufferTimeout
                    } else {
                        RouteError::BackendUnavailable(migration.old)
                    });
                }
                MigrationPolicy::Hold => {
                    // Re-resolve once more after the timeout before giving up.
                    if !matches!(
                        timeout_at(pause_deadline, changes.changed()).await,
                        Ok(Ok(()))
                    ) {
                        pause_expired = true;
                    }
                }
            }
        }
    }

    /// Forwards to a shard, holding safe requests while it is down. A request is
    /// only replayed when nothing reached the shard.
    async fn dispatch(
        &self,
        shard: &Shard,
        epoch: u64,
        mut request: Request<ProxyBody>,
        client_addr: SocketAddr,
        arrived_ms: u64,
        deadline: tokio::time::Instant,
    ) -> Result<Response<ProxyBody>, RouteError> {
        let safe = request.method().is_safe();
        let method = request.method().clone();
        let queue_hint = queue_binding(&mut request).await;
        let replay = safe.then(|| Replay::of(&request));
        let mut pending = Some(request);
        let mut must_hold = false;

        loop {
            let liveness = self
                .health
                .liveness(&shard.id)
                .ok_or_else(|| RouteError::BackendUnavailable(shard.id.clone()))?;

            if liveness != Liveness::Healthy || must_hold {
                if !safe {
                    return Err(RouteError::BackendUnavailable(shard.id.clone()));
                }
                match self.health.hold(&shard.id, &method, arrived_ms, deadline).await {
                    HoldOutcome::Released => {}
                    HoldOutcome::Expired => return Err(RouteError::BufferTimeout),
                }
            }

            let request = match (pending.take(), &replay) {
                (Some(request), _) => request,
                (None, Some(replay)) => replay.request(),
                (None, None) => return Err(RouteError::BackendUnavailable(shard.id.clone())),
            };

            match self.forwarder.send(shard, request, client_addr, epoch).await {
                Ok(response) => {
                    self.health.observe_response(&shard.id, Some(response.status()));
                    return normalize_stale_queue(shard, response, queue_hint).await;
                }
                Err(err @ ForwardError::Connect(..)) => {
                    tracing::warn!(shard = %shard.id, error = %err, "Connect to shard failed");
                    self.health.observe_response(&shard.id, None);
                    if !safe {
                        return Err(RouteError::BackendUnavailable(shard.id.clone()));
                    }
                    must_hold = true;
                }
                Err(err @ ForwardError::Timeout(_)) => {
                    tracing::warn!(shard = %shard.id, error = %err, "Shard timed out");
                    self.health.observe_response(&shard.id, None);
                    return Err(if safe {
                        RouteError::BufferTimeout
                    } else {
                        RouteError::BackendUnavailable(shard.id.clone())
                    });
                }
                Err(err @ ForwardError::Failed(..)) => {
                    tracing::warn!(shard = %shard.id, error = %err, "Request to shard failed");
                    self.health.observe_response(&shard.id, None);
                    return Err(RouteError::BackendUnavailable(shard.id.clone()));
                }
            }
        }
    }
}

/// Head of a safe request, kept so it can be sent again without its body.
struct Replay {
    method: Method,
    uri: http::Uri,
    version: http::Version,
    headers: HeaderMap,
}

impl Replay {
    fn of(request: &Request<ProxyBody>) -> Self {
        Replay {
            method: request.method().clone(),
            uri: request.uri().clone(),
            version: request.version(),
            headers: request.headers().clone(),
        }
    }

    fn request(&self) -> Request<ProxyBody> {
        let mut request = Request::new(Empty::<Bytes>::new().map_err(|e| match e {}).boxed());
        *request.method_mut() = self.method.clone();
        *request.uri_mut() = self.uri.clone();
        *request.version_mut() = self.version;
        *request.headers_mut() = self.headers.clone();
        request.headers_mut().remove(CONTENT_LENGTH);
        request
    }
}

fn is_content_type(headers: &HeaderMap, expected: &str) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(';').next().unwrap_or("").trim().eq_ignore_ascii_case(expected))
        .unwrap_or(false)
}

/// The queue a request is bound to, from the query string or, for DELETE, from a
/// small urlencoded body. A body that is read is put back in place.
async fn queue_binding(request: &mut Request<ProxyBody>) -> Option<String> {
    if let Some(queue_id) = query_queue_id(request.uri()) {
        return Some(queue_id);
    }
    if request.method() != Method::DELETE
        || !is_content_type(request.headers(), "application/x-www-form-urlencoded")
    {
        return None;
    }
    let length: usize = request
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())?;
    if length > MAX_FORM_BODY {
        return None;
    }

    let body = std::mem::replace(request.body_mut(), full_body(""));
    match Limited::new(body, MAX_FORM_BODY).collect().await {
        Ok(collected) => {
            let bytes = collected.to_bytes();
            let queue_id = form_queue_id(&bytes);
            *request.body_mut() = full_body(bytes);
            queue_id
        }
        Err(err) => {
            tracing::debug!(error = %err, "Could not read request body");
            None
        }
    }
}

/// A shard answering 400 with `BAD_EVENT_QUEUE_ID` is returned in the canonical
/// stale-queue shape, whatever else the shard put in the body.
async fn normalize_stale_queue(
    shard: &Shard,
    response: Response<ProxyBody>,
    queue_hint: Option<String>,
) -> Result<Response<ProxyBody>, RouteError> {
    if response.status() != StatusCode::BAD_REQUEST
        || !is_content_type(response.headers(), "application/json")
    {
        return Ok(response);
    }

    let (parts, body) = response.into_parts();
    let bytes = match Limited::new(body, MAX_ERROR_BODY).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => {
            tracing::warn!(shard = %shard.id, error = %err, "Could not read shard error body");
            return Err(RouteError::BackendUnavailable(shard.id.clone()));
        }
    };

    if let Ok(value) = serde_json::from_slice::<serde_json::Value>(&bytes)
        && value["code"] == BAD_EVENT_QUEUE_ID
    {
        counter!(STALE_QUEUE_FROM_SHARD, "shard" => shard.id.clone()).increment(1);
        let queue_id = value["queue_id"]
            .as_str()
            .map(String::from)
            .or(queue_hint)
            .unwrap_or_default();
        return Err(RouteError::StaleQueue(queue_id));
    }

    Ok(Response::from_parts(parts, full_body(bytes)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn migration(strategy: Strategy, phase: MigrationPhase) -> MigrationState {
        let mut state = MigrationState::new(
            "zulip".into(),
            "shard-a".into(),
            0,
            "shard-b".into(),
            1,
            strategy,
            unix_millis(),
        );
        state.phase = phase;
        state
    }

    #[test]
    fn test_transparent_policy() {
        use MigrationPhase::*;
        let expected = [
            (Preparing, MigrationPolicy::Old),
            (CreatingOnNew, MigrationPolicy::Old),
            (DbCommitted, MigrationPolicy::Old),
            (DrainingOld, MigrationPolicy::Old),
            (Paused, MigrationPolicy::Hold),
            (Serializing, MigrationPolicy::Hold),
            (MergingOnNew, MigrationPolicy::Hold),
            (Resumed, MigrationPolicy::New),
            (Invalidating, MigrationPolicy::Invalidate),
        ];
        for (phase, policy) in expected {
            assert_eq!(
                migration_policy(&migration(Strategy::Transparent, phase)),
                policy,
                "{phase}"
            );
        }
    }

    #[test]
    fn test_page_reload_policy() {
        use MigrationPhase::*;
        assert_eq!(
            migration_policy(&migration(Strategy::PageReload, Preparing)),
            MigrationPolicy::Old
        );
        assert_eq!(
            migration_policy(&migration(Strategy::PageReload, DbCommitted)),
            MigrationPolicy::Invalidate
        );
        assert_eq!(
            migration_policy(&migration(Strategy::PageReload, Invalidating)),
            MigrationPolicy::Invalidate
        );
    }

    #[tokio::test]
    async fn test_queue_binding_from_delete_body() {
        let mut request = Request::builder()
            .method(Method::DELETE)
            .uri("/json/events")
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .header(CONTENT_LENGTH, "17")
            .body(full_body("queue_id=1517-12a"))
            .unwrap();
        assert_eq!(
            queue_binding(&mut request).await,
            Some("1517-12a".to_string())
        );
        // The body is still there for the shard.
        let body = request.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"queue_id=1517-12a");

        let mut request = Request::builder()
            .method(Method::GET)
            .uri("/json/events?queue_id=abc")
            .body(full_body(""))
            .unwrap();
        assert_eq!(queue_binding(&mut request).await, Some("abc".to_string()));
    }

    #[test]
    fn test_replay_drops_body() {
        let request = Request::builder()
            .method(Method::GET)
            .uri("/json/events?queue_id=abc")
            .header(CONTENT_LENGTH, "3")
            .header("x-custom", "1")
            .body(full_body("abc"))
            .unwrap();
        let replayed = Replay::of(&request).request();
        assert_eq!(replayed.uri(), request.uri());
        assert_eq!(replayed.headers().get("x-custom").unwrap(), "1");
        assert!(replayed.headers().get(CONTENT_LENGTH).is_none());
    }
}
