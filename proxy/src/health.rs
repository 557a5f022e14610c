//! Per-shard liveness and the set of requests held while a shard is down.
//!
//! Every shard has one mutex guarding its liveness, failure counter and FIFO of
//! held requests. A held request is released by whoever removes it from the FIFO
//! while holding that mutex: the recovery drain, the request's own deadline, or the
//! client going away. Removal happens at most once, so release does too.

use crate::config::{BufferConfig, HealthConfig};
use crate::metrics_defs::{BUFFER_RELEASES, BUFFERED_REQUESTS, HEALTH_TRANSITIONS};
use crate::shards::Shards;
use directory::types::{ShardId, unix_millis};
use http::{Method, StatusCode};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use shared::{counter, gauge};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tokio::time::{MissedTickBehavior, interval, timeout_at};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Liveness {
    Healthy,
    Degraded,
    Unreachable,
}

impl Liveness {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Liveness::Healthy => "healthy",
            Liveness::Degraded => "degraded",
            Liveness::Unreachable => "unreachable",
        }
    }
}

impl fmt::Display for Liveness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reported state. A draining shard still takes traffic for realms assigned to it;
/// it only leaves the hash ring.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unreachable,
    Draining,
}

#[derive(Debug, PartialEq, Eq)]
pub enum HoldOutcome {
    /// The shard recovered; forward the request now.
    Released,
    /// The deadline passed first.
    Expired,
}

struct HeldRequest {
    id: u64,
    method: Method,
    arrived_ms: u64,
    deadline_ms: u64,
    release: oneshot::Sender<()>,
}

struct ShardState {
    liveness: Liveness,
    draining: bool,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    held: VecDeque<HeldRequest>,
    drain_running: bool,
    // Requests the predecessor process was still holding at handoff. They stay
    // owned by that process.
    inherited_held: usize,
}

impl ShardState {
    fn new() -> Self {
        ShardState {
            liveness: Liveness::Healthy,
            draining: false,
            consecutive_failures: 0,
            last_failure: None,
            held: VecDeque::new(),
            drain_running: false,
            inherited_held: 0,
        }
    }

    fn reported(&self) -> HealthState {
        match self.liveness {
            Liveness::Healthy if self.draining => HealthState::Draining,
            Liveness::Healthy => HealthState::Healthy,
            Liveness::Degraded => HealthState::Degraded,
            Liveness::Unreachable => HealthState::Unreachable,
        }
    }
}

/// Description of a held request, carried in the handoff snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeldDescription {
    pub method: String,
    pub arrived_ms: u64,
    pub deadline_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardHealthSnapshot {
    pub shard: ShardId,
    pub liveness: Liveness,
    pub draining: bool,
    pub consecutive_failures: u32,
    pub held: Vec<HeldDescription>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ShardStatus {
    pub shard: ShardId,
    pub state: HealthState,
    pub consecutive_failures: u32,
    pub held: usize,
    pub inherited_held: usize,
}

struct Inner {
    shards: HashMap<ShardId, Mutex<ShardState>>,
    config: HealthConfig,
    drain_period: Duration,
    next_id: AtomicU64,
}

#[derive(Clone)]
pub struct HealthMonitor {
    inner: Arc<Inner>,
}

impl HealthMonitor {
    pub fn new<I>(shards: I, config: HealthConfig, buffer: &BufferConfig) -> Self
    where
        I: IntoIterator<Item = ShardId>,
    {
        let shards = shards
            .into_iter()
            .map(|id| (id, Mutex::new(ShardState::new())))
            .collect();
        let rate = buffer.drain_rate_per_sec.max(1);

        HealthMonitor {
            inner: Arc::new(Inner {
                shards,
                config,
                drain_period: Duration::from_secs(1) / rate,
                next_id: AtomicU64::new(0),
            }),
        }
    }

    pub fn liveness(&self, shard: &str) -> Option<Liveness> {
        self.inner.shards.get(shard).map(|s| s.lock().liveness)
    }

    pub fn state(&self, shard: &str) -> Option<HealthState> {
        self.inner.shards.get(shard).map(|s| s.lock().reported())
    }

    pub fn held_count(&self, shard: &str) -> usize {
        self.inner
            .shards
            .get(shard)
            .map(|s| s.lock().held.len())
            .unwrap_or(0)
    }

    pub fn set_draining(&self, shard: &str, draining: bool) {
        if let Some(entry) = self.inner.shards.get(shard) {
            entry.lock().draining = draining;
        }
    }

    /// A successful exchange or health check. Restores the shard and starts
    /// releasing anything held for it.
    pub fn record_success(&self, shard: &str) {
        let Some(entry) = self.inner.shards.get(shard) else {
            return;
        };
        let mut state = entry.lock();
        state.consecutive_failures = 0;
        state.last_failure = None;
        self.transition(shard, &mut state, Liveness::Healthy);
        self.start_drain(shard, &mut state);
    }

    pub fn record_failure(&self, shard: &str) {
        let Some(entry) = self.inner.shards.get(shard) else {
            return;
        };
        let now = Instant::now();
        let mut state = entry.lock();

        if let Some(last) = state.last_failure
            && now.duration_since(last) > self.inner.config.failure_window()
        {
            state.consecutive_failures = 0;
        }
        state.consecutive_failures += 1;
        state.last_failure = Some(now);

        let failures = state.consecutive_failures;
        let next = if failures >= self.inner.config.unreachable_after {
            Liveness::Unreachable
        } else if failures >= self.inner.config.degraded_after
            && state.liveness == Liveness::Healthy
        {
            Liveness::Degraded
        } else {
            state.liveness
        };
        self.transition(shard, &mut state, next);
    }

    /// Feeds the outcome of a proxied request into the failure counter. Transport
    /// failures and 5xx count against the shard; 4xx responses say nothing about
    /// its health.
    pub fn observe_response(&self, shard: &str, status: Option<StatusCode>) {
        match status {
            None => self.record_failure(shard),
            Some(status) if status.is_server_error() => self.record_failure(shard),
            Some(status) if status.is_client_error() => {}
            Some(_) => self.record_success(shard),
        }
    }

    fn transition(&self, shard: &str, state: &mut ShardState, next: Liveness) {
        if state.liveness == next {
            return;
        }
        tracing::info!(
            shard,
            from = %state.liveness,
            to = %next,
            failures = state.consecutive_failures,
            "Backend health change"
        );
        counter!(HEALTH_TRANSITIONS, "shard" => shard.to_string(), "state" => next.as_str())
            .increment(1);
        state.liveness = next;
    }

    /// Holds the caller until the shard recovers or `deadline` passes, whichever
    /// comes first. Dropping the returned future releases the slot.
    pub async fn hold(
        &self,
        shard: &str,
        method: &Method,
        arrived_ms: u64,
        deadline: tokio::time::Instant,
    ) -> HoldOutcome {
        let Some(entry) = self.inner.shards.get(shard) else {
            return HoldOutcome::Expired;
        };
        let now = tokio::time::Instant::now();
        if deadline <= now {
            return HoldOutcome::Expired;
        }

        let (tx, mut rx) = oneshot::channel();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut state = entry.lock();
            state.held.push_back(HeldRequest {
                id,
                method: method.clone(),
                arrived_ms,
                deadline_ms: unix_millis() + deadline.duration_since(now).as_millis() as u64,
                release: tx,
            });
            gauge!(BUFFERED_REQUESTS, "shard" => shard.to_string()).set(state.held.len() as f64);
            if state.liveness == Liveness::Healthy {
                self.start_drain(shard, &mut state);
            }
        }

        let mut guard = HoldGuard {
            monitor: self,
            shard,
            id,
            armed: true,
        };

        let outcome = match timeout_at(deadline, &mut rx).await {
            Ok(Ok(())) => HoldOutcome::Released,
            Ok(Err(_)) => HoldOutcome::Expired,
            Err(_) => {
                if self.remove(shard, id) {
                    counter!(BUFFER_RELEASES, "shard" => shard.to_string(), "reason" => "deadline")
                        .increment(1);
                    HoldOutcome::Expired
                } else {
                    // The drain removed us first and has already sent.
                    match rx.await {
                        Ok(()) => HoldOutcome::Released,
                        Err(_) => HoldOutcome::Expired,
                    }
                }
            }
        };
        guard.armed = false;
        outcome
    }

    fn remove(&self, shard: &str, id: u64) -> bool {
        let Some(entry) = self.inner.shards.get(shard) else {
            return false;
        };
        let mut state = entry.lock();
        let Some(position) = state.held.iter().position(|h| h.id == id) else {
            return false;
        };
        state.held.remove(position);
        gauge!(BUFFERED_REQUESTS, "shard" => shard.to_string()).set(state.held.len() as f64);
        true
    }

    fn start_drain(&self, shard: &str, state: &mut ShardState) {
        if state.drain_running || state.held.is_empty() {
            return;
        }
        state.drain_running = true;
        let monitor = self.clone();
        let shard = shard.to_string();
        tokio::spawn(async move { monitor.drain(shard).await });
    }

    /// Releases held requests in arrival order at the configured rate. Stops as
    /// soon as the shard leaves Healthy; the next recovery starts a new drain.
    async fn drain(self, shard: ShardId) {
        let Some(entry) = self.inner.shards.get(&shard) else {
            return;
        };
        let mut ticker = interval(self.inner.drain_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut released = 0usize;

        loop {
            ticker.tick().await;
            let done = {
                let mut state = entry.lock();
                if state.liveness != Liveness::Healthy || state.held.is_empty() {
                    state.drain_running = false;
                    true
                } else {
                    while let Some(held) = state.held.pop_front() {
                        if held.release.send(()).is_ok() {
                            released += 1;
                            counter!(BUFFER_RELEASES, "shard" => shard.clone(), "reason" => "drain")
                                .increment(1);
                            break;
                        }
                    }
                    gauge!(BUFFERED_REQUESTS, "shard" => shard.clone())
                        .set(state.held.len() as f64);
                    false
                }
            };
            if done {
                break;
            }
        }

        tracing::info!(shard, released, "Finished releasing held requests");
    }

    pub fn statuses(&self) -> Vec<ShardStatus> {
        let mut statuses: Vec<ShardStatus> = self
            .inner
            .shards
            .iter()
            .map(|(id, entry)| {
                let state = entry.lock();
                ShardStatus {
                    shard: id.clone(),
                    state: state.reported(),
                    consecutive_failures: state.consecutive_failures,
                    held: state.held.len(),
                    inherited_held: state.inherited_held,
                }
            })
            .collect();
        statuses.sort_by(|a, b| a.shard.cmp(&b.shard));
        statuses
    }

    /// Point-in-time copy of every shard. Each shard is read under its own lock;
    /// request processing is never paused.
    pub fn snapshot(&self) -> Vec<ShardHealthSnapshot> {
        self.inner
            .shards
            .iter()
            .map(|(id, entry)| {
                let state = entry.lock();
                ShardHealthSnapshot {
                    shard: id.clone(),
                    liveness: state.liveness,
                    draining: state.draining,
                    consecutive_failures: state.consecutive_failures,
                    held: state
                        .held
                        .iter()
                        .map(|h| HeldDescription {
                            method: h.method.to_string(),
                            arrived_ms: h.arrived_ms,
                            deadline_ms: h.deadline_ms,
                        })
                        .collect(),
                }
            })
            .collect()
    }

    pub fn merge_snapshot(&self, snapshot: Vec<ShardHealthSnapshot>) {
        for shard in snapshot {
            let Some(entry) = self.inner.shards.get(&shard.shard) else {
                tracing::warn!(shard = %shard.shard, "Ignoring health of unknown shard");
                continue;
            };
            let mut state = entry.lock();
            state.liveness = shard.liveness;
            state.draining = shard.draining;
            state.consecutive_failures = shard.consecutive_failures;
            state.last_failure = (shard.consecutive_failures > 0).then(Instant::now);
            state.inherited_held = shard.held.len();
        }
    }
}

struct HoldGuard<'a> {
    monitor: &'a HealthMonitor,
    shard: &'a str,
    id: u64,
    armed: bool,
}

impl Drop for HoldGuard<'_> {
    fn drop(&mut self) {
        if self.armed && self.monitor.remove(self.shard, self.id) {
            counter!(BUFFER_RELEASES, "shard" => self.shard.to_string(), "reason" => "cancelled")
                .increment(1);
        }
    }
}

/// Periodically probes every shard's health path and feeds the result into the
/// monitor. A probe succeeds only on a 2xx within the liveness timeout.
pub async fn run_health_checks(
    monitor: HealthMonitor,
    shards: Arc<Shards>,
    config: HealthConfig,
) -> Result<(), reqwest::Error> {
    let client = reqwest::Client::builder()
        .timeout(config.liveness_timeout())
        .build()?;
    let mut ticker = interval(config.check_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let mut checks = JoinSet::new();
        for shard in shards.iter() {
            let client = client.clone();
            let url = shard.url_for(&config.check_path);
            let id = shard.id.clone();
            checks.spawn(async move {
                let healthy = match client.get(url).send().await {
                    Ok(response) => response.status().is_success(),
                    Err(err) => {
                        tracing::debug!(shard = %id, error = %err, "Health check failed");
                        false
                    }
                };
                (id, healthy)
            });
        }

        while let Some(result) = checks.join_next().await {
            match result {
                Ok((shard, true)) => monitor.record_success(&shard),
                Ok((shard, false)) => monitor.record_failure(&shard),
                Err(err) => tracing::error!(error = %err, "Health check task failed"),
            }
        }
    }
}
