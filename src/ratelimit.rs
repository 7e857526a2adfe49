//! # Rate Limiter & Circuit Breaker
//! Per-source pacing (minimum inter-request delay with symmetric jitter)
//! combined with a three-state circuit breaker:
//!
//! | From      | On                        | To        |
//! |-----------|---------------------------|-----------|
//! | CLOSED    | failures reach threshold  | OPEN      |
//! | OPEN      | cooldown elapsed (polled) | HALF_OPEN |
//! | HALF_OPEN | enough successes          | CLOSED    |
//! | HALF_OPEN | any failure               | OPEN      |
//!
//! The OPEN cooldown grows as `cooldown × 2^min(consecutive_blocks, 4)`,
//! capped at 600 s. One async lock per source: acquires are serialised per
//! source and parallel across sources.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};

use crate::config::SourcePolicy;

const BACKOFF_CAP: Duration = Duration::from_secs(600);
const BACKOFF_EXP_MAX: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug)]
struct SourceState {
    policy: SourcePolicy,
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    consecutive_blocks: u32,
    blocked_until: Option<Instant>,
    last_request: Option<Instant>,
}

impl SourceState {
    fn new(policy: SourcePolicy) -> Self {
        Self {
            policy,
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            consecutive_blocks: 0,
            blocked_until: None,
            last_request: None,
        }
    }

    /// Poll-on-acquire: OPEN flips to HALF_OPEN once the cooldown elapsed.
    fn can_execute(&mut self, now: Instant) -> bool {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => match self.blocked_until {
                Some(until) if now >= until => {
                    self.state = CircuitState::HalfOpen;
                    self.success_count = 0;
                    tracing::info!(state = "half_open", "circuit probing");
                    true
                }
                _ => false,
            },
        }
    }

    fn record_success(&mut self) {
        self.success_count += 1;
        match self.state {
            CircuitState::HalfOpen => {
                if self.success_count >= self.policy.half_open_success_threshold {
                    self.state = CircuitState::Closed;
                    self.failure_count = 0;
                    self.consecutive_blocks = 0;
                    self.blocked_until = None;
                    tracing::info!(state = "closed", "circuit recovered");
                }
            }
            CircuitState::Closed => {
                self.failure_count = 0;
            }
            CircuitState::Open => {}
        }
    }

    fn record_failure(&mut self, is_block: bool, now: Instant) {
        self.failure_count += 1;
        if is_block {
            self.consecutive_blocks += 1;
        }
        match self.state {
            CircuitState::HalfOpen => self.open_circuit(now),
            CircuitState::Closed => {
                if self.failure_count >= self.policy.failure_threshold {
                    self.open_circuit(now);
                }
            }
            CircuitState::Open => {}
        }
    }

    fn open_circuit(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        let exp = self.consecutive_blocks.min(BACKOFF_EXP_MAX);
        let backoff = Duration::from_secs(self.policy.cooldown_sec)
            .saturating_mul(2u32.pow(exp))
            .min(BACKOFF_CAP);
        self.blocked_until = Some(now + backoff);
        self.success_count = 0;
        tracing::warn!(paused_secs = backoff.as_secs(), "circuit opened");
    }
}

/// Snapshot of one source's limiter, for status endpoints.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SourceStatus {
    pub source: String,
    pub state: &'static str,
    pub failures: u32,
    pub consecutive_blocks: u32,
    pub retry_in_secs: Option<u64>,
}

/// Multi-source rate limiter. Cheap to clone via `Arc`.
#[derive(Debug, Default)]
pub struct RateLimiter {
    policies: BTreeMap<String, SourcePolicy>,
    sources: std::sync::Mutex<HashMap<String, Arc<Mutex<SourceState>>>>,
}

impl RateLimiter {
    pub fn new(policies: BTreeMap<String, SourcePolicy>) -> Self {
        Self {
            policies,
            sources: std::sync::Mutex::new(HashMap::new()),
        }
    }

    fn state_for(&self, source: &str) -> Arc<Mutex<SourceState>> {
        let mut map = self.sources.lock().expect("rate limiter registry poisoned");
        map.entry(source.to_string())
            .or_insert_with(|| {
                let policy = self.policies.get(source).copied().unwrap_or_default();
                Arc::new(Mutex::new(SourceState::new(policy)))
            })
            .clone()
    }

    /// Wait for the next slot on `source`.
    ///
    /// Returns `false` immediately when the breaker is OPEN; otherwise
    /// enforces `min_delay ± jitter` since the previous acquire and returns
    /// `true`. Holding the per-source lock through the sleep serialises
    /// acquires on the same source.
    pub async fn wait_for_slot(&self, source: &str) -> bool {
        let state = self.state_for(source);
        let mut guard = state.lock().await;

        let now = Instant::now();
        if !guard.can_execute(now) {
            let remaining = guard
                .blocked_until
                .map(|u| u.saturating_duration_since(now).as_secs())
                .unwrap_or(0);
            tracing::debug!(source = source, retry_in = remaining, "source blocked");
            return false;
        }

        let policy = guard.policy;
        let jitter_ms = if policy.jitter_ms == 0 {
            0.0
        } else {
            use rand::Rng;
            rand::rng().random_range(-(policy.jitter_ms as f64)..=(policy.jitter_ms as f64))
        };
        let required = Duration::from_millis(
            ((policy.min_delay_ms as f64) + jitter_ms).max(0.0) as u64,
        );

        if let Some(last) = guard.last_request {
            let elapsed = now.saturating_duration_since(last);
            if elapsed < required {
                tokio::time::sleep(required - elapsed).await;
            }
        }
        guard.last_request = Some(Instant::now());
        true
    }

    pub async fn record_success(&self, source: &str) {
        let state = self.state_for(source);
        state.lock().await.record_success();
    }

    /// `is_block` marks anti-bot blocks (403/429/503), which escalate the
    /// exponential backoff.
    pub async fn record_failure(&self, source: &str, is_block: bool) {
        let state = self.state_for(source);
        state.lock().await.record_failure(is_block, Instant::now());
    }

    /// True while the breaker is OPEN and the cooldown has not elapsed.
    /// Does not transition state.
    pub async fn is_blocked(&self, source: &str) -> bool {
        let state = self.state_for(source);
        let guard = state.lock().await;
        guard.state == CircuitState::Open
            && guard
                .blocked_until
                .map(|u| Instant::now() < u)
                .unwrap_or(false)
    }

    pub async fn status(&self) -> Vec<SourceStatus> {
        let arcs: Vec<(String, Arc<Mutex<SourceState>>)> = {
            let map = self.sources.lock().expect("rate limiter registry poisoned");
            map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };
        let now = Instant::now();
        let mut out = Vec::with_capacity(arcs.len());
        for (source, arc) in arcs {
            let guard = arc.lock().await;
            out.push(SourceStatus {
                source,
                state: guard.state.as_str(),
                failures: guard.failure_count,
                consecutive_blocks: guard.consecutive_blocks,
                retry_in_secs: guard
                    .blocked_until
                    .filter(|_| guard.state == CircuitState::Open)
                    .map(|u| u.saturating_duration_since(now).as_secs()),
            });
        }
        out.sort_by(|a, b| a.source.cmp(&b.source));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(failure_threshold: u32, cooldown_sec: u64) -> SourcePolicy {
        SourcePolicy {
            min_delay_ms: 100,
            jitter_ms: 0,
            failure_threshold,
            cooldown_sec,
            half_open_success_threshold: 2,
        }
    }

    fn limiter(p: SourcePolicy) -> RateLimiter {
        let mut policies = BTreeMap::new();
        policies.insert("testsource".to_string(), p);
        RateLimiter::new(policies)
    }

    #[tokio::test(start_paused = true)]
    async fn trips_open_after_threshold_failures() {
        let rl = limiter(policy(2, 1));
        assert!(rl.wait_for_slot("testsource").await);
        rl.record_failure("testsource", false).await;
        rl.record_failure("testsource", false).await;
        assert!(!rl.wait_for_slot("testsource").await);
        assert!(rl.is_blocked("testsource").await);
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_through_half_open() {
        let rl = limiter(policy(2, 1));
        rl.record_failure("testsource", false).await;
        rl.record_failure("testsource", false).await;
        assert!(!rl.wait_for_slot("testsource").await);

        tokio::time::sleep(Duration::from_millis(1100)).await;
        // Cooldown elapsed: acquire transitions OPEN → HALF_OPEN.
        assert!(rl.wait_for_slot("testsource").await);

        rl.record_success("testsource").await;
        rl.record_success("testsource").await;
        let status = rl.status().await;
        assert_eq!(status[0].state, "closed");
        assert_eq!(status[0].consecutive_blocks, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_failure_reopens_with_longer_backoff() {
        let rl = limiter(policy(1, 10));
        rl.record_failure("testsource", true).await; // OPEN, blocks=1 → 20 s
        tokio::time::sleep(Duration::from_secs(21)).await;
        assert!(rl.wait_for_slot("testsource").await); // HALF_OPEN
        rl.record_failure("testsource", true).await; // back to OPEN, blocks=2 → 40 s
        tokio::time::sleep(Duration::from_secs(25)).await;
        assert!(!rl.wait_for_slot("testsource").await, "40s backoff not over");
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_caps_at_ten_minutes() {
        let rl = limiter(policy(1, 300));
        for _ in 0..6 {
            rl.record_failure("testsource", true).await;
        }
        let status = rl.status().await;
        assert!(status[0].retry_in_secs.unwrap() <= 600);
    }

    #[tokio::test(start_paused = true)]
    async fn consecutive_acquires_respect_min_delay() {
        let rl = limiter(policy(3, 60));
        let t0 = Instant::now();
        assert!(rl.wait_for_slot("testsource").await);
        assert!(rl.wait_for_slot("testsource").await);
        assert!(rl.wait_for_slot("testsource").await);
        let elapsed = Instant::now().saturating_duration_since(t0);
        // Two inter-request gaps of >= min_delay (jitter is zero here).
        assert!(elapsed >= Duration::from_millis(200), "elapsed {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn success_in_closed_resets_failure_count() {
        let rl = limiter(policy(2, 1));
        rl.record_failure("testsource", false).await;
        rl.record_success("testsource").await;
        rl.record_failure("testsource", false).await;
        // Never reached two consecutive failures.
        assert!(rl.wait_for_slot("testsource").await);
    }
}
