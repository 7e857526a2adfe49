//! # Runner Loop
//! Schedules pipeline cycles: one orchestrator run per enabled search,
//! a pause between searches, a jittered interval between cycles, and
//! multiplicative backoff when the market goes quiet (which usually means
//! we are being throttled somewhere).
//!
//! Operator alerts fire on start/stop, on a zero-yield streak crossing the
//! configured threshold, and on repeated cycle failures. A shutdown signal
//! lets the current pipeline finish before the loop exits.

use rand::Rng;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Duration;

use crate::config::{RunnerConfig, SearchSpec, SearchesConfig};
use crate::model::Source;
use crate::notify::send_operator_alert;
use crate::pipeline::{Orchestrator, PipelineStats, RunOptions};

/// Aggregate counters across cycles, for logs and the status API.
#[derive(Debug, Clone, Default)]
pub struct RunnerStats {
    pub total_cycles: u64,
    pub total_listings: u64,
    pub total_notifications: u64,
    pub consecutive_zero_listings: u32,
    pub error_count: u32,
}

impl RunnerStats {
    pub fn record_cycle(&mut self, listings: usize, notifications: usize) {
        self.total_cycles += 1;
        self.total_listings += listings as u64;
        self.total_notifications += notifications as u64;
        if listings == 0 {
            self.consecutive_zero_listings += 1;
        } else {
            self.consecutive_zero_listings = 0;
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "cycles: {} | listings: {} | notifs: {} | zero streak: {} | errors: {}",
            self.total_cycles,
            self.total_listings,
            self.total_notifications,
            self.consecutive_zero_listings,
            self.error_count
        )
    }
}

pub struct Runner {
    orchestrator: Arc<Orchestrator>,
    searches: SearchesConfig,
    shutdown: watch::Receiver<bool>,
}

impl Runner {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        searches: SearchesConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            orchestrator,
            searches,
            shutdown,
        }
    }

    fn is_stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn run_options(search: &SearchSpec, runner: &RunnerConfig) -> RunOptions {
        let sources: Vec<Source> = search
            .sources
            .iter()
            .filter_map(|s| {
                let parsed = Source::parse(s);
                if parsed.is_none() {
                    tracing::warn!(source = %s, search = %search.name, "unknown source in search");
                }
                parsed
            })
            .collect();
        RunOptions {
            sources,
            detail_threshold: search.detail_threshold,
            notify_threshold: search.notify_threshold,
            max_detail_per_run: runner.max_detail_per_run,
            max_pages: search.max_pages,
        }
    }

    /// One cycle: every enabled search, with the configured pause between
    /// them. Returns the merged stats.
    pub async fn run_cycle(&self) -> Vec<PipelineStats> {
        let runner_cfg = self.searches.runner();
        let enabled: Vec<&SearchSpec> = self.searches.enabled_searches().collect();
        let mut all_stats = Vec::with_capacity(enabled.len());

        for (i, search) in enabled.iter().enumerate() {
            if self.is_stopping() {
                break;
            }
            tracing::info!(
                search = %search.name,
                make = %search.make,
                model = %search.model,
                sources = ?search.sources,
                "running search"
            );
            let opts = Self::run_options(search, &runner_cfg);
            let stats = self.orchestrator.run(&opts).await;
            all_stats.push(stats);

            if i + 1 < enabled.len() && !self.is_stopping() {
                tokio::time::sleep(Duration::from_secs(runner_cfg.delay_between_searches_sec))
                    .await;
            }
        }
        all_stats
    }

    /// Loop until the shutdown signal flips. The interval gets symmetric
    /// jitter; three zero-yield cycles in a row start multiplying it.
    pub async fn run_loop(&self) {
        let cfg = self.searches.runner();
        let mut stats = RunnerStats::default();
        let mut backoff_secs: u64 = 0;

        send_operator_alert("radar démarré").await;
        tracing::info!(
            interval = cfg.scan_interval_sec,
            jitter = cfg.jitter_sec,
            "runner loop started"
        );

        // Alert when a cycle burns through this many repository failures.
        const REPO_FAILURE_ALERT_THRESHOLD: u64 = 10;
        let mut repo_failures_seen = crate::repo::repo_failure_count();

        while !self.is_stopping() {
            let cycle = self.run_cycle().await;
            let listings: usize = cycle.iter().map(|s| s.index_scanned).sum();
            let notifications: usize = cycle.iter().map(|s| s.notified).sum();
            let errors: usize = cycle.iter().map(|s| s.index_errors + s.detail_errors).sum();
            stats.record_cycle(listings, notifications);
            stats.error_count += errors as u32;
            tracing::info!(summary = %stats.summary(), "cycle finished");

            let repo_failures_now = crate::repo::repo_failure_count();
            if repo_failures_now.saturating_sub(repo_failures_seen) >= REPO_FAILURE_ALERT_THRESHOLD {
                send_operator_alert(&format!(
                    "{} echecs de base de donnees sur le dernier cycle",
                    repo_failures_now - repo_failures_seen
                ))
                .await;
            }
            repo_failures_seen = repo_failures_now;

            if stats.consecutive_zero_listings >= cfg.zero_listings_threshold {
                backoff_secs = if backoff_secs == 0 {
                    cfg.scan_interval_sec
                } else {
                    (backoff_secs * cfg.backoff_multiplier).min(cfg.backoff_max_sec)
                }
                .min(cfg.backoff_max_sec);
                tracing::warn!(
                    streak = stats.consecutive_zero_listings,
                    backoff = backoff_secs,
                    "zero-yield streak, backing off"
                );
                if cfg.alert_on_zero_listings
                    && stats.consecutive_zero_listings == cfg.zero_listings_threshold
                {
                    send_operator_alert(&format!(
                        "0 annonce depuis {} cycles — blocage multi-sources possible",
                        stats.consecutive_zero_listings
                    ))
                    .await;
                }
            } else {
                backoff_secs = 0;
            }

            if self.is_stopping() {
                break;
            }
            let sleep_secs = jittered_interval(cfg.scan_interval_sec, cfg.jitter_sec) + backoff_secs;
            tracing::debug!(sleep_secs = sleep_secs, "next cycle scheduled");
            let mut shutdown = self.shutdown.clone();
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(sleep_secs)) => {}
                _ = shutdown.changed() => {}
            }
        }

        send_operator_alert("radar arrêté").await;
        tracing::info!(summary = %stats.summary(), "runner loop stopped");
    }
}

/// Base interval with symmetric jitter, floored at 1 s.
fn jittered_interval(base_sec: u64, jitter_sec: u64) -> u64 {
    if jitter_sec == 0 {
        return base_sec.max(1);
    }
    let jitter = rand::rng().random_range(-(jitter_sec as i64)..=(jitter_sec as i64));
    (base_sec as i64 + jitter).max(1) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_within_band() {
        for _ in 0..100 {
            let v = jittered_interval(60, 10);
            assert!((50..=70).contains(&v), "out of band: {v}");
        }
        assert_eq!(jittered_interval(60, 0), 60);
        // Jitter larger than the base never yields zero.
        for _ in 0..100 {
            assert!(jittered_interval(2, 10) >= 1);
        }
    }

    #[test]
    fn zero_yield_streak_tracking() {
        let mut stats = RunnerStats::default();
        stats.record_cycle(5, 1);
        assert_eq!(stats.consecutive_zero_listings, 0);
        stats.record_cycle(0, 0);
        stats.record_cycle(0, 0);
        assert_eq!(stats.consecutive_zero_listings, 2);
        stats.record_cycle(3, 0);
        assert_eq!(stats.consecutive_zero_listings, 0);
        assert_eq!(stats.total_cycles, 4);
        assert_eq!(stats.total_listings, 8);
    }

    #[test]
    fn run_options_filter_unknown_sources() {
        let search: SearchSpec = toml::from_str(
            r#"
            name = "test"
            sources = ["autoscout24", "craigslist"]
            detail_threshold = 40
            notify_threshold = 70
            max_pages = 3
        "#,
        )
        .unwrap();
        let opts = Runner::run_options(&search, &RunnerConfig::default());
        assert_eq!(opts.sources, vec![Source::Autoscout24]);
        assert_eq!(opts.detail_threshold, 40);
        assert_eq!(opts.notify_threshold, 70);
        assert_eq!(opts.max_pages, 3);
    }
}
