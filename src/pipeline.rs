//! # Pipeline Orchestrator
//! Two-phase scan/detail pipeline:
//!
//! 1. **Index scan** per source (adapters behind [`IndexScraper`]),
//! 2. strict dedup against in-memory seen-sets and the repository,
//! 3. light scoring + priority ordering,
//! 4. **detail enrichment** under bounded concurrency (one semaphore across
//!    sources, a rate-limiter slot per source), full scoring, notify
//!    decision, upsert,
//! 5. scan-history accounting.
//!
//! One source failing never aborts the run; errors stay inside the phase
//! that raised them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::{counter, describe_counter, describe_gauge, gauge};
use once_cell::sync::OnceCell;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Duration;

use crate::model::{canonicalize_url, AlertLevel, Annonce, Fuel, Gearbox, Source};
use crate::normalize;
use crate::notify::decider::should_notify;
use crate::notify::NotifierMux;
use crate::ratelimit::RateLimiter;
use crate::repo::AnnonceRepository;
use crate::scoring::Scorer;

/// Default bound on concurrent detail fetches, across all sources.
const DEFAULT_DETAIL_CONCURRENCY: usize = 5;
/// Default timeout applied to every external call.
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Error taxonomy surfaced by scrapers; the orchestrator maps each variant
/// to its rate-limiter and accounting consequences.
#[derive(Debug, Error)]
pub enum ScrapeError {
    /// Timeouts, connection resets: retried inside the adapter's HTTP
    /// layer; counts as a limiter failure on final give-up.
    #[error("transient network error: {0}")]
    TransientNetwork(String),
    /// 403/429/503 or an anti-bot page: records a block, never retried in
    /// the same run.
    #[error("blocked by source")]
    Blocked,
    /// 404: the listing is gone; the stored record is left untouched.
    #[error("listing not found")]
    NotFound,
    /// Malformed payload: skip the listing, does not count against the
    /// breaker.
    #[error("parse error: {0}")]
    Parse(String),
    /// Breaker is OPEN for this source.
    #[error("rate limited")]
    RateLimited,
}

/// Light payload from a source's list page.
#[derive(Debug, Clone, Default)]
pub struct IndexResult {
    pub source: Option<Source>,
    pub url: String,
    pub source_listing_id: String,
    pub title: String,
    pub price: Option<u32>,
    pub km: Option<u32>,
    pub year: Option<i32>,
    pub city: String,
    pub department: String,
    pub published_at: Option<DateTime<Utc>>,
    pub thumbnail_url: String,
    // Vehicle hints when the adapter already parsed them.
    pub make: String,
    pub model: String,
    pub version: String,
    pub fuel: String,
}

/// Full payload from a source's detail page.
#[derive(Debug, Clone, Default)]
pub struct DetailResult {
    pub description: String,
    pub image_urls: Vec<String>,
    pub seller_type: String,
    pub seller_name: String,
    pub seller_phone: String,
    pub fuel: String,
    pub gearbox: String,
    pub power_hp: Option<u32>,
    pub version: String,
    pub motorisation: String,
    pub ct_info: String,
}

#[async_trait]
pub trait IndexScraper: Send + Sync {
    /// Idempotent: repeated calls over the same page range may return
    /// overlapping listings; the orchestrator dedupes. The adapter should
    /// take its own rate-limiter slots before HTTP calls.
    async fn scan_index(&self, max_pages: u32) -> Result<Vec<IndexResult>, ScrapeError>;
}

#[async_trait]
pub trait DetailScraper: Send + Sync {
    /// `Ok(None)` for non-recoverable per-listing misses.
    async fn fetch_detail(&self, url: &str) -> Result<Option<DetailResult>, ScrapeError>;
}

/// Per-run counters; `summary()` is the one-line log form.
#[derive(Debug, Clone)]
pub struct PipelineStats {
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub index_scanned: usize,
    pub index_new: usize,
    pub index_duplicates: usize,
    pub index_errors: usize,
    pub detail_fetched: usize,
    pub detail_errors: usize,
    pub score_above_threshold: usize,
    pub urgent_count: usize,
    pub interessant_count: usize,
    pub notified: usize,
    pub cancelled: bool,
}

impl Default for PipelineStats {
    fn default() -> Self {
        Self {
            started_at: Utc::now(),
            finished_at: None,
            index_scanned: 0,
            index_new: 0,
            index_duplicates: 0,
            index_errors: 0,
            detail_fetched: 0,
            detail_errors: 0,
            score_above_threshold: 0,
            urgent_count: 0,
            interessant_count: 0,
            notified: 0,
            cancelled: false,
        }
    }
}

impl PipelineStats {
    pub fn duration_seconds(&self) -> f64 {
        let end = self.finished_at.unwrap_or_else(Utc::now);
        (end - self.started_at).num_milliseconds() as f64 / 1000.0
    }

    pub fn summary(&self) -> String {
        format!(
            "index: {} scanned, {} new, {} dup | detail: {} fetched, {} errors | \
             score: {} urgent, {} interessant | notifs: {} | {:.1}s",
            self.index_scanned,
            self.index_new,
            self.index_duplicates,
            self.detail_fetched,
            self.detail_errors,
            self.urgent_count,
            self.interessant_count,
            self.notified,
            self.duration_seconds()
        )
    }
}

/// Knobs for one pipeline invocation.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub sources: Vec<Source>,
    pub detail_threshold: i32,
    pub notify_threshold: i32,
    pub max_detail_per_run: usize,
    pub max_pages: u32,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
            detail_threshold: 30,
            notify_threshold: 60,
            max_detail_per_run: 20,
            max_pages: 2,
        }
    }
}

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("pipeline_runs_total", "Pipeline invocations.");
        describe_counter!("index_scanned_total", "Index results scanned.");
        describe_counter!("index_duplicates_total", "Index results deduplicated.");
        describe_counter!("index_errors_total", "Index scan errors.");
        describe_counter!("detail_fetched_total", "Detail pages fetched.");
        describe_counter!("detail_errors_total", "Detail fetch errors.");
        describe_counter!("notify_sent_total", "Listing notifications delivered.");
        describe_counter!("repo_errors_total", "Repository operation failures.");
        describe_gauge!("pipeline_last_run_ts", "Unix ts of the last pipeline run.");
    });
}

struct DetailOutcome {
    fetched: bool,
    error: bool,
    notified: bool,
    alert_level: Option<AlertLevel>,
    skipped: bool,
}

/// The pipeline orchestrator. Components are shared (`Arc`) so detail
/// tasks can run concurrently.
pub struct Orchestrator {
    repo: Arc<AnnonceRepository>,
    scorer: Arc<Scorer>,
    limiter: Arc<RateLimiter>,
    notifier: Arc<NotifierMux>,
    index_scrapers: HashMap<Source, Arc<dyn IndexScraper>>,
    detail_scrapers: HashMap<Source, Arc<dyn DetailScraper>>,
    seen_urls: Mutex<HashSet<String>>,
    seen_source_listings: Mutex<HashSet<(Source, String)>>,
    detail_semaphore: Arc<Semaphore>,
    call_timeout: Duration,
    /// Soft deadline for a whole run; unlimited when `None`. Checked at
    /// phase boundaries, so in-flight calls still finish.
    run_deadline: Option<Duration>,
    shutdown: watch::Receiver<bool>,
    _shutdown_tx: Option<watch::Sender<bool>>,
}

impl Orchestrator {
    pub fn new(
        repo: Arc<AnnonceRepository>,
        scorer: Arc<Scorer>,
        limiter: Arc<RateLimiter>,
        notifier: Arc<NotifierMux>,
    ) -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            repo,
            scorer,
            limiter,
            notifier,
            index_scrapers: HashMap::new(),
            detail_scrapers: HashMap::new(),
            seen_urls: Mutex::new(HashSet::new()),
            seen_source_listings: Mutex::new(HashSet::new()),
            detail_semaphore: Arc::new(Semaphore::new(DEFAULT_DETAIL_CONCURRENCY)),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            run_deadline: None,
            shutdown: rx,
            _shutdown_tx: Some(tx),
        }
    }

    pub fn register_scraper(
        &mut self,
        source: Source,
        index: Arc<dyn IndexScraper>,
        detail: Option<Arc<dyn DetailScraper>>,
    ) {
        self.index_scrapers.insert(source, index);
        if let Some(detail) = detail {
            self.detail_scrapers.insert(source, detail);
        }
    }

    /// Observe an external shutdown signal; in-flight work finishes, no new
    /// tasks start.
    pub fn with_shutdown(mut self, rx: watch::Receiver<bool>) -> Self {
        self.shutdown = rx;
        self._shutdown_tx = None;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_run_deadline(mut self, deadline: Duration) -> Self {
        self.run_deadline = Some(deadline);
        self
    }

    pub fn with_detail_concurrency(mut self, n: usize) -> Self {
        self.detail_semaphore = Arc::new(Semaphore::new(n.max(1)));
        self
    }

    pub fn registered_sources(&self) -> Vec<Source> {
        self.index_scrapers.keys().copied().collect()
    }

    /// Seed the seen-sets from recent repository rows so a restart does not
    /// re-process (and re-notify) everything it already knows.
    pub fn preload_cache(&self, hours: i64) {
        let keys = self.repo.recent_seen(hours, 5000);
        let mut urls = self.seen_urls.lock().expect("seen_urls poisoned");
        let mut listings = self
            .seen_source_listings
            .lock()
            .expect("seen_source_listings poisoned");
        for key in &keys {
            if !key.url_canonical.is_empty() {
                urls.insert(key.url_canonical.clone());
            }
            if !key.source_listing_id.is_empty() {
                listings.insert((key.source, key.source_listing_id.clone()));
            }
        }
        tracing::info!(seeded = keys.len(), "dedup cache preloaded");
    }

    pub fn clear_cache(&self) {
        self.seen_urls.lock().expect("seen_urls poisoned").clear();
        self.seen_source_listings
            .lock()
            .expect("seen_source_listings poisoned")
            .clear();
    }

    fn is_cancelled(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Run the full pipeline once.
    pub async fn run(&self, opts: &RunOptions) -> PipelineStats {
        ensure_metrics_described();
        counter!("pipeline_runs_total").increment(1);

        let mut stats = PipelineStats::default();
        let run_started = tokio::time::Instant::now();
        let past_deadline =
            |started: tokio::time::Instant| match self.run_deadline {
                Some(deadline) => started.elapsed() > deadline,
                None => false,
            };
        let sources: Vec<Source> = if opts.sources.is_empty() {
            self.registered_sources()
        } else {
            opts.sources.clone()
        };

        // Phase A+B: index scan, then strict dedup. Per-source accounting
        // feeds scan history.
        struct SourceCounts {
            scan_id: Option<i64>,
            found: usize,
            new: usize,
            errors: usize,
        }
        let mut per_source: HashMap<Source, SourceCounts> = HashMap::new();
        let mut fresh: Vec<IndexResult> = Vec::new();

        for source in &sources {
            let Some(scraper) = self.index_scrapers.get(source) else {
                continue;
            };
            if self.is_cancelled() || past_deadline(run_started) {
                stats.cancelled = true;
                break;
            }
            if self.limiter.is_blocked(source.as_str()).await {
                tracing::info!(source = %source, "breaker open, skipping source this cycle");
                continue;
            }

            let scan_id = self.repo.log_scan_start(*source);
            let mut counts = SourceCounts {
                scan_id,
                found: 0,
                new: 0,
                errors: 0,
            };

            let scan = tokio::time::timeout(self.call_timeout, scraper.scan_index(opts.max_pages))
                .await;
            match scan {
                Ok(Ok(results)) => {
                    self.limiter.record_success(source.as_str()).await;
                    counts.found = results.len();
                    stats.index_scanned += results.len();
                    for mut result in results {
                        result.source = Some(*source);
                        if self.is_duplicate(&result) {
                            stats.index_duplicates += 1;
                            continue;
                        }
                        counts.new += 1;
                        stats.index_new += 1;
                        fresh.push(result);
                    }
                }
                Ok(Err(e)) => {
                    counts.errors += 1;
                    stats.index_errors += 1;
                    match e {
                        ScrapeError::Blocked => {
                            self.limiter.record_failure(source.as_str(), true).await;
                        }
                        ScrapeError::TransientNetwork(_) => {
                            self.limiter.record_failure(source.as_str(), false).await;
                        }
                        // Parse problems and 404s are the adapter's own
                        // weather; they do not trip the breaker.
                        ScrapeError::Parse(_) | ScrapeError::NotFound | ScrapeError::RateLimited => {}
                    }
                    tracing::warn!(source = %source, error = %e, "index scan failed");
                }
                Err(_elapsed) => {
                    counts.errors += 1;
                    stats.index_errors += 1;
                    self.limiter.record_failure(source.as_str(), false).await;
                    tracing::warn!(source = %source, "index scan timed out");
                }
            }
            per_source.insert(*source, counts);
        }

        counter!("index_scanned_total").increment(stats.index_scanned as u64);
        counter!("index_duplicates_total").increment(stats.index_duplicates as u64);
        counter!("index_errors_total").increment(stats.index_errors as u64);

        // Phase C: light scoring + priority, best first.
        let mut scored: Vec<(i32, i32, IndexResult)> = fresh
            .into_iter()
            .map(|r| {
                let (score, priority) = light_score(&r);
                (score, priority, r)
            })
            .collect();
        scored.sort_by(|a, b| b.1.cmp(&a.1));

        let selected: Vec<IndexResult> = scored
            .into_iter()
            .filter(|(score, _, _)| *score >= opts.detail_threshold)
            .take(opts.max_detail_per_run)
            .map(|(_, _, r)| r)
            .collect();
        stats.score_above_threshold = selected.len();

        // Phase D: bounded-concurrency detail enrichment.
        let mut join_set: JoinSet<DetailOutcome> = JoinSet::new();
        for result in selected {
            if self.is_cancelled() || past_deadline(run_started) {
                stats.cancelled = true;
                break;
            }
            let Some(source) = result.source else {
                continue;
            };
            let semaphore = self.detail_semaphore.clone();
            let repo = self.repo.clone();
            let scorer = self.scorer.clone();
            let limiter = self.limiter.clone();
            let notifier = self.notifier.clone();
            let detail_scraper = self.detail_scrapers.get(&source).cloned();
            let shutdown = self.shutdown.clone();
            let call_timeout = self.call_timeout;
            let notify_threshold = opts.notify_threshold;

            join_set.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => return skipped_outcome(),
                };
                if *shutdown.borrow() {
                    return skipped_outcome();
                }
                process_detail(
                    result,
                    source,
                    repo,
                    scorer,
                    limiter,
                    notifier,
                    detail_scraper,
                    call_timeout,
                    notify_threshold,
                )
                .await
            });
        }

        while let Some(joined) = join_set.join_next().await {
            let outcome = match joined {
                Ok(o) => o,
                Err(e) => {
                    tracing::warn!(error = %e, "detail task panicked");
                    stats.detail_errors += 1;
                    continue;
                }
            };
            if outcome.skipped {
                continue;
            }
            if outcome.fetched {
                stats.detail_fetched += 1;
            }
            if outcome.error {
                stats.detail_errors += 1;
            }
            if outcome.notified {
                stats.notified += 1;
            }
            match outcome.alert_level {
                Some(AlertLevel::Urgent) => stats.urgent_count += 1,
                Some(AlertLevel::Interessant) => stats.interessant_count += 1,
                _ => {}
            }
        }

        counter!("detail_fetched_total").increment(stats.detail_fetched as u64);
        counter!("detail_errors_total").increment(stats.detail_errors as u64);
        counter!("notify_sent_total").increment(stats.notified as u64);
        gauge!("pipeline_last_run_ts").set(Utc::now().timestamp() as f64);

        // Phase E: close scan-history rows.
        let status = if stats.cancelled { "cancelled" } else { "completed" };
        for (_, counts) in per_source {
            if let Some(scan_id) = counts.scan_id {
                self.repo
                    .log_scan_end(scan_id, status, counts.found, counts.new, counts.errors, "");
            }
        }

        stats.finished_at = Some(Utc::now());
        tracing::info!(summary = %stats.summary(), "pipeline run finished");
        stats
    }

    /// Strict dedup: `(source, source_listing_id)` first, canonical URL as
    /// fallback; both checked against memory then the repository.
    fn is_duplicate(&self, result: &IndexResult) -> bool {
        let Some(source) = result.source else {
            return false;
        };

        if !result.source_listing_id.is_empty() {
            let key = (source, result.source_listing_id.clone());
            {
                let mut listings = self
                    .seen_source_listings
                    .lock()
                    .expect("seen_source_listings poisoned");
                if listings.contains(&key) {
                    return true;
                }
                listings.insert(key);
            }
            if self
                .repo
                .get_by_source_listing(source, &result.source_listing_id)
                .is_some()
            {
                return true;
            }
        }

        let url_canonical = canonicalize_url(&result.url);
        {
            let mut urls = self.seen_urls.lock().expect("seen_urls poisoned");
            if urls.contains(&url_canonical) {
                return true;
            }
            urls.insert(url_canonical.clone());
        }
        if self.repo.exists(None, Some(&url_canonical)) {
            return true;
        }
        false
    }
}

fn skipped_outcome() -> DetailOutcome {
    DetailOutcome {
        fetched: false,
        error: false,
        notified: false,
        alert_level: None,
        skipped: true,
    }
}

/// Heuristic pre-detail score and queue priority, from index data alone.
/// Fresh cheap listings with opportunity words in the title go first.
pub fn light_score(result: &IndexResult) -> (i32, i32) {
    let mut score = 0;
    let mut priority = 0;

    if let Some(price) = result.price {
        if price < 2000 {
            score += 25;
            priority += 20;
        } else if price < 3000 {
            score += 20;
            priority += 10;
        } else if price < 4000 {
            score += 10;
        }
    }

    if let Some(km) = result.km {
        if (80_000..=150_000).contains(&km) {
            score += 20;
        } else if km < 80_000 {
            score += 15;
        } else if km <= 200_000 {
            score += 10;
        }
    }

    if let Some(published) = result.published_at {
        let age_hours = (Utc::now() - published).num_seconds() as f64 / 3600.0;
        if age_hours < 1.0 {
            score += 15;
            priority += 30;
        } else if age_hours < 6.0 {
            score += 10;
            priority += 20;
        } else if age_hours < 24.0 {
            score += 5;
            priority += 10;
        }
    }

    let title = crate::keywords::normalize_matching_text(&result.title);
    if ["urgent", "vite", "depart", "demenagement"]
        .iter()
        .any(|k| title.contains(k))
    {
        score += 10;
        priority += 15;
    }
    if ["negociable", "a debattre", "nego"].iter().any(|k| title.contains(k)) {
        score += 5;
    }
    if ["ct ok", "ct vierge", "controle technique ok"]
        .iter()
        .any(|k| title.contains(k))
    {
        score += 8;
    }
    if ["hs", "panne", "accident", "epave", "pour pieces"]
        .iter()
        .any(|k| {
            if k.contains(' ') {
                title.contains(k)
            } else {
                title.split(' ').any(|w| w == *k)
            }
        })
    {
        score -= 20;
    }

    (score.max(0), priority + score.max(0))
}

/// Build the base annonce from index data; title parsing fills make/model
/// when the adapter did not.
pub fn index_to_annonce(result: &IndexResult, source: Source) -> Annonce {
    let (mut make, mut model, mut version) = (
        result.make.clone(),
        result.model.clone(),
        result.version.clone(),
    );
    if make.is_empty() || model.is_empty() {
        let (parsed_make, parsed_model, parsed_version) = normalize::parse_title(&result.title);
        if make.is_empty() {
            make = parsed_make;
        }
        if model.is_empty() {
            model = parsed_model;
        }
        if version.is_empty() {
            version = parsed_version;
        }
    }

    let department = if result.department.is_empty() {
        normalize::parse_department(&result.city).unwrap_or_default()
    } else {
        result.department.clone()
    };

    let mut annonce = Annonce {
        source,
        source_listing_id: result.source_listing_id.clone(),
        url: result.url.clone(),
        title: result.title.clone(),
        make,
        model,
        version,
        fuel: if result.fuel.is_empty() {
            Fuel::Unknown
        } else {
            normalize::parse_fuel(&result.fuel)
        },
        price: result.price,
        km: result.km,
        year: result.year,
        city: result.city.clone(),
        department,
        published_at: result.published_at,
        image_urls: if result.thumbnail_url.is_empty() {
            Vec::new()
        } else {
            vec![result.thumbnail_url.clone()]
        },
        ..Default::default()
    };
    annonce.seal_identity();
    annonce
}

/// Merge detail-page fields into the annonce.
pub fn merge_detail(annonce: &mut Annonce, detail: &DetailResult) {
    annonce.description = normalize::clean_text(&detail.description);
    if !detail.ct_info.is_empty() {
        if annonce.description.is_empty() {
            annonce.description = detail.ct_info.clone();
        } else {
            annonce.description = format!("{} {}", annonce.description, detail.ct_info);
        }
    }

    if !detail.image_urls.is_empty() {
        annonce.image_urls = detail.image_urls.clone();
    }
    if !detail.seller_type.is_empty() {
        annonce.seller_type = normalize::parse_seller_type(&detail.seller_type);
    }
    if !detail.seller_name.is_empty() {
        annonce.seller_name = detail.seller_name.clone();
    }
    if !detail.seller_phone.is_empty() {
        annonce.seller_phone = detail.seller_phone.clone();
    }
    if !detail.fuel.is_empty() {
        let parsed = normalize::parse_fuel(&detail.fuel);
        if parsed != Fuel::Unknown {
            annonce.fuel = parsed;
        }
    }
    if !detail.gearbox.is_empty() {
        let parsed = normalize::parse_gearbox(&detail.gearbox);
        if parsed != Gearbox::Unknown {
            annonce.gearbox = parsed;
        }
    }
    if detail.power_hp.is_some() {
        annonce.power_hp = detail.power_hp;
    }
    if annonce.version.is_empty() && !detail.version.is_empty() {
        annonce.version = detail.version.clone();
    }
    if !detail.motorisation.is_empty() {
        annonce.motorisation = detail.motorisation.clone();
    }
}

#[allow(clippy::too_many_arguments)]
async fn process_detail(
    result: IndexResult,
    source: Source,
    repo: Arc<AnnonceRepository>,
    scorer: Arc<Scorer>,
    limiter: Arc<RateLimiter>,
    notifier: Arc<NotifierMux>,
    detail_scraper: Option<Arc<dyn DetailScraper>>,
    call_timeout: Duration,
    notify_threshold: i32,
) -> DetailOutcome {
    let mut outcome = DetailOutcome {
        fetched: false,
        error: false,
        notified: false,
        alert_level: None,
        skipped: false,
    };

    let mut existing = repo.get_by_source_listing(source, &result.source_listing_id);
    let mut annonce = index_to_annonce(&result, source);

    // Cross-source repost: surface the near-duplicate as the "existing"
    // record so the decider can treat it as an update instead of a fresh
    // ping. Rows are never merged.
    if existing.is_none() {
        let (is_near, near) = repo.is_near_duplicate(&annonce);
        if is_near {
            existing = near;
        }
    }

    if let Some(scraper) = detail_scraper {
        if limiter.wait_for_slot(source.as_str()).await {
            match tokio::time::timeout(call_timeout, scraper.fetch_detail(&result.url)).await {
                Ok(Ok(Some(detail))) => {
                    limiter.record_success(source.as_str()).await;
                    merge_detail(&mut annonce, &detail);
                    outcome.fetched = true;
                }
                Ok(Ok(None)) => {
                    limiter.record_success(source.as_str()).await;
                }
                Ok(Err(e)) => {
                    outcome.error = true;
                    match e {
                        ScrapeError::Blocked => limiter.record_failure(source.as_str(), true).await,
                        ScrapeError::TransientNetwork(_) => {
                            limiter.record_failure(source.as_str(), false).await
                        }
                        ScrapeError::Parse(_) | ScrapeError::NotFound | ScrapeError::RateLimited => {}
                    }
                    tracing::warn!(url = %result.url, "detail fetch failed");
                }
                Err(_elapsed) => {
                    outcome.error = true;
                    limiter.record_failure(source.as_str(), false).await;
                    tracing::warn!(url = %result.url, "detail fetch timed out");
                }
            }
        } else {
            tracing::debug!(source = %source, "no limiter slot, scoring from index data only");
        }
    }

    scorer.calculate_score(&mut annonce);
    outcome.alert_level = Some(annonce.alert_level);

    let decision = should_notify(&annonce, existing.as_ref(), notify_threshold);
    if decision.notify {
        let channels = notifier.notify(&annonce, &decision).await;
        if !channels.is_empty() {
            annonce.mark_notified(channels);
            outcome.notified = true;
        }
    } else {
        tracing::debug!(
            id = %annonce.id,
            reason = decision.reason.as_str(),
            score = annonce.score_total,
            "notification suppressed"
        );
        // Keep the notified flag from a previous send.
        if let Some(prev) = &existing {
            if prev.notified && prev.fingerprint == annonce.fingerprint {
                annonce.notified = true;
                annonce.notified_at = prev.notified_at;
                annonce.notify_channels = prev.notify_channels.clone();
            }
        }
    }

    repo.save(&mut annonce);
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn light_score_prefers_cheap_fresh_listings() {
        let fresh = IndexResult {
            price: Some(1800),
            km: Some(120_000),
            published_at: Some(Utc::now() - ChronoDuration::minutes(20)),
            title: "Urgent 207 CT ok".into(),
            ..Default::default()
        };
        let (score, priority) = light_score(&fresh);
        // 25 price + 20 km + 15 fresh + 10 urgent + 8 ct = 78
        assert_eq!(score, 78);
        assert_eq!(priority, 78 + 20 + 30 + 15);

        let stale = IndexResult {
            price: Some(3800),
            km: Some(220_000),
            title: "207 moteur en panne".into(),
            ..Default::default()
        };
        let (score, _) = light_score(&stale);
        // 10 price, no km points, -20 risk word → floor at 0
        assert_eq!(score, 0);
    }

    #[test]
    fn light_score_penalises_risk_words() {
        let r = IndexResult {
            price: Some(1500),
            title: "Clio pour pieces".into(),
            ..Default::default()
        };
        let (score, _) = light_score(&r);
        assert_eq!(score, 5); // 25 - 20
    }

    #[test]
    fn index_to_annonce_parses_title_and_department() {
        let result = IndexResult {
            source: Some(Source::Leboncoin),
            url: "https://example.com/a/1?utm_source=x".into(),
            title: "207 1.4 HDi 70ch".into(),
            city: "Nantes 44300".into(),
            price: Some(2500),
            thumbnail_url: "https://img.example/t.jpg".into(),
            ..Default::default()
        };
        let annonce = index_to_annonce(&result, Source::Leboncoin);
        assert_eq!(annonce.make, "Peugeot");
        assert_eq!(annonce.model, "207");
        assert_eq!(annonce.department, "44");
        assert_eq!(annonce.image_urls, vec!["https://img.example/t.jpg"]);
        assert!(!annonce.fingerprint.is_empty());
        assert!(!annonce.url_canonical.contains("utm_source"));
    }

    #[test]
    fn merge_detail_fills_without_clobbering() {
        let result = IndexResult {
            source: Some(Source::Autoscout24),
            title: "Peugeot 207 1.4 HDi".into(),
            ..Default::default()
        };
        let mut annonce = index_to_annonce(&result, Source::Autoscout24);
        let detail = DetailResult {
            description: "<p>Tr&egrave;s bon état</p>".into(),
            image_urls: vec!["a".into(), "b".into()],
            seller_type: "particulier".into(),
            fuel: "diesel".into(),
            gearbox: "manuelle".into(),
            power_hp: Some(70),
            motorisation: "1.4 HDi".into(),
            ct_info: "CT OK".into(),
            ..Default::default()
        };
        merge_detail(&mut annonce, &detail);
        assert_eq!(annonce.description, "Très bon état CT OK");
        assert_eq!(annonce.image_urls.len(), 2);
        assert_eq!(annonce.seller_type, crate::model::SellerType::Particulier);
        assert_eq!(annonce.fuel, Fuel::Diesel);
        assert_eq!(annonce.gearbox, Gearbox::Manual);
        assert_eq!(annonce.power_hp, Some(70));
        // Version came from the title parse and is kept.
        assert_eq!(annonce.version, "1.4 HDi");
    }
}
