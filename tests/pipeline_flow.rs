// tests/pipeline_flow.rs
//
// End-to-end pipeline scenarios over fixture adapters and an in-memory
// repository: cross-run dedup, near-duplicate update notifications, and
// breaker-driven source skipping.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use occasion_radar::config::{KeywordsConfig, SourcePolicy, VehiclesConfig};
use occasion_radar::fixtures::FixtureIndexScraper;
use occasion_radar::keywords::KeywordMatcher;
use occasion_radar::model::{Annonce, Source};
use occasion_radar::notify::decider::{NotifyDecision, NotifyReason};
use occasion_radar::notify::{Notifier, NotifierMux};
use occasion_radar::pipeline::{IndexResult, Orchestrator, RunOptions};
use occasion_radar::ratelimit::RateLimiter;
use occasion_radar::repo::{AnnonceRepository, ListFilters};
use occasion_radar::scoring::Scorer;

/// Records every delivery instead of talking to a webhook.
struct CollectingNotifier {
    sent: Arc<Mutex<Vec<(String, NotifyReason)>>>,
}

#[async_trait]
impl Notifier for CollectingNotifier {
    async fn send(&self, annonce: &Annonce, decision: &NotifyDecision) -> anyhow::Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push((annonce.source_listing_id.clone(), decision.reason));
        Ok(())
    }

    fn channel(&self) -> &'static str {
        "collector"
    }
}

fn fast_policies() -> BTreeMap<String, SourcePolicy> {
    let mut map = BTreeMap::new();
    for source in ["autoscout24", "leboncoin", "lacentrale", "paruvendu"] {
        map.insert(
            source.to_string(),
            SourcePolicy {
                min_delay_ms: 1,
                jitter_ms: 0,
                failure_threshold: 2,
                cooldown_sec: 1,
                half_open_success_threshold: 2,
            },
        );
    }
    map
}

fn components() -> (
    Arc<AnnonceRepository>,
    Arc<Scorer>,
    Arc<RateLimiter>,
    Arc<NotifierMux>,
    Arc<Mutex<Vec<(String, NotifyReason)>>>,
) {
    let repo = Arc::new(AnnonceRepository::open_in_memory().unwrap());
    let vehicles: VehiclesConfig = toml::from_str(
        r#"
        [[vehicles]]
        id = "peugeot_207_hdi"
        make = "peugeot"
        model_patterns = ["^207"]
        price_min = 1500
        price_max = 4000
        km_min = 50000
        km_max = 200000
        resale_min = 3800
        resale_max = 4800
    "#,
    )
    .unwrap();
    let matcher = Arc::new(KeywordMatcher::from_config(&KeywordsConfig::default()));
    let scorer = Arc::new(Scorer::new(&vehicles, matcher));
    let limiter = Arc::new(RateLimiter::new(fast_policies()));
    let sent = Arc::new(Mutex::new(Vec::new()));
    let notifier = Arc::new(
        NotifierMux::new(vec![Box::new(CollectingNotifier { sent: sent.clone() })])
            .with_send_gap(std::time::Duration::from_millis(1)),
    );
    (repo, scorer, limiter, notifier, sent)
}

fn listing_207(listing_id: &str, url: &str, price: u32) -> IndexResult {
    IndexResult {
        source: Some(Source::Autoscout24),
        url: url.to_string(),
        source_listing_id: listing_id.to_string(),
        title: "Peugeot 207 1.4 HDi 70ch".into(),
        price: Some(price),
        km: Some(120_000),
        year: Some(2010),
        city: "Nantes".into(),
        department: "44".into(),
        published_at: Some(Utc::now() - ChronoDuration::minutes(30)),
        ..Default::default()
    }
}

#[tokio::test]
async fn second_run_dedupes_same_source_listing_despite_url_noise() {
    let (repo, scorer, limiter, notifier, _sent) = components();
    let index = FixtureIndexScraper::new();
    index.push_listings(vec![listing_207(
        "MOCK001",
        "https://www.autoscout24.fr/annonce/mock001",
        2500,
    )]);
    // Same listing again, with a tracking-noise URL.
    index.push_listings(vec![listing_207(
        "MOCK001",
        "https://www.autoscout24.fr/annonce/mock001?utm_source=x",
        2500,
    )]);

    let mut orch = Orchestrator::new(repo.clone(), scorer, limiter, notifier);
    orch.register_scraper(Source::Autoscout24, Arc::new(index), None);

    let opts = RunOptions {
        sources: vec![Source::Autoscout24],
        detail_threshold: 0,
        notify_threshold: 60,
        max_detail_per_run: 10,
        max_pages: 1,
    };

    let first = orch.run(&opts).await;
    assert_eq!(first.index_new, 1);
    assert_eq!(repo.count(&ListFilters::default()), 1);

    let second = orch.run(&opts).await;
    assert_eq!(second.index_duplicates, 1);
    assert_eq!(second.index_new, 0);
    assert_eq!(repo.count(&ListFilters::default()), 1);
}

#[tokio::test]
async fn near_duplicate_repost_notifies_as_price_drop() {
    let (repo, scorer, limiter, notifier, sent) = components();

    // Already-known, already-notified listing on another source.
    let mut existing = Annonce {
        source: Source::Leboncoin,
        source_listing_id: "OLD42".into(),
        url: "https://www.leboncoin.fr/voitures/old42".into(),
        title: "Peugeot 207 1.4 HDi 70ch".into(),
        make: "Peugeot".into(),
        model: "207".into(),
        price: Some(2000),
        km: Some(120_000),
        year: Some(2010),
        department: "44".into(),
        score_total: 70,
        notified: true,
        notified_at: Some(Utc::now()),
        ..Default::default()
    };
    repo.save(&mut existing);

    // The same car reappears on another source, cheaper.
    let index = FixtureIndexScraper::with_listings(vec![listing_207(
        "NEW99",
        "https://www.autoscout24.fr/annonce/new99",
        1850,
    )]);

    let mut orch = Orchestrator::new(repo.clone(), scorer, limiter, notifier);
    orch.register_scraper(Source::Autoscout24, Arc::new(index), None);

    let stats = orch
        .run(&RunOptions {
            sources: vec![Source::Autoscout24],
            detail_threshold: 0,
            notify_threshold: 60,
            max_detail_per_run: 10,
            max_pages: 1,
        })
        .await;

    assert_eq!(stats.notified, 1);
    let deliveries = sent.lock().unwrap();
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].0, "NEW99");
    assert_eq!(deliveries[0].1, NotifyReason::PriceDropped);
    drop(deliveries);

    // Near-duplicates are linked, never merged: both rows remain.
    assert_eq!(repo.count(&ListFilters::default()), 2);
    let new_row = repo
        .get_by_source_listing(Source::Autoscout24, "NEW99")
        .unwrap();
    assert!(new_row.notified);
    assert_eq!(new_row.notify_channels, vec!["collector"]);
}

#[tokio::test]
async fn breaker_skips_source_then_recovers() {
    let (repo, scorer, limiter, notifier, _sent) = components();
    let index = FixtureIndexScraper::new();
    index.push_network_error();
    index.push_network_error();
    // Queued behind the failures: a page that must survive the outage.
    index.push_listings(vec![listing_207(
        "AFTER1",
        "https://www.autoscout24.fr/annonce/after1",
        2500,
    )]);

    let mut orch = Orchestrator::new(repo.clone(), scorer, limiter.clone(), notifier);
    orch.register_scraper(Source::Autoscout24, Arc::new(index), None);

    let opts = RunOptions {
        sources: vec![Source::Autoscout24],
        detail_threshold: 0,
        notify_threshold: 60,
        max_detail_per_run: 10,
        max_pages: 1,
    };

    // Two failing runs trip the breaker (failure_threshold = 2).
    assert_eq!(orch.run(&opts).await.index_errors, 1);
    assert_eq!(orch.run(&opts).await.index_errors, 1);
    assert!(limiter.is_blocked("autoscout24").await);

    // While OPEN the source is skipped entirely.
    let skipped = orch.run(&opts).await;
    assert_eq!(skipped.index_scanned, 0);
    assert_eq!(skipped.index_errors, 0);

    // After the cooldown the next run probes (HALF_OPEN) and succeeds.
    tokio::time::sleep(std::time::Duration::from_millis(1200)).await;
    let recovered = orch.run(&opts).await;
    assert_eq!(recovered.index_scanned, 1);
    assert_eq!(recovered.index_new, 1);
    assert_eq!(repo.count(&ListFilters::default()), 1);
}
