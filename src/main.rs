//! # occasion-radar — Daemon Entrypoint
//! Wires config, repository, rate limiter, scorer, notifiers, and the
//! orchestrator, then hands control to the runner loop.
//!
//! Flags:
//! - `--once` — run a single cycle and exit (no loop)
//! - `--demo` — register the embedded fixture adapters (no network)
//!
//! Environment: `DATABASE_PATH`, `API_ADDR`, `DISCORD_WEBHOOK_URL`,
//! `SLACK_WEBHOOK_URL`, `OPS_WEBHOOK_URL`, `RUST_LOG`, and the
//! `*_CONFIG_PATH` overrides (see `config`).

use std::path::PathBuf;
use std::sync::Arc;

use occasion_radar::config;
use occasion_radar::fixtures::demo_scrapers;
use occasion_radar::keywords::KeywordMatcher;
use occasion_radar::model::Source;
use occasion_radar::notify::NotifierMux;
use occasion_radar::pipeline::Orchestrator;
use occasion_radar::ratelimit::RateLimiter;
use occasion_radar::repo::AnnonceRepository;
use occasion_radar::runner::Runner;
use occasion_radar::scoring::Scorer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let run_once = args.iter().any(|a| a == "--once");
    let demo = args.iter().any(|a| a == "--demo");

    let vehicles = config::load_vehicles_config()?;
    let keywords = config::load_keywords_config()?;
    let searches = config::load_searches_config()?;
    tracing::info!(
        vehicles = vehicles.vehicles.len(),
        searches = searches.searches.len(),
        "configuration loaded"
    );

    let db_path = std::env::var("DATABASE_PATH").unwrap_or_else(|_| "data/annonces.db".into());
    let repo = Arc::new(AnnonceRepository::open(&PathBuf::from(db_path))?);

    let matcher = Arc::new(KeywordMatcher::from_config(&keywords));
    let scorer = Arc::new(Scorer::new(&vehicles, matcher));
    let limiter = Arc::new(RateLimiter::new(searches.source_policies()));
    let notifier = Arc::new(NotifierMux::from_env());

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let mut orchestrator = Orchestrator::new(
        repo.clone(),
        scorer,
        limiter.clone(),
        notifier,
    );
    if demo {
        let (index, detail) = demo_scrapers();
        orchestrator.register_scraper(
            Source::Autoscout24,
            Arc::new(index),
            Some(Arc::new(detail)),
        );
        tracing::info!("demo fixture adapters registered");
    }
    // Site adapters plug in here; the core only knows the contracts.
    if orchestrator.registered_sources().is_empty() && !demo {
        tracing::warn!("no source adapters registered; cycles will scan nothing");
    }
    let orchestrator = Arc::new(orchestrator.with_shutdown(shutdown_rx.clone()));

    // Don't re-notify what we already saw before the restart.
    orchestrator.preload_cache(24);

    let api_addr: std::net::SocketAddr = std::env::var("API_ADDR")
        .unwrap_or_else(|_| "127.0.0.1:8080".into())
        .parse()?;
    tokio::spawn(occasion_radar::api::serve(
        repo.clone(),
        limiter.clone(),
        api_addr,
    ));

    let runner = Runner::new(orchestrator, searches, shutdown_rx);

    if run_once {
        let stats = runner.run_cycle().await;
        for s in &stats {
            tracing::info!(summary = %s.summary(), "search finished");
        }
        return Ok(());
    }

    // SIGINT/SIGTERM: finish the current pipeline, then exit.
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    runner.run_loop().await;
    Ok(())
}
