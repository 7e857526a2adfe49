//! # HTTP API Layer
//! Operational introspection served next to the runner:
//! - `GET /health` — liveness check
//! - `GET /stats` — repository totals + per-source aggregates
//! - `GET /annonces` — filtered listing browse (closed sort-key set)
//! - `GET /sources` — rate-limiter / breaker status per source
//! - `GET /metrics` — Prometheus exposition (attached in `serve`)

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use tower_http::cors::CorsLayer;

use crate::model::{AlertLevel, Annonce, ListingStatus, Source};
use crate::ratelimit::{RateLimiter, SourceStatus};
use crate::repo::{AnnonceRepository, ListFilters};

#[derive(Clone)]
pub struct AppState {
    repo: Arc<AnnonceRepository>,
    limiter: Arc<RateLimiter>,
}

pub fn create_router(repo: Arc<AnnonceRepository>, limiter: Arc<RateLimiter>) -> Router {
    let state = AppState { repo, limiter };
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/stats", get(stats))
        .route("/annonces", get(annonces))
        .route("/sources", get(sources))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

/// Bind and serve the router, with `/metrics` attached. Runs until the
/// process exits; meant to be spawned.
pub async fn serve(
    repo: Arc<AnnonceRepository>,
    limiter: Arc<RateLimiter>,
    addr: std::net::SocketAddr,
) -> anyhow::Result<()> {
    let router = attach_metrics_route(create_router(repo, limiter));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "api listening");
    axum::serve(listener, router).await?;
    Ok(())
}

/// Install the Prometheus recorder and expose it at `/metrics`.
pub fn attach_metrics_route(router: Router) -> Router {
    use metrics_exporter_prometheus::PrometheusBuilder;

    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => router.route(
            "/metrics",
            get(move || {
                let handle = handle.clone();
                async move { handle.render() }
            }),
        ),
        Err(e) => {
            // A second recorder (tests, embedded use) is not fatal.
            tracing::warn!(error = %e, "prometheus recorder not installed");
            router
        }
    }
}

async fn stats(State(state): State<AppState>) -> Json<serde_json::Value> {
    let global = state.repo.get_stats();
    let by_source = state.repo.get_stats_by_source();
    Json(serde_json::json!({
        "global": global,
        "by_source": by_source,
    }))
}

#[derive(serde::Serialize)]
struct AnnonceOut {
    id: String,
    source: String,
    title: String,
    price: Option<u32>,
    km: Option<u32>,
    year: Option<i32>,
    department: String,
    score_total: i32,
    alert_level: String,
    status: String,
    url: String,
    notified: bool,
}

impl From<Annonce> for AnnonceOut {
    fn from(a: Annonce) -> Self {
        Self {
            id: a.id,
            source: a.source.as_str().to_string(),
            title: a.title,
            price: a.price,
            km: a.km,
            year: a.year,
            department: a.department,
            score_total: a.score_total,
            alert_level: a.alert_level.as_str().to_string(),
            status: a.status.as_str().to_string(),
            url: a.url,
            notified: a.notified,
        }
    }
}

async fn annonces(
    State(state): State<AppState>,
    Query(q): Query<HashMap<String, String>>,
) -> Json<Vec<AnnonceOut>> {
    let filters = ListFilters {
        source: q.get("source").and_then(|s| Source::parse(s)),
        status: q.get("status").map(|s| ListingStatus::parse(s)),
        alert_level: q.get("alert_level").map(|s| AlertLevel::parse(s)),
        min_score: q.get("min_score").and_then(|s| s.parse().ok()),
        not_notified: q
            .get("not_notified")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false),
    };
    let limit = q
        .get("limit")
        .and_then(|s| s.parse().ok())
        .unwrap_or(50)
        .min(500);
    let offset = q.get("offset").and_then(|s| s.parse().ok()).unwrap_or(0);
    let order_by = q
        .get("order_by")
        .map(String::as_str)
        .unwrap_or("score_total DESC");

    let rows = state.repo.get_all(&filters, limit, offset, order_by);
    Json(rows.into_iter().map(AnnonceOut::from).collect())
}

async fn sources(State(state): State<AppState>) -> Json<Vec<SourceStatus>> {
    Json(state.limiter.status().await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_router() -> Router {
        let repo = Arc::new(AnnonceRepository::open_in_memory().unwrap());
        let limiter = Arc::new(RateLimiter::new(Default::default()));

        let mut a = Annonce {
            source: Source::Autoscout24,
            source_listing_id: "API1".into(),
            title: "Peugeot 207".into(),
            price: Some(2500),
            score_total: 72,
            alert_level: AlertLevel::Interessant,
            ..Default::default()
        };
        repo.save(&mut a);

        create_router(repo, limiter)
    }

    #[tokio::test]
    async fn health_answers_ok() {
        let router = test_router();
        let resp = router
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(resp.status().is_success());
    }

    #[tokio::test]
    async fn annonces_filters_by_score() {
        let router = test_router();
        let resp = router
            .oneshot(
                Request::builder()
                    .uri("/annonces?min_score=60")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(resp.status().is_success());
        let bytes = to_bytes(resp.into_body(), 256 * 1024).await.unwrap();
        let rows: Vec<serde_json::Value> = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["alert_level"], "interessant");

        let router = test_router();
        let resp = router
            .oneshot(
                Request::builder()
                    .uri("/annonces?min_score=90")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let bytes = to_bytes(resp.into_body(), 256 * 1024).await.unwrap();
        let rows: Vec<serde_json::Value> = serde_json::from_slice(&bytes).unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn stats_shape() {
        let router = test_router();
        let resp = router
            .oneshot(Request::builder().uri("/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let bytes = to_bytes(resp.into_body(), 256 * 1024).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["global"]["total"], 1);
        assert!(body["by_source"].is_array());
    }
}
