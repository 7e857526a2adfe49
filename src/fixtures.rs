//! # Fixture Adapters
//! Scriptable in-memory implementations of the scraping contracts, for
//! integration tests and the `--demo` mode. Real site adapters live
//! outside this crate; these stand in for them without any network.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::model::Source;
use crate::pipeline::{DetailResult, DetailScraper, IndexResult, IndexScraper, ScrapeError};

enum ScriptedResponse {
    Listings(Vec<IndexResult>),
    Blocked,
    NetworkError,
}

/// Index adapter replaying a scripted sequence of responses; once the
/// script is exhausted every further scan returns an empty page.
#[derive(Default)]
pub struct FixtureIndexScraper {
    script: Mutex<VecDeque<ScriptedResponse>>,
}

impl FixtureIndexScraper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_listings(listings: Vec<IndexResult>) -> Self {
        let scraper = Self::new();
        scraper.push_listings(listings);
        scraper
    }

    pub fn push_listings(&self, listings: Vec<IndexResult>) {
        self.script
            .lock()
            .expect("fixture script poisoned")
            .push_back(ScriptedResponse::Listings(listings));
    }

    pub fn push_blocked(&self) {
        self.script
            .lock()
            .expect("fixture script poisoned")
            .push_back(ScriptedResponse::Blocked);
    }

    pub fn push_network_error(&self) {
        self.script
            .lock()
            .expect("fixture script poisoned")
            .push_back(ScriptedResponse::NetworkError);
    }
}

#[async_trait]
impl IndexScraper for FixtureIndexScraper {
    async fn scan_index(&self, _max_pages: u32) -> Result<Vec<IndexResult>, ScrapeError> {
        let next = self
            .script
            .lock()
            .expect("fixture script poisoned")
            .pop_front();
        match next {
            Some(ScriptedResponse::Listings(listings)) => Ok(listings),
            Some(ScriptedResponse::Blocked) => Err(ScrapeError::Blocked),
            Some(ScriptedResponse::NetworkError) => {
                Err(ScrapeError::TransientNetwork("fixture".into()))
            }
            None => Ok(Vec::new()),
        }
    }
}

/// Detail adapter serving canned payloads by URL.
#[derive(Default)]
pub struct FixtureDetailScraper {
    details: Mutex<HashMap<String, DetailResult>>,
}

impl FixtureDetailScraper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, url: &str, detail: DetailResult) {
        self.details
            .lock()
            .expect("fixture details poisoned")
            .insert(url.to_string(), detail);
    }
}

#[async_trait]
impl DetailScraper for FixtureDetailScraper {
    async fn fetch_detail(&self, url: &str) -> Result<Option<DetailResult>, ScrapeError> {
        Ok(self
            .details
            .lock()
            .expect("fixture details poisoned")
            .get(url)
            .cloned())
    }
}

/// A small, plausible page of listings for demo runs.
pub fn demo_scrapers() -> (FixtureIndexScraper, FixtureDetailScraper) {
    let now = Utc::now();
    let listings = vec![
        IndexResult {
            source: Some(Source::Autoscout24),
            url: "https://demo.invalid/annonce/207-hdi-nantes".into(),
            source_listing_id: "DEMO-207".into(),
            title: "Peugeot 207 1.4 HDi 70ch Urgent".into(),
            price: Some(2300),
            km: Some(132_000),
            year: Some(2010),
            city: "Nantes".into(),
            department: "44".into(),
            published_at: Some(now - Duration::minutes(40)),
            thumbnail_url: "https://demo.invalid/img/207.jpg".into(),
            ..Default::default()
        },
        IndexResult {
            source: Some(Source::Autoscout24),
            url: "https://demo.invalid/annonce/clio3-dci".into(),
            source_listing_id: "DEMO-CLIO".into(),
            title: "Clio 3 1.5 dCi 85ch CT ok".into(),
            price: Some(2900),
            km: Some(148_000),
            year: Some(2009),
            city: "Rennes".into(),
            department: "35".into(),
            published_at: Some(now - Duration::hours(4)),
            ..Default::default()
        },
        IndexResult {
            source: Some(Source::Autoscout24),
            url: "https://demo.invalid/annonce/c3-hs".into(),
            source_listing_id: "DEMO-C3".into(),
            title: "C3 1.4 HDi moteur HS pour pieces".into(),
            price: Some(800),
            km: Some(210_000),
            year: Some(2006),
            city: "Angers".into(),
            department: "49".into(),
            published_at: Some(now - Duration::hours(30)),
            ..Default::default()
        },
    ];

    let index = FixtureIndexScraper::with_listings(listings);
    let detail = FixtureDetailScraper::new();
    detail.insert(
        "https://demo.invalid/annonce/207-hdi-nantes",
        DetailResult {
            description: "Vends 207 1.4 HDi, entretien suivi, CT ok, vente urgente cause \
                          déménagement. Prix négociable."
                .into(),
            image_urls: (1..=6)
                .map(|i| format!("https://demo.invalid/img/207-{i}.jpg"))
                .collect(),
            seller_type: "particulier".into(),
            fuel: "diesel".into(),
            gearbox: "manuelle".into(),
            power_hp: Some(70),
            motorisation: "1.4 HDi".into(),
            ct_info: "CT OK".into(),
            ..Default::default()
        },
    );
    detail.insert(
        "https://demo.invalid/annonce/clio3-dci",
        DetailResult {
            description: "Clio 3 dCi, distribution faite, quelques rayures.".into(),
            image_urls: vec!["https://demo.invalid/img/clio-1.jpg".into()],
            seller_type: "particulier".into(),
            fuel: "diesel".into(),
            ..Default::default()
        },
    );
    (index, detail)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_responses_play_in_order() {
        let scraper = FixtureIndexScraper::new();
        scraper.push_listings(vec![IndexResult::default()]);
        scraper.push_blocked();

        assert_eq!(scraper.scan_index(1).await.unwrap().len(), 1);
        assert!(matches!(
            scraper.scan_index(1).await,
            Err(ScrapeError::Blocked)
        ));
        // Script exhausted → empty pages, not errors.
        assert!(scraper.scan_index(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn detail_lookup_by_url() {
        let (_, detail) = demo_scrapers();
        let found = detail
            .fetch_detail("https://demo.invalid/annonce/207-hdi-nantes")
            .await
            .unwrap();
        assert!(found.is_some());
        let missing = detail.fetch_detail("https://demo.invalid/nope").await.unwrap();
        assert!(missing.is_none());
    }
}
