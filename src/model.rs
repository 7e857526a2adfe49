//! # Listing Model
//! Canonical `Annonce` record, score breakdown, and the enums shared across
//! the pipeline.
//!
//! ## Identity
//! - `id`: internal UUID, assigned once and never rewritten.
//! - `fingerprint`: 32-hex strict hash, the repository upsert key.
//! - `fingerprint_soft`: 16-hex hash for near-duplicate detection across
//!   sources (km bucketed to 50 000, price ignored).
//! - `url_canonical`: tracking parameters stripped, idempotent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Known listing sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Leboncoin,
    Autoscout24,
    Lacentrale,
    Paruvendu,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Leboncoin => "leboncoin",
            Source::Autoscout24 => "autoscout24",
            Source::Lacentrale => "lacentrale",
            Source::Paruvendu => "paruvendu",
        }
    }

    pub fn parse(s: &str) -> Option<Source> {
        match s.trim().to_ascii_lowercase().as_str() {
            "leboncoin" => Some(Source::Leboncoin),
            "autoscout24" => Some(Source::Autoscout24),
            "lacentrale" => Some(Source::Lacentrale),
            "paruvendu" => Some(Source::Paruvendu),
            _ => None,
        }
    }

    pub const ALL: [Source; 4] = [
        Source::Leboncoin,
        Source::Autoscout24,
        Source::Lacentrale,
        Source::Paruvendu,
    ];
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fuel type; `Unknown` is neutral for scoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Fuel {
    Diesel,
    Essence,
    Hybrid,
    Electric,
    Lpg,
    #[default]
    Unknown,
}

impl Fuel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Fuel::Diesel => "diesel",
            Fuel::Essence => "essence",
            Fuel::Hybrid => "hybrid",
            Fuel::Electric => "electric",
            Fuel::Lpg => "lpg",
            Fuel::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Fuel {
        match s.trim().to_ascii_lowercase().as_str() {
            "diesel" => Fuel::Diesel,
            "essence" => Fuel::Essence,
            "hybrid" | "hybride" => Fuel::Hybrid,
            "electric" | "electrique" => Fuel::Electric,
            "lpg" | "gpl" => Fuel::Lpg,
            _ => Fuel::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gearbox {
    Manual,
    Automatic,
    #[default]
    Unknown,
}

impl Gearbox {
    pub fn as_str(&self) -> &'static str {
        match self {
            Gearbox::Manual => "manual",
            Gearbox::Automatic => "automatic",
            Gearbox::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Gearbox {
        match s.trim().to_ascii_lowercase().as_str() {
            "manual" | "manuelle" => Gearbox::Manual,
            "automatic" | "automatique" => Gearbox::Automatic,
            _ => Gearbox::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SellerType {
    Particulier,
    Professionnel,
    #[default]
    Unknown,
}

impl SellerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SellerType::Particulier => "particulier",
            SellerType::Professionnel => "professionnel",
            SellerType::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> SellerType {
        match s.trim().to_ascii_lowercase().as_str() {
            "particulier" => SellerType::Particulier,
            "professionnel" => SellerType::Professionnel,
            _ => SellerType::Unknown,
        }
    }
}

/// Discrete alert tier, a pure function of the total score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Urgent,
    Interessant,
    Surveiller,
    #[default]
    Archive,
}

impl AlertLevel {
    /// Thresholds: 80 / 60 / 40.
    pub fn from_score(score: i32) -> AlertLevel {
        if score >= 80 {
            AlertLevel::Urgent
        } else if score >= 60 {
            AlertLevel::Interessant
        } else if score >= 40 {
            AlertLevel::Surveiller
        } else {
            AlertLevel::Archive
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AlertLevel::Urgent => "urgent",
            AlertLevel::Interessant => "interessant",
            AlertLevel::Surveiller => "surveiller",
            AlertLevel::Archive => "archive",
        }
    }

    pub fn parse(s: &str) -> AlertLevel {
        match s.trim().to_ascii_lowercase().as_str() {
            "urgent" => AlertLevel::Urgent,
            "interessant" => AlertLevel::Interessant,
            "surveiller" => AlertLevel::Surveiller,
            _ => AlertLevel::Archive,
        }
    }
}

/// Tracking status of a listing; mutated only by explicit updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListingStatus {
    #[default]
    New,
    Contacted,
    InProgress,
    Bought,
    Expired,
    Ignored,
    Excluded,
}

impl ListingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListingStatus::New => "new",
            ListingStatus::Contacted => "contacted",
            ListingStatus::InProgress => "in_progress",
            ListingStatus::Bought => "bought",
            ListingStatus::Expired => "expired",
            ListingStatus::Ignored => "ignored",
            ListingStatus::Excluded => "excluded",
        }
    }

    pub fn parse(s: &str) -> ListingStatus {
        match s.trim().to_ascii_lowercase().as_str() {
            "contacted" => ListingStatus::Contacted,
            "in_progress" => ListingStatus::InProgress,
            "bought" => ListingStatus::Bought,
            "expired" => ListingStatus::Expired,
            "ignored" => ListingStatus::Ignored,
            "excluded" => ListingStatus::Excluded,
            _ => ListingStatus::New,
        }
    }
}

/// Risk severity, ordered minor < moderate < major < critical.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Minor,
    Moderate,
    Major,
    Critical,
}

impl Severity {
    pub fn parse(s: &str) -> Severity {
        match s.trim().to_ascii_lowercase().as_str() {
            "critical" => Severity::Critical,
            "major" | "high" => Severity::Major,
            "moderate" | "medium" => Severity::Moderate,
            _ => Severity::Minor,
        }
    }
}

/// Per-component score detail, kept alongside the total for explainability.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub price_score: i32,
    pub price_detail: String,
    pub km_score: i32,
    pub km_detail: String,
    pub freshness_score: i32,
    pub freshness_detail: String,
    pub keywords_score: i32,
    pub keywords_detail: String,
    pub bonus_score: i32,
    pub bonus_detail: String,
    /// Negative or zero.
    pub risk_penalty: i32,
    pub risk_detail: String,
    pub total: i32,
    pub margin_min: i32,
    pub margin_max: i32,
    pub repair_cost_estimate: i32,
}

impl ScoreBreakdown {
    /// One-line human summary of the non-zero components.
    pub fn summary(&self) -> String {
        let mut parts = Vec::new();
        if self.price_score != 0 {
            parts.push(format!("prix {}pts", self.price_score));
        }
        if self.km_score != 0 {
            parts.push(format!("km {}pts", self.km_score));
        }
        if self.freshness_score != 0 {
            parts.push(format!("fraicheur {}pts", self.freshness_score));
        }
        if self.keywords_score != 0 {
            parts.push(format!("mots-cles {}pts", self.keywords_score));
        }
        if self.bonus_score != 0 {
            parts.push(format!("bonus +{}pts", self.bonus_score));
        }
        if self.risk_penalty != 0 {
            parts.push(format!("risques {}pts", self.risk_penalty));
        }
        if parts.is_empty() {
            "non calcule".to_string()
        } else {
            parts.join(" | ")
        }
    }
}

/// Canonical listing record. See the module docs for the identity scheme.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Annonce {
    pub id: String,
    pub source: Source,
    pub source_listing_id: String,
    pub url: String,
    pub url_canonical: String,
    pub fingerprint: String,
    pub fingerprint_soft: String,

    pub make: String,
    pub model: String,
    pub version: String,
    pub motorisation: String,
    pub fuel: Fuel,
    pub gearbox: Gearbox,
    pub power_hp: Option<u32>,
    pub year: Option<i32>,
    pub km: Option<u32>,
    pub price: Option<u32>,

    pub city: String,
    pub postal_code: String,
    pub department: String,
    pub lat: Option<f64>,
    pub lon: Option<f64>,

    pub seller_type: SellerType,
    pub seller_name: String,
    pub seller_phone: String,

    pub title: String,
    pub description: String,
    pub image_urls: Vec<String>,

    pub published_at: Option<DateTime<Utc>>,
    pub scraped_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    pub score_total: i32,
    pub score_breakdown: ScoreBreakdown,
    pub target_vehicle_id: String,

    pub opportunities: Vec<String>,
    pub risks: Vec<String>,

    pub margin_min: i32,
    pub margin_max: i32,
    pub repair_cost_estimate: i32,
    pub market_price_estimate: Option<u32>,

    pub alert_level: AlertLevel,
    pub status: ListingStatus,
    pub ignore_reason: String,

    pub notified: bool,
    pub notified_at: Option<DateTime<Utc>>,
    pub notify_channels: Vec<String>,
}

impl Default for Annonce {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            source: Source::Autoscout24,
            source_listing_id: String::new(),
            url: String::new(),
            url_canonical: String::new(),
            fingerprint: String::new(),
            fingerprint_soft: String::new(),
            make: String::new(),
            model: String::new(),
            version: String::new(),
            motorisation: String::new(),
            fuel: Fuel::Unknown,
            gearbox: Gearbox::Unknown,
            power_hp: None,
            year: None,
            km: None,
            price: None,
            city: String::new(),
            postal_code: String::new(),
            department: String::new(),
            lat: None,
            lon: None,
            seller_type: SellerType::Unknown,
            seller_name: String::new(),
            seller_phone: String::new(),
            title: String::new(),
            description: String::new(),
            image_urls: Vec::new(),
            published_at: None,
            scraped_at: now,
            created_at: now,
            updated_at: now,
            score_total: 0,
            score_breakdown: ScoreBreakdown::default(),
            target_vehicle_id: String::new(),
            opportunities: Vec::new(),
            risks: Vec::new(),
            margin_min: 0,
            margin_max: 0,
            repair_cost_estimate: 0,
            market_price_estimate: None,
            alert_level: AlertLevel::Archive,
            status: ListingStatus::New,
            ignore_reason: String::new(),
            notified: false,
            notified_at: None,
            notify_channels: Vec::new(),
        }
    }
}

impl Annonce {
    /// Fill in the derived identity fields (canonical URL + fingerprints)
    /// for any that are still empty.
    pub fn seal_identity(&mut self) {
        if self.url_canonical.is_empty() && !self.url.is_empty() {
            self.url_canonical = canonicalize_url(&self.url);
        }
        if self.fingerprint.is_empty() {
            self.fingerprint = self.compute_fingerprint();
        }
        if self.fingerprint_soft.is_empty() {
            self.fingerprint_soft = self.compute_fingerprint_soft();
        }
    }

    /// Strict fingerprint: site-native id when known, field combination
    /// otherwise. 32 hex chars.
    pub fn compute_fingerprint(&self) -> String {
        let data = if !self.source_listing_id.is_empty() {
            format!("{}:{}", self.source, self.source_listing_id)
        } else {
            let title_norm = norm_key(&self.title);
            let title_head: String = title_norm.chars().take(50).collect();
            [
                self.source.as_str().to_string(),
                norm_key(&self.make),
                norm_key(&self.model),
                self.year.map(|y| y.to_string()).unwrap_or_default(),
                self.km.map(|k| k.to_string()).unwrap_or_default(),
                self.price.map(|p| p.to_string()).unwrap_or_default(),
                self.department.clone(),
                title_head,
            ]
            .join("|")
        };
        short_hash(&data, 32)
    }

    /// Soft fingerprint for near-duplicate detection: price ignored, km
    /// bucketed to 50 000. 16 hex chars.
    pub fn compute_fingerprint_soft(&self) -> String {
        let km_bucket = self
            .km
            .map(|k| ((k / 50_000) * 50_000).to_string())
            .unwrap_or_default();
        let data = [
            norm_key(&self.make),
            norm_key(&self.model),
            self.year.map(|y| y.to_string()).unwrap_or_default(),
            km_bucket,
            self.department.clone(),
        ]
        .join("|");
        short_hash(&data, 16)
    }

    /// Apply a freshly computed breakdown: total, alert level, margins.
    pub fn apply_score(&mut self, breakdown: ScoreBreakdown) {
        self.score_total = breakdown.total;
        self.alert_level = AlertLevel::from_score(breakdown.total);
        self.margin_min = breakdown.margin_min;
        self.margin_max = breakdown.margin_max;
        self.repair_cost_estimate = breakdown.repair_cost_estimate;
        self.score_breakdown = breakdown;
    }

    pub fn mark_notified(&mut self, channels: Vec<String>) {
        self.notified = true;
        self.notified_at = Some(Utc::now());
        self.notify_channels = channels;
    }

    /// French-style price display: `2 500 €`.
    pub fn format_price(&self) -> String {
        match self.price {
            Some(p) => format!("{} €", group_thousands(p)),
            None => "N/C".to_string(),
        }
    }

    /// French-style mileage display: `150 000 km`.
    pub fn format_km(&self) -> String {
        match self.km {
            Some(k) => format!("{} km", group_thousands(k)),
            None => "N/C".to_string(),
        }
    }
}

/// Canonicalise a listing URL: lowercase scheme+host, strip the trailing
/// slash, drop tracking query parameters and the fragment. Idempotent.
pub fn canonicalize_url(raw: &str) -> String {
    const TRACKING_PARAMS: [&str; 14] = [
        "utm_source",
        "utm_medium",
        "utm_campaign",
        "utm_term",
        "utm_content",
        "ref",
        "referer",
        "fbclid",
        "gclid",
        "msclkid",
        "mc_cid",
        "mc_eid",
        "source",
        "origin",
    ];
    // Handled case-insensitively alongside the list above.
    const TRACKING_PARAMS_MIXED: [&str; 2] = ["searchid", "gallerymode"];

    if raw.is_empty() {
        return String::new();
    }
    let mut parsed = match url::Url::parse(raw) {
        Ok(u) => u,
        Err(_) => return raw.to_string(),
    };

    let kept: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(k, _)| {
            let kl = k.to_ascii_lowercase();
            !TRACKING_PARAMS.contains(&kl.as_str()) && !TRACKING_PARAMS_MIXED.contains(&kl.as_str())
        })
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    parsed.set_fragment(None);
    if kept.is_empty() {
        parsed.set_query(None);
    } else {
        let mut qp = parsed.query_pairs_mut();
        qp.clear();
        for (k, v) in &kept {
            qp.append_pair(k, v);
        }
        drop(qp);
    }

    // url::Url already lowercases scheme and host; strip the trailing slash
    // from the path (but keep a bare "/").
    let mut out = parsed.to_string();
    if let Some(q_pos) = out.find('?') {
        let (path_part, query_part) = out.split_at(q_pos);
        let trimmed = trim_trailing_slash(path_part);
        out = format!("{trimmed}{query_part}");
    } else {
        out = trim_trailing_slash(&out).to_string();
    }
    out
}

fn trim_trailing_slash(s: &str) -> &str {
    let without = s.trim_end_matches('/');
    // "https://host" needs no slash back; url always renders "host/" so a
    // fully trimmed authority-only URL is fine.
    without
}

/// Lowercase, strip accents, drop everything non-alphanumeric.
/// Used for fingerprint fields only (keyword matching keeps spaces).
pub fn norm_key(text: &str) -> String {
    fold_accents(&text.to_lowercase())
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect()
}

/// NFD-decompose and drop combining marks: `Négociable` → `Negociable`.
pub fn fold_accents(text: &str) -> String {
    text.nfd().filter(|c| !is_combining_mark(*c)).collect()
}

/// Sha256 truncated to `len` hex chars.
pub fn short_hash(data: &str, len: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(len);
    for b in digest.iter() {
        use std::fmt::Write as _;
        let _ = write!(&mut out, "{:02x}", b);
        if out.len() >= len {
            break;
        }
    }
    out.truncate(len);
    out
}

fn group_thousands(n: u32) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(' ');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alert_level_thresholds() {
        assert_eq!(AlertLevel::from_score(95), AlertLevel::Urgent);
        assert_eq!(AlertLevel::from_score(80), AlertLevel::Urgent);
        assert_eq!(AlertLevel::from_score(79), AlertLevel::Interessant);
        assert_eq!(AlertLevel::from_score(60), AlertLevel::Interessant);
        assert_eq!(AlertLevel::from_score(59), AlertLevel::Surveiller);
        assert_eq!(AlertLevel::from_score(40), AlertLevel::Surveiller);
        assert_eq!(AlertLevel::from_score(39), AlertLevel::Archive);
        assert_eq!(AlertLevel::from_score(0), AlertLevel::Archive);
    }

    #[test]
    fn canonicalize_strips_tracking_and_fragment() {
        let url = "HTTPS://WWW.Example.com/annonce/123/?utm_source=x&utm_medium=y&page=2&fbclid=abc#photos";
        let canon = canonicalize_url(url);
        assert_eq!(canon, "https://www.example.com/annonce/123?page=2");
    }

    #[test]
    fn canonicalize_is_idempotent() {
        let inputs = [
            "https://www.leboncoin.fr/voitures/123.htm?utm_source=alert&searchId=55",
            "https://auto.example.org/a/1/",
            "not a url at all",
            "",
        ];
        for raw in inputs {
            let once = canonicalize_url(raw);
            let twice = canonicalize_url(&once);
            assert_eq!(once, twice, "not idempotent for {raw:?}");
        }
    }

    #[test]
    fn fingerprint_prefers_source_listing_id() {
        let mut a = Annonce {
            source: Source::Autoscout24,
            source_listing_id: "MOCK001".into(),
            url: "https://example.com/a?utm_source=x".into(),
            ..Default::default()
        };
        a.seal_identity();
        let mut b = Annonce {
            source: Source::Autoscout24,
            source_listing_id: "MOCK001".into(),
            url: "https://example.com/a?utm_source=y&gclid=1".into(),
            ..Default::default()
        };
        b.seal_identity();
        assert_eq!(a.fingerprint, b.fingerprint);
        assert_eq!(a.fingerprint.len(), 32);
        assert_eq!(a.url_canonical, b.url_canonical);
    }

    #[test]
    fn soft_fingerprint_buckets_km() {
        let base = Annonce {
            make: "Peugeot".into(),
            model: "207".into(),
            year: Some(2010),
            department: "44".into(),
            ..Default::default()
        };
        let mut a = base.clone();
        a.km = Some(120_000);
        let mut b = base.clone();
        b.km = Some(149_999);
        let mut c = base;
        c.km = Some(151_000);
        assert_eq!(a.compute_fingerprint_soft(), b.compute_fingerprint_soft());
        assert_ne!(a.compute_fingerprint_soft(), c.compute_fingerprint_soft());
        assert_eq!(a.compute_fingerprint_soft().len(), 16);
    }

    #[test]
    fn norm_key_folds_accents_and_punctuation() {
        assert_eq!(norm_key("Citroën C3!"), "citroenc3");
        assert_eq!(norm_key("Mégane-II"), "meganeii");
    }

    #[test]
    fn french_number_formatting() {
        let a = Annonce {
            price: Some(2500),
            km: Some(150_000),
            ..Default::default()
        };
        assert_eq!(a.format_price(), "2 500 €");
        assert_eq!(a.format_km(), "150 000 km");
        let empty = Annonce::default();
        assert_eq!(empty.format_price(), "N/C");
    }
}
