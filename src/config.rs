//! # Configuration
//! TOML-backed configuration surface: target vehicles, keyword buckets,
//! department tiers, scoring weights, searches, runner pacing, and source
//! rate-limit policies.
//!
//! Each loader resolves its path as: explicit env var → `config/<name>.toml`
//! → built-in defaults. Missing files are not an error; a daemon with no
//! config simply targets nothing.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::model::{Fuel, Severity};

pub const ENV_VEHICLES_PATH: &str = "VEHICLES_CONFIG_PATH";
pub const ENV_KEYWORDS_PATH: &str = "KEYWORDS_CONFIG_PATH";
pub const ENV_SEARCHES_PATH: &str = "SEARCHES_CONFIG_PATH";

const DEFAULT_VEHICLES_PATH: &str = "config/vehicles.toml";
const DEFAULT_KEYWORDS_PATH: &str = "config/keywords.toml";
const DEFAULT_SEARCHES_PATH: &str = "config/searches.toml";

/// Maximum points per scoring component.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ScoringWeights {
    #[serde(default = "default_w_price")]
    pub price: i32,
    #[serde(default = "default_w_km")]
    pub km: i32,
    #[serde(default = "default_w_keywords")]
    pub keywords: i32,
    #[serde(default = "default_w_freshness")]
    pub freshness: i32,
    #[serde(default = "default_w_bonus")]
    pub bonus: i32,
    #[serde(default = "default_w_margin")]
    pub margin: i32,
}

fn default_w_price() -> i32 {
    35
}
fn default_w_km() -> i32 {
    25
}
fn default_w_keywords() -> i32 {
    15
}
fn default_w_freshness() -> i32 {
    10
}
fn default_w_bonus() -> i32 {
    10
}
fn default_w_margin() -> i32 {
    5
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            price: default_w_price(),
            km: default_w_km(),
            keywords: default_w_keywords(),
            freshness: default_w_freshness(),
            bonus: default_w_bonus(),
            margin: default_w_margin(),
        }
    }
}

/// Department tiers for the location bonus (tier1 +5, tier2 +3, tier3 +1).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DepartmentTiers {
    #[serde(default)]
    pub tier1: Vec<String>,
    #[serde(default)]
    pub tier2: Vec<String>,
    #[serde(default)]
    pub tier3: Vec<String>,
}

impl DepartmentTiers {
    /// Bonus points for a department, 0 if untiered.
    pub fn bonus_for(&self, dept: &str) -> i32 {
        if self.tier1.iter().any(|d| d == dept) {
            5
        } else if self.tier2.iter().any(|d| d == dept) {
            3
        } else if self.tier3.iter().any(|d| d == dept) {
            1
        } else {
            0
        }
    }
}

/// One configured target vehicle profile.
#[derive(Debug, Clone, Deserialize)]
pub struct TargetVehicle {
    pub id: String,
    pub make: String,
    #[serde(default)]
    pub model_patterns: Vec<String>,
    #[serde(default)]
    pub engine_include: Vec<String>,
    #[serde(default)]
    pub engine_exclude: Vec<String>,
    #[serde(default)]
    pub fuel: Option<String>,
    #[serde(default = "default_price_min")]
    pub price_min: u32,
    #[serde(default = "default_price_max")]
    pub price_max: u32,
    #[serde(default)]
    pub km_min: u32,
    #[serde(default = "default_km_max")]
    pub km_max: u32,
    #[serde(default)]
    pub km_ideal_min: Option<u32>,
    #[serde(default)]
    pub km_ideal_max: Option<u32>,
    #[serde(default)]
    pub year_min: Option<i32>,
    #[serde(default)]
    pub year_max: Option<i32>,
    #[serde(default)]
    pub resale_min: Option<u32>,
    #[serde(default)]
    pub resale_max: Option<u32>,
    /// Median market price; falls back to the price-band midpoint.
    #[serde(default)]
    pub market_price_median: Option<u32>,
    #[serde(default)]
    pub priority: i32,
    /// Equipment bonuses: name → value in euros.
    #[serde(default)]
    pub bonus: BTreeMap<String, i32>,
    /// Substrings in title/version that disqualify the match.
    #[serde(default)]
    pub exclusions: Vec<String>,
}

fn default_price_min() -> u32 {
    1000
}
fn default_price_max() -> u32 {
    5000
}
fn default_km_max() -> u32 {
    200_000
}

impl TargetVehicle {
    pub fn fuel_enum(&self) -> Fuel {
        self.fuel.as_deref().map(Fuel::parse).unwrap_or(Fuel::Unknown)
    }

    pub fn market_price(&self) -> u32 {
        self.market_price_median
            .unwrap_or((self.price_min + self.price_max) / 2)
    }

    pub fn km_ideal_bounds(&self) -> (u32, u32) {
        (
            self.km_ideal_min.unwrap_or(self.km_min),
            self.km_ideal_max
                .unwrap_or_else(|| self.km_max.saturating_sub(30_000)),
        )
    }
}

/// Root of `config/vehicles.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VehiclesConfig {
    #[serde(default)]
    pub scoring_weights: ScoringWeights,
    #[serde(default)]
    pub departments: DepartmentTiers,
    #[serde(default)]
    pub vehicles: Vec<TargetVehicle>,
}

/// One opportunity keyword entry.
#[derive(Debug, Clone, Deserialize)]
pub struct OpportunitySpec {
    #[serde(default)]
    pub patterns: Vec<String>,
    #[serde(default = "default_bonus")]
    pub bonus: i32,
    #[serde(default)]
    pub description: String,
}

fn default_bonus() -> i32 {
    5
}

/// One risk keyword entry. `penalty` is stored negative.
#[derive(Debug, Clone, Deserialize)]
pub struct RiskSpec {
    #[serde(default)]
    pub patterns: Vec<String>,
    #[serde(default = "default_penalty")]
    pub penalty: i32,
    #[serde(default)]
    pub cost_estimate: i32,
    #[serde(default)]
    pub severity: String,
    #[serde(default)]
    pub description: String,
}

fn default_penalty() -> i32 {
    -10
}

impl RiskSpec {
    pub fn severity_enum(&self) -> Severity {
        Severity::parse(&self.severity)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExclusionSpec {
    #[serde(default)]
    pub patterns: Vec<String>,
}

/// Root of `config/keywords.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct KeywordsConfig {
    #[serde(default)]
    pub opportunity: BTreeMap<String, OpportunitySpec>,
    #[serde(default)]
    pub risk: BTreeMap<String, RiskSpec>,
    #[serde(default)]
    pub exclusions: ExclusionSpec,
}

/// One saved search; each enabled search is one pipeline invocation per
/// cycle. The vehicle bands parameterise the source adapters.
#[derive(Debug, Clone, Deserialize)]
pub struct SearchSpec {
    pub name: String,
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub make: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub price_min: u32,
    #[serde(default = "default_price_max")]
    pub price_max: u32,
    #[serde(default)]
    pub km_min: u32,
    #[serde(default = "default_km_max")]
    pub km_max: u32,
    #[serde(default)]
    pub year_min: Option<i32>,
    #[serde(default)]
    pub year_max: Option<i32>,
    #[serde(default)]
    pub fuel: Option<String>,
    #[serde(default = "default_detail_threshold")]
    pub detail_threshold: i32,
    #[serde(default = "default_notify_threshold")]
    pub notify_threshold: i32,
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_detail_threshold() -> i32 {
    30
}
fn default_notify_threshold() -> i32 {
    60
}
fn default_max_pages() -> u32 {
    2
}
fn default_enabled() -> bool {
    true
}

/// Runner pacing settings.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RunnerConfig {
    #[serde(default = "default_scan_interval")]
    pub scan_interval_sec: u64,
    #[serde(default = "default_jitter")]
    pub jitter_sec: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: u64,
    #[serde(default = "default_backoff_max")]
    pub backoff_max_sec: u64,
    #[serde(default = "default_delay_between_searches")]
    pub delay_between_searches_sec: u64,
    #[serde(default = "default_max_detail_per_run")]
    pub max_detail_per_run: usize,
    #[serde(default = "default_alert_on_zero")]
    pub alert_on_zero_listings: bool,
    #[serde(default = "default_zero_threshold")]
    pub zero_listings_threshold: u32,
}

fn default_scan_interval() -> u64 {
    60
}
fn default_jitter() -> u64 {
    10
}
fn default_backoff_multiplier() -> u64 {
    2
}
fn default_backoff_max() -> u64 {
    300
}
fn default_delay_between_searches() -> u64 {
    5
}
fn default_max_detail_per_run() -> usize {
    20
}
fn default_alert_on_zero() -> bool {
    true
}
fn default_zero_threshold() -> u32 {
    3
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            scan_interval_sec: default_scan_interval(),
            jitter_sec: default_jitter(),
            backoff_multiplier: default_backoff_multiplier(),
            backoff_max_sec: default_backoff_max(),
            delay_between_searches_sec: default_delay_between_searches(),
            max_detail_per_run: default_max_detail_per_run(),
            alert_on_zero_listings: default_alert_on_zero(),
            zero_listings_threshold: default_zero_threshold(),
        }
    }
}

/// Per-source pacing and breaker policy.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct SourcePolicy {
    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_cooldown_sec")]
    pub cooldown_sec: u64,
    #[serde(default = "default_half_open_successes")]
    pub half_open_success_threshold: u32,
}

fn default_min_delay_ms() -> u64 {
    1500
}
fn default_jitter_ms() -> u64 {
    500
}
fn default_failure_threshold() -> u32 {
    3
}
fn default_cooldown_sec() -> u64 {
    120
}
fn default_half_open_successes() -> u32 {
    2
}

impl Default for SourcePolicy {
    fn default() -> Self {
        Self {
            min_delay_ms: default_min_delay_ms(),
            jitter_ms: default_jitter_ms(),
            failure_threshold: default_failure_threshold(),
            cooldown_sec: default_cooldown_sec(),
            half_open_success_threshold: default_half_open_successes(),
        }
    }
}

/// Built-in per-source policies; anti-bot-heavy sites get slower pacing
/// and a lower failure threshold.
pub fn default_source_policies() -> BTreeMap<String, SourcePolicy> {
    let mut map = BTreeMap::new();
    map.insert(
        "autoscout24".to_string(),
        SourcePolicy {
            min_delay_ms: 1500,
            jitter_ms: 500,
            failure_threshold: 3,
            ..SourcePolicy::default()
        },
    );
    map.insert(
        "lacentrale".to_string(),
        SourcePolicy {
            min_delay_ms: 2000,
            jitter_ms: 800,
            failure_threshold: 3,
            ..SourcePolicy::default()
        },
    );
    map.insert(
        "paruvendu".to_string(),
        SourcePolicy {
            min_delay_ms: 1500,
            jitter_ms: 500,
            failure_threshold: 3,
            ..SourcePolicy::default()
        },
    );
    map.insert(
        "leboncoin".to_string(),
        SourcePolicy {
            min_delay_ms: 3000,
            jitter_ms: 1000,
            failure_threshold: 2,
            ..SourcePolicy::default()
        },
    );
    map
}

/// Root of `config/searches.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchesConfig {
    #[serde(default)]
    pub searches: Vec<SearchSpec>,
    #[serde(default)]
    pub runner: Option<RunnerConfig>,
    /// Overrides merged over `default_source_policies`.
    #[serde(default)]
    pub sources: BTreeMap<String, SourcePolicy>,
}

impl SearchesConfig {
    pub fn runner(&self) -> RunnerConfig {
        self.runner.unwrap_or_default()
    }

    pub fn enabled_searches(&self) -> impl Iterator<Item = &SearchSpec> {
        self.searches.iter().filter(|s| s.enabled)
    }

    /// Effective source policies: built-in defaults + file overrides.
    pub fn source_policies(&self) -> BTreeMap<String, SourcePolicy> {
        let mut map = default_source_policies();
        for (name, policy) in &self.sources {
            map.insert(name.clone(), *policy);
        }
        map
    }
}

fn resolve_path(env_var: &str, default: &str) -> Option<PathBuf> {
    if let Ok(p) = std::env::var(env_var) {
        let pb = PathBuf::from(p);
        if pb.exists() {
            return Some(pb);
        }
        tracing::warn!(env = env_var, "config path from env does not exist");
        return None;
    }
    let pb = PathBuf::from(default);
    pb.exists().then_some(pb)
}

fn load_toml<T: serde::de::DeserializeOwned + Default>(
    env_var: &str,
    default_path: &str,
) -> Result<T> {
    match resolve_path(env_var, default_path) {
        Some(path) => load_toml_from(&path),
        None => Ok(T::default()),
    }
}

pub fn load_toml_from<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading config from {}", path.display()))?;
    toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))
}

pub fn load_vehicles_config() -> Result<VehiclesConfig> {
    load_toml(ENV_VEHICLES_PATH, DEFAULT_VEHICLES_PATH)
}

pub fn load_keywords_config() -> Result<KeywordsConfig> {
    load_toml(ENV_KEYWORDS_PATH, DEFAULT_KEYWORDS_PATH)
}

pub fn load_searches_config() -> Result<SearchesConfig> {
    load_toml(ENV_SEARCHES_PATH, DEFAULT_SEARCHES_PATH)
}
