//! # Scoring Engine
//! Maps a populated `Annonce` plus the target-vehicle config to an
//! explainable 0–100 `ScoreBreakdown`, and stamps the listing with score,
//! alert level, keyword ids, and margin estimates.
//!
//! Principles:
//! - a very low price is an opportunity, not a penalty — it scores high and
//!   gets a synthetic `price_to_verify` risk unless the signals are benign;
//! - a critical-severity risk caps the total at 59 unless the minimum
//!   margin clears 1 000 €, so risky listings stay out of the urgent tier;
//! - every component keeps a short human-readable detail string.

use chrono::Utc;
use regex::Regex;
use std::sync::Arc;

use crate::config::{DepartmentTiers, ScoringWeights, TargetVehicle, VehiclesConfig};
use crate::keywords::KeywordMatcher;
use crate::model::{Annonce, Fuel, ListingStatus, ScoreBreakdown, SellerType, Severity};

/// Safety buffer subtracted from every margin estimate, in euros.
const MARGIN_BUFFER: i32 = 200;
/// Synthetic risk id attached when a too-low price needs human eyes.
pub const PRICE_TO_VERIFY: &str = "price_to_verify";
/// A critical risk caps the score below the "interessant" tier unless the
/// minimum margin clears this.
const CRITICAL_MARGIN_FLOOR: i32 = 1000;
const CRITICAL_SCORE_CAP: i32 = 59;

struct CompiledVehicle {
    cfg: TargetVehicle,
    model_patterns: Vec<Regex>,
}

struct PriceAnalysis {
    score: i32,
    detail: String,
    needs_verification: bool,
}

/// Shared scoring engine; build once from config.
pub struct Scorer {
    weights: ScoringWeights,
    departments: DepartmentTiers,
    vehicles: Vec<CompiledVehicle>,
    matcher: Arc<KeywordMatcher>,
}

impl Scorer {
    pub fn new(config: &VehiclesConfig, matcher: Arc<KeywordMatcher>) -> Self {
        let mut vehicles: Vec<CompiledVehicle> = config
            .vehicles
            .iter()
            .map(|v| CompiledVehicle {
                model_patterns: v
                    .model_patterns
                    .iter()
                    .filter_map(|p| match Regex::new(&format!("(?i){p}")) {
                        Ok(re) => Some(re),
                        Err(e) => {
                            tracing::warn!(vehicle = %v.id, pattern = %p, error = %e, "invalid model pattern");
                            None
                        }
                    })
                    .collect(),
                cfg: v.clone(),
            })
            .collect();
        // First match wins, so lower `priority` values are tried first;
        // equal priorities keep config order.
        vehicles.sort_by_key(|v| v.cfg.priority);
        Self {
            weights: config.scoring_weights,
            departments: config.departments.clone(),
            vehicles,
            matcher,
        }
    }

    /// Full scoring pass. Mutates the annonce (score, alert level, keyword
    /// ids, margins, status on exclusion) and returns the breakdown.
    pub fn calculate_score(&self, annonce: &mut Annonce) -> ScoreBreakdown {
        let mut breakdown = ScoreBreakdown::default();

        let Some(vehicle) = self.identify_vehicle(annonce) else {
            breakdown.price_detail = "vehicule non cible".to_string();
            annonce.apply_score(breakdown.clone());
            return breakdown;
        };
        annonce.target_vehicle_id = vehicle.cfg.id.clone();

        // Single keyword pass over everything textual, before any component
        // score (the price branch inspects the risk list).
        let text_full = format!("{} {} {}", annonce.title, annonce.description, annonce.version);
        if let Some(reason) = self.matcher.exclusion_reason(&text_full) {
            breakdown.risk_detail = format!("EXCLU: {reason}");
            annonce.status = ListingStatus::Excluded;
            annonce.ignore_reason = reason;
            annonce.apply_score(breakdown.clone());
            tracing::debug!(id = %annonce.id, reason = %annonce.ignore_reason, "listing excluded");
            return breakdown;
        }

        let scan = self.matcher.scan(&text_full);
        annonce.opportunities = scan.opportunity_ids.clone();
        annonce.risks = scan.risk_ids.clone();
        annonce.repair_cost_estimate = scan.cost_estimate;

        let price = self.score_price(annonce, &vehicle.cfg);
        breakdown.price_score = price.score;
        breakdown.price_detail = price.detail;

        let (km_score, km_detail) = self.score_km(annonce, &vehicle.cfg);
        breakdown.km_score = km_score;
        breakdown.km_detail = km_detail;

        let (fresh_score, fresh_detail) = self.score_freshness(annonce);
        breakdown.freshness_score = fresh_score;
        breakdown.freshness_detail = fresh_detail;

        breakdown.keywords_score = scan.bonus_total.min(self.weights.keywords);
        breakdown.keywords_detail = if scan.opportunity_ids.is_empty() {
            "aucun".to_string()
        } else {
            scan.opportunity_ids.join(", ")
        };

        let (bonus_score, bonus_detail) = self.score_bonus(annonce, &vehicle.cfg);
        breakdown.bonus_score = bonus_score;
        breakdown.bonus_detail = bonus_detail;

        breakdown.risk_penalty = scan.penalty_total;
        breakdown.risk_detail = if scan.risk_ids.is_empty() {
            "aucun risque detecte".to_string()
        } else {
            let base = format!("{} (~{}€)", scan.risk_ids.join(", "), scan.cost_estimate);
            if scan.max_severity == Some(Severity::Critical) {
                format!("CRITIQUE: {base}")
            } else {
                base
            }
        };

        let (margin_min, margin_max) = estimate_margin(annonce, &vehicle.cfg, scan.cost_estimate);
        breakdown.margin_min = margin_min;
        breakdown.margin_max = margin_max;
        breakdown.repair_cost_estimate = scan.cost_estimate;

        let margin_bonus = self.score_margin_bonus(margin_min);

        let raw = breakdown.price_score
            + breakdown.km_score
            + breakdown.freshness_score
            + breakdown.keywords_score
            + breakdown.bonus_score
            + breakdown.risk_penalty
            + margin_bonus;
        breakdown.total = raw.clamp(0, 100);

        // A critical risk with a thin margin must not reach the
        // "interessant" tier.
        if scan.max_severity == Some(Severity::Critical)
            && breakdown.total >= 60
            && margin_min < CRITICAL_MARGIN_FLOOR
        {
            breakdown.total = breakdown.total.min(CRITICAL_SCORE_CAP);
        }

        if price.needs_verification && !annonce.risks.iter().any(|r| r == PRICE_TO_VERIFY) {
            annonce.risks.push(PRICE_TO_VERIFY.to_string());
        }

        annonce.apply_score(breakdown.clone());
        breakdown
    }

    /// First configured vehicle whose make, model pattern, fuel, and
    /// exclusion constraints all accept the annonce.
    fn identify_vehicle(&self, annonce: &Annonce) -> Option<&CompiledVehicle> {
        if annonce.make.is_empty() || annonce.model.is_empty() {
            return None;
        }
        let make = annonce.make.to_lowercase();
        let model = annonce.model.to_lowercase();
        let title = annonce.title.to_lowercase();
        let version = annonce.version.to_lowercase();
        let engine_text = format!("{title} {version} {}", annonce.motorisation.to_lowercase());

        'vehicles: for vehicle in &self.vehicles {
            let cfg_make = vehicle.cfg.make.to_lowercase();
            if !cfg_make.contains(&make) && !make.contains(&cfg_make) {
                continue;
            }

            let model_match = vehicle.model_patterns.iter().any(|re| {
                re.is_match(&model) || re.is_match(&title) || re.is_match(&version)
            });
            if !model_match {
                continue;
            }

            let cfg_fuel = vehicle.cfg.fuel_enum();
            if cfg_fuel != Fuel::Unknown && annonce.fuel != cfg_fuel {
                // The structured field disagrees or is missing; engine codes
                // in the text can still vouch for the fuel.
                let text_fuel = crate::normalize::parse_fuel(&engine_text);
                if text_fuel != cfg_fuel && annonce.fuel != Fuel::Unknown {
                    continue;
                }
                if text_fuel != cfg_fuel && text_fuel != Fuel::Unknown {
                    continue;
                }
            }

            if !vehicle.cfg.engine_include.is_empty()
                && !vehicle
                    .cfg
                    .engine_include
                    .iter()
                    .any(|p| engine_text.contains(&p.to_lowercase()))
            {
                continue;
            }
            for excl in &vehicle.cfg.engine_exclude {
                if engine_text.contains(&excl.to_lowercase()) {
                    continue 'vehicles;
                }
            }
            for excl in &vehicle.cfg.exclusions {
                let e = excl.to_lowercase();
                if title.contains(&e) || version.contains(&e) {
                    continue 'vehicles;
                }
            }

            return Some(vehicle);
        }
        None
    }

    fn score_price(&self, annonce: &Annonce, cfg: &TargetVehicle) -> PriceAnalysis {
        let max_pts = self.weights.price;

        let Some(price) = annonce.price else {
            return PriceAnalysis {
                score: 0,
                detail: "prix non renseigne".to_string(),
                needs_verification: false,
            };
        };

        let market = annonce
            .market_price_estimate
            .unwrap_or_else(|| cfg.market_price())
            .max(1);

        if price > cfg.price_max {
            return PriceAnalysis {
                score: 0,
                detail: format!("prix trop eleve ({price}€ > {}€ max)", cfg.price_max),
                needs_verification: false,
            };
        }

        if price < cfg.price_min {
            let discount = (1.0 - price as f64 / market as f64) * 100.0;
            let benign = !annonce.image_urls.is_empty()
                && annonce.seller_type == SellerType::Particulier
                && annonce.risks.is_empty();
            return if benign {
                PriceAnalysis {
                    score: max_pts,
                    detail: format!("{price}€ (-{:.0}% marche) - tres bonne affaire", discount),
                    needs_verification: false,
                }
            } else {
                PriceAnalysis {
                    score: (max_pts as f64 * 0.9) as i32,
                    detail: format!("{price}€ (-{:.0}% marche) - A VERIFIER", discount),
                    needs_verification: true,
                }
            };
        }

        let range = cfg.price_max.saturating_sub(cfg.price_min);
        if range == 0 {
            return PriceAnalysis {
                score: max_pts / 2,
                detail: "fourchette prix invalide".to_string(),
                needs_verification: false,
            };
        }

        let position = (cfg.price_max - price) as f64 / range as f64;
        let mut score = (max_pts as f64 * position) as i32;

        if (price as f64) < market as f64 * 0.85 {
            let discount = (1.0 - price as f64 / market as f64) * 100.0;
            score = (score + (max_pts as f64 * 0.15) as i32).min(max_pts);
            PriceAnalysis {
                score,
                detail: format!("{price}€ (-{discount:.0}% vs marche {market}€)"),
                needs_verification: false,
            }
        } else {
            PriceAnalysis {
                score,
                detail: format!("{price}€ (fourchette {}-{}€)", cfg.price_min, cfg.price_max),
                needs_verification: false,
            }
        }
    }

    fn score_km(&self, annonce: &Annonce, cfg: &TargetVehicle) -> (i32, String) {
        let max_pts = self.weights.km;
        let Some(km) = annonce.km else {
            return ((max_pts as f64 * 0.3) as i32, "km non renseigne".to_string());
        };
        let (ideal_min, ideal_max) = cfg.km_ideal_bounds();

        if km < cfg.km_min {
            return ((max_pts as f64 * 0.5) as i32, format!("{km} km - bas (verifier)"));
        }
        if km > cfg.km_max {
            return (0, format!("{km} km > {} km max", cfg.km_max));
        }
        if (ideal_min..=ideal_max).contains(&km) {
            return (max_pts, format!("{km} km (ideal)"));
        }
        if km < ideal_min {
            let ratio = if ideal_min > cfg.km_min {
                (km - cfg.km_min) as f64 / (ideal_min - cfg.km_min) as f64
            } else {
                1.0
            };
            return ((max_pts as f64 * (0.7 + 0.3 * ratio)) as i32, format!("{km} km"));
        }
        // km > ideal_max: linear decay to zero at km_max.
        let ratio = if cfg.km_max > ideal_max {
            (cfg.km_max - km) as f64 / (cfg.km_max - ideal_max) as f64
        } else {
            0.0
        };
        ((max_pts as f64 * ratio * 0.7) as i32, format!("{km} km (eleve)"))
    }

    fn score_freshness(&self, annonce: &Annonce) -> (i32, String) {
        let max_pts = self.weights.freshness;
        let Some(published) = annonce.published_at else {
            return ((max_pts as f64 * 0.5) as i32, "date inconnue".to_string());
        };
        let hours = (Utc::now() - published).num_seconds() as f64 / 3600.0;
        let (factor, detail) = if hours < 1.0 {
            (1.0, "< 1h".to_string())
        } else if hours < 3.0 {
            (0.95, format!("{}h", hours as i64))
        } else if hours < 6.0 {
            (0.85, format!("{}h", hours as i64))
        } else if hours < 12.0 {
            (0.7, format!("{}h", hours as i64))
        } else if hours < 24.0 {
            (0.5, format!("{}h", hours as i64))
        } else if hours < 48.0 {
            (0.3, "1-2j".to_string())
        } else if hours < 168.0 {
            (0.15, format!("{}j", (hours / 24.0) as i64))
        } else {
            (0.0, "> 1 sem".to_string())
        };
        ((max_pts as f64 * factor) as i32, detail)
    }

    fn score_bonus(&self, annonce: &Annonce, cfg: &TargetVehicle) -> (i32, String) {
        let max_pts = self.weights.bonus;
        let mut total = 0;
        let mut notes: Vec<String> = Vec::new();

        if !annonce.department.is_empty() {
            let dept_bonus = self.departments.bonus_for(&annonce.department);
            if dept_bonus > 0 {
                total += dept_bonus;
                notes.push(format!("dept {}", annonce.department));
            }
        }

        match annonce.seller_type {
            SellerType::Particulier => {
                total += 3;
                notes.push("particulier".to_string());
            }
            SellerType::Professionnel => {
                total -= 1;
                notes.push("pro".to_string());
            }
            SellerType::Unknown => {}
        }

        if annonce.image_urls.len() >= 5 {
            total += 1;
            notes.push(format!("{} photos", annonce.image_urls.len()));
        }

        let text = format!("{} {}", annonce.title, annonce.version).to_lowercase();
        for (name, value) in &cfg.bonus {
            if text.contains(&name.to_lowercase()) {
                total += (value / 100).min(2);
                notes.push(name.clone());
            }
        }

        let score = total.clamp(0, max_pts);
        let detail = if notes.is_empty() {
            "aucun".to_string()
        } else {
            notes.join(", ")
        };
        (score, detail)
    }

    fn score_margin_bonus(&self, margin_min: i32) -> i32 {
        let max_pts = self.weights.margin;
        if margin_min >= 1500 {
            max_pts
        } else if margin_min >= 1000 {
            (max_pts as f64 * 0.7) as i32
        } else if margin_min >= 500 {
            (max_pts as f64 * 0.4) as i32
        } else {
            0
        }
    }
}

/// Net margin: resale − price − repair costs − safety buffer, floored at 0.
fn estimate_margin(annonce: &Annonce, cfg: &TargetVehicle, repair_cost: i32) -> (i32, i32) {
    let Some(price) = annonce.price else {
        return (0, 0);
    };
    let price = price as i32;
    let resale_min = cfg.resale_min.map(|v| v as i32).unwrap_or(price + 500);
    let resale_max = cfg.resale_max.map(|v| v as i32).unwrap_or(price + 1500);
    let margin_min = resale_min - price - repair_cost - MARGIN_BUFFER;
    let margin_max = resale_max - price - repair_cost - MARGIN_BUFFER;
    (margin_min.max(0), margin_max.max(0))
}
