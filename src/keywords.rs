//! # Keyword Matcher
//! Accent-folded, word-boundary-aware keyword detection over listing text.
//!
//! Plain substring checks misfire across word boundaries (`turbo` inside
//! `turbo-diesel`) and accent variants (`négociable` vs `negociable`).
//! Instead, both the text and every configured pattern go through the same
//! normalisation, and patterns are compiled once with `\b` anchors.
//!
//! Buckets:
//! - opportunities contribute a bonus, at most once per text;
//! - risks contribute a (negative) penalty plus a repair-cost estimate and
//!   carry a severity;
//! - exclusions short-circuit the whole evaluation with a reason string.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::KeywordsConfig;
use crate::model::{fold_accents, Severity};

static RE_NON_WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\w\s]").expect("non-word regex"));
static RE_WS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("ws regex"));

/// Normalise text for matching: lowercase, fold accents, turn `'`/`:`/`/`
/// and other punctuation into spaces, collapse whitespace.
///
/// Hyphens between word characters glue the compound into one token
/// (`turbo-diesel` → `turbodiesel`), so a bare `turbo` keyword cannot fire
/// inside it; dangling hyphens become spaces.
pub fn normalize_matching_text(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }
    let mut t = fold_accents(&text.to_lowercase());
    t = glue_hyphenated(&t);
    t = t.replace(['\'', ':', '/'], " ");
    t = RE_NON_WORD.replace_all(&t, " ").to_string();
    RE_WS.replace_all(&t, " ").trim().to_string()
}

fn glue_hyphenated(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    for (i, &c) in chars.iter().enumerate() {
        if c == '-' {
            let prev_word = i > 0 && chars[i - 1].is_alphanumeric();
            let next_word = chars.get(i + 1).is_some_and(|n| n.is_alphanumeric());
            if prev_word && next_word {
                continue;
            }
            out.push(' ');
        } else {
            out.push(c);
        }
    }
    out
}

#[derive(Debug)]
struct CompiledKeyword {
    id: String,
    patterns: Vec<Regex>,
    bonus: i32,
    penalty: i32,
    cost_estimate: i32,
    severity: Severity,
}

/// Aggregate result of one matching pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeywordScan {
    pub bonus_total: i32,
    /// Negative or zero.
    pub penalty_total: i32,
    pub cost_estimate: i32,
    pub opportunity_ids: Vec<String>,
    pub risk_ids: Vec<String>,
    pub max_severity: Option<Severity>,
}

/// Compiled matcher; build once from config, share behind an `Arc`.
#[derive(Debug)]
pub struct KeywordMatcher {
    opportunities: Vec<CompiledKeyword>,
    risks: Vec<CompiledKeyword>,
    exclusions: Vec<Regex>,
}

impl KeywordMatcher {
    pub fn from_config(config: &KeywordsConfig) -> Self {
        let mut opportunities = Vec::new();
        for (id, spec) in &config.opportunity {
            opportunities.push(CompiledKeyword {
                id: id.clone(),
                patterns: compile_patterns(&spec.patterns),
                bonus: spec.bonus,
                penalty: 0,
                cost_estimate: 0,
                severity: Severity::Minor,
            });
        }

        let mut risks = Vec::new();
        for (id, spec) in &config.risk {
            risks.push(CompiledKeyword {
                id: id.clone(),
                patterns: compile_patterns(&spec.patterns),
                bonus: 0,
                penalty: spec.penalty.min(0),
                cost_estimate: spec.cost_estimate,
                severity: spec.severity_enum(),
            });
        }

        let exclusions = compile_patterns(&config.exclusions.patterns);

        let mut matcher = Self {
            opportunities,
            risks,
            exclusions,
        };
        matcher.seed_builtin_variants();
        matcher
    }

    /// Built-in variants layered on top of the config, added only when the
    /// config does not already define the id. Patterns are raw regexes.
    fn seed_builtin_variants(&mut self) {
        let opp_ids: Vec<String> = self.opportunities.iter().map(|k| k.id.clone()).collect();
        if !opp_ids.iter().any(|id| id == "ct_ok") {
            self.opportunities.push(CompiledKeyword {
                id: "ct_ok".into(),
                patterns: compile_raw(&[
                    r"\bct\s*(ok|vierge|recent|neuf|valide|fait|passe)\b",
                    r"\bcontrole\s*technique\s*(ok|vierge|recent|neuf|valide|fait|passe)\b",
                    r"\bct\s*ok\b",
                    r"\bctok\b",
                ]),
                bonus: 8,
                penalty: 0,
                cost_estimate: 0,
                severity: Severity::Minor,
            });
        }
        if !opp_ids.iter().any(|id| id == "urgent_vente") {
            self.opportunities.push(CompiledKeyword {
                id: "urgent_vente".into(),
                patterns: compile_raw(&[
                    r"\burgent\w*\b",
                    r"\bvente\s*(urgente|rapide)\b",
                    r"\bdoit\s+partir\b",
                    r"\ba\s+saisir\b",
                    r"\bdemenagement\b",
                ]),
                bonus: 10,
                penalty: 0,
                cost_estimate: 0,
                severity: Severity::Minor,
            });
        }
        if !opp_ids.iter().any(|id| id == "negociable") {
            self.opportunities.push(CompiledKeyword {
                id: "negociable".into(),
                patterns: compile_raw(&[
                    r"\bnego(ciable)?\b",
                    r"\ba\s+debattre\b",
                    r"\bprix\s+a\s+discuter\b",
                    r"\bouvert\s+(aux\s+)?propositions?\b",
                ]),
                bonus: 5,
                penalty: 0,
                cost_estimate: 0,
                severity: Severity::Minor,
            });
        }

        let risk_ids: Vec<String> = self.risks.iter().map(|k| k.id.clone()).collect();
        if !risk_ids.iter().any(|id| id == "moteur_hs") {
            self.risks.push(CompiledKeyword {
                id: "moteur_hs".into(),
                patterns: compile_raw(&[
                    r"\bmoteur\s*(hs|mort|casse|a\s+refaire)\b",
                    r"\bne\s+(demarre|roule)\s+(plus|pas)\b",
                    r"\bpour\s+pieces\b",
                ]),
                bonus: 0,
                penalty: -30,
                cost_estimate: 2000,
                severity: Severity::Critical,
            });
        }
        if !risk_ids.iter().any(|id| id == "ct_refuse") {
            self.risks.push(CompiledKeyword {
                id: "ct_refuse".into(),
                patterns: compile_raw(&[
                    r"\bct\s*(refuse|refus|a\s*faire|expire)\b",
                    r"\bcontre\s*visite\b",
                    r"\bcontrevisite\b",
                    r"\bsans\s+ct\b",
                ]),
                bonus: 0,
                penalty: -15,
                cost_estimate: 400,
                severity: Severity::Moderate,
            });
        }
    }

    /// Exclusion check; returns the reason when the text is disqualified.
    /// Exclusions outrank any score.
    pub fn exclusion_reason(&self, text: &str) -> Option<String> {
        if text.is_empty() {
            return None;
        }
        let normalized = normalize_matching_text(text);
        for pattern in &self.exclusions {
            if let Some(m) = pattern.find(&normalized) {
                return Some(format!("exclusion: {}", m.as_str()));
            }
        }
        None
    }

    /// Single matching pass: each keyword fires at most once (first pattern
    /// that hits wins).
    pub fn scan(&self, text: &str) -> KeywordScan {
        let mut out = KeywordScan::default();
        if text.is_empty() {
            return out;
        }
        let normalized = normalize_matching_text(text);

        for kw in &self.opportunities {
            if kw.patterns.iter().any(|p| p.is_match(&normalized)) {
                out.bonus_total += kw.bonus;
                out.opportunity_ids.push(kw.id.clone());
            }
        }
        for kw in &self.risks {
            if kw.patterns.iter().any(|p| p.is_match(&normalized)) {
                out.penalty_total += kw.penalty;
                out.cost_estimate += kw.cost_estimate;
                out.risk_ids.push(kw.id.clone());
                out.max_severity = Some(match out.max_severity {
                    Some(s) => s.max(kw.severity),
                    None => kw.severity,
                });
            }
        }
        out
    }
}

/// Compile config patterns: normalise like the text, escape unless the
/// pattern carries regex metacharacters, anchor with `\b` unless already
/// anchored.
fn compile_patterns(raw_patterns: &[String]) -> Vec<Regex> {
    let mut compiled = Vec::with_capacity(raw_patterns.len());
    for pattern in raw_patterns {
        let mut normalized = fold_accents(&pattern.to_lowercase());

        let has_meta = pattern
            .chars()
            .any(|c| matches!(c, '\\' | '.' | '*' | '+' | '?' | '[' | ']' | '(' | ')' | '{' | '}' | '|' | '^' | '$'));
        if !has_meta {
            // Literal patterns get the same hyphen treatment as the text.
            normalized = glue_hyphenated(&normalized);
            normalized = regex::escape(&normalized);
        }

        if !normalized.starts_with(r"\b") && !normalized.starts_with('^') {
            normalized = format!(r"\b{normalized}");
        }
        if !normalized.ends_with(r"\b") && !normalized.ends_with('$') {
            normalized = format!(r"{normalized}\b");
        }

        match Regex::new(&normalized) {
            Ok(re) => compiled.push(re),
            Err(e) => tracing::warn!(pattern = %pattern, error = %e, "invalid keyword pattern"),
        }
    }
    compiled
}

fn compile_raw(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .filter_map(|p| match Regex::new(p) {
            Ok(re) => Some(re),
            Err(e) => {
                tracing::warn!(pattern = %p, error = %e, "invalid builtin pattern");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExclusionSpec, OpportunitySpec, RiskSpec};
    use std::collections::BTreeMap;

    fn matcher_with(
        opportunity: &[(&str, &[&str], i32)],
        risk: &[(&str, &[&str], i32, i32, &str)],
        exclusions: &[&str],
    ) -> KeywordMatcher {
        let mut cfg = KeywordsConfig::default();
        let mut opp = BTreeMap::new();
        for (id, patterns, bonus) in opportunity {
            opp.insert(
                id.to_string(),
                OpportunitySpec {
                    patterns: patterns.iter().map(|s| s.to_string()).collect(),
                    bonus: *bonus,
                    description: String::new(),
                },
            );
        }
        let mut risks = BTreeMap::new();
        for (id, patterns, penalty, cost, severity) in risk {
            risks.insert(
                id.to_string(),
                RiskSpec {
                    patterns: patterns.iter().map(|s| s.to_string()).collect(),
                    penalty: *penalty,
                    cost_estimate: *cost,
                    severity: severity.to_string(),
                    description: String::new(),
                },
            );
        }
        cfg.opportunity = opp;
        cfg.risk = risks;
        cfg.exclusions = ExclusionSpec {
            patterns: exclusions.iter().map(|s| s.to_string()).collect(),
        };
        KeywordMatcher::from_config(&cfg)
    }

    #[test]
    fn word_boundary_blocks_partial_hits() {
        let m = matcher_with(&[("turbo", &["turbo"], 5)], &[], &[]);
        assert!(m.scan("moteur turbo-diesel").opportunity_ids.is_empty());
        assert!(m.scan("turbocompresse neuf").opportunity_ids.is_empty());
        assert_eq!(m.scan("kit turbo neuf").opportunity_ids, vec!["turbo"]);
    }

    #[test]
    fn accent_and_case_folding() {
        let m = matcher_with(&[], &[], &[]);
        for text in ["negociable", "Négociable", "NÉGOCIABLE !"] {
            let scan = m.scan(text);
            assert!(
                scan.opportunity_ids.contains(&"negociable".to_string()),
                "missed in {text:?}"
            );
        }
    }

    #[test]
    fn keyword_fires_once_across_patterns() {
        let m = matcher_with(&[("ct_ok", &["ct ok", "ct vierge"], 8)], &[], &[]);
        let scan = m.scan("ct ok et ct vierge");
        assert_eq!(scan.bonus_total, 8);
        assert_eq!(scan.opportunity_ids, vec!["ct_ok".to_string()]);
    }

    #[test]
    fn risks_accumulate_costs_and_severity() {
        let m = matcher_with(
            &[],
            &[
                ("embrayage", &["embrayage fatigue"], -10, 600, "moderate"),
                ("boite_morte", &["boite casse"], -30, 2000, "critical"),
            ],
            &[],
        );
        let scan = m.scan("boite casse, embrayage fatigué");
        assert_eq!(scan.penalty_total, -40);
        assert_eq!(scan.cost_estimate, 2600);
        assert_eq!(scan.max_severity, Some(Severity::Critical));
    }

    #[test]
    fn exclusion_short_circuits_with_reason() {
        let m = matcher_with(&[], &[], &["epave", "vehicule brule"]);
        let reason = m.exclusion_reason("vends épave pour pièces").unwrap();
        assert!(reason.contains("epave"));
        assert!(m.exclusion_reason("tres bon etat").is_none());
    }

    #[test]
    fn builtin_variants_detect_common_phrasings() {
        let m = matcher_with(&[], &[], &[]);
        assert!(m
            .scan("vente urgente cause déménagement")
            .opportunity_ids
            .contains(&"urgent_vente".to_string()));
        let hs = m.scan("moteur HS, ne démarre plus");
        assert!(hs.risk_ids.contains(&"moteur_hs".to_string()));
        assert_eq!(hs.max_severity, Some(Severity::Critical));
    }

    #[test]
    fn config_entry_overrides_builtin_id() {
        let m = matcher_with(&[("ct_ok", &["ct tout neuf"], 3)], &[], &[]);
        let scan = m.scan("ct ok");
        // The builtin ct_ok variants were not seeded, so plain "ct ok"
        // does not fire under the overridden definition.
        assert!(!scan.opportunity_ids.contains(&"ct_ok".to_string()));
        assert_eq!(m.scan("ct tout neuf").bonus_total, 3);
    }

    #[test]
    fn normalize_replaces_punctuation_with_spaces() {
        assert_eq!(
            normalize_matching_text("CT: OK / prix-fixe, l'été"),
            "ct ok prixfixe l ete"
        );
    }
}
