// tests/scoring_properties.rs
//
// Scoring laws: price monotonicity with the verification flag, the
// critical-risk cap, and the alert-level mapping on the final record.

use std::sync::Arc;

use occasion_radar::config::{KeywordsConfig, VehiclesConfig};
use occasion_radar::keywords::KeywordMatcher;
use occasion_radar::model::{AlertLevel, Annonce, Fuel, SellerType};
use occasion_radar::scoring::{Scorer, PRICE_TO_VERIFY};

fn scorer() -> Scorer {
    let vehicles: VehiclesConfig = toml::from_str(
        r#"
        [[vehicles]]
        id = "peugeot_207_hdi"
        make = "peugeot"
        model_patterns = ["^207"]
        fuel = "diesel"
        price_min = 1500
        price_max = 4000
        km_min = 50000
        km_max = 200000
        km_ideal_min = 80000
        km_ideal_max = 150000
        resale_min = 3800
        resale_max = 4800

        [departments]
        tier1 = ["44"]
    "#,
    )
    .unwrap();
    let matcher = Arc::new(KeywordMatcher::from_config(&KeywordsConfig::default()));
    Scorer::new(&vehicles, matcher)
}

fn base_annonce() -> Annonce {
    Annonce {
        make: "Peugeot".into(),
        model: "207".into(),
        version: "1.4 HDi 70ch".into(),
        title: "Peugeot 207 1.4 HDi".into(),
        fuel: Fuel::Diesel,
        km: Some(120_000),
        department: "44".into(),
        seller_type: SellerType::Particulier,
        image_urls: vec!["img".into(); 6],
        ..Default::default()
    }
}

#[test]
fn decreasing_price_never_decreases_total_until_flag_toggles() {
    let s = scorer();
    let mut previous_total = -1;
    // Walk the price down in €100 steps through the whole normal band.
    for price in (1500..=4000).rev().step_by(100) {
        let mut a = base_annonce();
        a.price = Some(price);
        let b = s.calculate_score(&mut a);
        assert!(
            !a.risks.contains(&PRICE_TO_VERIFY.to_string()),
            "flag must not fire inside the band (price {price})"
        );
        assert!(
            b.total >= previous_total,
            "price {price}: total {} dropped below {previous_total}",
            b.total
        );
        previous_total = b.total;
    }
}

#[test]
fn flag_does_not_survive_rescoring_in_the_normal_band() {
    let s = scorer();
    let mut a = base_annonce();
    a.image_urls.clear(); // suspicious: no photos
    a.price = Some(1200);
    s.calculate_score(&mut a);
    assert!(a.risks.contains(&PRICE_TO_VERIFY.to_string()));

    // Price corrected into the band: re-scoring must drop the flag.
    a.price = Some(2000);
    s.calculate_score(&mut a);
    assert!(!a.risks.contains(&PRICE_TO_VERIFY.to_string()));
}

#[test]
fn below_band_price_scores_high_not_zero() {
    let s = scorer();
    let mut benign = base_annonce();
    benign.price = Some(1200);
    let b = s.calculate_score(&mut benign);
    // Benign signals (photos, particulier, no risks): full price points.
    assert_eq!(b.price_score, 35);
    assert!(!benign.risks.contains(&PRICE_TO_VERIFY.to_string()));
}

#[test]
fn critical_risk_with_thin_margin_caps_at_59() {
    let s = scorer();
    let mut a = base_annonce();
    a.price = Some(1600);
    a.published_at = Some(chrono::Utc::now() - chrono::Duration::minutes(10));
    a.description = "vente urgente, CT ok, prix négociable, mais moteur HS".into();
    let b = s.calculate_score(&mut a);

    assert!(a.risks.contains(&"moteur_hs".to_string()));
    assert!(b.total <= 59, "total {}", b.total);
    assert_eq!(a.alert_level, AlertLevel::Surveiller);
}

#[test]
fn critical_risk_with_large_margin_is_not_capped() {
    // Resale so high that even a 2 000 € engine leaves margin ≥ 1 000.
    let vehicles: VehiclesConfig = toml::from_str(
        r#"
        [[vehicles]]
        id = "v"
        make = "peugeot"
        model_patterns = ["^207"]
        fuel = "diesel"
        price_min = 1500
        price_max = 4000
        km_min = 50000
        km_max = 200000
        km_ideal_min = 80000
        km_ideal_max = 150000
        resale_min = 6000
        resale_max = 7000

        [departments]
        tier1 = ["44"]
    "#,
    )
    .unwrap();
    let matcher = Arc::new(KeywordMatcher::from_config(&KeywordsConfig::default()));
    let s = Scorer::new(&vehicles, matcher);

    let mut a = base_annonce();
    a.price = Some(1600);
    a.published_at = Some(chrono::Utc::now() - chrono::Duration::minutes(10));
    a.description = "vente urgente, CT ok, prix négociable, mais moteur HS".into();
    let b = s.calculate_score(&mut a);

    // margin_min = 6000 - 1600 - 2000 - 200 = 2200 → the cap stays off.
    assert!(b.margin_min >= 1000);
    assert!(b.total >= 60, "total {}", b.total);
}

#[test]
fn alert_level_follows_total_on_the_record() {
    let s = scorer();
    for price in [1600u32, 2600, 3900] {
        let mut a = base_annonce();
        a.price = Some(price);
        a.published_at = Some(chrono::Utc::now() - chrono::Duration::minutes(10));
        let b = s.calculate_score(&mut a);
        assert_eq!(a.alert_level, AlertLevel::from_score(b.total));
        assert!((0..=100).contains(&b.total));
    }
}
