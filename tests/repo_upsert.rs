// tests/repo_upsert.rs
//
// Upsert discipline against an on-disk database: one row per fingerprint,
// immutable id/created_at, advancing updated_at.

use occasion_radar::model::{Annonce, Source};
use occasion_radar::repo::{AnnonceRepository, ListFilters};

fn annonce(listing_id: &str, price: u32) -> Annonce {
    let mut a = Annonce {
        source: Source::Leboncoin,
        source_listing_id: listing_id.to_string(),
        url: format!("https://www.leboncoin.fr/voitures/{listing_id}"),
        title: "Clio 3 1.5 dCi".into(),
        make: "Renault".into(),
        model: "Clio".into(),
        price: Some(price),
        km: Some(140_000),
        year: Some(2009),
        department: "35".into(),
        ..Default::default()
    };
    a.seal_identity();
    a
}

#[test]
fn two_saves_one_row_created_at_stable() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("annonces.db");
    let repo = AnnonceRepository::open(&db_path).unwrap();

    let mut first = annonce("UP1", 2800);
    assert!(repo.save(&mut first));
    let before = repo.get_by_fingerprint(&first.fingerprint).unwrap();

    std::thread::sleep(std::time::Duration::from_millis(10));
    let mut second = annonce("UP1", 2650);
    assert!(repo.save(&mut second));

    assert_eq!(repo.count(&ListFilters::default()), 1);
    let after = repo.get_by_fingerprint(&first.fingerprint).unwrap();
    assert_eq!(after.id, before.id);
    assert_eq!(after.created_at, before.created_at);
    assert!(after.updated_at > before.updated_at);
    assert_eq!(after.price, Some(2650));
}

#[test]
fn reopen_preserves_rows_and_roundtrips_fields() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("annonces.db");

    let fingerprint = {
        let repo = AnnonceRepository::open(&db_path).unwrap();
        let mut a = annonce("PERSIST1", 3100);
        a.opportunities = vec!["ct_ok".into(), "negociable".into()];
        a.risks = vec!["embrayage".into()];
        a.image_urls = vec!["https://img.example/1.jpg".into()];
        a.score_total = 66;
        assert!(repo.save(&mut a));
        a.fingerprint.clone()
    };

    // A fresh handle over the same file sees the same record.
    let repo = AnnonceRepository::open(&db_path).unwrap();
    let restored = repo.get_by_fingerprint(&fingerprint).unwrap();
    assert_eq!(restored.opportunities, vec!["ct_ok", "negociable"]);
    assert_eq!(restored.risks, vec!["embrayage"]);
    assert_eq!(restored.image_urls, vec!["https://img.example/1.jpg"]);
    assert_eq!(restored.score_total, 66);
    assert_eq!(restored.source, Source::Leboncoin);
}

#[test]
fn scan_history_duration_computed() {
    let dir = tempfile::tempdir().unwrap();
    let repo = AnnonceRepository::open(&dir.path().join("annonces.db")).unwrap();

    let scan_id = repo.log_scan_start(Source::Paruvendu).unwrap();
    std::thread::sleep(std::time::Duration::from_millis(20));
    assert!(repo.log_scan_end(scan_id, "completed", 10, 2, 0, ""));
    // A second close on the same id still succeeds as an update.
    assert!(repo.log_scan_end(scan_id, "cancelled", 10, 2, 1, "stop requested"));
}
