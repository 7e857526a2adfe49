//! # Repository
//! SQLite-backed store for listings and scan history. The schema ships
//! embedded and is applied on open.
//!
//! Discipline:
//! - one row per `fingerprint`; `save` upserts on that key and never
//!   rewrites `id`, `fingerprint`, or `created_at`;
//! - a single `Mutex<Connection>` serialises writers, readers share it;
//! - repository errors are logged and surface as `false`/empty — the
//!   pipeline keeps going (callers watch the `repo_errors_total` counter).

use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::model::{
    AlertLevel, Annonce, Fuel, Gearbox, ListingStatus, ScoreBreakdown, SellerType, Source,
};

const SCHEMA: &str = include_str!("schema.sql");

/// Closed set of accepted sort keys (anything else falls back to the
/// first entry).
const ALLOWED_ORDERS: [&str; 6] = [
    "score_total DESC",
    "score_total ASC",
    "created_at DESC",
    "created_at ASC",
    "price ASC",
    "price DESC",
];

/// Filters for `get_all` / `count`.
#[derive(Debug, Clone, Default)]
pub struct ListFilters {
    pub source: Option<Source>,
    pub status: Option<ListingStatus>,
    pub alert_level: Option<AlertLevel>,
    pub min_score: Option<i32>,
    pub not_notified: bool,
}

/// Identity triple preloaded into the orchestrator's seen-sets on restart.
#[derive(Debug, Clone)]
pub struct SeenKey {
    pub source: Source,
    pub source_listing_id: String,
    pub url_canonical: String,
}

pub struct AnnonceRepository {
    conn: Mutex<Connection>,
}

impl AnnonceRepository {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Volatile store for tests and dry runs.
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("repository mutex poisoned")
    }

    /// Upsert keyed by `fingerprint`. Refreshes `updated_at`; preserves
    /// `id`, `fingerprint`, and `created_at` on conflict.
    pub fn save(&self, annonce: &mut Annonce) -> bool {
        annonce.seal_identity();
        annonce.updated_at = Utc::now();

        let breakdown_json =
            serde_json::to_string(&annonce.score_breakdown).unwrap_or_else(|_| "{}".to_string());
        let images_json =
            serde_json::to_string(&annonce.image_urls).unwrap_or_else(|_| "[]".to_string());
        let opportunities_json =
            serde_json::to_string(&annonce.opportunities).unwrap_or_else(|_| "[]".to_string());
        let risks_json = serde_json::to_string(&annonce.risks).unwrap_or_else(|_| "[]".to_string());
        let channels_json =
            serde_json::to_string(&annonce.notify_channels).unwrap_or_else(|_| "[]".to_string());

        let sql = r#"
            INSERT INTO annonces (
                id, source, source_listing_id, url, url_canonical,
                fingerprint, fingerprint_soft,
                make, model, version, motorisation, fuel, gearbox,
                power_hp, year, km, price,
                city, postal_code, department, lat, lon,
                seller_type, seller_name, seller_phone,
                title, description, image_urls,
                published_at, scraped_at, created_at, updated_at,
                score_total, score_breakdown, target_vehicle_id,
                opportunities, risks,
                margin_min, margin_max, repair_cost_estimate, market_price_estimate,
                alert_level, status, ignore_reason,
                notified, notified_at, notify_channels
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26,
                ?27, ?28, ?29, ?30, ?31, ?32, ?33, ?34, ?35, ?36, ?37, ?38,
                ?39, ?40, ?41, ?42, ?43, ?44, ?45, ?46, ?47
            )
            ON CONFLICT(fingerprint) DO UPDATE SET
                source = excluded.source,
                source_listing_id = excluded.source_listing_id,
                url = excluded.url,
                url_canonical = excluded.url_canonical,
                fingerprint_soft = excluded.fingerprint_soft,
                make = excluded.make,
                model = excluded.model,
                version = excluded.version,
                motorisation = excluded.motorisation,
                fuel = excluded.fuel,
                gearbox = excluded.gearbox,
                power_hp = excluded.power_hp,
                year = excluded.year,
                km = excluded.km,
                price = excluded.price,
                city = excluded.city,
                postal_code = excluded.postal_code,
                department = excluded.department,
                lat = excluded.lat,
                lon = excluded.lon,
                seller_type = excluded.seller_type,
                seller_name = excluded.seller_name,
                seller_phone = excluded.seller_phone,
                title = excluded.title,
                description = excluded.description,
                image_urls = excluded.image_urls,
                published_at = excluded.published_at,
                scraped_at = excluded.scraped_at,
                updated_at = excluded.updated_at,
                score_total = excluded.score_total,
                score_breakdown = excluded.score_breakdown,
                target_vehicle_id = excluded.target_vehicle_id,
                opportunities = excluded.opportunities,
                risks = excluded.risks,
                margin_min = excluded.margin_min,
                margin_max = excluded.margin_max,
                repair_cost_estimate = excluded.repair_cost_estimate,
                market_price_estimate = excluded.market_price_estimate,
                alert_level = excluded.alert_level,
                status = excluded.status,
                ignore_reason = excluded.ignore_reason,
                notified = excluded.notified,
                notified_at = excluded.notified_at,
                notify_channels = excluded.notify_channels
        "#;

        let conn = self.lock();
        let result = conn.execute(
            sql,
            params![
                annonce.id,
                annonce.source.as_str(),
                annonce.source_listing_id,
                annonce.url,
                annonce.url_canonical,
                annonce.fingerprint,
                annonce.fingerprint_soft,
                annonce.make,
                annonce.model,
                annonce.version,
                annonce.motorisation,
                annonce.fuel.as_str(),
                annonce.gearbox.as_str(),
                annonce.power_hp,
                annonce.year,
                annonce.km,
                annonce.price,
                annonce.city,
                annonce.postal_code,
                annonce.department,
                annonce.lat,
                annonce.lon,
                annonce.seller_type.as_str(),
                annonce.seller_name,
                annonce.seller_phone,
                annonce.title,
                annonce.description,
                images_json,
                annonce.published_at,
                annonce.scraped_at,
                annonce.created_at,
                annonce.updated_at,
                annonce.score_total,
                breakdown_json,
                annonce.target_vehicle_id,
                opportunities_json,
                risks_json,
                annonce.margin_min,
                annonce.margin_max,
                annonce.repair_cost_estimate,
                annonce.market_price_estimate,
                annonce.alert_level.as_str(),
                annonce.status.as_str(),
                annonce.ignore_reason,
                annonce.notified as i32,
                annonce.notified_at,
                channels_json,
            ],
        );
        match result {
            Ok(_) => true,
            Err(e) => {
                repo_error("save", &e);
                false
            }
        }
    }

    pub fn get_by_id(&self, id: &str) -> Option<Annonce> {
        self.query_one("SELECT * FROM annonces WHERE id = ?1", params![id])
    }

    pub fn get_by_fingerprint(&self, fingerprint: &str) -> Option<Annonce> {
        self.query_one(
            "SELECT * FROM annonces WHERE fingerprint = ?1",
            params![fingerprint],
        )
    }

    /// Matches either the raw or the canonical URL.
    pub fn get_by_url(&self, url: &str) -> Option<Annonce> {
        self.query_one(
            "SELECT * FROM annonces WHERE url = ?1 OR url_canonical = ?1",
            params![url],
        )
    }

    pub fn get_by_source_listing(&self, source: Source, listing_id: &str) -> Option<Annonce> {
        if listing_id.is_empty() {
            return None;
        }
        self.query_one(
            "SELECT * FROM annonces WHERE source = ?1 AND source_listing_id = ?2",
            params![source.as_str(), listing_id],
        )
    }

    /// Short-circuits as soon as one key matches.
    pub fn exists(&self, fingerprint: Option<&str>, url: Option<&str>) -> bool {
        let conn = self.lock();
        if let Some(fp) = fingerprint {
            let hit: Result<Option<i64>, _> = conn
                .query_row(
                    "SELECT 1 FROM annonces WHERE fingerprint = ?1",
                    params![fp],
                    |r| r.get(0),
                )
                .optional();
            match hit {
                Ok(Some(_)) => return true,
                Ok(None) => {}
                Err(e) => repo_error("exists", &e),
            }
        }
        if let Some(u) = url {
            let hit: Result<Option<i64>, _> = conn
                .query_row(
                    "SELECT 1 FROM annonces WHERE url = ?1 OR url_canonical = ?1",
                    params![u],
                    |r| r.get(0),
                )
                .optional();
            match hit {
                Ok(Some(_)) => return true,
                Ok(None) => {}
                Err(e) => repo_error("exists", &e),
            }
        }
        false
    }

    /// All rows sharing a soft fingerprint, newest first.
    pub fn find_near_duplicates(&self, fingerprint_soft: &str) -> Vec<Annonce> {
        if fingerprint_soft.is_empty() {
            return Vec::new();
        }
        self.query_many(
            "SELECT * FROM annonces WHERE fingerprint_soft = ?1 ORDER BY created_at DESC",
            params![fingerprint_soft],
        )
    }

    /// Near-duplicate check excluding the annonce itself by `id`.
    pub fn is_near_duplicate(&self, annonce: &Annonce) -> (bool, Option<Annonce>) {
        let soft = if annonce.fingerprint_soft.is_empty() {
            annonce.compute_fingerprint_soft()
        } else {
            annonce.fingerprint_soft.clone()
        };
        let candidates: Vec<Annonce> = self
            .find_near_duplicates(&soft)
            .into_iter()
            .filter(|a| a.id != annonce.id)
            .collect();
        match candidates.into_iter().next() {
            Some(existing) => (true, Some(existing)),
            None => (false, None),
        }
    }

    pub fn get_all(
        &self,
        filters: &ListFilters,
        limit: usize,
        offset: usize,
        order_by: &str,
    ) -> Vec<Annonce> {
        let order = ALLOWED_ORDERS
            .iter()
            .find(|o| **o == order_by)
            .copied()
            .unwrap_or(ALLOWED_ORDERS[0]);

        let (where_clause, params) = build_filters(filters);
        let sql = format!(
            "SELECT * FROM annonces {where_clause} ORDER BY {order} LIMIT {limit} OFFSET {offset}"
        );
        self.query_many_dyn(&sql, &params)
    }

    pub fn count(&self, filters: &ListFilters) -> usize {
        let (where_clause, params) = build_filters(filters);
        let sql = format!("SELECT COUNT(*) FROM annonces {where_clause}");
        let conn = self.lock();
        let result: rusqlite::Result<usize> = conn.query_row(
            &sql,
            rusqlite::params_from_iter(params.iter().map(|p| p.as_str())),
            |r| r.get(0),
        );
        match result {
            Ok(n) => n,
            Err(e) => {
                repo_error("count", &e);
                0
            }
        }
    }

    pub fn mark_notified(&self, id: &str, channels: &[String]) -> bool {
        let channels_json = serde_json::to_string(channels).unwrap_or_else(|_| "[]".to_string());
        let now = Utc::now();
        let conn = self.lock();
        let result = conn.execute(
            "UPDATE annonces
             SET notified = 1, notified_at = ?1, notify_channels = ?2, updated_at = ?1
             WHERE id = ?3",
            params![now, channels_json, id],
        );
        match result {
            Ok(n) => n > 0,
            Err(e) => {
                repo_error("mark_notified", &e);
                false
            }
        }
    }

    pub fn update_status(&self, id: &str, status: ListingStatus, reason: &str) -> bool {
        let conn = self.lock();
        let result = conn.execute(
            "UPDATE annonces SET status = ?1, ignore_reason = ?2, updated_at = ?3 WHERE id = ?4",
            params![status.as_str(), reason, Utc::now(), id],
        );
        match result {
            Ok(n) => n > 0,
            Err(e) => {
                repo_error("update_status", &e);
                false
            }
        }
    }

    pub fn delete(&self, id: &str) -> bool {
        let conn = self.lock();
        match conn.execute("DELETE FROM annonces WHERE id = ?1", params![id]) {
            Ok(n) => n > 0,
            Err(e) => {
                repo_error("delete", &e);
                false
            }
        }
    }

    /// Global stats from the `v_stats` view.
    pub fn get_stats(&self) -> serde_json::Value {
        let conn = self.lock();
        let result = conn.query_row("SELECT * FROM v_stats", [], |row| {
            Ok(serde_json::json!({
                "total": row.get::<_, i64>("total")?,
                "urgent": row.get::<_, Option<i64>>("urgent")?.unwrap_or(0),
                "interessant": row.get::<_, Option<i64>>("interessant")?.unwrap_or(0),
                "surveiller": row.get::<_, Option<i64>>("surveiller")?.unwrap_or(0),
                "notified": row.get::<_, Option<i64>>("notified")?.unwrap_or(0),
                "avg_score": row.get::<_, Option<f64>>("avg_score")?,
                "max_score": row.get::<_, Option<i64>>("max_score")?,
            }))
        });
        match result {
            Ok(v) => v,
            Err(e) => {
                repo_error("get_stats", &e);
                serde_json::json!({})
            }
        }
    }

    /// Per-source stats from the `v_stats_by_source` view.
    pub fn get_stats_by_source(&self) -> Vec<serde_json::Value> {
        let conn = self.lock();
        let mut out = Vec::new();
        let mut stmt = match conn.prepare("SELECT * FROM v_stats_by_source") {
            Ok(s) => s,
            Err(e) => {
                repo_error("get_stats_by_source", &e);
                return out;
            }
        };
        let rows = stmt.query_map([], |row| {
            Ok(serde_json::json!({
                "source": row.get::<_, String>("source")?,
                "total": row.get::<_, i64>("total")?,
                "avg_score": row.get::<_, Option<f64>>("avg_score")?,
                "notified": row.get::<_, Option<i64>>("notified")?.unwrap_or(0),
                "last_created_at": row.get::<_, Option<String>>("last_created_at")?,
            }))
        });
        match rows {
            Ok(iter) => {
                for row in iter.flatten() {
                    out.push(row);
                }
            }
            Err(e) => repo_error("get_stats_by_source", &e),
        }
        out
    }

    /// Identity keys of recently created rows, for seeding dedup caches.
    pub fn recent_seen(&self, hours: i64, limit: usize) -> Vec<SeenKey> {
        let cutoff = Utc::now() - Duration::hours(hours);
        let conn = self.lock();
        let mut out = Vec::new();
        let mut stmt = match conn.prepare(
            "SELECT source, source_listing_id, url_canonical
             FROM annonces WHERE created_at >= ?1
             ORDER BY created_at DESC LIMIT ?2",
        ) {
            Ok(s) => s,
            Err(e) => {
                repo_error("recent_seen", &e);
                return out;
            }
        };
        let rows = stmt.query_map(params![cutoff, limit], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        });
        match rows {
            Ok(iter) => {
                for (source, listing_id, url_canonical) in iter.flatten() {
                    if let Some(source) = Source::parse(&source) {
                        out.push(SeenKey {
                            source,
                            source_listing_id: listing_id,
                            url_canonical,
                        });
                    }
                }
            }
            Err(e) => repo_error("recent_seen", &e),
        }
        out
    }

    // === Scan history ===

    pub fn log_scan_start(&self, source: Source) -> Option<i64> {
        let conn = self.lock();
        let result = conn.execute(
            "INSERT INTO scan_history (source, started_at, status) VALUES (?1, ?2, 'running')",
            params![source.as_str(), Utc::now()],
        );
        match result {
            Ok(_) => Some(conn.last_insert_rowid()),
            Err(e) => {
                repo_error("log_scan_start", &e);
                None
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn log_scan_end(
        &self,
        scan_id: i64,
        status: &str,
        listings_found: usize,
        listings_new: usize,
        errors_count: usize,
        error_message: &str,
    ) -> bool {
        let conn = self.lock();
        let result = conn.execute(
            "UPDATE scan_history
             SET finished_at = ?1, status = ?2,
                 listings_found = ?3, listings_new = ?4,
                 errors_count = ?5, error_message = ?6,
                 duration_seconds = (julianday(?1) - julianday(started_at)) * 86400
             WHERE id = ?7",
            params![
                Utc::now(),
                status,
                listings_found,
                listings_new,
                errors_count,
                error_message,
                scan_id
            ],
        );
        match result {
            Ok(n) => n > 0,
            Err(e) => {
                repo_error("log_scan_end", &e);
                false
            }
        }
    }

    /// One-shot variant for completed scans.
    pub fn log_scan(
        &self,
        source: Source,
        listings_found: usize,
        listings_new: usize,
        errors_count: usize,
    ) {
        let now = Utc::now();
        let conn = self.lock();
        let result = conn.execute(
            "INSERT INTO scan_history
                 (source, started_at, finished_at, status, listings_found, listings_new, errors_count)
             VALUES (?1, ?2, ?2, 'completed', ?3, ?4, ?5)",
            params![source.as_str(), now, listings_found, listings_new, errors_count],
        );
        if let Err(e) = result {
            repo_error("log_scan", &e);
        }
    }

    // === internals ===

    fn query_one(&self, sql: &str, params: impl rusqlite::Params) -> Option<Annonce> {
        let conn = self.lock();
        let result = conn.query_row(sql, params, row_to_annonce).optional();
        match result {
            Ok(found) => found,
            Err(e) => {
                repo_error("query_one", &e);
                None
            }
        }
    }

    fn query_many(&self, sql: &str, params: impl rusqlite::Params) -> Vec<Annonce> {
        let conn = self.lock();
        let mut out = Vec::new();
        let mut stmt = match conn.prepare(sql) {
            Ok(s) => s,
            Err(e) => {
                repo_error("query_many", &e);
                return out;
            }
        };
        match stmt.query_map(params, row_to_annonce) {
            Ok(rows) => {
                for row in rows.flatten() {
                    out.push(row);
                }
            }
            Err(e) => repo_error("query_many", &e),
        }
        out
    }

    fn query_many_dyn(&self, sql: &str, params: &[String]) -> Vec<Annonce> {
        let conn = self.lock();
        let mut out = Vec::new();
        let mut stmt = match conn.prepare(sql) {
            Ok(s) => s,
            Err(e) => {
                repo_error("query_many_dyn", &e);
                return out;
            }
        };
        let iter = stmt.query_map(
            rusqlite::params_from_iter(params.iter().map(|p| p.as_str())),
            row_to_annonce,
        );
        match iter {
            Ok(rows) => {
                for row in rows.flatten() {
                    out.push(row);
                }
            }
            Err(e) => repo_error("query_many_dyn", &e),
        }
        out
    }
}

static REPO_FAILURES: AtomicU64 = AtomicU64::new(0);

/// Process-wide count of failed repository operations. The runner compares
/// snapshots across cycles to decide when to raise an operator alert.
pub fn repo_failure_count() -> u64 {
    REPO_FAILURES.load(Ordering::Relaxed)
}

fn repo_error(op: &str, e: &rusqlite::Error) {
    REPO_FAILURES.fetch_add(1, Ordering::Relaxed);
    counter!("repo_errors_total").increment(1);
    tracing::warn!(op = op, error = %e, "repository operation failed");
}

fn build_filters(filters: &ListFilters) -> (String, Vec<String>) {
    let mut conditions: Vec<String> = Vec::new();
    let mut params: Vec<String> = Vec::new();

    if let Some(source) = filters.source {
        params.push(source.as_str().to_string());
        conditions.push(format!("source = ?{}", params.len()));
    }
    if let Some(status) = filters.status {
        params.push(status.as_str().to_string());
        conditions.push(format!("status = ?{}", params.len()));
    }
    if let Some(level) = filters.alert_level {
        params.push(level.as_str().to_string());
        conditions.push(format!("alert_level = ?{}", params.len()));
    }
    if let Some(min_score) = filters.min_score {
        params.push(min_score.to_string());
        conditions.push(format!("score_total >= ?{}", params.len()));
    }
    if filters.not_notified {
        conditions.push("notified = 0".to_string());
    }

    let clause = if conditions.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", conditions.join(" AND "))
    };
    (clause, params)
}

fn row_to_annonce(row: &Row<'_>) -> rusqlite::Result<Annonce> {
    let parse_json_list = |raw: String| -> Vec<String> {
        serde_json::from_str(&raw).unwrap_or_default()
    };

    let source_raw: String = row.get("source")?;
    let fuel_raw: String = row.get("fuel")?;
    let gearbox_raw: String = row.get("gearbox")?;
    let seller_raw: String = row.get("seller_type")?;
    let alert_raw: String = row.get("alert_level")?;
    let status_raw: String = row.get("status")?;
    let breakdown_raw: String = row.get("score_breakdown")?;

    Ok(Annonce {
        id: row.get("id")?,
        source: Source::parse(&source_raw).unwrap_or(Source::Autoscout24),
        source_listing_id: row.get("source_listing_id")?,
        url: row.get("url")?,
        url_canonical: row.get("url_canonical")?,
        fingerprint: row.get("fingerprint")?,
        fingerprint_soft: row.get("fingerprint_soft")?,
        make: row.get("make")?,
        model: row.get("model")?,
        version: row.get("version")?,
        motorisation: row.get("motorisation")?,
        fuel: Fuel::parse(&fuel_raw),
        gearbox: Gearbox::parse(&gearbox_raw),
        power_hp: row.get("power_hp")?,
        year: row.get("year")?,
        km: row.get("km")?,
        price: row.get("price")?,
        city: row.get("city")?,
        postal_code: row.get("postal_code")?,
        department: row.get("department")?,
        lat: row.get("lat")?,
        lon: row.get("lon")?,
        seller_type: SellerType::parse(&seller_raw),
        seller_name: row.get("seller_name")?,
        seller_phone: row.get("seller_phone")?,
        title: row.get("title")?,
        description: row.get("description")?,
        image_urls: parse_json_list(row.get("image_urls")?),
        published_at: row.get::<_, Option<DateTime<Utc>>>("published_at")?,
        scraped_at: row.get("scraped_at")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
        score_total: row.get("score_total")?,
        score_breakdown: serde_json::from_str::<ScoreBreakdown>(&breakdown_raw)
            .unwrap_or_default(),
        target_vehicle_id: row.get("target_vehicle_id")?,
        opportunities: parse_json_list(row.get("opportunities")?),
        risks: parse_json_list(row.get("risks")?),
        margin_min: row.get("margin_min")?,
        margin_max: row.get("margin_max")?,
        repair_cost_estimate: row.get("repair_cost_estimate")?,
        market_price_estimate: row.get("market_price_estimate")?,
        alert_level: AlertLevel::parse(&alert_raw),
        status: ListingStatus::parse(&status_raw),
        ignore_reason: row.get("ignore_reason")?,
        notified: row.get::<_, i64>("notified")? != 0,
        notified_at: row.get::<_, Option<DateTime<Utc>>>("notified_at")?,
        notify_channels: parse_json_list(row.get("notify_channels")?),
    })
}
