//! Persistent dedup store
//!
//! One row per posted item, keyed by catalog id. The store alone decides
//! whether an item may be (re)posted: never-seen items always pass, items
//! inside the cooldown window pass only when the price dropped far enough
//! since the last post.

use std::path::Path;

use anyhow::{Result, bail};
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, SqlitePool, migrate::MigrateDatabase};
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::models::{Candidate, ItemId, PostRecord, detail_url};

/// Cooldown rules applied by [`DedupStore::should_skip`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DedupPolicy {
    pub cooldown_hours: i64,
    pub repost_price_drop_percent: f64,
}

impl DedupPolicy {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            cooldown_hours: settings.cooldown_hours,
            repost_price_drop_percent: settings.repost_price_drop_percent,
        }
    }
}

#[derive(Clone)]
pub struct DedupStore {
    pool: SqlitePool,
    policy: DedupPolicy,
}

impl DedupStore {
    /// Opens (creating if needed) the SQLite file at `db_path`.
    pub async fn open(db_path: &str, policy: DedupPolicy) -> Result<Self> {
        if let Some(parent) = Path::new(db_path).parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let db_url = format!("sqlite:{db_path}");

        // Create database file if it doesn't exist
        if !Sqlite::database_exists(&db_url).await.unwrap_or(false) {
            info!("Creating database file {}", db_path);
            Sqlite::create_database(&db_url).await?;
        }

        let pool = SqlitePool::connect(&db_url).await?;
        Self::with_pool(pool, policy).await
    }

    /// Ephemeral store backed by a single in-memory connection.
    pub async fn in_memory(policy: DedupPolicy) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        Self::with_pool(pool, policy).await
    }

    async fn with_pool(pool: SqlitePool, policy: DedupPolicy) -> Result<Self> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool, policy })
    }

    pub fn policy(&self) -> &DedupPolicy {
        &self.policy
    }

    pub async fn should_skip(&self, id: &ItemId, current_price: f64) -> Result<bool> {
        self.should_skip_at(id, current_price, Utc::now()).await
    }

    /// `true` when `id` was posted inside the cooldown window and its price
    /// has not dropped by at least the override percentage since.
    pub async fn should_skip_at(
        &self,
        id: &ItemId,
        current_price: f64,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let Some(record) = self.record_for(id).await? else {
            return Ok(false);
        };
        let Some(last_posted) = record.last_posted_at else {
            debug!("Record for {} has no usable post time; allowing", id);
            return Ok(false);
        };

        let elapsed_hours = (now - last_posted).num_seconds() as f64 / 3600.0;
        if elapsed_hours >= self.policy.cooldown_hours as f64 {
            return Ok(false);
        }

        let drop_percent = match record.last_price {
            Some(last) if last > 0.0 && current_price > 0.0 => (last - current_price) * 100.0 / last,
            _ => return Ok(true),
        };

        if drop_percent >= self.policy.repost_price_drop_percent {
            info!(
                "{} dropped {:.1}% since last post ({:.0}h ago); reposting early",
                id, drop_percent, elapsed_hours
            );
            Ok(false)
        } else {
            Ok(true)
        }
    }

    pub async fn record(&self, candidate: &Candidate) -> Result<()> {
        self.record_at(candidate, Utc::now()).await
    }

    /// Upserts the post record. `first_seen_at` is written once and kept.
    pub async fn record_at(&self, candidate: &Candidate, now: DateTime<Utc>) -> Result<()> {
        let timestamp = format_timestamp(now);

        sqlx::query(
            r"
            INSERT INTO post_records (id, title, url, last_price, first_seen_at, last_posted_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                url = excluded.url,
                last_price = excluded.last_price,
                last_posted_at = excluded.last_posted_at,
                first_seen_at = COALESCE(post_records.first_seen_at, excluded.first_seen_at)
            ",
        )
        .bind(candidate.id.as_str())
        .bind(&candidate.title)
        .bind(candidate.source_url())
        .bind(candidate.deal_price())
        .bind(&timestamp)
        .bind(&timestamp)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn record_for(&self, id: &ItemId) -> Result<Option<PostRecord>> {
        let row = sqlx::query(
            "SELECT id, title, url, last_price, first_seen_at, last_posted_at FROM post_records WHERE id = ?",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| record_from_row(&row)).transpose()?)
    }

    pub async fn len(&self) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM post_records")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn prune_older_than(&self, retention: Duration) -> Result<u64> {
        self.prune_older_than_at(retention, Utc::now()).await
    }

    /// Deletes records whose most recent known timestamp is older than
    /// `now - retention`, plus records with no parseable timestamp at all.
    pub async fn prune_older_than_at(&self, retention: Duration, now: DateTime<Utc>) -> Result<u64> {
        let cutoff = now - retention;

        let rows = sqlx::query("SELECT id, title, url, last_price, first_seen_at, last_posted_at FROM post_records")
            .fetch_all(&self.pool)
            .await?;

        let mut stale = Vec::new();
        for row in &rows {
            let record = record_from_row(row)?;
            match record.best_timestamp() {
                Some(ts) if ts >= cutoff => {}
                Some(_) => stale.push(record.id),
                None => {
                    warn!("Pruning {} with unreadable timestamps", record.id);
                    stale.push(record.id);
                }
            }
        }

        if stale.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        for id in &stale {
            sqlx::query("DELETE FROM post_records WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        info!(
            "Pruned {} dedup records older than {} days",
            stale.len(),
            retention.num_days()
        );
        Ok(stale.len() as u64)
    }

    /// Imports a JSON dedup document written by earlier versions: an object
    /// keyed by item id whose values are either a bare timestamp or an object
    /// with timestamp/price fields. Existing rows win over imported ones.
    pub async fn import_json(&self, path: &Path) -> Result<u64> {
        let raw = tokio::fs::read_to_string(path).await?;
        let doc: Value = serde_json::from_str(&raw)?;
        let Some(entries) = doc.as_object() else {
            bail!("legacy store {} is not a JSON object", path.display());
        };

        let mut imported = 0;
        for (key, value) in entries {
            let Some(id) = ItemId::parse(key) else {
                warn!("Skipping legacy entry with malformed id {:?}", key);
                continue;
            };
            let entry = LegacyEntry::from_value(value);
            let Some(last_posted) = entry.last_posted_at.or(entry.first_seen_at) else {
                warn!("Skipping legacy entry {} without a readable timestamp", id);
                continue;
            };
            let first_seen = entry.first_seen_at.unwrap_or(last_posted);

            let result = sqlx::query(
                r"
                INSERT INTO post_records (id, title, url, last_price, first_seen_at, last_posted_at)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO NOTHING
                ",
            )
            .bind(id.as_str())
            .bind(entry.title)
            .bind(entry.url.unwrap_or_else(|| detail_url(&id)))
            .bind(entry.last_price)
            .bind(format_timestamp(first_seen))
            .bind(format_timestamp(last_posted))
            .execute(&self.pool)
            .await?;

            imported += result.rows_affected();
        }

        info!("Imported {} legacy dedup records from {}", imported, path.display());
        Ok(imported)
    }
}

fn record_from_row(row: &SqliteRow) -> Result<PostRecord, sqlx::Error> {
    let first_seen: Option<String> = row.try_get("first_seen_at")?;
    let last_posted: Option<String> = row.try_get("last_posted_at")?;

    Ok(PostRecord {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        url: row.try_get("url")?,
        last_price: row.try_get("last_price")?,
        first_seen_at: first_seen.as_deref().and_then(normalize_timestamp),
        last_posted_at: last_posted.as_deref().and_then(normalize_timestamp),
    })
}

fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Normalizes the timestamp spellings found in stored records: epoch seconds
/// or milliseconds, RFC 3339, SQLite `YYYY-MM-DD HH:MM:SS`, and date-only.
/// Naive values are taken as UTC.
pub fn normalize_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(epoch) = raw.parse::<f64>() {
        if !epoch.is_finite() || epoch < 0.0 {
            return None;
        }
        // Anything past year 33658 in seconds is really milliseconds.
        let secs = if epoch >= 1e12 { epoch / 1000.0 } else { epoch };
        let nanos = (secs.fract() * 1e9) as u32;
        return DateTime::from_timestamp(secs.trunc() as i64, nanos);
    }

    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }

    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc());
        }
    }

    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

#[derive(Debug, Default)]
struct LegacyEntry {
    title: Option<String>,
    url: Option<String>,
    last_price: Option<f64>,
    first_seen_at: Option<DateTime<Utc>>,
    last_posted_at: Option<DateTime<Utc>>,
}

impl LegacyEntry {
    fn from_value(value: &Value) -> Self {
        let Some(obj) = value.as_object() else {
            return Self {
                last_posted_at: json_timestamp(value),
                ..Self::default()
            };
        };

        let first = |keys: &[&str]| keys.iter().find_map(|k| obj.get(*k).filter(|v| !v.is_null()));

        Self {
            title: first(&["title"]).and_then(Value::as_str).map(str::to_string),
            url: first(&["url"]).and_then(Value::as_str).map(str::to_string),
            last_price: first(&["last_price", "price"]).and_then(json_number),
            first_seen_at: first(&["first_seen_at", "first_seen"]).and_then(json_timestamp),
            last_posted_at: first(&["last_posted_at", "posted_at", "last_posted", "timestamp", "ts"])
                .and_then(json_timestamp),
        }
    }
}

fn json_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => normalize_timestamp(&n.to_string()),
        Value::String(s) => normalize_timestamp(s),
        _ => None,
    }
}

fn json_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn policy() -> DedupPolicy {
        DedupPolicy {
            cooldown_hours: 72,
            repost_price_drop_percent: 8.0,
        }
    }

    async fn store() -> DedupStore {
        DedupStore::in_memory(policy()).await.unwrap()
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 1, 12, 0, 0).unwrap()
    }

    fn candidate(id: &str, price: f64) -> Candidate {
        let mut c = Candidate::new(ItemId::parse(id).unwrap(), "Steel Water Bottle", "Beauty").unwrap();
        c.set_prices(Some(price), Some(price * 3.0));
        c
    }

    fn id(raw: &str) -> ItemId {
        ItemId::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn unknown_item_is_never_skipped() {
        let store = store().await;
        assert!(!store.should_skip_at(&id("B0NEWITEM1"), 10.0, t0()).await.unwrap());
    }

    #[tokio::test]
    async fn cooldown_with_price_drop_override() {
        let store = store().await;
        store.record_at(&candidate("B0BOTTLE01", 1000.0), t0()).await.unwrap();
        let later = t0() + Duration::hours(5);

        assert!(store.should_skip_at(&id("B0BOTTLE01"), 1000.0, later).await.unwrap());
        assert!(store.should_skip_at(&id("B0BOTTLE01"), 960.0, later).await.unwrap());
        assert!(!store.should_skip_at(&id("B0BOTTLE01"), 920.0, later).await.unwrap());
        assert!(!store.should_skip_at(&id("B0BOTTLE01"), 900.0, later).await.unwrap());
        assert!(store.should_skip_at(&id("B0BOTTLE01"), 1100.0, later).await.unwrap());
    }

    #[tokio::test]
    async fn cooldown_expiry_allows_repost() {
        let store = store().await;
        store.record_at(&candidate("B0BOTTLE01", 500.0), t0()).await.unwrap();

        let just_inside = t0() + Duration::hours(71) + Duration::minutes(59);
        assert!(store.should_skip_at(&id("B0BOTTLE01"), 500.0, just_inside).await.unwrap());

        let expired = t0() + Duration::hours(72);
        assert!(!store.should_skip_at(&id("B0BOTTLE01"), 500.0, expired).await.unwrap());
    }

    #[tokio::test]
    async fn record_is_an_upsert_keeping_first_seen() {
        let store = store().await;
        let c = candidate("B0BOTTLE01", 1000.0);

        store.record_at(&c, t0()).await.unwrap();
        store.record_at(&c, t0()).await.unwrap();
        let record = store.record_for(&c.id).await.unwrap().unwrap();
        assert_eq!(store.len().await.unwrap(), 1);
        assert_eq!(record.first_seen_at, Some(t0()));

        let later = t0() + Duration::days(4);
        store.record_at(&candidate("B0BOTTLE01", 850.0), later).await.unwrap();
        let record = store.record_for(&c.id).await.unwrap().unwrap();
        assert_eq!(store.len().await.unwrap(), 1);
        assert_eq!(record.first_seen_at, Some(t0()));
        assert_eq!(record.last_posted_at, Some(later));
        assert_eq!(record.last_price, Some(850.0));
        assert_eq!(record.url.as_deref(), Some("https://www.amazon.in/dp/B0BOTTLE01"));
    }

    #[tokio::test]
    async fn prune_uses_best_available_timestamp() {
        let store = store().await;
        let now = t0();

        store.record_at(&candidate("B0RECENT01", 100.0), now - Duration::days(2)).await.unwrap();
        store.record_at(&candidate("B0STALE001", 100.0), now - Duration::days(20)).await.unwrap();

        let legacy = [
            ("B0EPOCH001", None, Some((now - Duration::days(1)).timestamp().to_string())),
            ("B0DATEONLY", None, Some("2026-09-01".to_string())),
            ("B0SQLITETS", None, Some("2026-09-28 08:30:00".to_string())),
            ("B0FIRSTONL", Some("2026-09-30T00:00:00Z".to_string()), None),
            ("B0GARBAGE1", None, Some("yesterday-ish".to_string())),
        ];
        for (item, first_seen, last_posted) in legacy {
            sqlx::query("INSERT INTO post_records (id, first_seen_at, last_posted_at) VALUES (?, ?, ?)")
                .bind(item)
                .bind(first_seen)
                .bind(last_posted)
                .execute(&store.pool)
                .await
                .unwrap();
        }

        let pruned = store.prune_older_than_at(Duration::days(14), now).await.unwrap();
        assert_eq!(pruned, 3);

        for kept in ["B0RECENT01", "B0EPOCH001", "B0SQLITETS", "B0FIRSTONL"] {
            assert!(store.record_for(&id(kept)).await.unwrap().is_some(), "{kept} was pruned");
        }
        for gone in ["B0STALE001", "B0DATEONLY", "B0GARBAGE1"] {
            assert!(store.record_for(&id(gone)).await.unwrap().is_none(), "{gone} was kept");
        }
    }

    #[tokio::test]
    async fn legacy_epoch_rows_take_part_in_cooldown() {
        let store = store().await;
        let posted = t0() - Duration::hours(10);
        sqlx::query("INSERT INTO post_records (id, last_price, last_posted_at) VALUES (?, ?, ?)")
            .bind("B0EPOCH001")
            .bind(1000.0)
            .bind(posted.timestamp_millis().to_string())
            .execute(&store.pool)
            .await
            .unwrap();

        assert!(store.should_skip_at(&id("B0EPOCH001"), 990.0, t0()).await.unwrap());
        assert!(!store.should_skip_at(&id("B0EPOCH001"), 800.0, t0()).await.unwrap());
    }

    #[tokio::test]
    async fn imports_legacy_json_document() {
        let store = store().await;
        store.record_at(&candidate("B0BOTTLE01", 100.0), t0()).await.unwrap();

        let path = std::env::temp_dir().join(format!("deal-finder-legacy-{}.json", std::process::id()));
        let doc = serde_json::json!({
            "B0BOTTLE01": {"posted_at": "2020-01-01", "price": 1.0},
            "B0LEGACY01": {"ts": 1_790_000_000, "price": "499.0", "title": "Old deal"},
            "B0LEGACY02": "2026-09-30 10:00:00",
            "B0LEGACY03": {"first_seen": 1_790_000_000_000_i64},
            "not-an-id": {"ts": 1},
            "B0LEGACY04": {"price": 10}
        });
        tokio::fs::write(&path, doc.to_string()).await.unwrap();

        let imported = store.import_json(&path).await.unwrap();
        tokio::fs::remove_file(&path).await.ok();
        assert_eq!(imported, 3);

        let kept = store.record_for(&id("B0BOTTLE01")).await.unwrap().unwrap();
        assert_eq!(kept.last_price, Some(100.0));

        let legacy = store.record_for(&id("B0LEGACY01")).await.unwrap().unwrap();
        assert_eq!(legacy.last_price, Some(499.0));
        assert_eq!(legacy.title.as_deref(), Some("Old deal"));
        assert_eq!(legacy.last_posted_at, DateTime::from_timestamp(1_790_000_000, 0));

        let first_only = store.record_for(&id("B0LEGACY03")).await.unwrap().unwrap();
        assert_eq!(first_only.first_seen_at, first_only.last_posted_at);
    }

    #[test]
    fn normalizes_timestamp_formats() {
        let expected = Utc.with_ymd_and_hms(2026, 10, 1, 12, 0, 0).unwrap();

        assert_eq!(normalize_timestamp("1790856000"), Some(expected));
        assert_eq!(normalize_timestamp("1790856000000"), Some(expected));
        assert_eq!(normalize_timestamp("2026-10-01T12:00:00Z"), Some(expected));
        assert_eq!(normalize_timestamp("2026-10-01T17:30:00+05:30"), Some(expected));
        assert_eq!(normalize_timestamp("2026-10-01 12:00:00"), Some(expected));
        assert_eq!(normalize_timestamp("2026-10-01T12:00:00.000"), Some(expected));
        assert_eq!(
            normalize_timestamp("2026-10-01"),
            Some(Utc.with_ymd_and_hms(2026, 10, 1, 0, 0, 0).unwrap())
        );
        assert_eq!(normalize_timestamp(""), None);
        assert_eq!(normalize_timestamp("-5"), None);
        assert_eq!(normalize_timestamp("soon"), None);
    }
}
