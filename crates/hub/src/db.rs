use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::str::FromStr;

use crate::normalize::TelemetryRecord;

/// Document store for canonical telemetry records.
#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

/// A stored record: the canonical document plus its row id.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredRecord {
    pub id: i64,
    #[serde(flatten)]
    pub record: TelemetryRecord,
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/home/pi/garden/garden.db?mode=rwc"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal);

        // Every connection to ":memory:" is its own database; keep exactly one
        // and never recycle it.
        let pool = if db_url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        }
        .connect_with(options)
        .await
        .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    #[cfg(test)]
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    pub async fn insert_record(&self, record: &TelemetryRecord) -> Result<i64> {
        let doc = serde_json::to_string(record).context("failed to encode record")?;
        let res = sqlx::query(
            r#"
            INSERT INTO sensor_data (garden_id, recorded_at, doc)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(&record.garden_id)
        .bind(&record.timestamp)
        .bind(doc)
        .execute(&self.pool)
        .await
        .context("insert_record failed")?;
        Ok(res.last_insert_rowid())
    }

    /// Newest first.
    pub async fn recent(&self, limit: i64) -> Result<Vec<StoredRecord>> {
        let rows: Vec<(i64, String)> = sqlx::query_as(
            r#"
            SELECT id, doc
            FROM sensor_data
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("recent failed")?;

        rows.into_iter().map(decode_row).collect()
    }

    pub async fn latest(&self) -> Result<Option<StoredRecord>> {
        let row: Option<(i64, String)> = sqlx::query_as(
            r#"
            SELECT id, doc
            FROM sensor_data
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await
        .context("latest failed")?;

        row.map(decode_row).transpose()
    }

    /// Returns how many records were removed.
    pub async fn delete_all(&self) -> Result<u64> {
        let res = sqlx::query("DELETE FROM sensor_data")
            .execute(&self.pool)
            .await
            .context("delete_all failed")?;
        Ok(res.rows_affected())
    }

    pub async fn count(&self) -> Result<i64> {
        let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM sensor_data")
            .fetch_one(&self.pool)
            .await
            .context("count failed")?;
        Ok(n)
    }
}

fn decode_row((id, doc): (i64, String)) -> Result<StoredRecord> {
    let record = serde_json::from_str(&doc)
        .with_context(|| format!("sensor_data row {id} holds an invalid document"))?;
    Ok(StoredRecord { id, record })
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::Normalizer;
    use serde_json::json;
    use time::macros::datetime;

    async fn test_db() -> Db {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db
    }

    fn record(raw: serde_json::Value) -> TelemetryRecord {
        Normalizer::new("KBG001").normalize_at(&raw, datetime!(2024-05-01 07:30:00 UTC))
    }

    #[tokio::test]
    async fn empty_store() {
        let db = test_db().await;
        assert_eq!(db.count().await.unwrap(), 0);
        assert!(db.latest().await.unwrap().is_none());
        assert!(db.recent(50).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn insert_then_latest_round_trips_document() {
        let db = test_db().await;
        let rec = record(json!({"suhu": 30, "kelembapan_udara": 55, "cahaya": 80}));
        let id = db.insert_record(&rec).await.unwrap();

        let latest = db.latest().await.unwrap().unwrap();
        assert_eq!(latest.id, id);
        assert_eq!(latest.record, rec);
    }

    #[tokio::test]
    async fn recent_is_newest_first_and_limited() {
        let db = test_db().await;
        for t in 0..5 {
            db.insert_record(&record(json!({"suhu": t}))).await.unwrap();
        }

        let recent = db.recent(3).await.unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].record.temperature, Some(4.into()));
        assert_eq!(recent[2].record.temperature, Some(2.into()));
        assert!(recent[0].id > recent[1].id);
    }

    #[tokio::test]
    async fn delete_all_reports_count() {
        let db = test_db().await;
        for _ in 0..3 {
            db.insert_record(&record(json!({}))).await.unwrap();
        }
        assert_eq!(db.delete_all().await.unwrap(), 3);
        assert_eq!(db.count().await.unwrap(), 0);
        assert_eq!(db.delete_all().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn stored_record_serializes_flat() {
        let db = test_db().await;
        let id = db
            .insert_record(&record(json!({"garden_id": "KBG003", "co2": 410})))
            .await
            .unwrap();
        let latest = db.latest().await.unwrap().unwrap();
        assert_eq!(
            serde_json::to_value(&latest).unwrap(),
            json!({
                "id": id,
                "garden_id": "KBG003",
                "co2": 410,
                "timestamp": "2024-05-01T07:30:00Z"
            })
        );
    }

    #[tokio::test]
    async fn absent_fields_are_not_stored_as_null() {
        let db = test_db().await;
        db.insert_record(&record(json!({"suhu": 21}))).await.unwrap();
        let (doc,): (String,) = sqlx::query_as("SELECT doc FROM sensor_data")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert!(!doc.contains("null"), "doc = {doc}");
    }
}
