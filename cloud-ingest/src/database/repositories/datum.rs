//! Datum repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::database::models::DatumDbModel;
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time::datetime_to_ms;
use crate::domain::{Datum, DatumDao, DatumSink, StreamKey};
use crate::Result;

/// SQLx implementation of DatumDao.
///
/// Node and location datum share one table keyed by
/// `(kind, object_id, source_id, ts)`; storing is an upsert on that key.
pub struct SqlxDatumDao {
    pool: SqlitePool,
}

impl SqlxDatumDao {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn upsert(&self, datum: &Datum) -> Result<()> {
        let row = DatumDbModel::from_domain(datum)?;
        retry_on_sqlite_busy("upsert_datum", || async {
            sqlx::query(
                r#"
                INSERT INTO datum (kind, object_id, source_id, ts, samples)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT (kind, object_id, source_id, ts) DO UPDATE SET
                    samples = excluded.samples
                "#,
            )
            .bind(&row.kind)
            .bind(row.object_id)
            .bind(&row.source_id)
            .bind(row.ts)
            .bind(&row.samples)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    /// Total number of stored rows.
    pub async fn count(&self) -> Result<i64> {
        let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM datum")
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }
}

#[async_trait]
impl DatumSink for SqlxDatumDao {
    async fn store_node_datum(&self, datum: &Datum) -> Result<()> {
        self.upsert(datum).await
    }

    async fn store_location_datum(&self, datum: &Datum) -> Result<()> {
        self.upsert(datum).await
    }
}

#[async_trait]
impl DatumDao for SqlxDatumDao {
    async fn find_stream_datum(
        &self,
        stream: &StreamKey,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Datum>> {
        let rows = sqlx::query_as::<_, DatumDbModel>(
            r#"
            SELECT * FROM datum
            WHERE kind = ? AND object_id = ? AND source_id = ? AND ts >= ? AND ts < ?
            ORDER BY ts
            "#,
        )
        .bind(stream.kind.as_key())
        .bind(stream.object_id)
        .bind(&stream.source_id)
        .bind(datetime_to_ms(start))
        .bind(datetime_to_ms(end))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(DatumDbModel::into_domain).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{init_pool_with_size, run_migrations};
    use crate::domain::{DatumSamples, ObjectKind};
    use chrono::{Duration, TimeZone};

    #[tokio::test]
    async fn test_store_is_idempotent_upsert() {
        let pool = init_pool_with_size("sqlite::memory:", 1).await.unwrap();
        run_migrations(&pool).await.unwrap();
        let dao = SqlxDatumDao::new(pool);

        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        let mut samples = DatumSamples::default();
        samples.put_instantaneous("watts", 120.5);
        let mut datum = Datum::new(ObjectKind::Node, 11, "inv/1", ts, samples);

        datum.persist(&dao).await.unwrap();
        datum.persist(&dao).await.unwrap();
        assert_eq!(dao.count().await.unwrap(), 1);

        datum.samples.put_instantaneous("watts", 130.0);
        datum.persist(&dao).await.unwrap();
        assert_eq!(dao.count().await.unwrap(), 1);

        let found = dao
            .find_stream_datum(&datum.stream_key(), ts, ts + Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(found, vec![datum]);
    }
}
