//! Stream configuration repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::models::StreamConfigDbModel;
use crate::domain::{StreamConfig, StreamId};
use crate::Result;

/// Read access to stream configurations.
#[async_trait]
pub trait StreamConfigDao: Send + Sync {
    /// Load a configuration; `None` when it has been deleted.
    async fn get(&self, id: StreamId) -> Result<Option<StreamConfig>>;
}

/// SQLx implementation of StreamConfigDao.
pub struct SqlxStreamConfigDao {
    pool: SqlitePool,
}

impl SqlxStreamConfigDao {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or replace a configuration.
    pub async fn save(&self, config: &StreamConfig) -> Result<()> {
        let row = StreamConfigDbModel::from_domain(config)?;
        sqlx::query(
            r#"
            INSERT INTO datum_stream
                (user_id, config_id, kind, object_id, source_id, service_ident, schedule, service_props)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (user_id, config_id) DO UPDATE SET
                kind = excluded.kind,
                object_id = excluded.object_id,
                source_id = excluded.source_id,
                service_ident = excluded.service_ident,
                schedule = excluded.schedule,
                service_props = excluded.service_props
            "#,
        )
        .bind(row.user_id)
        .bind(row.config_id)
        .bind(&row.kind)
        .bind(row.object_id)
        .bind(&row.source_id)
        .bind(&row.service_ident)
        .bind(&row.schedule)
        .bind(&row.service_props)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete(&self, id: StreamId) -> Result<()> {
        sqlx::query("DELETE FROM datum_stream WHERE user_id = ? AND config_id = ?")
            .bind(id.user_id)
            .bind(id.config_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl StreamConfigDao for SqlxStreamConfigDao {
    async fn get(&self, id: StreamId) -> Result<Option<StreamConfig>> {
        sqlx::query_as::<_, StreamConfigDbModel>(
            "SELECT * FROM datum_stream WHERE user_id = ? AND config_id = ?",
        )
        .bind(id.user_id)
        .bind(id.config_id)
        .fetch_optional(&self.pool)
        .await?
        .map(StreamConfigDbModel::into_domain)
        .transpose()
    }
}
