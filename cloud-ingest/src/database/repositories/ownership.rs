//! Node ownership lookups used by the rake authorization check.

use async_trait::async_trait;
use chrono_tz::Tz;
use sqlx::SqlitePool;
use tracing::warn;

use crate::Result;

/// Resolves the owning user and local time zone of a node.
#[async_trait]
pub trait OwnershipResolver: Send + Sync {
    /// `None` when the node is unknown.
    async fn owner_and_zone(&self, object_id: i64) -> Result<Option<(i64, Tz)>>;
}

/// SQLx implementation of OwnershipResolver.
pub struct SqlxOwnershipResolver {
    pool: SqlitePool,
}

impl SqlxOwnershipResolver {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn save(&self, node_id: i64, user_id: i64, zone: Tz) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO node_ownership (node_id, user_id, time_zone) VALUES (?, ?, ?)
            ON CONFLICT (node_id) DO UPDATE SET
                user_id = excluded.user_id,
                time_zone = excluded.time_zone
            "#,
        )
        .bind(node_id)
        .bind(user_id)
        .bind(zone.name())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl OwnershipResolver for SqlxOwnershipResolver {
    async fn owner_and_zone(&self, object_id: i64) -> Result<Option<(i64, Tz)>> {
        let row: Option<(i64, String)> =
            sqlx::query_as("SELECT user_id, time_zone FROM node_ownership WHERE node_id = ?")
                .bind(object_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(user_id, zone)| {
            let tz = zone.parse::<Tz>().unwrap_or_else(|_| {
                warn!(node_id = object_id, zone = %zone, "Unknown node time zone, using UTC");
                Tz::UTC
            });
            (user_id, tz)
        }))
    }
}
