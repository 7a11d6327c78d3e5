//! User event persistence.

use async_trait::async_trait;
use sqlx::SqlitePool;
use tracing::error;

use crate::database::time::{datetime_to_ms, ms_to_datetime};
use crate::events::{EventSink, TracingEventSink, UserEvent};
use crate::Result;

/// Event sink that appends to the `user_event` table.
///
/// Write failures are logged and dropped; the event is still echoed to the log.
pub struct SqlxEventSink {
    pool: SqlitePool,
}

impl SqlxEventSink {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn insert(&self, event: &UserEvent) -> Result<()> {
        let tags = serde_json::to_string(&event.tags)?;
        let data = serde_json::to_string(&event.data)?;
        sqlx::query(
            "INSERT INTO user_event (user_id, tags, message, data, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(event.user_id)
        .bind(&tags)
        .bind(&event.message)
        .bind(&data)
        .bind(datetime_to_ms(event.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Most recent events for `user_id`, newest first.
    pub async fn list_for_user(&self, user_id: i64, limit: i64) -> Result<Vec<UserEvent>> {
        let rows: Vec<(i64, String, String, String, i64)> = sqlx::query_as(
            r#"
            SELECT user_id, tags, message, data, created_at FROM user_event
            WHERE user_id = ? ORDER BY created_at DESC, id DESC LIMIT ?
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(user_id, tags, message, data, created_at)| -> Result<UserEvent> {
                Ok(UserEvent {
                    user_id,
                    tags: serde_json::from_str(&tags)?,
                    message,
                    data: serde_json::from_str(&data)?,
                    created_at: ms_to_datetime(created_at),
                })
            })
            .collect()
    }
}

#[async_trait]
impl EventSink for SqlxEventSink {
    async fn add_event(&self, event: UserEvent) {
        if let Err(e) = self.insert(&event).await {
            error!(user_id = event.user_id, error = %e, "Failed to store user event");
        }
        TracingEventSink.add_event(event).await;
    }
}
