// ═══════════════════════════════════════════════════════════════════════════════
// IMPORTS
// ═══════════════════════════════════════════════════════════════════════════════

use serde::{Deserialize, Serialize};
use sqlx::PgExecutor;
use sqlx::prelude::FromRow;
use time::OffsetDateTime;
use utoipa::ToSchema;

use crate::db::Postgre;
use crate::error::DatabaseError;

// ═══════════════════════════════════════════════════════════════════════════════
// MODELS
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub channel_id: i64,
    pub channel_name: String,
    #[serde(with = "time::serde::iso8601::option")]
    pub archived_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::iso8601::option")]
    pub deleted_at: Option<OffsetDateTime>,
}

impl Channel {
    pub fn is_valid(&self) -> bool {
        self.channel_id > 0 && self.deleted_at.is_none()
    }
}

pub(crate) async fn fetch_channel_by_id<'e, E: PgExecutor<'e>>(
    executor: E,
    channel_id: i64,
) -> Result<Option<Channel>, DatabaseError> {
    let channel = sqlx::query_as::<_, Channel>(
        r#"SELECT channel_id, channel_name, archived_at, deleted_at
           FROM channels
           WHERE channel_id = $1"#,
    )
    .bind(channel_id)
    .fetch_optional(executor)
    .await?;

    Ok(channel)
}

// ═══════════════════════════════════════════════════════════════════════════════
// ACCESS
// ═══════════════════════════════════════════════════════════════════════════════

pub trait ChannelAccess: Send + Sync + Clone {
    async fn can_read(&self, user_id: i64, channel_id: i64) -> Result<bool, DatabaseError>;

    async fn can_write(&self, user_id: i64, channel_id: i64) -> Result<bool, DatabaseError>;
}

impl ChannelAccess for Postgre {
    async fn can_read(&self, user_id: i64, channel_id: i64) -> Result<bool, DatabaseError> {
        let is_member: bool = sqlx::query_scalar(
            r#"SELECT EXISTS (
                SELECT 1 FROM channel_members
                WHERE channel_id = $1 AND user_id = $2
            )"#,
        )
        .bind(channel_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(is_member)
    }

    async fn can_write(&self, user_id: i64, channel_id: i64) -> Result<bool, DatabaseError> {
        let is_member: bool = sqlx::query_scalar(
            r#"SELECT EXISTS (
                SELECT 1 FROM channel_members cm
                JOIN channels c ON c.channel_id = cm.channel_id
                WHERE cm.channel_id = $1 AND cm.user_id = $2
                AND c.archived_at IS NULL AND c.deleted_at IS NULL
            )"#,
        )
        .bind(channel_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(is_member)
    }
}
