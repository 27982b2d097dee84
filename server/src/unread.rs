use serde::{Deserialize, Serialize};
use sqlx::prelude::FromRow;
use utoipa::ToSchema;

use crate::error::DatabaseError;
use crate::message::PgMessageTransaction;

#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Unread {
    pub user_id: i64,
    pub channel_id: i64,
    pub thread_id: i64,
    pub last_message_id: i64,
    pub count: i64,
}

pub trait UnreadTransaction: Send + Sync {
    async fn increment_unread(
        &mut self,
        channel_id: i64,
        thread_id: i64,
        author_id: i64,
    ) -> Result<(), DatabaseError>;

    async fn decrement_unread(
        &mut self,
        channel_id: i64,
        thread_id: i64,
        author_id: i64,
    ) -> Result<(), DatabaseError>;

    async fn count_from_message_id(
        &mut self,
        channel_id: i64,
        thread_id: i64,
        last_message_id: i64,
    ) -> Result<i64, DatabaseError>;

    async fn record_read(&mut self, unread: &Unread) -> Result<(), DatabaseError>;
}

impl UnreadTransaction for PgMessageTransaction {
    async fn increment_unread(
        &mut self,
        channel_id: i64,
        thread_id: i64,
        author_id: i64,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            r#"INSERT INTO unreads (user_id, channel_id, thread_id, count)
               SELECT cm.user_id, $1, $2, 1
               FROM channel_members cm
               WHERE cm.channel_id = $1 AND cm.user_id <> $3
               ON CONFLICT (user_id, channel_id, thread_id)
               DO UPDATE SET count = unreads.count + 1"#,
        )
        .bind(channel_id)
        .bind(thread_id)
        .bind(author_id)
        .execute(&mut *self.transaction)
        .await?;

        Ok(())
    }

    async fn decrement_unread(
        &mut self,
        channel_id: i64,
        thread_id: i64,
        author_id: i64,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            r#"UPDATE unreads
               SET count = GREATEST(count - 1, 0)
               WHERE channel_id = $1 AND thread_id = $2 AND user_id <> $3"#,
        )
        .bind(channel_id)
        .bind(thread_id)
        .bind(author_id)
        .execute(&mut *self.transaction)
        .await?;

        Ok(())
    }

    async fn count_from_message_id(
        &mut self,
        channel_id: i64,
        thread_id: i64,
        last_message_id: i64,
    ) -> Result<i64, DatabaseError> {
        let count: i64 = sqlx::query_scalar(
            r#"SELECT COUNT(*)
               FROM messages
               WHERE channel_id = $1
               AND COALESCE(reply_to, 0) = $2
               AND id > $3"#,
        )
        .bind(channel_id)
        .bind(thread_id)
        .bind(last_message_id)
        .fetch_one(&mut *self.transaction)
        .await?;

        Ok(count)
    }

    async fn record_read(&mut self, unread: &Unread) -> Result<(), DatabaseError> {
        sqlx::query(
            r#"INSERT INTO unreads (user_id, channel_id, thread_id, last_message_id, count)
               VALUES ($1, $2, $3, $4, $5)
               ON CONFLICT (user_id, channel_id, thread_id)
               DO UPDATE SET last_message_id = EXCLUDED.last_message_id, count = EXCLUDED.count"#,
        )
        .bind(unread.user_id)
        .bind(unread.channel_id)
        .bind(unread.thread_id)
        .bind(unread.last_message_id)
        .bind(unread.count)
        .execute(&mut *self.transaction)
        .await?;

        Ok(())
    }
}
