use serde::{Deserialize, Serialize};
use sqlx::prelude::FromRow;
use time::OffsetDateTime;
use utoipa::ToSchema;

use crate::db::Postgre;
use crate::error::DatabaseError;

#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub user_id: i64,
    pub username: String,
    #[serde(with = "time::serde::iso8601")]
    pub created_at: OffsetDateTime,
}

pub trait UserDirectory: Send + Sync + Clone {
    async fn find_users_by_ids(&self, user_ids: &[i64]) -> Result<Vec<User>, DatabaseError>;
}

impl UserDirectory for Postgre {
    async fn find_users_by_ids(&self, user_ids: &[i64]) -> Result<Vec<User>, DatabaseError> {
        let users = sqlx::query_as::<_, User>(
            r#"SELECT user_id, username, created_at
               FROM users
               WHERE user_id = ANY($1)
               ORDER BY user_id"#,
        )
        .bind(user_ids)
        .fetch_all(&self.pool)
        .await?;

        Ok(users)
    }
}
