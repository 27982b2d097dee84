use serde::{Deserialize, Serialize};
use sqlx::prelude::FromRow;
use time::OffsetDateTime;
use utoipa::ToSchema;

use crate::db::Postgre;
use crate::error::DatabaseError;

#[derive(Debug, Clone, FromRow, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_id: i64,
    pub session_token: String,
    pub user_id: i64,
    #[serde(with = "time::serde::iso8601")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::iso8601::option")]
    pub expires_at: Option<OffsetDateTime>,
}

impl Session {
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at < now)
    }
}

pub trait SessionRepository: Send + Sync + Clone {
    async fn find_session(&self, session_token: &str) -> Result<Option<Session>, DatabaseError>;
}

impl SessionRepository for Postgre {
    async fn find_session(&self, session_token: &str) -> Result<Option<Session>, DatabaseError> {
        let result = sqlx::query_as::<_, Session>(
            r#"SELECT
                   session_id,
                   session_token,
                   user_id,
                   created_at,
                   expires_at
               FROM sessions
               WHERE session_token = $1"#,
        )
        .bind(session_token)
        .fetch_optional(&self.pool)
        .await?;

        Ok(result)
    }
}
