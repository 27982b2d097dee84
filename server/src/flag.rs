// ═══════════════════════════════════════════════════════════════════════════════
// IMPORTS
// ═══════════════════════════════════════════════════════════════════════════════

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use sqlx::PgExecutor;
use sqlx::prelude::FromRow;
use time::OffsetDateTime;
use utoipa::ToSchema;

use crate::error::{DatabaseError, DomainError};
use crate::message::PgMessageTransaction;

// ═══════════════════════════════════════════════════════════════════════════════
// MODELS
// ═══════════════════════════════════════════════════════════════════════════════

pub const PIN_FLAG: &str = "pin";
pub const BOOKMARK_FLAG: &str = "bookmark";

const MAX_FREE_REACTION_LENGTH: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FlagKind {
    Reaction(String),
    PinToChannel,
    Bookmark,
}

impl FlagKind {
    pub fn from_reaction_input(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.is_empty() {
            return FlagKind::PinToChannel;
        }
        FlagKind::Reaction(raw.to_string())
    }

    pub fn as_str(&self) -> &str {
        match self {
            FlagKind::Reaction(reaction) => reaction,
            FlagKind::PinToChannel => PIN_FLAG,
            FlagKind::Bookmark => BOOKMARK_FLAG,
        }
    }

    /// Pins belong to the channel, everything else to the flagging user.
    pub fn owner_for(&self, user_id: i64) -> i64 {
        match self {
            FlagKind::PinToChannel => 0,
            _ => user_id,
        }
    }

    pub fn is_private(&self) -> bool {
        matches!(self, FlagKind::Bookmark)
    }
}

impl From<String> for FlagKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            PIN_FLAG => FlagKind::PinToChannel,
            BOOKMARK_FLAG => FlagKind::Bookmark,
            _ => FlagKind::Reaction(value),
        }
    }
}

impl From<FlagKind> for String {
    fn from(kind: FlagKind) -> Self {
        match kind {
            FlagKind::Reaction(reaction) => reaction,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for FlagKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MessageFlag {
    pub id: i64,
    pub user_id: i64,
    pub channel_id: i64,
    pub message_id: i64,
    #[sqlx(try_from = "String")]
    #[schema(value_type = String)]
    pub kind: FlagKind,
    #[serde(with = "time::serde::iso8601")]
    pub created_at: OffsetDateTime,
    #[sqlx(skip)]
    #[serde(with = "time::serde::iso8601::option", default)]
    pub deleted_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagToggle {
    Add,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlagPlan {
    Skip,
    Create,
    Delete(i64),
}

pub fn plan_toggle(existing: Option<&MessageFlag>, toggle: FlagToggle) -> FlagPlan {
    match (existing, toggle) {
        (None, FlagToggle::Remove) => FlagPlan::Skip,
        (Some(_), FlagToggle::Add) => FlagPlan::Skip,
        (None, FlagToggle::Add) => FlagPlan::Create,
        (Some(flag), FlagToggle::Remove) => FlagPlan::Delete(flag.id),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// REACTION POLICY
// ═══════════════════════════════════════════════════════════════════════════════

const DEFAULT_REACTIONS: &[&str] = &["👍", "👎", "😄", "🎉", "😕", "❤️", "🚀", "👀", "✅"];

#[derive(Debug, Clone)]
pub struct ReactionPolicy {
    allowed: Option<HashSet<String>>,
}

impl ReactionPolicy {
    pub fn allow_list<I: IntoIterator<Item = String>>(reactions: I) -> Self {
        Self {
            allowed: Some(reactions.into_iter().collect()),
        }
    }

    pub fn unrestricted() -> Self {
        Self { allowed: None }
    }

    pub fn permits(&self, reaction: &str) -> bool {
        if reaction == PIN_FLAG || reaction == BOOKMARK_FLAG {
            return false;
        }
        match &self.allowed {
            Some(allowed) => allowed.contains(reaction),
            None => {
                !reaction.is_empty()
                    && reaction.chars().count() <= MAX_FREE_REACTION_LENGTH
                    && !reaction.chars().any(char::is_whitespace)
            }
        }
    }

    pub fn check(&self, kind: &FlagKind) -> Result<(), DomainError> {
        match kind {
            FlagKind::Reaction(reaction) if !self.permits(reaction) => {
                Err(DomainError::ReactionNotAllowed(reaction.clone()))
            }
            _ => Ok(()),
        }
    }
}

impl Default for ReactionPolicy {
    fn default() -> Self {
        Self::allow_list(DEFAULT_REACTIONS.iter().map(|r| r.to_string()))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// REPOSITORY
// ═══════════════════════════════════════════════════════════════════════════════

pub trait FlagTransaction: Send + Sync {
    async fn find_flag(
        &mut self,
        message_id: i64,
        owner_id: i64,
        kind: &FlagKind,
    ) -> Result<Option<MessageFlag>, DatabaseError>;

    async fn create_flag(
        &mut self,
        owner_id: i64,
        channel_id: i64,
        message_id: i64,
        kind: &FlagKind,
    ) -> Result<Option<MessageFlag>, DatabaseError>;

    async fn delete_flag(&mut self, flag_id: i64) -> Result<(), DatabaseError>;

    async fn delete_message_flags(&mut self, message_id: i64) -> Result<u64, DatabaseError>;
}

pub(crate) async fn fetch_flags_by_message_ids<'e, E: PgExecutor<'e>>(
    executor: E,
    message_ids: &[i64],
) -> Result<Vec<MessageFlag>, DatabaseError> {
    let flags = sqlx::query_as::<_, MessageFlag>(
        r#"SELECT id, user_id, channel_id, message_id, flag AS kind, created_at
           FROM message_flags
           WHERE message_id = ANY($1)
           ORDER BY message_id, id"#,
    )
    .bind(message_ids)
    .fetch_all(executor)
    .await?;

    Ok(flags)
}

impl FlagTransaction for PgMessageTransaction {
    async fn find_flag(
        &mut self,
        message_id: i64,
        owner_id: i64,
        kind: &FlagKind,
    ) -> Result<Option<MessageFlag>, DatabaseError> {
        let flag = sqlx::query_as::<_, MessageFlag>(
            r#"SELECT id, user_id, channel_id, message_id, flag AS kind, created_at
               FROM message_flags
               WHERE message_id = $1 AND user_id = $2 AND flag = $3
               FOR UPDATE"#,
        )
        .bind(message_id)
        .bind(owner_id)
        .bind(kind.as_str())
        .fetch_optional(&mut *self.transaction)
        .await?;

        Ok(flag)
    }

    async fn create_flag(
        &mut self,
        owner_id: i64,
        channel_id: i64,
        message_id: i64,
        kind: &FlagKind,
    ) -> Result<Option<MessageFlag>, DatabaseError> {
        let flag = sqlx::query_as::<_, MessageFlag>(
            r#"INSERT INTO message_flags (user_id, channel_id, message_id, flag)
               VALUES ($1, $2, $3, $4)
               ON CONFLICT ON CONSTRAINT unique_message_flag DO NOTHING
               RETURNING id, user_id, channel_id, message_id, flag AS kind, created_at"#,
        )
        .bind(owner_id)
        .bind(channel_id)
        .bind(message_id)
        .bind(kind.as_str())
        .fetch_optional(&mut *self.transaction)
        .await?;

        Ok(flag)
    }

    async fn delete_flag(&mut self, flag_id: i64) -> Result<(), DatabaseError> {
        sqlx::query("DELETE FROM message_flags WHERE id = $1")
            .bind(flag_id)
            .execute(&mut *self.transaction)
            .await?;

        Ok(())
    }

    async fn delete_message_flags(&mut self, message_id: i64) -> Result<u64, DatabaseError> {
        let result = sqlx::query("DELETE FROM message_flags WHERE message_id = $1")
            .bind(message_id)
            .execute(&mut *self.transaction)
            .await?;

        Ok(result.rows_affected())
    }
}
