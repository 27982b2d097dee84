// ═══════════════════════════════════════════════════════════════════════════════
// IMPORTS
// ═══════════════════════════════════════════════════════════════════════════════

use regex::Regex;
use serde::{Deserialize, Serialize};
use sqlx::PgExecutor;
use sqlx::prelude::FromRow;
use tracing::debug;
use utoipa::ToSchema;

use crate::error::{DatabaseError, DomainError, ResultExt};
use crate::message::{Message, PgMessageTransaction};

// ═══════════════════════════════════════════════════════════════════════════════
// MODELS
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Mention {
    pub id: i64,
    pub channel_id: i64,
    pub message_id: i64,
    pub mentioned_by_id: i64,
    pub user_id: i64,
}

impl Mention {
    pub fn same_identity(&self, other: &Mention) -> bool {
        self.message_id == other.message_id && self.user_id == other.user_id
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// EXTRACTION
// ═══════════════════════════════════════════════════════════════════════════════

pub const DEFAULT_MENTION_PATTERN: &str = r"<([@#])(\d+)((?:\s)([^>]+))?>";

const SIGIL_GROUP: usize = 1;
const ID_GROUP: usize = 2;
const USER_SIGIL: &str = "@";

#[derive(Debug, Clone)]
pub struct MentionExtractor {
    pattern: Regex,
}

impl MentionExtractor {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
        })
    }

    pub fn extract(&self, message: &Message) -> Vec<Mention> {
        let mut mentions: Vec<Mention> = Vec::new();

        for captures in self.pattern.captures_iter(&message.body) {
            let is_user = captures
                .get(SIGIL_GROUP)
                .is_some_and(|sigil| sigil.as_str() == USER_SIGIL);
            if !is_user {
                continue;
            }

            let Some(user_id) = captures
                .get(ID_GROUP)
                .and_then(|id| id.as_str().parse::<i64>().ok())
            else {
                continue;
            };

            if mentions.iter().any(|m| m.user_id == user_id) {
                continue;
            }

            mentions.push(Mention {
                id: 0,
                channel_id: message.channel_id,
                message_id: message.id,
                mentioned_by_id: message.user_id,
                user_id,
            });
        }

        mentions
    }
}

impl Default for MentionExtractor {
    fn default() -> Self {
        Self {
            pattern: Regex::new(DEFAULT_MENTION_PATTERN).expect("default mention pattern compiles"),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// DIFF
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default, PartialEq, Eq)]
pub struct MentionDiff {
    pub add: Vec<Mention>,
    pub remove: Vec<Mention>,
}

pub fn diff_mentions(existing: &[Mention], desired: &[Mention]) -> MentionDiff {
    let add = desired
        .iter()
        .filter(|d| !existing.iter().any(|e| e.same_identity(d)))
        .cloned()
        .collect();

    let remove = existing
        .iter()
        .filter(|e| !desired.iter().any(|d| d.same_identity(e)))
        .cloned()
        .collect();

    MentionDiff { add, remove }
}

// ═══════════════════════════════════════════════════════════════════════════════
// REPOSITORY
// ═══════════════════════════════════════════════════════════════════════════════

pub trait MentionTransaction: Send + Sync {
    async fn find_mentions_by_message_id(
        &mut self,
        message_id: i64,
    ) -> Result<Vec<Mention>, DatabaseError>;

    async fn create_mention(&mut self, mention: &Mention) -> Result<Mention, DatabaseError>;

    async fn delete_mention(&mut self, mention_id: i64) -> Result<(), DatabaseError>;

    async fn delete_message_mentions(&mut self, message_id: i64) -> Result<u64, DatabaseError>;
}

pub(crate) async fn fetch_mentions_by_message_ids<'e, E: PgExecutor<'e>>(
    executor: E,
    message_ids: &[i64],
) -> Result<Vec<Mention>, DatabaseError> {
    let mentions = sqlx::query_as::<_, Mention>(
        r#"SELECT id, channel_id, message_id, mentioned_by_id, user_id
           FROM mentions
           WHERE message_id = ANY($1)
           ORDER BY message_id, id"#,
    )
    .bind(message_ids)
    .fetch_all(executor)
    .await?;

    Ok(mentions)
}

impl MentionTransaction for PgMessageTransaction {
    async fn find_mentions_by_message_id(
        &mut self,
        message_id: i64,
    ) -> Result<Vec<Mention>, DatabaseError> {
        fetch_mentions_by_message_ids(&mut *self.transaction, &[message_id]).await
    }

    async fn create_mention(&mut self, mention: &Mention) -> Result<Mention, DatabaseError> {
        let created = sqlx::query_as::<_, Mention>(
            r#"INSERT INTO mentions (channel_id, message_id, mentioned_by_id, user_id)
               VALUES ($1, $2, $3, $4)
               RETURNING id, channel_id, message_id, mentioned_by_id, user_id"#,
        )
        .bind(mention.channel_id)
        .bind(mention.message_id)
        .bind(mention.mentioned_by_id)
        .bind(mention.user_id)
        .fetch_one(&mut *self.transaction)
        .await?;

        Ok(created)
    }

    async fn delete_mention(&mut self, mention_id: i64) -> Result<(), DatabaseError> {
        sqlx::query("DELETE FROM mentions WHERE id = $1")
            .bind(mention_id)
            .execute(&mut *self.transaction)
            .await?;

        Ok(())
    }

    async fn delete_message_mentions(&mut self, message_id: i64) -> Result<u64, DatabaseError> {
        let result = sqlx::query("DELETE FROM mentions WHERE message_id = $1")
            .bind(message_id)
            .execute(&mut *self.transaction)
            .await?;

        Ok(result.rows_affected())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SYNCHRONIZATION
// ═══════════════════════════════════════════════════════════════════════════════

pub async fn sync_mentions<T: MentionTransaction>(
    tx: &mut T,
    message_id: i64,
    desired: &[Mention],
) -> Result<(), DomainError> {
    let existing = tx
        .find_mentions_by_message_id(message_id)
        .await
        .context("Could not update mentions")?;

    if desired.is_empty() {
        if !existing.is_empty() {
            tx.delete_message_mentions(message_id)
                .await
                .context("Could not delete mentions")?;
        }
        return Ok(());
    }

    let diff = diff_mentions(&existing, desired);

    for mention in &diff.add {
        tx.create_mention(mention)
            .await
            .context("Could not create mentions")?;
    }

    for mention in &diff.remove {
        tx.delete_mention(mention.id)
            .await
            .context("Could not delete mentions")?;
    }

    debug!(
        message_id,
        added = diff.add.len(),
        removed = diff.remove.len(),
        "Mentions synchronized"
    );

    Ok(())
}
