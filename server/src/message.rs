// ═══════════════════════════════════════════════════════════════════════════════
// IMPORTS
// ═══════════════════════════════════════════════════════════════════════════════

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sqlx::prelude::FromRow;
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use utoipa::{IntoParams, ToSchema};

use crate::auth::Session;
use crate::channel::{Channel, ChannelAccess, fetch_channel_by_id};
use crate::config::MessagingConfig;
use crate::db::Postgre;
use crate::error::{ApiError, DatabaseError, DomainError, ResultExt};
use crate::flag::{
    FlagKind, FlagPlan, FlagToggle, FlagTransaction, MessageFlag, fetch_flags_by_message_ids,
    plan_toggle,
};
use crate::mention::{Mention, MentionTransaction, fetch_mentions_by_message_ids, sync_mentions};
use crate::middleware::{AuthorizeService, authorize};
use crate::model::EventPayload;
use crate::outbox::{OutboxSignal, OutboxTransaction};
use crate::unread::{Unread, UnreadTransaction};
use crate::user::{User, UserDirectory};

use axum::Json;
use axum::http::StatusCode;
use axum::{
    extract::{Extension, Path, Query, State},
    middleware::from_fn_with_state,
};
use utoipa_axum::{router::OpenApiRouter, routes};

// ═══════════════════════════════════════════════════════════════════════════════
// MODELS
// ═══════════════════════════════════════════════════════════════════════════════

pub const DEFAULT_PAGE_SIZE: i64 = 50;
pub const MAX_PAGE_SIZE: i64 = 200;

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema, sqlx::Type,
)]
#[sqlx(type_name = "message_kind", rename_all = "snake_case")]
#[serde(rename_all = "camelCase")]
pub enum MessageKind {
    #[default]
    Plain,
    Attachment,
    InlineImage,
    ChannelEvent,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Plain => "plain",
            MessageKind::Attachment => "attachment",
            MessageKind::InlineImage => "inline_image",
            MessageKind::ChannelEvent => "channel_event",
        }
    }

    pub fn is_repliable(&self) -> bool {
        !matches!(self, MessageKind::ChannelEvent)
    }

    pub fn has_attachments(&self) -> bool {
        matches!(self, MessageKind::Attachment | MessageKind::InlineImage)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: i64,
    pub channel_id: i64,
    pub reply_to: Option<i64>,
    pub user_id: i64,
    pub body: String,
    pub kind: MessageKind,
    pub replies: i64,
    #[serde(with = "time::serde::iso8601")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::iso8601::option")]
    pub updated_at: Option<OffsetDateTime>,
    #[sqlx(skip)]
    #[serde(with = "time::serde::iso8601::option", default)]
    pub deleted_at: Option<OffsetDateTime>,

    #[sqlx(skip)]
    #[serde(default)]
    pub author: Option<User>,
    #[sqlx(skip)]
    #[serde(default)]
    pub flags: Vec<MessageFlag>,
    #[sqlx(skip)]
    #[serde(default)]
    pub mentions: Vec<Mention>,
    #[sqlx(skip)]
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[sqlx(skip)]
    #[serde(default)]
    pub participants: Vec<i64>,
}

impl Message {
    pub fn draft(user_id: i64, channel_id: i64, body: String, kind: MessageKind) -> Self {
        Self {
            id: 0,
            channel_id,
            reply_to: None,
            user_id,
            body,
            kind,
            replies: 0,
            created_at: OffsetDateTime::now_utc(),
            updated_at: None,
            deleted_at: None,
            author: None,
            flags: Vec::new(),
            mentions: Vec::new(),
            attachments: Vec::new(),
            participants: Vec::new(),
        }
    }

    pub fn thread_id(&self) -> i64 {
        self.reply_to.unwrap_or(0)
    }

    pub fn is_reply(&self) -> bool {
        self.thread_id() != 0
    }
}

#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub attachment_id: i64,
    pub message_id: i64,
    pub user_id: i64,
    pub file_name: String,
    pub url: String,
    pub preview_url: Option<String>,
    pub mimetype: String,
    pub file_size: i64,
    #[serde(with = "time::serde::iso8601")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct ThreadParticipant {
    pub thread_id: i64,
    pub user_id: i64,
}

#[derive(Debug, Clone, Default)]
pub struct NewMessage {
    pub channel_id: i64,
    pub reply_to: Option<i64>,
    pub body: String,
    pub kind: MessageKind,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageFilter {
    pub channel_id: i64,
    pub current_user_id: i64,
    pub reply_to: Option<i64>,
    pub before_id: Option<i64>,
    pub after_id: Option<i64>,
    pub limit: Option<i64>,
}

impl MessageFilter {
    pub fn limit(&self) -> i64 {
        self.limit
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE)
    }

    pub fn thread_id(&self) -> i64 {
        self.reply_to.unwrap_or(0)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// REPOSITORY
// ═══════════════════════════════════════════════════════════════════════════════

pub trait MessageTransaction:
    MentionTransaction + FlagTransaction + UnreadTransaction + OutboxTransaction
{
    async fn find_messages(&mut self, filter: &MessageFilter) -> Result<Vec<Message>, DatabaseError>;

    async fn find_threads(&mut self, filter: &MessageFilter) -> Result<Vec<Message>, DatabaseError>;

    /// Locks the row until the transaction ends.
    async fn find_message_by_id(&mut self, message_id: i64)
    -> Result<Option<Message>, DatabaseError>;

    async fn find_channel_by_id(&mut self, channel_id: i64)
    -> Result<Option<Channel>, DatabaseError>;

    async fn create_message(&mut self, message: &Message) -> Result<Message, DatabaseError>;

    async fn update_message_body(
        &mut self,
        message_id: i64,
        body: &str,
    ) -> Result<Message, DatabaseError>;

    async fn delete_message(&mut self, message_id: i64) -> Result<(), DatabaseError>;

    async fn increment_reply_count(&mut self, message_id: i64) -> Result<i64, DatabaseError>;

    async fn decrement_reply_count(&mut self, message_id: i64) -> Result<i64, DatabaseError>;

    async fn find_flags_by_message_ids(
        &mut self,
        message_ids: &[i64],
    ) -> Result<Vec<MessageFlag>, DatabaseError>;

    async fn find_mentions_by_message_ids(
        &mut self,
        message_ids: &[i64],
    ) -> Result<Vec<Mention>, DatabaseError>;

    async fn find_attachments_by_message_ids(
        &mut self,
        message_ids: &[i64],
    ) -> Result<Vec<Attachment>, DatabaseError>;

    async fn find_thread_participants(
        &mut self,
        thread_ids: &[i64],
    ) -> Result<Vec<ThreadParticipant>, DatabaseError>;
}

pub trait MessageRepository: Send + Sync + Clone {
    type Transaction: MessageTransaction;

    async fn begin(&self) -> Result<Self::Transaction, DatabaseError>;

    async fn commit(&self, transaction: Self::Transaction) -> Result<(), DatabaseError>;

    async fn rollback(&self, transaction: Self::Transaction) -> Result<(), DatabaseError>;
}

pub struct PgMessageTransaction {
    pub(crate) transaction: sqlx::Transaction<'static, sqlx::Postgres>,
}

const MESSAGE_COLUMNS: &str =
    "id, channel_id, reply_to, user_id, body, kind, replies, created_at, updated_at";

impl MessageTransaction for PgMessageTransaction {
    async fn find_messages(&mut self, filter: &MessageFilter) -> Result<Vec<Message>, DatabaseError> {
        let messages = sqlx::query_as::<_, Message>(&format!(
            r#"SELECT {MESSAGE_COLUMNS}
               FROM messages
               WHERE channel_id = $1
               AND COALESCE(reply_to, 0) = $2
               AND ($3::BIGINT IS NULL OR id < $3)
               AND ($4::BIGINT IS NULL OR id > $4)
               ORDER BY id DESC
               LIMIT $5"#
        ))
        .bind(filter.channel_id)
        .bind(filter.thread_id())
        .bind(filter.before_id)
        .bind(filter.after_id)
        .bind(filter.limit())
        .fetch_all(&mut *self.transaction)
        .await?;

        Ok(messages)
    }

    async fn find_threads(&mut self, filter: &MessageFilter) -> Result<Vec<Message>, DatabaseError> {
        let messages = sqlx::query_as::<_, Message>(&format!(
            r#"SELECT {MESSAGE_COLUMNS}
               FROM messages
               WHERE channel_id = $1
               AND reply_to IS NULL
               AND replies > 0
               AND ($2::BIGINT IS NULL OR id < $2)
               AND ($3::BIGINT IS NULL OR id > $3)
               ORDER BY id DESC
               LIMIT $4"#
        ))
        .bind(filter.channel_id)
        .bind(filter.before_id)
        .bind(filter.after_id)
        .bind(filter.limit())
        .fetch_all(&mut *self.transaction)
        .await?;

        Ok(messages)
    }

    async fn find_message_by_id(
        &mut self,
        message_id: i64,
    ) -> Result<Option<Message>, DatabaseError> {
        let message = sqlx::query_as::<_, Message>(&format!(
            r#"SELECT {MESSAGE_COLUMNS}
               FROM messages
               WHERE id = $1
               FOR UPDATE"#
        ))
        .bind(message_id)
        .fetch_optional(&mut *self.transaction)
        .await?;

        Ok(message)
    }

    async fn find_channel_by_id(
        &mut self,
        channel_id: i64,
    ) -> Result<Option<Channel>, DatabaseError> {
        fetch_channel_by_id(&mut *self.transaction, channel_id).await
    }

    async fn create_message(&mut self, message: &Message) -> Result<Message, DatabaseError> {
        let created = sqlx::query_as::<_, Message>(&format!(
            r#"INSERT INTO messages (channel_id, reply_to, user_id, body, kind)
               VALUES ($1, $2, $3, $4, $5)
               RETURNING {MESSAGE_COLUMNS}"#
        ))
        .bind(message.channel_id)
        .bind(message.reply_to)
        .bind(message.user_id)
        .bind(&message.body)
        .bind(message.kind)
        .fetch_one(&mut *self.transaction)
        .await?;

        Ok(created)
    }

    async fn update_message_body(
        &mut self,
        message_id: i64,
        body: &str,
    ) -> Result<Message, DatabaseError> {
        let updated = sqlx::query_as::<_, Message>(&format!(
            r#"UPDATE messages
               SET body = $2, updated_at = NOW()
               WHERE id = $1
               RETURNING {MESSAGE_COLUMNS}"#
        ))
        .bind(message_id)
        .bind(body)
        .fetch_one(&mut *self.transaction)
        .await?;

        Ok(updated)
    }

    async fn delete_message(&mut self, message_id: i64) -> Result<(), DatabaseError> {
        let result = sqlx::query("DELETE FROM messages WHERE id = $1")
            .bind(message_id)
            .execute(&mut *self.transaction)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::RowNotFound);
        }

        Ok(())
    }

    async fn increment_reply_count(&mut self, message_id: i64) -> Result<i64, DatabaseError> {
        let replies: i64 = sqlx::query_scalar(
            r#"UPDATE messages
               SET replies = replies + 1
               WHERE id = $1
               RETURNING replies"#,
        )
        .bind(message_id)
        .fetch_one(&mut *self.transaction)
        .await?;

        Ok(replies)
    }

    async fn decrement_reply_count(&mut self, message_id: i64) -> Result<i64, DatabaseError> {
        let replies: i64 = sqlx::query_scalar(
            r#"UPDATE messages
               SET replies = GREATEST(replies - 1, 0)
               WHERE id = $1
               RETURNING replies"#,
        )
        .bind(message_id)
        .fetch_one(&mut *self.transaction)
        .await?;

        Ok(replies)
    }

    async fn find_flags_by_message_ids(
        &mut self,
        message_ids: &[i64],
    ) -> Result<Vec<MessageFlag>, DatabaseError> {
        fetch_flags_by_message_ids(&mut *self.transaction, message_ids).await
    }

    async fn find_mentions_by_message_ids(
        &mut self,
        message_ids: &[i64],
    ) -> Result<Vec<Mention>, DatabaseError> {
        fetch_mentions_by_message_ids(&mut *self.transaction, message_ids).await
    }

    async fn find_attachments_by_message_ids(
        &mut self,
        message_ids: &[i64],
    ) -> Result<Vec<Attachment>, DatabaseError> {
        let attachments = sqlx::query_as::<_, Attachment>(
            r#"SELECT
                   attachment_id,
                   message_id,
                   user_id,
                   file_name,
                   url,
                   preview_url,
                   mimetype,
                   file_size,
                   created_at
               FROM attachments
               WHERE message_id = ANY($1)
               ORDER BY message_id, attachment_id"#,
        )
        .bind(message_ids)
        .fetch_all(&mut *self.transaction)
        .await?;

        Ok(attachments)
    }

    async fn find_thread_participants(
        &mut self,
        thread_ids: &[i64],
    ) -> Result<Vec<ThreadParticipant>, DatabaseError> {
        let participants = sqlx::query_as::<_, ThreadParticipant>(
            r#"SELECT reply_to AS thread_id, user_id
               FROM messages
               WHERE reply_to = ANY($1)
               GROUP BY reply_to, user_id
               ORDER BY reply_to, MIN(id)"#,
        )
        .bind(thread_ids)
        .fetch_all(&mut *self.transaction)
        .await?;

        Ok(participants)
    }
}

impl MessageRepository for Postgre {
    type Transaction = PgMessageTransaction;

    async fn begin(&self) -> Result<Self::Transaction, DatabaseError> {
        let tx = self.pool.begin().await?;
        Ok(PgMessageTransaction { transaction: tx })
    }

    async fn commit(&self, transaction: Self::Transaction) -> Result<(), DatabaseError> {
        transaction.transaction.commit().await?;
        Ok(())
    }

    async fn rollback(&self, transaction: Self::Transaction) -> Result<(), DatabaseError> {
        transaction.transaction.rollback().await?;
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SERVICE
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Clone)]
pub struct MessageService<R: MessageRepository, U: UserDirectory, A: ChannelAccess> {
    repository: R,
    users: U,
    access: A,
    config: Arc<MessagingConfig>,
    signal: OutboxSignal,
}

impl<R: MessageRepository, U: UserDirectory, A: ChannelAccess> MessageService<R, U, A> {
    pub fn new(
        repository: R,
        users: U,
        access: A,
        config: MessagingConfig,
        signal: OutboxSignal,
    ) -> Self {
        Self {
            repository,
            users,
            access,
            config: Arc::new(config),
            signal,
        }
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Reads
    // ───────────────────────────────────────────────────────────────────────────

    pub async fn find(
        &self,
        user_id: i64,
        mut filter: MessageFilter,
    ) -> Result<Vec<Message>, DomainError> {
        filter.current_user_id = user_id;
        self.ensure_readable(filter.current_user_id, filter.channel_id)
            .await?;

        let mut tx = self.repository.begin().await?;
        let result = async {
            let mut messages = tx.find_messages(&filter).await?;
            self.hydrate(&mut tx, &mut messages, Some(filter.current_user_id))
                .await?;
            Ok::<_, DomainError>(messages)
        }
        .await;

        self.finish(tx, result)
            .await
            .context("unable to load messages")
    }

    pub async fn find_threads(
        &self,
        user_id: i64,
        mut filter: MessageFilter,
    ) -> Result<Vec<Message>, DomainError> {
        filter.current_user_id = user_id;
        filter.reply_to = None;
        self.ensure_readable(filter.current_user_id, filter.channel_id)
            .await?;

        let mut tx = self.repository.begin().await?;
        let result = async {
            let mut threads = tx.find_threads(&filter).await?;
            self.hydrate(&mut tx, &mut threads, Some(filter.current_user_id))
                .await?;
            Ok::<_, DomainError>(threads)
        }
        .await;

        self.finish(tx, result)
            .await
            .context("unable to load threads")
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Writes
    // ───────────────────────────────────────────────────────────────────────────

    pub async fn create(&self, user_id: i64, draft: NewMessage) -> Result<Message, DomainError> {
        let body = self.validate_body(&draft.body)?;
        let message = Message {
            reply_to: draft.reply_to.filter(|id| *id != 0),
            ..Message::draft(user_id, draft.channel_id, body, draft.kind)
        };

        let mut tx = self.repository.begin().await?;
        let result = self.create_in(&mut tx, message).await;
        let created = self
            .finish(tx, result)
            .await
            .context("unable to create message")?;

        self.signal.wake();
        info!(
            message_id = created.id,
            channel_id = created.channel_id,
            thread_id = created.thread_id(),
            user_id,
            "Message created"
        );

        Ok(created)
    }

    async fn create_in(
        &self,
        tx: &mut R::Transaction,
        mut message: Message,
    ) -> Result<Message, DomainError> {
        let mut queue = Vec::with_capacity(2);

        if let Some(reply_to) = message.reply_to {
            let mut root = self
                .resolve_thread_root(tx, reply_to)
                .await
                .context("unable to resolve thread")?;

            if !root.kind.is_repliable() {
                return Err(DomainError::NotRepliable(root.kind));
            }

            message.reply_to = Some(root.id);
            message.channel_id = root.channel_id;

            root.replies = tx
                .increment_reply_count(root.id)
                .await
                .context("Could not update reply count")?;
            queue.push(root);
        }

        if message.channel_id == 0 {
            return Err(DomainError::ChannelMissing);
        }
        self.ensure_channel(tx, message.channel_id).await?;
        self.ensure_writable(message.user_id, message.channel_id)
            .await?;

        let created = tx
            .create_message(&message)
            .await
            .context("Could not store message")?;

        let mentions = self.config.mentions.extract(&created);
        sync_mentions(tx, created.id, &mentions)
            .await
            .context("Could not update mentions")?;

        tx.increment_unread(created.channel_id, created.thread_id(), created.user_id)
            .await
            .context("Could not update unread counters")?;

        queue.push(created);
        self.publish(tx, &mut queue).await?;

        queue.pop().ok_or(DomainError::Invalid("message queue"))
    }

    pub async fn update(
        &self,
        user_id: i64,
        message_id: i64,
        body: &str,
    ) -> Result<Message, DomainError> {
        let body = self.validate_body(body)?;

        let mut tx = self.repository.begin().await?;
        let result = self.update_in(&mut tx, user_id, message_id, body).await;
        let (message, changed) = self
            .finish(tx, result)
            .await
            .context("unable to update message")?;

        if changed {
            self.signal.wake();
            info!(message_id, user_id, "Message updated");
        } else {
            debug!(message_id, "Message body unchanged");
        }

        Ok(message)
    }

    async fn update_in(
        &self,
        tx: &mut R::Transaction,
        user_id: i64,
        message_id: i64,
        body: String,
    ) -> Result<(Message, bool), DomainError> {
        let existing = tx
            .find_message_by_id(message_id)
            .await?
            .ok_or_else(|| DomainError::NotFound(format!("Message {}", message_id)))?;

        if existing.body.trim() == body {
            let mut messages = vec![existing];
            self.hydrate(tx, &mut messages, Some(user_id)).await?;
            let message = messages
                .pop()
                .ok_or(DomainError::Invalid("message queue"))?;
            return Ok((message, false));
        }

        if existing.user_id != user_id {
            return Err(DomainError::NotOwner);
        }
        self.ensure_writable(user_id, existing.channel_id).await?;

        let updated = tx
            .update_message_body(message_id, &body)
            .await
            .context("Could not store message")?;

        let mentions = self.config.mentions.extract(&updated);
        sync_mentions(tx, updated.id, &mentions)
            .await
            .context("Could not update mentions")?;

        let mut queue = vec![updated];
        self.publish(tx, &mut queue).await?;

        let message = queue.pop().ok_or(DomainError::Invalid("message queue"))?;
        Ok((message, true))
    }

    pub async fn delete(&self, user_id: i64, message_id: i64) -> Result<Message, DomainError> {
        let mut tx = self.repository.begin().await?;
        let result = self.delete_in(&mut tx, user_id, message_id).await;
        let deleted = self
            .finish(tx, result)
            .await
            .context("unable to delete message")?;

        self.signal.wake();
        info!(
            message_id,
            channel_id = deleted.channel_id,
            user_id,
            "Message deleted"
        );

        Ok(deleted)
    }

    async fn delete_in(
        &self,
        tx: &mut R::Transaction,
        user_id: i64,
        message_id: i64,
    ) -> Result<Message, DomainError> {
        let mut target = tx
            .find_message_by_id(message_id)
            .await?
            .ok_or_else(|| DomainError::NotFound(format!("Message {}", message_id)))?;

        if target.user_id != user_id {
            return Err(DomainError::NotOwner);
        }
        self.ensure_writable(user_id, target.channel_id).await?;
        if !target.is_reply() && target.replies > 0 {
            return Err(DomainError::ThreadNotEmpty(target.id));
        }

        let mut queue = Vec::with_capacity(2);

        if let Some(root_id) = target.reply_to {
            let mut root = tx
                .find_message_by_id(root_id)
                .await?
                .ok_or_else(|| DomainError::NotFound(format!("Message {}", root_id)))?;

            root.replies = tx
                .decrement_reply_count(root.id)
                .await
                .context("Could not update reply count")?;
            queue.push(root);
        }

        let flags = tx
            .delete_message_flags(target.id)
            .await
            .context("Could not delete flags")?;
        sync_mentions(tx, target.id, &[])
            .await
            .context("Could not delete mentions")?;

        tx.delete_message(target.id)
            .await
            .context("Could not delete message")?;

        tx.decrement_unread(target.channel_id, target.thread_id(), target.user_id)
            .await
            .context("Could not update unread counters")?;

        debug!(message_id, flags, "Message relations removed");

        target.deleted_at = Some(OffsetDateTime::now_utc());
        queue.push(target);
        self.publish(tx, &mut queue).await?;

        queue.pop().ok_or(DomainError::Invalid("message queue"))
    }

    pub async fn mark_as_read(
        &self,
        user_id: i64,
        channel_id: i64,
        thread_id: i64,
        last_message_id: i64,
    ) -> Result<i64, DomainError> {
        self.ensure_readable(user_id, channel_id)
            .await
            .context("unable to mark as read")?;

        let mut tx = self.repository.begin().await?;
        let result = async {
            self.ensure_channel(&mut tx, channel_id)
                .await
                .context("unable to verify channel")?;

            if thread_id != 0 {
                Self::ensure_message_in(&mut tx, thread_id, channel_id, "Thread")
                    .await
                    .and_then(|thread| match thread.is_reply() {
                        true => Err(DomainError::Invalid("thread must be a top-level message")),
                        false => Ok(thread),
                    })
                    .context("unable to verify thread")?;
            }
            if last_message_id != 0 {
                Self::ensure_message_in(&mut tx, last_message_id, channel_id, "Message")
                    .await
                    .context("unable to verify last message")?;
            }

            let count = tx
                .count_from_message_id(channel_id, thread_id, last_message_id)
                .await
                .context("unable to count unread messages")?;

            tx.record_read(&Unread {
                user_id,
                channel_id,
                thread_id,
                last_message_id,
                count,
            })
            .await
            .context("unable to record read marker")?;

            Ok::<_, DomainError>(count)
        }
        .await;

        let count = self
            .finish(tx, result)
            .await
            .context("unable to mark as read")?;

        info!(user_id, channel_id, thread_id, last_message_id, count, "Read marker recorded");

        Ok(count)
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Flags
    // ───────────────────────────────────────────────────────────────────────────

    pub async fn react(
        &self,
        user_id: i64,
        message_id: i64,
        reaction: &str,
    ) -> Result<Option<MessageFlag>, DomainError> {
        let kind = FlagKind::from_reaction_input(reaction);
        self.flag(user_id, message_id, kind, FlagToggle::Add).await
    }

    pub async fn remove_reaction(
        &self,
        user_id: i64,
        message_id: i64,
        reaction: &str,
    ) -> Result<Option<MessageFlag>, DomainError> {
        let kind = FlagKind::from_reaction_input(reaction);
        self.flag(user_id, message_id, kind, FlagToggle::Remove)
            .await
    }

    pub async fn pin(&self, user_id: i64, message_id: i64) -> Result<Option<MessageFlag>, DomainError> {
        self.flag(user_id, message_id, FlagKind::PinToChannel, FlagToggle::Add)
            .await
    }

    pub async fn remove_pin(
        &self,
        user_id: i64,
        message_id: i64,
    ) -> Result<Option<MessageFlag>, DomainError> {
        self.flag(user_id, message_id, FlagKind::PinToChannel, FlagToggle::Remove)
            .await
    }

    pub async fn bookmark(
        &self,
        user_id: i64,
        message_id: i64,
    ) -> Result<Option<MessageFlag>, DomainError> {
        self.flag(user_id, message_id, FlagKind::Bookmark, FlagToggle::Add)
            .await
    }

    pub async fn remove_bookmark(
        &self,
        user_id: i64,
        message_id: i64,
    ) -> Result<Option<MessageFlag>, DomainError> {
        self.flag(user_id, message_id, FlagKind::Bookmark, FlagToggle::Remove)
            .await
    }

    pub async fn flag(
        &self,
        user_id: i64,
        message_id: i64,
        kind: FlagKind,
        toggle: FlagToggle,
    ) -> Result<Option<MessageFlag>, DomainError> {
        if toggle == FlagToggle::Add {
            self.config.reactions.check(&kind)?;
        }
        let owner_id = kind.owner_for(user_id);

        let mut tx = self.repository.begin().await?;
        let result = self
            .flag_in(&mut tx, user_id, owner_id, message_id, &kind, toggle)
            .await;
        let (flag, changed) = self
            .finish(tx, result)
            .await
            .context("Can not flag/un-flag message")?;

        if changed {
            self.signal.wake();
            info!(message_id, user_id, owner_id, flag = %kind, ?toggle, "Message flag toggled");
        }

        Ok(flag)
    }

    async fn flag_in(
        &self,
        tx: &mut R::Transaction,
        user_id: i64,
        owner_id: i64,
        message_id: i64,
        kind: &FlagKind,
        toggle: FlagToggle,
    ) -> Result<(Option<MessageFlag>, bool), DomainError> {
        let existing = tx.find_flag(message_id, owner_id, kind).await?;

        let plan = plan_toggle(existing.as_ref(), toggle);
        if plan == FlagPlan::Skip {
            return Ok((existing, false));
        }

        let message = tx
            .find_message_by_id(message_id)
            .await?
            .ok_or_else(|| DomainError::NotFound(format!("Message {}", message_id)))?;
        self.ensure_writable(user_id, message.channel_id).await?;

        let flag = match (plan, existing) {
            (FlagPlan::Delete(flag_id), Some(mut flag)) => {
                tx.delete_flag(flag_id).await?;
                flag.deleted_at = Some(OffsetDateTime::now_utc());
                flag
            }
            _ => match tx
                .create_flag(owner_id, message.channel_id, message_id, kind)
                .await?
            {
                Some(flag) => flag,
                // A concurrent toggle committed the same flag first.
                None => {
                    let current = tx.find_flag(message_id, owner_id, kind).await?;
                    return Ok((current, false));
                }
            },
        };

        tx.enqueue_event(&EventPayload::MessageFlag { flag: flag.clone() })
            .await
            .context("Could not queue flag event")?;

        Ok((Some(flag), true))
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Helpers
    // ───────────────────────────────────────────────────────────────────────────

    fn validate_body(&self, body: &str) -> Result<String, DomainError> {
        let body = body.trim();
        if body.is_empty() {
            return Err(DomainError::EmptyBody);
        }

        let max = self.config.max_body_length;
        let len = body.chars().count();
        if max > 0 && len > max {
            return Err(DomainError::BodyTooLong { len, max });
        }

        Ok(body.to_string())
    }

    async fn resolve_thread_root(
        &self,
        tx: &mut R::Transaction,
        reply_to: i64,
    ) -> Result<Message, DomainError> {
        let mut current = reply_to;

        for _ in 0..=self.config.max_reply_hops {
            let message = tx
                .find_message_by_id(current)
                .await?
                .ok_or_else(|| DomainError::NotFound(format!("Message {}", current)))?;

            match message.reply_to {
                Some(parent) if parent != 0 => current = parent,
                _ => return Ok(message),
            }
        }

        Err(DomainError::ReplyChainTooDeep(self.config.max_reply_hops))
    }

    async fn ensure_channel(
        &self,
        tx: &mut R::Transaction,
        channel_id: i64,
    ) -> Result<Channel, DomainError> {
        tx.find_channel_by_id(channel_id)
            .await?
            .filter(Channel::is_valid)
            .ok_or_else(|| DomainError::NotFound(format!("Channel {}", channel_id)))
    }

    async fn ensure_message_in(
        tx: &mut R::Transaction,
        message_id: i64,
        channel_id: i64,
        what: &str,
    ) -> Result<Message, DomainError> {
        tx.find_message_by_id(message_id)
            .await?
            .filter(|message| message.channel_id == channel_id)
            .ok_or_else(|| DomainError::NotFound(format!("{} {}", what, message_id)))
    }

    async fn ensure_readable(&self, user_id: i64, channel_id: i64) -> Result<(), DomainError> {
        if !self.access.can_read(user_id, channel_id).await? {
            return Err(DomainError::PermissionDenied(format!(
                "No read access to channel {}",
                channel_id
            )));
        }
        Ok(())
    }

    async fn ensure_writable(&self, user_id: i64, channel_id: i64) -> Result<(), DomainError> {
        if !self.access.can_write(user_id, channel_id).await? {
            return Err(DomainError::PermissionDenied(format!(
                "No write access to channel {}",
                channel_id
            )));
        }
        Ok(())
    }

    async fn publish(
        &self,
        tx: &mut R::Transaction,
        messages: &mut [Message],
    ) -> Result<(), DomainError> {
        self.hydrate(tx, messages, None).await?;

        for message in messages.iter() {
            tx.enqueue_event(&EventPayload::Message {
                message: message.clone(),
            })
            .await
            .context("Could not queue message event")?;
        }

        Ok(())
    }

    async fn hydrate(
        &self,
        tx: &mut R::Transaction,
        messages: &mut [Message],
        viewer: Option<i64>,
    ) -> Result<(), DomainError> {
        if messages.is_empty() {
            return Ok(());
        }

        let ids: Vec<i64> = messages.iter().map(|m| m.id).collect();

        let mut author_ids: Vec<i64> = messages.iter().map(|m| m.user_id).collect();
        author_ids.sort_unstable();
        author_ids.dedup();
        let authors: HashMap<i64, User> = self
            .users
            .find_users_by_ids(&author_ids)
            .await
            .context("Could not load authors")?
            .into_iter()
            .map(|user| (user.user_id, user))
            .collect();

        let mut flags = group_by(
            tx.find_flags_by_message_ids(&ids)
                .await
                .context("Could not load flags")?,
            |flag| flag.message_id,
        );

        let mut mentions = group_by(
            tx.find_mentions_by_message_ids(&ids)
                .await
                .context("Could not load mentions")?,
            |mention| mention.message_id,
        );

        let attachment_ids: Vec<i64> = messages
            .iter()
            .filter(|m| m.kind.has_attachments())
            .map(|m| m.id)
            .collect();
        let mut attachments = if attachment_ids.is_empty() {
            HashMap::new()
        } else {
            group_by(
                tx.find_attachments_by_message_ids(&attachment_ids)
                    .await
                    .context("Could not load attachments")?,
                |attachment| attachment.message_id,
            )
        };

        let thread_ids: Vec<i64> = messages
            .iter()
            .filter(|m| !m.is_reply() && m.replies > 0)
            .map(|m| m.id)
            .collect();
        let mut participants = if thread_ids.is_empty() {
            HashMap::new()
        } else {
            group_by(
                tx.find_thread_participants(&thread_ids)
                    .await
                    .context("Could not load thread participants")?,
                |participant| participant.thread_id,
            )
        };

        for message in messages.iter_mut() {
            message.author = authors.get(&message.user_id).cloned();
            message.flags = flags
                .remove(&message.id)
                .unwrap_or_default()
                .into_iter()
                .filter(|flag| !flag.kind.is_private() || Some(flag.user_id) == viewer)
                .collect();
            message.mentions = mentions.remove(&message.id).unwrap_or_default();
            message.attachments = attachments.remove(&message.id).unwrap_or_default();
            message.participants = participants
                .remove(&message.id)
                .unwrap_or_default()
                .into_iter()
                .map(|participant| participant.user_id)
                .collect();
        }

        Ok(())
    }

    async fn finish<T>(
        &self,
        tx: R::Transaction,
        result: Result<T, DomainError>,
    ) -> Result<T, DomainError> {
        match result {
            Ok(value) => {
                self.repository
                    .commit(tx)
                    .await
                    .context("Could not commit transaction")?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = self.repository.rollback(tx).await {
                    warn!("Rollback failed: {}", rollback_err);
                }
                Err(e)
            }
        }
    }
}

fn group_by<T>(items: Vec<T>, key: impl Fn(&T) -> i64) -> HashMap<i64, Vec<T>> {
    let mut grouped: HashMap<i64, Vec<T>> = HashMap::new();
    for item in items {
        grouped.entry(key(&item)).or_default().push(item);
    }
    grouped
}

// ═══════════════════════════════════════════════════════════════════════════════
// REQUEST/RESPONSE
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MessagesResponse {
    pub messages: Vec<Message>,
}

#[derive(Debug, Default, Serialize, Deserialize, ToSchema, IntoParams)]
#[serde(rename_all = "camelCase")]
#[into_params(parameter_in = Query)]
pub struct MessagesQuery {
    pub reply_to: Option<i64>,
    pub before_id: Option<i64>,
    pub after_id: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateMessageRequest {
    pub body: String,
    pub reply_to: Option<i64>,
    #[serde(default)]
    pub kind: MessageKind,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdateMessageRequest {
    pub body: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MarkAsReadRequest {
    pub thread_id: Option<i64>,
    pub last_message_id: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MarkAsReadResponse {
    pub count: i64,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ReactionRequest {
    pub reaction: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct FlagResponse {
    pub flag: Option<MessageFlag>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// ROUTES
// ═══════════════════════════════════════════════════════════════════════════════

type AppMessageService = MessageService<Postgre, Postgre, Postgre>;

pub fn message_routes(
    message_service: AppMessageService,
    authorize_service: AuthorizeService<Postgre>,
) -> OpenApiRouter {
    OpenApiRouter::new()
        .routes(routes!(find_messages_handler, create_message_handler))
        .routes(routes!(find_threads_handler))
        .routes(routes!(mark_as_read_handler))
        .routes(routes!(update_message_handler, delete_message_handler))
        .routes(routes!(react_handler))
        .routes(routes!(remove_reaction_handler))
        .routes(routes!(pin_handler, remove_pin_handler))
        .routes(routes!(bookmark_handler, remove_bookmark_handler))
        .layer(from_fn_with_state(authorize_service, authorize))
        .with_state(message_service)
}

// ═══════════════════════════════════════════════════════════════════════════════
// HANDLERS
// ═══════════════════════════════════════════════════════════════════════════════

#[utoipa::path(
    get,
    tag = "message",
    path = "/channel/{channel_id}/messages",
    description = "List messages of a channel or thread, newest first",
    params(("channel_id" = i64, Path, description = "Channel ID"), MessagesQuery),
    responses(
        (status = 200, body = MessagesResponse),
        (status = 422, body = ApiError),
        (status = 500, body = ApiError),
    ),
    security(("api_key" = []))
)]
async fn find_messages_handler(
    State(service): State<AppMessageService>,
    Extension(session): Extension<Session>,
    Path(channel_id): Path<i64>,
    Query(query): Query<MessagesQuery>,
) -> Result<Json<MessagesResponse>, ApiError> {
    let filter = MessageFilter {
        channel_id,
        current_user_id: session.user_id,
        reply_to: query.reply_to.filter(|id| *id != 0),
        before_id: query.before_id,
        after_id: query.after_id,
        limit: query.limit,
    };

    let messages = service
        .find(session.user_id, filter)
        .await
        .map_err(ApiError::from)?;

    Ok(Json(MessagesResponse { messages }))
}

#[utoipa::path(
    get,
    tag = "message",
    path = "/channel/{channel_id}/threads",
    description = "List threads of a channel",
    params(("channel_id" = i64, Path, description = "Channel ID"), MessagesQuery),
    responses(
        (status = 200, body = MessagesResponse),
        (status = 422, body = ApiError),
        (status = 500, body = ApiError),
    ),
    security(("api_key" = []))
)]
async fn find_threads_handler(
    State(service): State<AppMessageService>,
    Extension(session): Extension<Session>,
    Path(channel_id): Path<i64>,
    Query(query): Query<MessagesQuery>,
) -> Result<Json<MessagesResponse>, ApiError> {
    let filter = MessageFilter {
        channel_id,
        current_user_id: session.user_id,
        reply_to: None,
        before_id: query.before_id,
        after_id: query.after_id,
        limit: query.limit,
    };

    let messages = service
        .find_threads(session.user_id, filter)
        .await
        .map_err(ApiError::from)?;

    Ok(Json(MessagesResponse { messages }))
}

#[utoipa::path(
    post,
    tag = "message",
    path = "/channel/{channel_id}/messages",
    description = "Post a message or a reply",
    params(("channel_id" = i64, Path, description = "Channel ID")),
    request_body = CreateMessageRequest,
    responses(
        (status = 201, body = Message),
        (status = 422, body = ApiError),
        (status = 500, body = ApiError),
    ),
    security(("api_key" = []))
)]
async fn create_message_handler(
    State(service): State<AppMessageService>,
    Extension(session): Extension<Session>,
    Path(channel_id): Path<i64>,
    Json(payload): Json<CreateMessageRequest>,
) -> Result<(StatusCode, Json<Message>), ApiError> {
    let draft = NewMessage {
        channel_id,
        reply_to: payload.reply_to,
        body: payload.body,
        kind: payload.kind,
    };

    let message = service
        .create(session.user_id, draft)
        .await
        .map_err(ApiError::from)?;

    Ok((StatusCode::CREATED, Json(message)))
}

#[utoipa::path(
    post,
    tag = "message",
    path = "/channel/{channel_id}/read",
    description = "Record the caller's read position",
    params(("channel_id" = i64, Path, description = "Channel ID")),
    request_body = MarkAsReadRequest,
    responses(
        (status = 200, body = MarkAsReadResponse),
        (status = 422, body = ApiError),
        (status = 500, body = ApiError),
    ),
    security(("api_key" = []))
)]
async fn mark_as_read_handler(
    State(service): State<AppMessageService>,
    Extension(session): Extension<Session>,
    Path(channel_id): Path<i64>,
    Json(payload): Json<MarkAsReadRequest>,
) -> Result<Json<MarkAsReadResponse>, ApiError> {
    let count = service
        .mark_as_read(
            session.user_id,
            channel_id,
            payload.thread_id.unwrap_or(0),
            payload.last_message_id.unwrap_or(0),
        )
        .await
        .map_err(ApiError::from)?;

    Ok(Json(MarkAsReadResponse { count }))
}

#[utoipa::path(
    put,
    tag = "message",
    path = "/{message_id}",
    description = "Edit message",
    params(("message_id" = i64, Path, description = "Message ID")),
    request_body = UpdateMessageRequest,
    responses(
        (status = 200, body = Message),
        (status = 422, body = ApiError),
        (status = 500, body = ApiError),
    ),
    security(("api_key" = []))
)]
async fn update_message_handler(
    State(service): State<AppMessageService>,
    Extension(session): Extension<Session>,
    Path(message_id): Path<i64>,
    Json(payload): Json<UpdateMessageRequest>,
) -> Result<Json<Message>, ApiError> {
    let message = service
        .update(session.user_id, message_id, &payload.body)
        .await
        .map_err(ApiError::from)?;

    Ok(Json(message))
}

#[utoipa::path(
    delete,
    tag = "message",
    path = "/{message_id}",
    description = "Delete message",
    params(("message_id" = i64, Path, description = "Message ID")),
    responses(
        (status = 204, description = "Deleted"),
        (status = 422, body = ApiError),
        (status = 500, body = ApiError),
    ),
    security(("api_key" = []))
)]
async fn delete_message_handler(
    State(service): State<AppMessageService>,
    Extension(session): Extension<Session>,
    Path(message_id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    service
        .delete(session.user_id, message_id)
        .await
        .map_err(ApiError::from)?;

    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    post,
    tag = "message",
    path = "/{message_id}/reactions",
    description = "React to message",
    params(("message_id" = i64, Path, description = "Message ID")),
    request_body = ReactionRequest,
    responses(
        (status = 200, body = FlagResponse),
        (status = 422, body = ApiError),
        (status = 500, body = ApiError),
    ),
    security(("api_key" = []))
)]
async fn react_handler(
    State(service): State<AppMessageService>,
    Extension(session): Extension<Session>,
    Path(message_id): Path<i64>,
    Json(payload): Json<ReactionRequest>,
) -> Result<Json<FlagResponse>, ApiError> {
    let flag = service
        .react(session.user_id, message_id, &payload.reaction)
        .await
        .map_err(ApiError::from)?;

    Ok(Json(FlagResponse { flag }))
}

#[utoipa::path(
    delete,
    tag = "message",
    path = "/{message_id}/reactions/{reaction}",
    description = "Remove reaction from message",
    params(
        ("message_id" = i64, Path, description = "Message ID"),
        ("reaction" = String, Path, description = "Reaction")
    ),
    responses(
        (status = 200, body = FlagResponse),
        (status = 422, body = ApiError),
        (status = 500, body = ApiError),
    ),
    security(("api_key" = []))
)]
async fn remove_reaction_handler(
    State(service): State<AppMessageService>,
    Extension(session): Extension<Session>,
    Path((message_id, reaction)): Path<(i64, String)>,
) -> Result<Json<FlagResponse>, ApiError> {
    let flag = service
        .remove_reaction(session.user_id, message_id, &reaction)
        .await
        .map_err(ApiError::from)?;

    Ok(Json(FlagResponse { flag }))
}

#[utoipa::path(
    post,
    tag = "message",
    path = "/{message_id}/pin",
    description = "Pin message to its channel",
    params(("message_id" = i64, Path, description = "Message ID")),
    responses(
        (status = 200, body = FlagResponse),
        (status = 422, body = ApiError),
        (status = 500, body = ApiError),
    ),
    security(("api_key" = []))
)]
async fn pin_handler(
    State(service): State<AppMessageService>,
    Extension(session): Extension<Session>,
    Path(message_id): Path<i64>,
) -> Result<Json<FlagResponse>, ApiError> {
    let flag = service
        .pin(session.user_id, message_id)
        .await
        .map_err(ApiError::from)?;

    Ok(Json(FlagResponse { flag }))
}

#[utoipa::path(
    delete,
    tag = "message",
    path = "/{message_id}/pin",
    description = "Unpin message",
    params(("message_id" = i64, Path, description = "Message ID")),
    responses(
        (status = 200, body = FlagResponse),
        (status = 422, body = ApiError),
        (status = 500, body = ApiError),
    ),
    security(("api_key" = []))
)]
async fn remove_pin_handler(
    State(service): State<AppMessageService>,
    Extension(session): Extension<Session>,
    Path(message_id): Path<i64>,
) -> Result<Json<FlagResponse>, ApiError> {
    let flag = service
        .remove_pin(session.user_id, message_id)
        .await
        .map_err(ApiError::from)?;

    Ok(Json(FlagResponse { flag }))
}

#[utoipa::path(
    post,
    tag = "message",
    path = "/{message_id}/bookmark",
    description = "Bookmark message for the caller",
    params(("message_id" = i64, Path, description = "Message ID")),
    responses(
        (status = 200, body = FlagResponse),
        (status = 422, body = ApiError),
        (status = 500, body = ApiError),
    ),
    security(("api_key" = []))
)]
async fn bookmark_handler(
    State(service): State<AppMessageService>,
    Extension(session): Extension<Session>,
    Path(message_id): Path<i64>,
) -> Result<Json<FlagResponse>, ApiError> {
    let flag = service
        .bookmark(session.user_id, message_id)
        .await
        .map_err(ApiError::from)?;

    Ok(Json(FlagResponse { flag }))
}

#[utoipa::path(
    delete,
    tag = "message",
    path = "/{message_id}/bookmark",
    description = "Remove the caller's bookmark",
    params(("message_id" = i64, Path, description = "Message ID")),
    responses(
        (status = 200, body = FlagResponse),
        (status = 422, body = ApiError),
        (status = 500, body = ApiError),
    ),
    security(("api_key" = []))
)]
async fn remove_bookmark_handler(
    State(service): State<AppMessageService>,
    Extension(session): Extension<Session>,
    Path(message_id): Path<i64>,
) -> Result<Json<FlagResponse>, ApiError> {
    let flag = service
        .remove_bookmark(session.user_id, message_id)
        .await
        .map_err(ApiError::from)?;

    Ok(Json(FlagResponse { flag }))
}
