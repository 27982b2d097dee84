use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use time::OffsetDateTime;

use crate::auth::{Session, SessionRepository};
use crate::channel::{Channel, ChannelAccess};
use crate::error::DatabaseError;
use crate::flag::{FlagKind, FlagTransaction, MessageFlag};
use crate::mention::{Mention, MentionTransaction};
use crate::message::{
    Attachment, Message, MessageFilter, MessageKind, MessageRepository, MessageTransaction,
    ThreadParticipant,
};
use crate::model::EventPayload;
use crate::outbox::{OutboxRecord, OutboxRepository, OutboxTransaction};
use crate::unread::{Unread, UnreadTransaction};
use crate::user::{User, UserDirectory};

pub fn message_fixture(id: i64, channel_id: i64, user_id: i64) -> Message {
    Message {
        id,
        ..Message::draft(user_id, channel_id, "hello".to_string(), MessageKind::Plain)
    }
}

#[derive(Debug, Clone)]
struct OutboxRow {
    id: i64,
    payload: String,
    created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Default)]
struct State {
    messages: BTreeMap<i64, Message>,
    channels: BTreeMap<i64, Channel>,
    members: HashSet<(i64, i64)>,
    mentions: Vec<Mention>,
    flags: Vec<MessageFlag>,
    unreads: BTreeMap<(i64, i64, i64), Unread>,
    attachments: Vec<Attachment>,
    outbox: Vec<OutboxRow>,
}

#[derive(Default)]
struct Inner {
    state: State,
    ops: Vec<String>,
    failures: HashSet<String>,
    next_id: i64,
    transactions: usize,
}

impl Inner {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// STORE
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let store = Self::default();
        store.lock().next_id = 1000;
        store
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    pub fn begin_tx(&self) -> MemoryTransaction {
        let mut inner = self.lock();
        inner.transactions += 1;
        MemoryTransaction {
            store: self.clone(),
            state: inner.state.clone(),
        }
    }

    pub fn insert_channel(&self, channel_id: i64, members: &[i64]) {
        let mut inner = self.lock();
        inner.state.channels.insert(
            channel_id,
            Channel {
                channel_id,
                channel_name: format!("channel-{}", channel_id),
                archived_at: None,
                deleted_at: None,
            },
        );
        for user_id in members {
            inner.state.members.insert((channel_id, *user_id));
        }
    }

    pub fn archive_channel(&self, channel_id: i64) {
        if let Some(channel) = self.lock().state.channels.get_mut(&channel_id) {
            channel.archived_at = Some(OffsetDateTime::now_utc());
        }
    }

    pub fn insert_message(&self, message: Message) -> Message {
        let mut inner = self.lock();
        let mut message = message;
        if message.id == 0 {
            message.id = inner.next_id();
        }
        inner.next_id = inner.next_id.max(message.id);
        inner.state.messages.insert(message.id, message.clone());
        message
    }

    pub fn insert_mention(&self, mention: Mention) -> Mention {
        let mut inner = self.lock();
        let mention = Mention {
            id: inner.next_id(),
            ..mention
        };
        inner.state.mentions.push(mention.clone());
        mention
    }

    pub fn insert_attachment(&self, attachment: Attachment) {
        self.lock().state.attachments.push(attachment);
    }

    pub fn push_raw_event(&self, payload: &str) {
        let mut inner = self.lock();
        let id = inner.next_id();
        inner.state.outbox.push(OutboxRow {
            id,
            payload: payload.to_string(),
            created_at: OffsetDateTime::now_utc(),
        });
    }

    pub fn fail_on(&self, op: &str) {
        self.lock().failures.insert(op.to_string());
    }

    pub fn ops(&self) -> Vec<String> {
        self.lock().ops.clone()
    }

    pub fn clear_ops(&self) {
        self.lock().ops.clear();
    }

    pub fn transactions_started(&self) -> usize {
        self.lock().transactions
    }

    pub fn message(&self, message_id: i64) -> Option<Message> {
        self.lock().state.messages.get(&message_id).cloned()
    }

    pub fn mentions_for(&self, message_id: i64) -> Vec<Mention> {
        self.lock()
            .state
            .mentions
            .iter()
            .filter(|m| m.message_id == message_id)
            .cloned()
            .collect()
    }

    pub fn flags_for(&self, message_id: i64) -> Vec<MessageFlag> {
        self.lock()
            .state
            .flags
            .iter()
            .filter(|f| f.message_id == message_id)
            .cloned()
            .collect()
    }

    pub fn unread(&self, user_id: i64, channel_id: i64, thread_id: i64) -> Option<Unread> {
        self.lock()
            .state
            .unreads
            .get(&(user_id, channel_id, thread_id))
            .cloned()
    }

    pub fn events(&self) -> Vec<EventPayload> {
        self.lock()
            .state
            .outbox
            .iter()
            .filter_map(|row| serde_json::from_str(&row.payload).ok())
            .collect()
    }

    pub fn pending_events(&self) -> Vec<OutboxRecord> {
        self.lock()
            .state
            .outbox
            .iter()
            .map(|row| OutboxRecord {
                id: row.id,
                payload: row.payload.clone(),
                created_at: row.created_at,
            })
            .collect()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TRANSACTION
// ═══════════════════════════════════════════════════════════════════════════════

pub struct MemoryTransaction {
    store: MemoryStore,
    state: State,
}

impl MemoryTransaction {
    pub fn commit(self) {
        self.store.lock().state = self.state;
    }

    fn write(&self, op: &str, args: String) -> Result<(), DatabaseError> {
        let mut inner = self.store.lock();
        if inner.failures.contains(op) {
            return Err(DatabaseError::InternalServerError {
                message: format!("injected failure in {}", op),
            });
        }
        inner.ops.push(format!("{}({})", op, args));
        Ok(())
    }

    fn next_id(&self) -> i64 {
        self.store.lock().next_id()
    }
}

impl MentionTransaction for MemoryTransaction {
    async fn find_mentions_by_message_id(
        &mut self,
        message_id: i64,
    ) -> Result<Vec<Mention>, DatabaseError> {
        Ok(self
            .state
            .mentions
            .iter()
            .filter(|m| m.message_id == message_id)
            .cloned()
            .collect())
    }

    async fn create_mention(&mut self, mention: &Mention) -> Result<Mention, DatabaseError> {
        self.write(
            "create_mention",
            format!("{},{}", mention.message_id, mention.user_id),
        )?;
        if self.state.mentions.iter().any(|m| m.same_identity(mention)) {
            return Err(DatabaseError::UniqueConstraintViolation {
                column: "mention".to_string(),
            });
        }

        let created = Mention {
            id: self.next_id(),
            ..mention.clone()
        };
        self.state.mentions.push(created.clone());
        Ok(created)
    }

    async fn delete_mention(&mut self, mention_id: i64) -> Result<(), DatabaseError> {
        let Some(position) = self.state.mentions.iter().position(|m| m.id == mention_id) else {
            return Err(DatabaseError::RowNotFound);
        };
        let mention = &self.state.mentions[position];
        self.write(
            "delete_mention",
            format!("{},{}", mention.message_id, mention.user_id),
        )?;
        self.state.mentions.remove(position);
        Ok(())
    }

    async fn delete_message_mentions(&mut self, message_id: i64) -> Result<u64, DatabaseError> {
        self.write("delete_message_mentions", message_id.to_string())?;
        let before = self.state.mentions.len();
        self.state.mentions.retain(|m| m.message_id != message_id);
        Ok((before - self.state.mentions.len()) as u64)
    }
}

impl FlagTransaction for MemoryTransaction {
    async fn find_flag(
        &mut self,
        message_id: i64,
        owner_id: i64,
        kind: &FlagKind,
    ) -> Result<Option<MessageFlag>, DatabaseError> {
        Ok(self
            .state
            .flags
            .iter()
            .find(|f| f.message_id == message_id && f.user_id == owner_id && &f.kind == kind)
            .cloned())
    }

    async fn create_flag(
        &mut self,
        owner_id: i64,
        channel_id: i64,
        message_id: i64,
        kind: &FlagKind,
    ) -> Result<Option<MessageFlag>, DatabaseError> {
        self.write(
            "create_flag",
            format!("{},{},{}", message_id, owner_id, kind),
        )?;

        let same = |f: &MessageFlag| {
            f.message_id == message_id && f.user_id == owner_id && &f.kind == kind
        };
        let committed = self.store.lock().state.flags.iter().any(same);
        if committed || self.state.flags.iter().any(same) {
            return Ok(None);
        }

        let flag = MessageFlag {
            id: self.next_id(),
            user_id: owner_id,
            channel_id,
            message_id,
            kind: kind.clone(),
            created_at: OffsetDateTime::now_utc(),
            deleted_at: None,
        };
        self.state.flags.push(flag.clone());
        Ok(Some(flag))
    }

    async fn delete_flag(&mut self, flag_id: i64) -> Result<(), DatabaseError> {
        self.write("delete_flag", flag_id.to_string())?;
        self.state.flags.retain(|f| f.id != flag_id);
        Ok(())
    }

    async fn delete_message_flags(&mut self, message_id: i64) -> Result<u64, DatabaseError> {
        self.write("delete_message_flags", message_id.to_string())?;
        let before = self.state.flags.len();
        self.state.flags.retain(|f| f.message_id != message_id);
        Ok((before - self.state.flags.len()) as u64)
    }
}

impl UnreadTransaction for MemoryTransaction {
    async fn increment_unread(
        &mut self,
        channel_id: i64,
        thread_id: i64,
        author_id: i64,
    ) -> Result<(), DatabaseError> {
        self.write(
            "increment_unread",
            format!("{},{},{}", channel_id, thread_id, author_id),
        )?;

        let recipients: Vec<i64> = self
            .state
            .members
            .iter()
            .filter(|(channel, user)| *channel == channel_id && *user != author_id)
            .map(|(_, user)| *user)
            .collect();

        for user_id in recipients {
            self.state
                .unreads
                .entry((user_id, channel_id, thread_id))
                .or_insert(Unread {
                    user_id,
                    channel_id,
                    thread_id,
                    last_message_id: 0,
                    count: 0,
                })
                .count += 1;
        }
        Ok(())
    }

    async fn decrement_unread(
        &mut self,
        channel_id: i64,
        thread_id: i64,
        author_id: i64,
    ) -> Result<(), DatabaseError> {
        self.write(
            "decrement_unread",
            format!("{},{},{}", channel_id, thread_id, author_id),
        )?;

        for unread in self.state.unreads.values_mut() {
            if unread.channel_id == channel_id
                && unread.thread_id == thread_id
                && unread.user_id != author_id
            {
                unread.count = (unread.count - 1).max(0);
            }
        }
        Ok(())
    }

    async fn count_from_message_id(
        &mut self,
        channel_id: i64,
        thread_id: i64,
        last_message_id: i64,
    ) -> Result<i64, DatabaseError> {
        Ok(self
            .state
            .messages
            .values()
            .filter(|m| {
                m.channel_id == channel_id && m.thread_id() == thread_id && m.id > last_message_id
            })
            .count() as i64)
    }

    async fn record_read(&mut self, unread: &Unread) -> Result<(), DatabaseError> {
        self.write(
            "record_read",
            format!(
                "{},{},{},{},{}",
                unread.user_id,
                unread.channel_id,
                unread.thread_id,
                unread.last_message_id,
                unread.count
            ),
        )?;
        self.state.unreads.insert(
            (unread.user_id, unread.channel_id, unread.thread_id),
            unread.clone(),
        );
        Ok(())
    }
}

impl OutboxTransaction for MemoryTransaction {
    async fn enqueue_event(&mut self, event: &EventPayload) -> Result<i64, DatabaseError> {
        let payload = serde_json::to_string(event)?;
        self.write("enqueue_event", String::new())?;

        let id = self.next_id();
        self.state.outbox.push(OutboxRow {
            id,
            payload,
            created_at: OffsetDateTime::now_utc(),
        });
        Ok(id)
    }
}

impl MessageTransaction for MemoryTransaction {
    async fn find_messages(&mut self, filter: &MessageFilter) -> Result<Vec<Message>, DatabaseError> {
        Ok(self
            .state
            .messages
            .values()
            .rev()
            .filter(|m| m.channel_id == filter.channel_id && m.thread_id() == filter.thread_id())
            .filter(|m| filter.before_id.is_none_or(|before| m.id < before))
            .filter(|m| filter.after_id.is_none_or(|after| m.id > after))
            .take(filter.limit() as usize)
            .cloned()
            .collect())
    }

    async fn find_threads(&mut self, filter: &MessageFilter) -> Result<Vec<Message>, DatabaseError> {
        Ok(self
            .state
            .messages
            .values()
            .rev()
            .filter(|m| m.channel_id == filter.channel_id && !m.is_reply() && m.replies > 0)
            .filter(|m| filter.before_id.is_none_or(|before| m.id < before))
            .filter(|m| filter.after_id.is_none_or(|after| m.id > after))
            .take(filter.limit() as usize)
            .cloned()
            .collect())
    }

    async fn find_message_by_id(
        &mut self,
        message_id: i64,
    ) -> Result<Option<Message>, DatabaseError> {
        Ok(self.state.messages.get(&message_id).cloned())
    }

    async fn find_channel_by_id(
        &mut self,
        channel_id: i64,
    ) -> Result<Option<Channel>, DatabaseError> {
        Ok(self.state.channels.get(&channel_id).cloned())
    }

    async fn create_message(&mut self, message: &Message) -> Result<Message, DatabaseError> {
        self.write(
            "create_message",
            format!("{},{}", message.channel_id, message.user_id),
        )?;

        let created = Message {
            id: self.next_id(),
            reply_to: message.reply_to,
            ..Message::draft(
                message.user_id,
                message.channel_id,
                message.body.clone(),
                message.kind,
            )
        };
        self.state.messages.insert(created.id, created.clone());
        Ok(created)
    }

    async fn update_message_body(
        &mut self,
        message_id: i64,
        body: &str,
    ) -> Result<Message, DatabaseError> {
        self.write("update_message_body", message_id.to_string())?;
        let message = self
            .state
            .messages
            .get_mut(&message_id)
            .ok_or(DatabaseError::RowNotFound)?;
        message.body = body.to_string();
        message.updated_at = Some(OffsetDateTime::now_utc());
        Ok(message.clone())
    }

    async fn delete_message(&mut self, message_id: i64) -> Result<(), DatabaseError> {
        self.write("delete_message", message_id.to_string())?;
        self.state
            .messages
            .remove(&message_id)
            .map(|_| ())
            .ok_or(DatabaseError::RowNotFound)
    }

    async fn increment_reply_count(&mut self, message_id: i64) -> Result<i64, DatabaseError> {
        self.write("increment_reply_count", message_id.to_string())?;
        let message = self
            .state
            .messages
            .get_mut(&message_id)
            .ok_or(DatabaseError::RowNotFound)?;
        message.replies += 1;
        Ok(message.replies)
    }

    async fn decrement_reply_count(&mut self, message_id: i64) -> Result<i64, DatabaseError> {
        self.write("decrement_reply_count", message_id.to_string())?;
        let message = self
            .state
            .messages
            .get_mut(&message_id)
            .ok_or(DatabaseError::RowNotFound)?;
        message.replies = (message.replies - 1).max(0);
        Ok(message.replies)
    }

    async fn find_flags_by_message_ids(
        &mut self,
        message_ids: &[i64],
    ) -> Result<Vec<MessageFlag>, DatabaseError> {
        Ok(self
            .state
            .flags
            .iter()
            .filter(|f| message_ids.contains(&f.message_id))
            .cloned()
            .collect())
    }

    async fn find_mentions_by_message_ids(
        &mut self,
        message_ids: &[i64],
    ) -> Result<Vec<Mention>, DatabaseError> {
        Ok(self
            .state
            .mentions
            .iter()
            .filter(|m| message_ids.contains(&m.message_id))
            .cloned()
            .collect())
    }

    async fn find_attachments_by_message_ids(
        &mut self,
        message_ids: &[i64],
    ) -> Result<Vec<Attachment>, DatabaseError> {
        Ok(self
            .state
            .attachments
            .iter()
            .filter(|a| message_ids.contains(&a.message_id))
            .cloned()
            .collect())
    }

    async fn find_thread_participants(
        &mut self,
        thread_ids: &[i64],
    ) -> Result<Vec<ThreadParticipant>, DatabaseError> {
        let mut participants: Vec<ThreadParticipant> = Vec::new();
        for reply in self.state.messages.values() {
            let Some(thread_id) = reply.reply_to else {
                continue;
            };
            let participant = ThreadParticipant {
                thread_id,
                user_id: reply.user_id,
            };
            if thread_ids.contains(&thread_id) && !participants.contains(&participant) {
                participants.push(participant);
            }
        }
        Ok(participants)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// REPOSITORIES
// ═══════════════════════════════════════════════════════════════════════════════

impl MessageRepository for MemoryStore {
    type Transaction = MemoryTransaction;

    async fn begin(&self) -> Result<Self::Transaction, DatabaseError> {
        Ok(self.begin_tx())
    }

    async fn commit(&self, transaction: Self::Transaction) -> Result<(), DatabaseError> {
        if self.lock().failures.contains("commit") {
            return Err(DatabaseError::InternalServerError {
                message: "injected failure in commit".to_string(),
            });
        }
        transaction.commit();
        Ok(())
    }

    async fn rollback(&self, transaction: Self::Transaction) -> Result<(), DatabaseError> {
        drop(transaction);
        Ok(())
    }
}

impl OutboxRepository for MemoryStore {
    async fn find_pending_events(&self, limit: i64) -> Result<Vec<OutboxRecord>, DatabaseError> {
        Ok(self
            .pending_events()
            .into_iter()
            .take(limit as usize)
            .collect())
    }

    async fn delete_event(&self, event_id: i64) -> Result<(), DatabaseError> {
        self.lock().state.outbox.retain(|row| row.id != event_id);
        Ok(())
    }
}

impl ChannelAccess for MemoryStore {
    async fn can_read(&self, user_id: i64, channel_id: i64) -> Result<bool, DatabaseError> {
        Ok(self.lock().state.members.contains(&(channel_id, user_id)))
    }

    async fn can_write(&self, user_id: i64, channel_id: i64) -> Result<bool, DatabaseError> {
        let inner = self.lock();
        let open = inner
            .state
            .channels
            .get(&channel_id)
            .is_some_and(|c| c.archived_at.is_none() && c.deleted_at.is_none());
        Ok(open && inner.state.members.contains(&(channel_id, user_id)))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// USERS & SESSIONS
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Clone, Default)]
pub struct MemoryUsers {
    users: Arc<Mutex<HashMap<i64, User>>>,
}

impl MemoryUsers {
    pub fn with(users: &[(i64, &str)]) -> Self {
        let directory = Self::default();
        for (user_id, username) in users {
            directory.users.lock().unwrap().insert(
                *user_id,
                User {
                    user_id: *user_id,
                    username: username.to_string(),
                    created_at: OffsetDateTime::UNIX_EPOCH,
                },
            );
        }
        directory
    }
}

impl UserDirectory for MemoryUsers {
    async fn find_users_by_ids(&self, user_ids: &[i64]) -> Result<Vec<User>, DatabaseError> {
        let users = self.users.lock().unwrap();
        Ok(user_ids
            .iter()
            .filter_map(|id| users.get(id).cloned())
            .collect())
    }
}

#[derive(Clone, Default)]
pub struct MemorySessions {
    sessions: Arc<Mutex<HashMap<String, Session>>>,
}

impl MemorySessions {
    pub fn insert(&self, session: Session) {
        self.sessions
            .lock()
            .unwrap()
            .insert(session.session_token.clone(), session);
    }
}

impl SessionRepository for MemorySessions {
    async fn find_session(&self, session_token: &str) -> Result<Option<Session>, DatabaseError> {
        Ok(self.sessions.lock().unwrap().get(session_token).cloned())
    }
}
