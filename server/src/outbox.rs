// ═══════════════════════════════════════════════════════════════════════════════
// IMPORTS
// ═══════════════════════════════════════════════════════════════════════════════

use std::sync::Arc;
use std::time::Duration;

use sqlx::prelude::FromRow;
use time::OffsetDateTime;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::db::Postgre;
use crate::error::DatabaseError;
use crate::managers::NotifierManager;
use crate::message::PgMessageTransaction;
use crate::model::EventPayload;
use crate::transport::ServerMessage;

// ═══════════════════════════════════════════════════════════════════════════════
// MODELS
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct OutboxRecord {
    pub id: i64,
    pub payload: String,
    pub created_at: OffsetDateTime,
}

// ═══════════════════════════════════════════════════════════════════════════════
// REPOSITORY
// ═══════════════════════════════════════════════════════════════════════════════

pub trait OutboxTransaction: Send + Sync {
    /// Stored with the surrounding transaction; invisible to the relay until
    /// it commits.
    async fn enqueue_event(&mut self, event: &EventPayload) -> Result<i64, DatabaseError>;
}

pub trait OutboxRepository: Send + Sync + Clone {
    async fn find_pending_events(&self, limit: i64) -> Result<Vec<OutboxRecord>, DatabaseError>;

    async fn delete_event(&self, event_id: i64) -> Result<(), DatabaseError>;
}

impl OutboxTransaction for PgMessageTransaction {
    async fn enqueue_event(&mut self, event: &EventPayload) -> Result<i64, DatabaseError> {
        let payload = serde_json::to_string(event)?;

        let id: i64 = sqlx::query_scalar(
            r#"INSERT INTO event_outbox (payload)
               VALUES ($1)
               RETURNING id"#,
        )
        .bind(payload)
        .fetch_one(&mut *self.transaction)
        .await?;

        Ok(id)
    }
}

impl OutboxRepository for Postgre {
    async fn find_pending_events(&self, limit: i64) -> Result<Vec<OutboxRecord>, DatabaseError> {
        let records = sqlx::query_as::<_, OutboxRecord>(
            r#"SELECT id, payload, created_at
               FROM event_outbox
               ORDER BY id
               LIMIT $1"#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn delete_event(&self, event_id: i64) -> Result<(), DatabaseError> {
        sqlx::query("DELETE FROM event_outbox WHERE id = $1")
            .bind(event_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RELAY
// ═══════════════════════════════════════════════════════════════════════════════

/// Wakes the relay after a commit. A wake with no one waiting is kept until
/// the next wait, so a commit during a drain is never missed.
#[derive(Clone, Default)]
pub struct OutboxSignal {
    notify: Arc<Notify>,
}

impl OutboxSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wake(&self) {
        self.notify.notify_one();
    }

    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

pub struct OutboxRelay<R: OutboxRepository, N: NotifierManager> {
    repository: R,
    notifier: N,
    signal: OutboxSignal,
    batch_size: i64,
    poll_interval: Duration,
}

impl<R: OutboxRepository, N: NotifierManager> OutboxRelay<R, N> {
    pub fn new(
        repository: R,
        notifier: N,
        signal: OutboxSignal,
        batch_size: i64,
        poll_interval: Duration,
    ) -> Self {
        Self {
            repository,
            notifier,
            signal,
            batch_size: batch_size.max(1),
            poll_interval,
        }
    }

    pub async fn drain(&self) -> Result<usize, DatabaseError> {
        let mut delivered = 0;

        loop {
            let batch = self.repository.find_pending_events(self.batch_size).await?;
            let exhausted = (batch.len() as i64) < self.batch_size;

            for record in batch {
                let payload = match serde_json::from_str::<EventPayload>(&record.payload) {
                    Ok(payload) => payload,
                    Err(e) => {
                        error!(
                            event_id = record.id,
                            created_at = %record.created_at,
                            "Dropping undecodable outbox event: {}", e
                        );
                        self.repository.delete_event(record.id).await?;
                        continue;
                    }
                };

                let route = payload.route();
                if let Err(e) = self
                    .notifier
                    .notify(ServerMessage::Control(record.id, payload, route))
                    .await
                {
                    warn!(event_id = record.id, "Outbox delivery deferred: {}", e);
                    return Ok(delivered);
                }

                self.repository.delete_event(record.id).await?;
                delivered += 1;
            }

            if exhausted {
                break;
            }
        }

        if delivered > 0 {
            debug!(delivered, "Outbox drained");
        }

        Ok(delivered)
    }

    pub async fn run(self) {
        info!(
            batch_size = self.batch_size,
            poll_ms = self.poll_interval.as_millis() as u64,
            "Outbox relay started"
        );

        loop {
            if let Err(e) = self.drain().await {
                error!("Outbox relay failed: {}", e);
            }

            tokio::select! {
                _ = self.signal.notified() => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::managers::DefaultNotifierManager;
    use crate::testing::{MemoryStore, message_fixture};
    use crate::transport::ControlRoutingPolicy;

    fn relay(
        store: &MemoryStore,
        batch_size: i64,
    ) -> (
        OutboxRelay<MemoryStore, DefaultNotifierManager>,
        mpsc::Receiver<ServerMessage>,
    ) {
        let (tx, rx) = mpsc::channel(16);
        let relay = OutboxRelay::new(
            store.clone(),
            DefaultNotifierManager::new(tx),
            OutboxSignal::new(),
            batch_size,
            Duration::from_millis(10),
        );
        (relay, rx)
    }

    async fn enqueue(store: &MemoryStore, message_id: i64) {
        let mut tx = store.begin_tx();
        tx.enqueue_event(&EventPayload::Message {
            message: message_fixture(message_id, 7, 1),
        })
        .await
        .unwrap();
        tx.commit();
    }

    #[tokio::test]
    async fn delivers_in_order_across_batches() {
        let store = MemoryStore::new();
        for id in [100, 101, 102] {
            enqueue(&store, id).await;
        }
        let (relay, mut rx) = relay(&store, 2);

        assert_eq!(relay.drain().await.unwrap(), 3);

        let mut seen = Vec::new();
        while let Ok(ServerMessage::Control(_, EventPayload::Message { message }, route)) =
            rx.try_recv()
        {
            assert_eq!(route, ControlRoutingPolicy::Channel { channel_id: 7 });
            seen.push(message.id);
        }
        assert_eq!(seen, vec![100, 101, 102]);
        assert!(store.pending_events().is_empty());
    }

    #[tokio::test]
    async fn drained_rows_leave_the_table() {
        let store = MemoryStore::new();
        let (relay, mut rx) = relay(&store, 2);

        for round in 0..3 {
            for id in 0..5 {
                enqueue(&store, 100 + round * 10 + id).await;
            }
            assert_eq!(store.pending_events().len(), 5);

            assert_eq!(relay.drain().await.unwrap(), 5);
            assert!(store.pending_events().is_empty());
            while rx.try_recv().is_ok() {}
        }
    }

    #[tokio::test]
    async fn uncommitted_events_are_invisible() {
        let store = MemoryStore::new();
        let mut tx = store.begin_tx();
        tx.enqueue_event(&EventPayload::Message {
            message: message_fixture(100, 7, 1),
        })
        .await
        .unwrap();
        drop(tx);

        let (relay, _rx) = relay(&store, 10);
        assert_eq!(relay.drain().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn failed_hand_off_keeps_the_event_pending() {
        let store = MemoryStore::new();
        enqueue(&store, 100).await;
        let (relay, rx) = relay(&store, 10);
        drop(rx);

        assert_eq!(relay.drain().await.unwrap(), 0);
        assert_eq!(store.pending_events().len(), 1);
    }

    #[tokio::test]
    async fn undecodable_rows_do_not_block_the_queue() {
        let store = MemoryStore::new();
        store.push_raw_event("{not json");
        enqueue(&store, 100).await;
        let (relay, mut rx) = relay(&store, 10);

        assert_eq!(relay.drain().await.unwrap(), 1);
        assert!(rx.try_recv().is_ok());
        assert!(store.pending_events().is_empty());
    }

    #[tokio::test]
    async fn wake_before_wait_is_not_lost() {
        let signal = OutboxSignal::new();
        signal.wake();

        tokio::time::timeout(Duration::from_millis(100), signal.notified())
            .await
            .unwrap();
    }
}
