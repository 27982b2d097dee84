// ═══════════════════════════════════════════════════════════════════════════════
// IMPORTS
// ═══════════════════════════════════════════════════════════════════════════════

use std::time::Duration;

use axum::{
    Extension,
    extract::State,
    middleware::from_fn_with_state,
    response::sse::{Event, KeepAlive, Sse},
};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_stream::{Stream, StreamExt, wrappers::ReceiverStream};
use tracing::{debug, error, info, warn};
use utoipa_axum::{router::OpenApiRouter, routes};

use crate::auth::Session;
use crate::channel::ChannelAccess;
use crate::db::Postgre;
use crate::error::ApiError;
use crate::managers::NotifierError;
use crate::middleware::{AuthorizeService, authorize};
use crate::model::EventPayload;
use crate::transport::{ControlRoutingPolicy, ServerMessage, Subscriber, SubscriberMessage};

const SUBSCRIBER_BUFFER: usize = 256;
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

// ═══════════════════════════════════════════════════════════════════════════════
// SERVER
// ═══════════════════════════════════════════════════════════════════════════════

pub struct RealtimeServer<A: ChannelAccess> {
    receiver: mpsc::Receiver<ServerMessage>,
    observers: Vec<Subscriber>,
    access: A,
}

impl<A: ChannelAccess> RealtimeServer<A> {
    pub fn new(receiver: mpsc::Receiver<ServerMessage>, access: A) -> Self {
        Self {
            receiver,
            observers: Vec::new(),
            access,
        }
    }

    fn handle_subscribe(&mut self, subscriber: Subscriber) {
        debug!(user_id = subscriber.user_id(), "Subscriber connected");
        self.observers.push(subscriber);
    }

    async fn can_receive(&self, subscriber: &Subscriber, policy: &ControlRoutingPolicy) -> bool {
        match policy {
            ControlRoutingPolicy::Channel { channel_id } => {
                match self.access.can_read(subscriber.user_id(), *channel_id).await {
                    Ok(allowed) => allowed,
                    Err(e) => {
                        warn!(
                            user_id = subscriber.user_id(),
                            channel_id = *channel_id,
                            "Access check failed: {}", e
                        );
                        false
                    }
                }
            }
            ControlRoutingPolicy::User { user_id } => subscriber.user_id() == *user_id,
        }
    }

    async fn route_control(
        &mut self,
        event_id: i64,
        payload: EventPayload,
        policy: ControlRoutingPolicy,
    ) {
        let observers = std::mem::take(&mut self.observers);
        let mut kept = Vec::with_capacity(observers.len());

        for subscriber in observers {
            if !self.can_receive(&subscriber, &policy).await {
                kept.push(subscriber);
                continue;
            }

            match subscriber.try_send(SubscriberMessage::Event(event_id, payload.clone())) {
                Ok(()) => kept.push(subscriber),
                Err(TrySendError::Full(_)) => {
                    warn!(
                        user_id = subscriber.user_id(),
                        event_id,
                        "Subscriber lagging, closing stream"
                    );
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(user_id = subscriber.user_id(), "Subscriber disconnected");
                }
            }
        }

        self.observers = kept;
    }

    pub async fn run(mut self) {
        info!("Realtime server started");

        while let Some(message) = self.receiver.recv().await {
            match message {
                ServerMessage::Subscribe(subscriber) => self.handle_subscribe(subscriber),
                ServerMessage::Control(event_id, payload, policy) => {
                    self.route_control(event_id, payload, policy).await
                }
            }
        }

        info!("Realtime server stopped");
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SERVICE
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Clone)]
pub struct RealtimeService {
    sender: mpsc::Sender<ServerMessage>,
}

impl RealtimeService {
    pub fn new(sender: mpsc::Sender<ServerMessage>) -> Self {
        Self { sender }
    }

    pub async fn subscribe(
        &self,
        user_id: i64,
    ) -> Result<mpsc::Receiver<SubscriberMessage>, NotifierError> {
        let (sender, receiver) = mpsc::channel(SUBSCRIBER_BUFFER);

        self.sender
            .send(ServerMessage::Subscribe(Subscriber::new(user_id, sender)))
            .await
            .map_err(|_| NotifierError::ServiceUnavailable)?;

        Ok(receiver)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ROUTES
// ═══════════════════════════════════════════════════════════════════════════════

pub fn realtime_routes(
    realtime_service: RealtimeService,
    authorize_service: AuthorizeService<Postgre>,
) -> OpenApiRouter {
    OpenApiRouter::new()
        .routes(routes!(events_handler))
        .layer(from_fn_with_state(authorize_service, authorize))
        .with_state(realtime_service)
}

// ═══════════════════════════════════════════════════════════════════════════════
// HANDLERS
// ═══════════════════════════════════════════════════════════════════════════════

fn to_sse(message: SubscriberMessage) -> Result<Event, axum::Error> {
    match message {
        SubscriberMessage::Event(event_id, payload) => Event::default()
            .id(event_id.to_string())
            .event(payload.name())
            .json_data(&payload),
    }
}

#[utoipa::path(
    get,
    tag = "realtime",
    path = "/events",
    description = "Server-sent stream of message and flag events visible to the caller",
    responses(
        (status = 200, description = "Event stream", content_type = "text/event-stream"),
        (status = 500, body = ApiError),
    ),
    security(("api_key" = []))
)]
async fn events_handler(
    State(service): State<RealtimeService>,
    Extension(session): Extension<Session>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ApiError> {
    let receiver = service.subscribe(session.user_id).await.map_err(|e| {
        error!("Event stream unavailable: {}", e);
        ApiError::InternalServerError("Internal server error".to_string())
    })?;

    info!(user_id = session.user_id, "Event stream opened");

    let stream = ReceiverStream::new(receiver).map(to_sse);
    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::managers::DefaultNotifierManager;
    use crate::outbox::{OutboxRelay, OutboxSignal, OutboxTransaction};
    use crate::testing::{MemoryStore, message_fixture};

    fn server(store: &MemoryStore) -> RealtimeServer<MemoryStore> {
        let (_sender, receiver) = mpsc::channel(1);
        RealtimeServer::new(receiver, store.clone())
    }

    fn subscribe(
        server: &mut RealtimeServer<MemoryStore>,
        user_id: i64,
    ) -> mpsc::Receiver<SubscriberMessage> {
        let (sender, receiver) = mpsc::channel(4);
        server.handle_subscribe(Subscriber::new(user_id, sender));
        receiver
    }

    fn message_event() -> EventPayload {
        EventPayload::Message {
            message: message_fixture(100, 7, 1),
        }
    }

    #[tokio::test]
    async fn channel_events_reach_members_only() {
        let store = MemoryStore::new();
        store.insert_channel(7, &[1, 2]);
        let mut server = server(&store);
        let mut member = subscribe(&mut server, 2);
        let mut outsider = subscribe(&mut server, 3);

        server
            .route_control(5, message_event(), ControlRoutingPolicy::Channel { channel_id: 7 })
            .await;

        let Ok(SubscriberMessage::Event(event_id, EventPayload::Message { message })) =
            member.try_recv()
        else {
            panic!("member should receive the event");
        };
        assert_eq!(event_id, 5);
        assert_eq!(message.id, 100);
        assert!(outsider.try_recv().is_err());
        assert_eq!(server.observers.len(), 2);
    }

    #[tokio::test]
    async fn user_events_reach_their_owner_only() {
        let store = MemoryStore::new();
        store.insert_channel(7, &[1, 2]);
        let mut server = server(&store);
        let mut owner = subscribe(&mut server, 1);
        let mut other = subscribe(&mut server, 2);

        server
            .route_control(6, message_event(), ControlRoutingPolicy::User { user_id: 1 })
            .await;

        assert!(owner.try_recv().is_ok());
        assert!(other.try_recv().is_err());
    }

    #[tokio::test]
    async fn gone_and_lagging_subscribers_are_dropped() {
        let store = MemoryStore::new();
        store.insert_channel(7, &[1, 2, 3]);
        let mut server = server(&store);
        drop(subscribe(&mut server, 1));
        let (sender, _lagging) = mpsc::channel(1);
        server.handle_subscribe(Subscriber::new(2, sender));
        let mut live = subscribe(&mut server, 3);

        let policy = ControlRoutingPolicy::Channel { channel_id: 7 };
        server.route_control(1, message_event(), policy.clone()).await;
        server.route_control(2, message_event(), policy).await;

        assert_eq!(server.observers.len(), 1);
        assert_eq!(server.observers[0].user_id(), 3);
        assert!(live.try_recv().is_ok());
        assert!(live.try_recv().is_ok());
    }

    #[tokio::test]
    async fn committed_events_flow_from_outbox_to_subscribers() {
        let store = MemoryStore::new();
        store.insert_channel(7, &[1]);
        let (sender, receiver) = mpsc::channel(16);
        tokio::spawn(RealtimeServer::new(receiver, store.clone()).run());

        let service = RealtimeService::new(sender.clone());
        let mut stream = service.subscribe(1).await.unwrap();

        let mut tx = store.begin_tx();
        tx.enqueue_event(&message_event()).await.unwrap();
        tx.commit();

        let relay = OutboxRelay::new(
            store.clone(),
            DefaultNotifierManager::new(sender),
            OutboxSignal::new(),
            10,
            Duration::from_millis(10),
        );
        assert_eq!(relay.drain().await.unwrap(), 1);

        let received = tokio::time::timeout(Duration::from_secs(1), stream.recv())
            .await
            .unwrap();
        assert!(matches!(
            received,
            Some(SubscriberMessage::Event(_, EventPayload::Message { .. }))
        ));
        assert!(store.pending_events().is_empty());
    }
}
