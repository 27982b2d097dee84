mod auth;
mod channel;
mod config;
mod db;
mod error;
mod flag;
mod managers;
mod mention;
mod message;
mod middleware;
mod model;
mod outbox;
mod realtime;
mod transport;
mod unread;
mod user;

#[cfg(test)]
mod testing;

use config::Config;
use db::Postgre;
use http::Method;
use managers::DefaultNotifierManager;
use message::{MessageService, message_routes};
use middleware::AuthorizeService;
use outbox::{OutboxRelay, OutboxSignal};
use realtime::{RealtimeServer, RealtimeService, realtime_routes};
use transport::ServerMessage;

use axum_server::tls_rustls::RustlsConfig;
use tokio::sync::mpsc;
use tower_http::cors::{AllowHeaders, AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use utoipa::OpenApi;
use utoipa_axum::router::OpenApiRouter;
use utoipa_swagger_ui::SwaggerUi;

pub const MESSAGE_TAG: &str = "message";
pub const REALTIME_TAG: &str = "realtime";

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(OpenApi)]
#[openapi(tags(
    (name = MESSAGE_TAG, description = "Message API endpoints"),
    (name = REALTIME_TAG, description = "Realtime event stream")
))]
struct ApiDoc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "threadline_server=info,tower_http=info".into()),
        )
        .init();

    let config = Config::from_env()?;
    let messaging = config.messaging()?;

    let postgre = Postgre::connect(&config.database_url, config.database_max_connections).await?;

    let (event_sender, event_receiver) = mpsc::channel::<ServerMessage>(EVENT_CHANNEL_CAPACITY);
    let notifier_manager = DefaultNotifierManager::new(event_sender.clone());
    let realtime_service = RealtimeService::new(event_sender);

    tokio::spawn(RealtimeServer::new(event_receiver, postgre.clone()).run());
    let outbox_signal = OutboxSignal::new();

    let relay = OutboxRelay::new(
        postgre.clone(),
        notifier_manager,
        outbox_signal.clone(),
        config.outbox_batch_size,
        config.outbox_poll_interval,
    );
    tokio::spawn(relay.run());

    let authorize_service = AuthorizeService::new(postgre.clone());
    let message_service = MessageService::new(
        postgre.clone(),
        postgre.clone(),
        postgre.clone(),
        messaging,
        outbox_signal,
    );

    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::any())
        .allow_methods(vec![
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(AllowHeaders::any());

    let (router, api) = OpenApiRouter::with_openapi(ApiDoc::openapi())
        .nest(
            "/message",
            message_routes(message_service, authorize_service.clone()),
        )
        .nest(
            "/realtime",
            realtime_routes(realtime_service, authorize_service),
        )
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .split_for_parts();

    let router = router.merge(SwaggerUi::new("/swagger-ui").url("/apidoc/openapi.json", api));

    match &config.tls {
        Some(tls) => {
            rustls::crypto::aws_lc_rs::default_provider()
                .install_default()
                .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

            let tls_config = RustlsConfig::from_pem_file(&tls.cert_path, &tls.key_path).await?;

            info!("HTTPS server listening on https://{}", config.bind_addr);
            axum_server::bind_rustls(config.bind_addr, tls_config)
                .serve(router.into_make_service())
                .await?;
        }
        None => {
            let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;

            info!("HTTP server listening on http://{}", config.bind_addr);
            axum::serve(listener, router).await?;
        }
    }

    Ok(())
}
