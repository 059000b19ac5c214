//! Splitter federation engine
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      API Layer (Axum)                        │
//! │  - ActivityPub + WebFinger endpoints                        │
//! │  - Local-client federation actions                          │
//! │  - Admin endpoints                                          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Federation Layer                          │
//! │  - Signatures, instance identity, actor resolution          │
//! │  - Delivery (outbox, retry, circuit breaker)                │
//! │  - Inbox dispatch, messaging guard, reputation              │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Data Layer                              │
//! │  - SQLite (sqlx)                                            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `api`: HTTP handlers
//! - `federation`: ActivityPub federation handling
//! - `data`: Database layer
//! - `auth`: Bearer-token middleware
//! - `config`: Configuration management
//! - `error`: Error types
//! - `metrics`: Prometheus instruments

pub mod api;
pub mod auth;
pub mod config;
pub mod data;
pub mod error;
pub mod federation;
pub mod metrics;

use std::sync::Arc;

use federation::{
    ActorResolver, DeliveryEngine, DeliveryPolicy, FederationWorker, InboxDispatcher,
    INSTANCE_ACTOR, InstanceDirectory, InstanceIdentity, MessagingGuard,
};

/// Largest accepted request body (inbound activities included)
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Application state shared across all handlers
///
/// Cloned for each request; every service inside is shared.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<config::AppConfig>,

    /// Database connection pool
    pub db: Arc<data::Database>,

    /// Instance keypair and local actor URIs
    pub identity: Arc<InstanceIdentity>,

    /// Remote actor discovery and cache
    pub resolver: Arc<ActorResolver>,

    /// Outbound delivery engine
    pub delivery: DeliveryEngine,

    /// Inbound activity dispatcher
    pub inbox: Arc<InboxDispatcher>,

    /// Messaging rate limits and security events
    pub guard: Arc<MessagingGuard>,

    /// Background retry and reputation sweeps
    pub worker: Arc<FederationWorker>,
}

impl AppState {
    /// Initialize application state
    ///
    /// # Steps
    /// 1. Connect to SQLite database (migrations applied)
    /// 2. Load or generate the instance keypair
    /// 3. Build the HTTP client and federation services
    ///
    /// # Errors
    /// Returns error if any initialization step fails
    pub async fn new(config: config::AppConfig) -> Result<Self, error::AppError> {
        tracing::info!("Initializing application state...");

        // 1. Connect to SQLite database
        let db = Arc::new(data::Database::connect(&config.database.path).await?);
        tracing::info!("Database connected");

        // 2. Instance identity
        let domain = config.server.domain.clone();
        let base_url = config.server.base_url();
        let identity = Arc::new(InstanceIdentity::new(
            db.clone(),
            &domain,
            &base_url,
            config.federation.key_bits,
        ));
        identity.ensure_keys().await?;
        tracing::info!(%domain, "Instance keys ready");

        // 3. HTTP client and federation services
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("Splitter/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let directory = Arc::new(InstanceDirectory::new(
            &config.federation.known_instances,
            &domain,
            &base_url,
        ));
        let resolver = Arc::new(ActorResolver::new(
            db.clone(),
            http_client.clone(),
            directory,
            config.federation.actor_cache_ttl(),
            config.federation.fetch_timeout(),
        ));
        let delivery = DeliveryEngine::new(
            db.clone(),
            identity.clone(),
            resolver.clone(),
            http_client,
            DeliveryPolicy::from_config(&config.federation),
            config.federation.delivery_timeout(),
            config.federation.delivery_concurrency,
        );
        let guard = Arc::new(MessagingGuard::new());
        let inbox = Arc::new(InboxDispatcher::new(
            db.clone(),
            identity.clone(),
            resolver.clone(),
            delivery.clone(),
            guard.clone(),
            config.federation.require_signatures,
        ));
        let worker = Arc::new(FederationWorker::new(
            db.clone(),
            delivery.clone(),
            config.federation.retry_batch_size,
        ));

        tracing::info!("Application state initialized successfully");

        Ok(Self {
            config: Arc::new(config),
            db,
            identity,
            resolver,
            delivery,
            inbox,
            guard,
            worker,
        })
    }
}

/// Build the Axum router with all routes.
///
/// This is shared by the binary and integration tests to keep route
/// composition consistent across environments.
pub fn build_router(state: AppState) -> axum::Router {
    use axum::{Router, middleware};
    use tower::ServiceBuilder;
    use tower_http::{
        limit::RequestBodyLimitLayer, map_response_body::MapResponseBodyLayer, trace::TraceLayer,
    };

    let cors_layer = build_cors_layer(&state.config.server);
    let require_token = || middleware::from_fn_with_state(state.clone(), auth::require_admin_token);

    let protected = Router::new()
        .nest(
            "/federation",
            api::federation_router().route_layer(require_token()),
        )
        .nest("/admin", api::admin_router().route_layer(require_token()));

    Router::new()
        .route("/health", axum::routing::get(health_check))
        .merge(api::wellknown_router())
        .merge(api::activitypub_router())
        .merge(api::metrics_router())
        .nest("/api", protected)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors_layer)
                .layer(MapResponseBodyLayer::new(axum::body::Body::new))
                .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES)),
        )
        .with_state(state)
}

fn build_cors_layer(server: &config::ServerConfig) -> tower_http::cors::CorsLayer {
    use axum::http::HeaderValue;
    use tower_http::cors::{Any, CorsLayer};

    if !server.protocol.eq_ignore_ascii_case("https") {
        return CorsLayer::permissive();
    }

    let allowed_origin = server.base_url();
    match HeaderValue::from_str(&allowed_origin) {
        Ok(origin) => CorsLayer::new()
            .allow_origin([origin])
            .allow_methods(Any)
            .allow_headers(Any),
        Err(error) => {
            tracing::error!(
                %error,
                origin = %allowed_origin,
                "Failed to parse CORS origin from server base URL; denying cross-origin requests"
            );
            CorsLayer::new().allow_methods(Any).allow_headers(Any)
        }
    }
}

async fn health_check(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "ok",
        "domain": state.config.server.domain,
        "actor": state.identity.actor_uri(INSTANCE_ACTOR),
    }))
}
