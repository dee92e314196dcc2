//! fedcore - the federation core of an ActivityPub server
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      API Layer (Axum)                        │
//! │  - Inbox / shared inbox                                      │
//! │  - Actor documents, followers synchronization, metrics       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │               Federation + Service Layer                     │
//! │  - Signature verification, activity handlers                 │
//! │  - Distribution, delivery, job runner                        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Data Layer                              │
//! │  - SQLite (sqlx): edges, statuses, delivery and job queues   │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod config;
pub mod data;
pub mod error;
pub mod federation;
pub mod metrics;
pub mod service;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use federation::{
    ActivityProcessor, CollectionSynchronizer, DeliveryWorker, Distributor, HttpActorFetcher,
    KeyResolver, PollExpirationNotifier, RemoteActorFetcher, SignatureVerifier, TagManager,
};
use service::{AccountService, JobQueue, RelayService, StatusService};

const USER_AGENT: &str = concat!("fedcore/", env!("CARGO_PKG_VERSION"));

/// Application state shared across handlers and background runners
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<config::AppConfig>,
    pub db: Arc<data::Database>,
    pub tags: Arc<TagManager>,
    pub resolver: Arc<KeyResolver>,
    pub verifier: Arc<SignatureVerifier>,
    pub jobs: Arc<JobQueue>,
    pub distributor: Arc<Distributor>,
    pub delivery: Arc<DeliveryWorker>,
    pub processor: Arc<ActivityProcessor>,
    pub collection_sync: Arc<CollectionSynchronizer>,
    pub poll_notifier: Arc<PollExpirationNotifier>,
    pub accounts: Arc<AccountService>,
    pub statuses: Arc<StatusService>,
    pub relays: Arc<RelayService>,
}

impl AppState {
    /// Initialize application state with the HTTP actor fetcher.
    ///
    /// # Errors
    /// Returns error if the database cannot be opened or the instance actor
    /// cannot be created.
    pub async fn new(config: config::AppConfig) -> Result<Self, error::AppError> {
        let http_client = build_http_client(&config)?;
        let fetcher = Arc::new(HttpActorFetcher::new(
            http_client,
            config.federation.allow_private_addresses,
        ));
        Self::with_fetcher(config, fetcher).await
    }

    /// Initialize application state around a given remote actor fetcher.
    pub async fn with_fetcher(
        config: config::AppConfig,
        fetcher: Arc<dyn RemoteActorFetcher>,
    ) -> Result<Self, error::AppError> {
        tracing::info!("Initializing application state...");

        let db = Arc::new(data::Database::connect(&config.database.path).await?);
        tracing::info!(path = %config.database.path.display(), "Database connected");

        let tags = Arc::new(TagManager::new(&config.server));
        let resolver = Arc::new(KeyResolver::new(
            db.clone(),
            fetcher,
            Some(Duration::from_secs(config.federation.key_cache_ttl_secs)),
        ));
        let verifier = Arc::new(SignatureVerifier::new(
            resolver.clone(),
            config.federation.signature_max_skew_secs,
        ));
        let jobs = Arc::new(JobQueue::new(db.clone()));

        let delivery_wake = Arc::new(Notify::new());
        let distributor = Arc::new(
            Distributor::new(db.clone(), tags.clone(), delivery_wake.clone()).with_unreachable_retry(
                chrono::Duration::seconds(config.delivery.unreachable_retry_secs),
            ),
        );
        let delivery = Arc::new(DeliveryWorker::new(
            db.clone(),
            tags.clone(),
            build_http_client(&config)?,
            config.delivery.clone(),
            &config.federation,
            delivery_wake,
        ));

        let poll_grace = chrono::Duration::seconds(config.polls.expiry_grace_secs);
        let poll_notifier = Arc::new(PollExpirationNotifier::new(
            db.clone(),
            jobs.clone(),
            poll_grace,
        ));
        let processor = Arc::new(ActivityProcessor::new(
            db.clone(),
            tags.clone(),
            resolver.clone(),
            verifier.clone(),
            distributor.clone(),
            jobs.clone(),
            poll_grace,
        ));
        let collection_sync = Arc::new(CollectionSynchronizer::new(
            db.clone(),
            tags.clone(),
            resolver.clone(),
            distributor.clone(),
            jobs.clone(),
            config.instance.actor_username.clone(),
        ));

        let accounts = Arc::new(AccountService::new(
            db.clone(),
            tags.clone(),
            resolver.clone(),
            distributor.clone(),
        ));
        let statuses = Arc::new(StatusService::new(
            db.clone(),
            tags.clone(),
            resolver.clone(),
            jobs.clone(),
            distributor.clone(),
            poll_notifier.clone(),
        ));
        let relays = Arc::new(RelayService::new(
            db.clone(),
            tags.clone(),
            distributor.clone(),
            config.instance.actor_username.clone(),
            config.federation.allow_private_addresses,
        ));

        accounts
            .ensure_instance_actor(&config.instance.actor_username)
            .await?;

        tracing::info!("Application state initialized");

        Ok(Self {
            config: Arc::new(config),
            db,
            tags,
            resolver,
            verifier,
            jobs,
            distributor,
            delivery,
            processor,
            collection_sync,
            poll_notifier,
            accounts,
            statuses,
            relays,
        })
    }
}

fn build_http_client(config: &config::AppConfig) -> Result<reqwest::Client, error::AppError> {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(config.federation.request_timeout())
        .build()
        .map_err(|e| error::AppError::Internal(e.into()))
}

/// Build the Axum router with all routes.
///
/// Shared by the binary and integration tests.
pub fn build_router(state: AppState) -> axum::Router {
    use axum::Router;
    use tower_http::trace::TraceLayer;

    Router::new()
        .route("/health", axum::routing::get(health_check))
        .merge(api::activitypub_router())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
        .merge(api::metrics_router())
}

async fn health_check() -> &'static str {
    "OK"
}
