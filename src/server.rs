//! HTTP server bootstrap for the booking ingestion core.
//!
//! This module wires together:
//! - configuration
//! - storage (Postgres or in-memory)
//! - core services (ingest, processor, dead-letter, replay, metrics, reconciliation)
//! - background workers and the reconciliation scheduler
//! - the Axum router

use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderValue, Method};
use axum::response::IntoResponse;
use axum::Router;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::api::{ApiError, ErrorCode};
use crate::auth::signature::{
    HEADER_IDEMPOTENCY_KEY, HEADER_NONCE, HEADER_SIGNATURE, HEADER_SIGNATURE_ALGORITHM,
    HEADER_TIMESTAMP,
};
use crate::auth::{
    ApiKeyRecord, ApiKeyValidator, AuthMiddlewareState, Authenticator, JwtValidator, Permissions,
    RateLimiter, SignatureVerifier,
};
use crate::config::{AppConfig, AuthConfig, StorageBackend};
use crate::dead_letter::{DeadLetterService, ReplayCoordinator};
use crate::infra::memory::{
    InMemoryAuditLog, InMemoryBookingDomain, InMemoryDeadLetterStore, InMemoryEventStore,
    InMemoryJobQueue, InMemoryLeaseStore, InMemoryNonceStore,
};
use crate::infra::postgres::{
    PgAuditLog, PgBookingDomain, PgDeadLetterStore, PgEventStore, PgJobQueue, PgLeaseStore,
    PgNonceStore,
};
use crate::infra::{
    shutdown_signal, spawn_until_shutdown, AuditLog, BookingDomain, CircuitBreaker, DeadLetterRepository,
    EventRepository, JobQueue, LeaseStore, NonceStore, ShutdownCoordinator,
};
use crate::ingest::{IngestService, JobDispatcher, PayloadValidator};
use crate::metrics::{MetricsAggregator, MetricsRegistry, SloPolicy};
use crate::processor::{EventProcessor, StallSweeper, WorkerPool};
use crate::reconcile::{Reconciler, ReconciliationScheduler};

/// How long in-flight work may take to finish after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

const NONCE_PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// Storage and queue backends behind the service traits.
#[derive(Clone)]
pub struct Storage {
    pub events: Arc<dyn EventRepository>,
    pub dead_letters: Arc<dyn DeadLetterRepository>,
    pub audit: Arc<dyn AuditLog>,
    pub domain: Arc<dyn BookingDomain>,
    pub nonces: Arc<dyn NonceStore>,
    pub leases: Arc<dyn LeaseStore>,
    /// `None` processes every event inline
    pub queue: Option<Arc<dyn JobQueue>>,
}

impl Storage {
    pub fn memory(queue_enabled: bool) -> Self {
        Self {
            events: Arc::new(InMemoryEventStore::new()),
            dead_letters: Arc::new(InMemoryDeadLetterStore::new()),
            audit: Arc::new(InMemoryAuditLog::new()),
            domain: Arc::new(InMemoryBookingDomain::new()),
            nonces: Arc::new(InMemoryNonceStore::new()),
            leases: Arc::new(InMemoryLeaseStore::new()),
            queue: queue_enabled.then(|| Arc::new(InMemoryJobQueue::new()) as Arc<dyn JobQueue>),
        }
    }

    pub fn postgres(pool: PgPool, queue_enabled: bool) -> Self {
        Self {
            events: Arc::new(PgEventStore::new(pool.clone())),
            dead_letters: Arc::new(PgDeadLetterStore::new(pool.clone())),
            audit: Arc::new(PgAuditLog::new(pool.clone())),
            domain: Arc::new(PgBookingDomain::new(pool.clone())),
            nonces: Arc::new(PgNonceStore::new(pool.clone())),
            leases: Arc::new(PgLeaseStore::new(pool.clone())),
            queue: queue_enabled.then(|| Arc::new(PgJobQueue::new(pool)) as Arc<dyn JobQueue>),
        }
    }
}

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub ingest: Arc<IngestService>,
    pub dead_letters: Arc<DeadLetterService>,
    pub replay: Arc<ReplayCoordinator>,
    pub aggregator: Arc<MetricsAggregator>,
    pub scheduler: Arc<ReconciliationScheduler>,
    pub dispatcher: Arc<JobDispatcher>,
    pub verifier: Arc<SignatureVerifier>,
    pub events: Arc<dyn EventRepository>,
    pub audit: Arc<dyn AuditLog>,
    pub metrics: Arc<MetricsRegistry>,
    pub slo: Arc<SloPolicy>,
}

/// Fully wired application, ready to serve.
pub struct App {
    pub state: AppState,
    pub storage: Storage,
    pub processor: Arc<EventProcessor>,
    /// Present when the job queue is enabled
    pub workers: Option<Arc<WorkerPool>>,
    pub sweeper: Arc<StallSweeper>,
}

/// Wire every service over `storage`.
pub fn build_app(config: &AppConfig, storage: Storage) -> anyhow::Result<App> {
    let metrics = Arc::new(MetricsRegistry::new());

    let processor = Arc::new(EventProcessor::new(
        storage.events.clone(),
        storage.dead_letters.clone(),
        storage.audit.clone(),
        storage.domain.clone(),
        metrics.clone(),
        config.processor.clone(),
    ));

    let dispatcher = Arc::new(JobDispatcher::new(
        storage.queue.clone(),
        Arc::new(CircuitBreaker::new("job-queue")),
        metrics.clone(),
    ));

    let validator = PayloadValidator::new(config.ingest.schema_validation)?;
    let ingest = Arc::new(
        IngestService::new(
            storage.events.clone(),
            storage.dead_letters.clone(),
            storage.audit.clone(),
            processor.clone(),
            dispatcher.clone(),
            metrics.clone(),
        )?
        .with_validator(validator)
        .with_cutover(config.ingest.cutover.clone()),
    );

    let replay = Arc::new(ReplayCoordinator::new(
        storage.dead_letters.clone(),
        storage.audit.clone(),
        processor.clone(),
        dispatcher.clone(),
        metrics.clone(),
        config.replay.clone(),
    ));

    let reconciler = Arc::new(Reconciler::new(
        storage.events.clone(),
        storage.domain.clone(),
        storage.audit.clone(),
        metrics.clone(),
        config.reconcile.clone(),
    ));
    let scheduler = Arc::new(ReconciliationScheduler::new(
        reconciler,
        storage.leases.clone(),
        config.reconcile_interval,
    ));

    let workers = storage.queue.clone().map(|queue| {
        Arc::new(WorkerPool::new(
            queue,
            processor.clone(),
            config.worker.clone(),
        ))
    });
    let sweeper = Arc::new(StallSweeper::new(
        storage.events.clone(),
        storage.dead_letters.clone(),
        processor.clone(),
        dispatcher.clone(),
        config.sweeper.clone(),
    ));

    let state = AppState {
        ingest,
        dead_letters: Arc::new(DeadLetterService::new(
            storage.dead_letters.clone(),
            storage.audit.clone(),
        )),
        replay,
        aggregator: Arc::new(MetricsAggregator::new(
            storage.events.clone(),
            storage.dead_letters.clone(),
            dispatcher.clone(),
        )),
        scheduler,
        dispatcher,
        verifier: Arc::new(SignatureVerifier::new(
            config.signature.clone(),
            storage.nonces.clone(),
        )),
        events: storage.events.clone(),
        audit: storage.audit.clone(),
        metrics,
        slo: Arc::new(config.slo.clone()),
    };

    Ok(App {
        state,
        storage,
        processor,
        workers,
        sweeper,
    })
}

/// Build the authentication layer state from configuration.
pub fn auth_state(config: &AuthConfig) -> AuthMiddlewareState {
    let api_key_validator = Arc::new(ApiKeyValidator::new());
    if let Some(key) = &config.bootstrap_api_key {
        api_key_validator.register_key(ApiKeyRecord::new(
            key,
            "bootstrap",
            Permissions::operator(),
        ));
        info!("Bootstrap API key is configured");
    }

    let authenticator = Authenticator::new(api_key_validator);
    let authenticator = match &config.jwt_secret {
        Some(secret) => authenticator.with_jwt(Arc::new(JwtValidator::new(
            secret.as_bytes(),
            &config.jwt_issuer,
            &config.jwt_audience,
        ))),
        None => authenticator,
    };

    AuthMiddlewareState {
        authenticator: Arc::new(authenticator),
        require_auth: config.require_auth,
        rate_limiter: config
            .rate_limit_per_minute
            .map(|rpm| Arc::new(RateLimiter::new(rpm))),
    }
}

/// Assemble the full router: authenticated API under the base path plus health checks.
pub fn build_router(
    state: AppState,
    config: &AppConfig,
    auth_state: AuthMiddlewareState,
) -> anyhow::Result<Router> {
    let api = crate::api::router(&config.server.ingest_path)
        .layer(axum::middleware::from_fn_with_state(
            auth_state,
            crate::auth::auth_middleware,
        ))
        .layer(axum::middleware::from_fn_with_state(
            config.server.request_timeout,
            request_timeout,
        ));

    let api_base = &config.server.api_base_path;
    let router = if api_base.is_empty() {
        Router::new().merge(api)
    } else {
        Router::new().nest(api_base, api)
    };

    let mut router = router
        .merge(crate::api::health_router())
        .layer(TraceLayer::new_for_http().make_span_with(crate::telemetry::http_request_span));

    if let Some(cors_layer) = cors_layer(config.server.cors_allow_origins.as_deref())? {
        router = router.layer(cors_layer);
    }

    Ok(router.with_state(state))
}

/// Answer 504 when a request outlives `timeout`.
async fn request_timeout(
    axum::extract::State(timeout): axum::extract::State<Duration>,
    request: axum::extract::Request,
    next: axum::middleware::Next,
) -> axum::response::Response {
    match tokio::time::timeout(timeout, next.run(request)).await {
        Ok(response) => response,
        Err(_) => {
            warn!(timeout_ms = timeout.as_millis() as u64, "Request timed out");
            ApiError::new(ErrorCode::Timeout, "request timed out").into_response()
        }
    }
}

fn cors_layer(origins: Option<&[String]>) -> anyhow::Result<Option<CorsLayer>> {
    let Some(origins) = origins.filter(|o| !o.is_empty()) else {
        return Ok(None);
    };

    let allow_origin = if origins.iter().any(|o| o == "*") {
        AllowOrigin::any()
    } else {
        let origins: Vec<HeaderValue> = origins
            .iter()
            .map(|s| {
                s.parse::<HeaderValue>()
                    .map_err(|e| anyhow::anyhow!("Invalid CORS origin {s:?}: {e}"))
            })
            .collect::<anyhow::Result<_>>()?;
        AllowOrigin::list(origins)
    };

    Ok(Some(
        CorsLayer::new()
            .allow_origin(allow_origin)
            .allow_methods([Method::GET, Method::POST, Method::PATCH])
            .allow_headers([
                axum::http::header::AUTHORIZATION,
                axum::http::header::CONTENT_TYPE,
                axum::http::header::HeaderName::from_static(HEADER_SIGNATURE),
                axum::http::header::HeaderName::from_static(HEADER_SIGNATURE_ALGORITHM),
                axum::http::header::HeaderName::from_static(HEADER_TIMESTAMP),
                axum::http::header::HeaderName::from_static(HEADER_NONCE),
                axum::http::header::HeaderName::from_static(HEADER_IDEMPOTENCY_KEY),
            ]),
    ))
}

/// Periodically drop nonces that have aged out of the replay window.
pub async fn start_nonce_purge(nonces: Arc<dyn NonceStore>, shutdown: &ShutdownCoordinator) {
    let handle = spawn_until_shutdown(shutdown.signal(), async move {
        let mut ticker = tokio::time::interval(NONCE_PURGE_INTERVAL);
        loop {
            ticker.tick().await;
            match nonces.purge_expired(chrono::Utc::now()).await {
                Ok(0) => {}
                Ok(removed) => debug!(removed, "Purged expired nonces"),
                Err(e) => warn!(error = %e, "Nonce purge failed"),
            }
        }
    });
    shutdown.track("nonce-purge", handle).await;
}

/// Connect to Postgres, optionally applying migrations.
pub async fn connect_postgres(
    database_url: &str,
    max_connections: u32,
    migrate: bool,
) -> anyhow::Result<PgPool> {
    info!("Connecting to PostgreSQL...");
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;
    info!("Connected to PostgreSQL");

    if migrate {
        info!("Running database migrations...");
        crate::migrations::run_postgres(&pool).await?;
        info!("Database migrations applied");
    } else {
        info!("DB migrations skipped (DB_MIGRATE_ON_STARTUP=0)");
    }
    Ok(pool)
}

/// Start the HTTP server and background tasks, returning after a graceful shutdown.
pub async fn run() -> anyhow::Result<()> {
    let telemetry = crate::telemetry::TelemetryConfig::from_env();
    crate::telemetry::init_telemetry(&telemetry)
        .map_err(|e| anyhow::anyhow!("failed to initialize telemetry: {e}"))?;

    info!("Starting booking-ingest v{}", env!("CARGO_PKG_VERSION"));

    let config = AppConfig::from_env()?;
    info!(
        listen_addr = %config.server.listen_addr,
        api_base_path = %config.server.api_base_path,
        ingest_route = %config.ingest_route(),
        storage = ?config.storage.backend,
        queue_enabled = config.ingest.queue_enabled,
        cutover = %config.ingest.cutover,
        replay_queued = config.replay.queued,
        "Configuration loaded"
    );

    let storage = match config.storage.backend {
        StorageBackend::Postgres => {
            let database_url = config
                .storage
                .database_url
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("DATABASE_URL is required"))?;
            let pool = connect_postgres(
                database_url,
                config.storage.max_connections,
                config.storage.migrate_on_startup,
            )
            .await?;
            Storage::postgres(pool, config.ingest.queue_enabled)
        }
        StorageBackend::Memory => {
            info!("Using in-memory storage; data is lost on restart");
            Storage::memory(config.ingest.queue_enabled)
        }
    };

    let app = build_app(&config, storage)?;
    let shutdown = ShutdownCoordinator::new();

    if let Some(workers) = &app.workers {
        workers.clone().start(&shutdown).await;
    }
    app.sweeper.clone().start(&shutdown).await;
    app.state.scheduler.clone().start(&shutdown).await;
    start_nonce_purge(app.storage.nonces.clone(), &shutdown).await;

    let router = build_router(app.state.clone(), &config, auth_state(&config.auth))?;

    info!("Starting HTTP server on {}", config.server.listen_addr);
    let listener = tokio::net::TcpListener::bind(config.server.listen_addr).await?;
    info!("booking-ingest is ready to accept connections");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("HTTP server stopped; draining background tasks");
    shutdown.graceful_shutdown(DRAIN_TIMEOUT).await;
    crate::telemetry::shutdown_telemetry();

    Ok(())
}
