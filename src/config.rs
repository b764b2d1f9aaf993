//! Environment configuration.
//!
//! Every setting is read once at startup into [`AppConfig`]. Invalid values
//! are reported as [`ConfigError`]s naming the offending variable.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::auth::signature::MAX_SKEW_TOLERANCE;
use crate::auth::SignatureConfig;
use crate::dead_letter::ReplayConfig;
use crate::infra::RetryPolicy;
use crate::ingest::{CutoverStrategy, SchemaValidationMode};
use crate::metrics::SloPolicy;
use crate::processor::{ProcessorConfig, SweeperConfig, WorkerPoolConfig};
use crate::reconcile::{ReconcileConfig, ReconcileThresholds};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {message}")]
    Invalid { var: &'static str, message: String },

    #[error("{0}")]
    Missing(String),
}

fn invalid(var: &'static str, message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        var,
        message: message.into(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Memory,
    Postgres,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    /// Prefix for every authenticated route
    pub api_base_path: String,
    pub ingest_path: String,
    /// `None` disables the CORS layer; `Some(["*"])` allows any origin
    pub cors_allow_origins: Option<Vec<String>>,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub database_url: Option<String>,
    pub max_connections: u32,
    pub migrate_on_startup: bool,
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub require_auth: bool,
    pub jwt_secret: Option<String>,
    pub jwt_issuer: String,
    pub jwt_audience: String,
    pub bootstrap_api_key: Option<String>,
    pub rate_limit_per_minute: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub schema_validation: SchemaValidationMode,
    pub queue_enabled: bool,
    pub cutover: CutoverStrategy,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub auth: AuthConfig,
    pub signature: SignatureConfig,
    pub ingest: IngestConfig,
    pub processor: ProcessorConfig,
    pub worker: WorkerPoolConfig,
    pub sweeper: SweeperConfig,
    pub replay: ReplayConfig,
    pub reconcile: ReconcileConfig,
    pub reconcile_interval: Duration,
    pub slo: SloPolicy,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_map(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        Self::from_lookup(|key| vars.get(key).cloned())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(&lookup);

        let host = env.string("HOST").unwrap_or_else(|| "0.0.0.0".to_string());
        let port: u16 = env.parse("PORT")?.unwrap_or(8080);
        let listen_addr: SocketAddr = format!("{host}:{port}")
            .parse()
            .map_err(|e| invalid("HOST", format!("{host}:{port}: {e}")))?;

        let server = ServerConfig {
            listen_addr,
            api_base_path: normalize_path(
                "API_BASE_PATH",
                &env.string("API_BASE_PATH").unwrap_or_else(|| "/api/v1".to_string()),
            )?,
            ingest_path: normalize_path(
                "INGEST_PATH",
                &env
                    .string("INGEST_PATH")
                    .unwrap_or_else(|| "/ingest/bookings".to_string()),
            )?,
            cors_allow_origins: env.string("CORS_ALLOW_ORIGINS").map(|v| split_list(&v)),
            request_timeout: Duration::from_millis(
                env.parse("REQUEST_TIMEOUT_MS")?.unwrap_or(30_000),
            ),
        };

        let database_url = env.string("DATABASE_URL");
        let backend = match env.string("STORAGE_BACKEND") {
            Some(v) => match v.to_ascii_lowercase().as_str() {
                "memory" | "in_memory" | "inmemory" => StorageBackend::Memory,
                "postgres" | "postgresql" | "pg" => StorageBackend::Postgres,
                other => {
                    return Err(invalid(
                        "STORAGE_BACKEND",
                        format!("{other} (expected memory or postgres)"),
                    ))
                }
            },
            None if database_url.is_some() => StorageBackend::Postgres,
            None => StorageBackend::Memory,
        };
        if backend == StorageBackend::Postgres && database_url.is_none() {
            return Err(ConfigError::Missing(
                "STORAGE_BACKEND=postgres requires DATABASE_URL".to_string(),
            ));
        }
        let storage = StorageConfig {
            backend,
            database_url,
            max_connections: env.parse("MAX_DB_CONNECTIONS")?.unwrap_or(10),
            migrate_on_startup: env.flag("DB_MIGRATE_ON_STARTUP")?.unwrap_or(true),
        };

        let require_auth = match env.string("AUTH_MODE") {
            None => true,
            Some(v) => match v.to_ascii_lowercase().as_str() {
                "required" | "enabled" => true,
                "disabled" | "off" => false,
                other => {
                    return Err(invalid(
                        "AUTH_MODE",
                        format!("{other} (expected required or disabled)"),
                    ))
                }
            },
        };
        let auth = AuthConfig {
            require_auth,
            jwt_secret: env.string("JWT_SECRET"),
            jwt_issuer: env
                .string("JWT_ISSUER")
                .unwrap_or_else(|| "booking-ingest".to_string()),
            jwt_audience: env
                .string("JWT_AUDIENCE")
                .unwrap_or_else(|| "booking-ingest-api".to_string()),
            bootstrap_api_key: env.string("BOOTSTRAP_API_KEY"),
            rate_limit_per_minute: env.parse::<u32>("RATE_LIMIT_PER_MINUTE")?.filter(|v| *v > 0),
        };
        if auth.require_auth && auth.jwt_secret.is_none() && auth.bootstrap_api_key.is_none() {
            return Err(ConfigError::Missing(
                "AUTH_MODE=required but no auth is configured; set JWT_SECRET or BOOTSTRAP_API_KEY (or AUTH_MODE=disabled for local dev)"
                    .to_string(),
            ));
        }

        let secret = env.string("SIGNATURE_SECRET").ok_or_else(|| {
            ConfigError::Missing("SIGNATURE_SECRET is required".to_string())
        })?;
        let skew = Duration::from_secs(env.parse("SIGNATURE_SKEW_SECS")?.unwrap_or(300));
        if skew.is_zero() || skew > MAX_SKEW_TOLERANCE {
            return Err(invalid(
                "SIGNATURE_SKEW_SECS",
                format!("must be between 1 and {}", MAX_SKEW_TOLERANCE.as_secs()),
            ));
        }
        let signature = SignatureConfig::new(secret.into_bytes(), skew);

        let schema_validation = SchemaValidationMode::from_env_value(
            &env.string("SCHEMA_VALIDATION_MODE").unwrap_or_default(),
        )
        .map_err(|e| invalid("SCHEMA_VALIDATION_MODE", e))?;
        let cutover = CutoverStrategy::parse(
            &env.string("CUTOVER_STRATEGY").unwrap_or_default(),
            env.string("CUTOVER_PERCENT").as_deref(),
            env.string("CUTOVER_SALT").as_deref(),
            env.string("CUTOVER_ALLOW_LIST").as_deref(),
        )
        .map_err(|e| invalid("CUTOVER_STRATEGY", e))?;
        let ingest = IngestConfig {
            schema_validation,
            queue_enabled: env.flag("QUEUE_ENABLED")?.unwrap_or(true),
            cutover,
        };

        let defaults = RetryPolicy::default();
        let retry = RetryPolicy {
            max_attempts: env
                .parse("RETRY_MAX_ATTEMPTS")?
                .unwrap_or(defaults.max_attempts)
                .max(1),
            initial_delay: env
                .millis("RETRY_INITIAL_DELAY_MS")?
                .unwrap_or(defaults.initial_delay),
            max_delay: env.millis("RETRY_MAX_DELAY_MS")?.unwrap_or(defaults.max_delay),
            multiplier: env.parse("RETRY_MULTIPLIER")?.unwrap_or(defaults.multiplier),
            jitter: env.parse("RETRY_JITTER")?.unwrap_or(defaults.jitter),
        };
        if retry.multiplier < 1.0 {
            return Err(invalid("RETRY_MULTIPLIER", "must be >= 1.0"));
        }
        if !(0.0..=1.0).contains(&retry.jitter) {
            return Err(invalid("RETRY_JITTER", "must be between 0.0 and 1.0"));
        }
        let processor = ProcessorConfig {
            retry,
            stale_processing_after: Duration::from_secs(
                env.parse("STALE_PROCESSING_SECS")?.unwrap_or(300),
            ),
        };

        let worker_defaults = WorkerPoolConfig::default();
        let worker = WorkerPoolConfig {
            concurrency: env
                .parse("WORKER_CONCURRENCY")?
                .unwrap_or(worker_defaults.concurrency)
                .max(1),
            max_deliveries: env
                .parse("WORKER_MAX_DELIVERIES")?
                .unwrap_or(worker_defaults.max_deliveries),
            ..worker_defaults
        };

        let sweeper_defaults = SweeperConfig::default();
        let sweeper = SweeperConfig {
            interval: Duration::from_secs(
                env.parse::<u64>("SWEEP_INTERVAL_SECS")?
                    .unwrap_or(sweeper_defaults.interval.as_secs())
                    .max(1),
            ),
            stall_after: Duration::from_secs(
                env.parse("STALL_AFTER_SECS")?
                    .unwrap_or(sweeper_defaults.stall_after.as_secs()),
            ),
            ..sweeper_defaults
        };

        let queued_replay = match env.string("REPLAY_MODE") {
            None => false,
            Some(v) => match v.to_ascii_lowercase().as_str() {
                "inline" | "sync" => false,
                "queued" | "queue" | "async" => true,
                other => {
                    return Err(invalid(
                        "REPLAY_MODE",
                        format!("{other} (expected inline or queued)"),
                    ))
                }
            },
        };
        let replay = ReplayConfig {
            queued: queued_replay,
            timeout: env
                .millis("REPLAY_TIMEOUT_MS")?
                .unwrap_or(ReplayConfig::default().timeout),
        };

        let threshold_defaults = ReconcileThresholds::default();
        let reconcile = ReconcileConfig {
            thresholds: ReconcileThresholds {
                ingest: env
                    .ratio("RECONCILE_THRESHOLD_INGEST")?
                    .unwrap_or(threshold_defaults.ingest),
                booking: env
                    .ratio("RECONCILE_THRESHOLD_BOOKING")?
                    .unwrap_or(threshold_defaults.booking),
                payment: env
                    .ratio("RECONCILE_THRESHOLD_PAYMENT")?
                    .unwrap_or(threshold_defaults.payment),
                catalog: env
                    .ratio("RECONCILE_THRESHOLD_CATALOG")?
                    .unwrap_or(threshold_defaults.catalog),
            },
            ..ReconcileConfig::default()
        };
        let reconcile_interval =
            Duration::from_secs(env.parse::<u64>("RECONCILE_INTERVAL_SECS")?.unwrap_or(900).max(1));

        let slo_defaults = SloPolicy::default();
        let slo = SloPolicy {
            min_received: env.parse("SLO_MIN_RECEIVED")?.unwrap_or(slo_defaults.min_received),
            min_success_rate: env
                .ratio("SLO_MIN_SUCCESS_RATE")?
                .unwrap_or(slo_defaults.min_success_rate),
            max_median_ms: env
                .parse("SLO_MAX_MEDIAN_MS")?
                .unwrap_or(slo_defaults.max_median_ms),
            max_p95_ms: env.parse("SLO_MAX_P95_MS")?.unwrap_or(slo_defaults.max_p95_ms),
            max_dlq_growth_per_hour: env
                .parse("SLO_MAX_DLQ_GROWTH_PER_HOUR")?
                .unwrap_or(slo_defaults.max_dlq_growth_per_hour),
        };

        Ok(Self {
            server,
            storage,
            auth,
            signature,
            ingest,
            processor,
            worker,
            sweeper,
            replay,
            reconcile,
            reconcile_interval,
            slo,
        })
    }

    /// Full path of the ingest collection route
    pub fn ingest_route(&self) -> String {
        format!("{}{}", self.server.api_base_path, self.server.ingest_path)
    }
}

struct Env<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn string(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, key: &'static str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.string(key)
            .map(|v| v.parse::<T>().map_err(|e| invalid(key, format!("{v}: {e}"))))
            .transpose()
    }

    fn millis(&self, key: &'static str) -> Result<Option<Duration>, ConfigError> {
        Ok(self.parse::<u64>(key)?.map(Duration::from_millis))
    }

    fn ratio(&self, key: &'static str) -> Result<Option<f64>, ConfigError> {
        match self.parse::<f64>(key)? {
            Some(v) if !(0.0..=1.0).contains(&v) => {
                Err(invalid(key, format!("{v} is outside 0.0-1.0")))
            }
            other => Ok(other),
        }
    }

    fn flag(&self, key: &'static str) -> Result<Option<bool>, ConfigError> {
        self.string(key)
            .map(|v| match v.to_ascii_lowercase().as_str() {
                "1" | "true" | "on" | "yes" => Ok(true),
                "0" | "false" | "off" | "no" => Ok(false),
                _ => Err(invalid(key, format!("{v} is not a boolean"))),
            })
            .transpose()
    }
}

fn normalize_path(var: &'static str, path: &str) -> Result<String, ConfigError> {
    let trimmed = path.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Ok(String::new());
    }
    if !trimmed.starts_with('/') {
        return Err(invalid(var, format!("{path} must start with '/'")));
    }
    Ok(trimmed.to_string())
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
