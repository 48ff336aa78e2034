// Server configuration loaded from environment variables
// Decision: Every knob has a default; a present but invalid value is a fatal ConfigError
// Decision: from_env is a thin wrapper over from_lookup so tests never touch the process env

use std::fmt::Display;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use genrelay_worker::{OverflowConfig, WorkerPoolConfig};
use thiserror::Error;

use crate::auth::AuthConfig;
use crate::broadcast::BroadcastConfig;
use crate::correlator::CorrelatorConfig;
use crate::dispatch::DispatchMode;
use crate::quality::{QualityGate, QualityPolicy};
use crate::rate_limit::RateLimitConfig;
use crate::validation::{FieldSchema, Validator};

/// Configuration errors (fatal at startup)
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

impl ConfigError {
    pub fn invalid(key: &'static str, message: impl Into<String>) -> Self {
        ConfigError::Invalid {
            key,
            message: message.into(),
        }
    }
}

/// Typed access to a variable source
pub(crate) struct Vars<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Vars<F> {
    pub(crate) fn new(lookup: F) -> Self {
        Self { lookup }
    }

    /// Raw value; empty strings count as unset
    pub(crate) fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|v| !v.trim().is_empty())
    }

    pub(crate) fn parse<T>(&self, key: &'static str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        self.get(key)
            .map(|raw| {
                raw.trim()
                    .parse::<T>()
                    .map_err(|e| ConfigError::invalid(key, format!("'{raw}': {e}")))
            })
            .transpose()
    }

    pub(crate) fn parse_or<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        Ok(self.parse(key)?.unwrap_or(default))
    }

    fn millis(&self, key: &'static str, default_ms: u64) -> Result<Duration, ConfigError> {
        let ms: u64 = self.parse_or(key, default_ms)?;
        if ms == 0 {
            return Err(ConfigError::invalid(key, "must be greater than zero"));
        }
        Ok(Duration::from_millis(ms))
    }

    fn positive(&self, key: &'static str, default: usize) -> Result<usize, ConfigError> {
        let value: usize = self.parse_or(key, default)?;
        if value == 0 {
            return Err(ConfigError::invalid(key, "must be greater than zero"));
        }
        Ok(value)
    }

    fn ratio(&self, key: &'static str, default: f64) -> Result<f64, ConfigError> {
        let value: f64 = self.parse_or(key, default)?;
        if !(0.0..=1.0).contains(&value) {
            return Err(ConfigError::invalid(key, "must be between 0 and 1"));
        }
        Ok(value)
    }

    fn schema(&self, key: &'static str) -> Result<Option<FieldSchema>, ConfigError> {
        self.get(key)
            .map(|raw| FieldSchema::from_json(&raw).map_err(|e| ConfigError::invalid(key, e.to_string())))
            .transpose()
    }
}

/// Readiness monitor settings
#[derive(Debug, Clone, PartialEq)]
pub struct ReadinessConfig {
    pub heap_ratio: f64,
    pub interval: Duration,
    pub check_timeout: Duration,
    /// Reference for the memory ratio; total system memory when unset
    pub memory_limit_bytes: Option<u64>,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            heap_ratio: 0.85,
            interval: Duration::from_millis(5000),
            check_timeout: Duration::from_secs(2),
            memory_limit_bytes: None,
        }
    }
}

/// Complete server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub dispatch_mode: DispatchMode,
    /// Run the backend bridge in-process (brokered mode)
    pub embedded_backend: bool,
    pub worker: WorkerPoolConfig,
    pub correlator: CorrelatorConfig,
    pub rate_limit: RateLimitConfig,
    pub broadcast: BroadcastConfig,
    pub readiness: ReadinessConfig,
    pub quality_gate: QualityGate,
    pub dead_letter_retention: usize,
    pub validator: Validator,
    pub auth: AuthConfig,
    /// Empty means same-origin only
    pub cors_allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 9300)),
            dispatch_mode: DispatchMode::Brokered,
            embedded_backend: true,
            worker: WorkerPoolConfig::default(),
            correlator: CorrelatorConfig::default(),
            rate_limit: RateLimitConfig::default(),
            broadcast: BroadcastConfig::default(),
            readiness: ReadinessConfig::default(),
            quality_gate: QualityGate::default(),
            dead_letter_retention: 1000,
            validator: Validator::default(),
            auth: AuthConfig::default(),
            cors_allowed_origins: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables
    ///
    /// See [`ServerConfig::from_lookup`] for the variables read.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an explicit variable source
    ///
    /// Variables:
    /// - `BIND_ADDR` (default `0.0.0.0:9300`)
    /// - `DISPATCH_MODE` = brokered | inline, `EMBEDDED_BACKEND` (default true)
    /// - `WORKER_CORES`, `WORKER_OVERFLOW_CAPACITY`
    /// - `JOB_TIMEOUT_MS`, `MAX_PENDING_JOBS`, `PROCESSED_SET_CAPACITY`
    /// - `RATE_LIMIT_WINDOW_MS`, `RATE_LIMIT_MAX_REQUESTS`
    /// - `BROADCAST_MIN_FPS`, `BROADCAST_MAX_FPS`, `BROADCAST_BACKLOG_THRESHOLD_BYTES`,
    ///   `BROADCAST_QUEUE_CAPACITY`, `BROADCAST_SUBSCRIBER_BUFFER`
    /// - `READINESS_HEAP_RATIO`, `READINESS_INTERVAL_MS`, `MEMORY_LIMIT_BYTES`
    /// - `MIN_QUALITY_SCORE`, `QUALITY_GATE_POLICY` = deliver | withhold
    /// - `DEAD_LETTER_RETENTION`
    /// - `REQUEST_SCHEMA`, `STATE_SCHEMA` (JSON Schema documents)
    /// - `AUTH_MODE`, `AUTH_JWT_SECRET`, `AUTH_API_KEYS`
    /// - `CORS_ALLOWED_ORIGINS` (comma-separated)
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let vars = Vars::new(lookup);
        let defaults = ServerConfig::default();

        let bind_addr = vars.parse_or("BIND_ADDR", defaults.bind_addr)?;
        let dispatch_mode = vars.parse_or("DISPATCH_MODE", defaults.dispatch_mode)?;
        let embedded_backend = vars.parse_or("EMBEDDED_BACKEND", defaults.embedded_backend)?;

        let worker = WorkerPoolConfig::default()
            .with_size(vars.positive("WORKER_CORES", defaults.worker.size)?)
            .with_overflow(OverflowConfig::default().with_capacity(vars.positive(
                "WORKER_OVERFLOW_CAPACITY",
                defaults.worker.overflow.capacity,
            )?));
        worker
            .validate()
            .map_err(|e| ConfigError::invalid("WORKER_CORES", e.to_string()))?;

        let correlator = CorrelatorConfig::default()
            .with_job_timeout(vars.millis("JOB_TIMEOUT_MS", 30_000)?)
            .with_max_pending(vars.positive("MAX_PENDING_JOBS", defaults.correlator.max_pending)?)
            .with_processed_capacity(vars.positive(
                "PROCESSED_SET_CAPACITY",
                defaults.correlator.processed_capacity,
            )?);
        correlator
            .validate()
            .map_err(|e| ConfigError::invalid("JOB_TIMEOUT_MS", e))?;

        let rate_limit = RateLimitConfig {
            window: vars.millis("RATE_LIMIT_WINDOW_MS", 60_000)?,
            max_requests: vars.parse_or("RATE_LIMIT_MAX_REQUESTS", defaults.rate_limit.max_requests)?,
        };

        let b = &defaults.broadcast;
        let broadcast = BroadcastConfig::default()
            .with_fps_range(
                vars.parse_or("BROADCAST_MIN_FPS", b.min_fps)?,
                vars.parse_or("BROADCAST_MAX_FPS", b.max_fps)?,
            )
            .with_backlog_threshold(
                vars.parse_or("BROADCAST_BACKLOG_THRESHOLD_BYTES", b.backlog_threshold_bytes)?,
            )
            .with_queue_capacity(vars.parse_or("BROADCAST_QUEUE_CAPACITY", b.queue_capacity)?)
            .with_subscriber_buffer(
                vars.parse_or("BROADCAST_SUBSCRIBER_BUFFER", b.subscriber_buffer)?,
            );
        broadcast
            .validate()
            .map_err(|e| ConfigError::invalid("BROADCAST_MIN_FPS", e.to_string()))?;

        let readiness = ReadinessConfig {
            heap_ratio: vars.ratio("READINESS_HEAP_RATIO", defaults.readiness.heap_ratio)?,
            interval: vars.millis("READINESS_INTERVAL_MS", 5000)?,
            check_timeout: defaults.readiness.check_timeout,
            memory_limit_bytes: vars.parse("MEMORY_LIMIT_BYTES")?,
        };

        let min_score: Option<f64> = vars.parse("MIN_QUALITY_SCORE")?;
        let quality_gate = QualityGate::new(
            min_score,
            vars.parse_or("QUALITY_GATE_POLICY", QualityPolicy::Deliver)?,
        );

        let validator = Validator::new(vars.schema("REQUEST_SCHEMA")?, vars.schema("STATE_SCHEMA")?);

        let cors_allowed_origins = vars
            .get("CORS_ALLOWED_ORIGINS")
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            bind_addr,
            dispatch_mode,
            embedded_backend,
            worker,
            correlator,
            rate_limit,
            broadcast,
            readiness,
            quality_gate,
            dead_letter_retention: vars.positive("DEAD_LETTER_RETENTION", defaults.dead_letter_retention)?,
            validator,
            auth: AuthConfig::from_vars(&vars)?,
            cors_allowed_origins,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthMode;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<ServerConfig, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.bind_addr.port(), 9300);
        assert_eq!(config.dispatch_mode, DispatchMode::Brokered);
        assert!(config.embedded_backend);
        assert_eq!(config.worker.size, 2);
        assert_eq!(config.worker.overflow.capacity, 1024);
        assert_eq!(config.correlator.job_timeout, Duration::from_millis(30_000));
        assert_eq!(config.correlator.max_pending, 1000);
        assert_eq!(config.correlator.processed_capacity, 2000);
        assert_eq!(config.rate_limit.max_requests, 120);
        assert_eq!(config.rate_limit.window, Duration::from_secs(60));
        assert_eq!(config.broadcast.min_fps, 1);
        assert_eq!(config.broadcast.max_fps, 10);
        assert_eq!(config.readiness.heap_ratio, 0.85);
        assert_eq!(config.quality_gate, QualityGate::default());
        assert_eq!(config.auth.mode, AuthMode::None);
        assert!(config.cors_allowed_origins.is_empty());
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("DISPATCH_MODE", "inline"),
            ("WORKER_CORES", "4"),
            ("JOB_TIMEOUT_MS", "1500"),
            ("MAX_PENDING_JOBS", "3"),
            ("MIN_QUALITY_SCORE", "0.6"),
            ("QUALITY_GATE_POLICY", "withhold"),
            ("MEMORY_LIMIT_BYTES", "1073741824"),
            ("REQUEST_SCHEMA", r#"{"required": ["type"]}"#),
            ("CORS_ALLOWED_ORIGINS", "http://a.test, http://b.test"),
        ])
        .unwrap();

        assert_eq!(config.dispatch_mode, DispatchMode::Inline);
        assert_eq!(config.worker.size, 4);
        assert_eq!(config.correlator.job_timeout, Duration::from_millis(1500));
        assert_eq!(config.correlator.max_pending, 3);
        assert_eq!(
            config.quality_gate,
            QualityGate::new(Some(0.6), QualityPolicy::Withhold)
        );
        assert_eq!(config.readiness.memory_limit_bytes, Some(1 << 30));
        assert!(config.validator.validate(None, None).is_err());
        assert_eq!(config.cors_allowed_origins.len(), 2);
    }

    #[test]
    fn test_invalid_values_are_fatal() {
        for (key, value) in [
            ("WORKER_CORES", "0"),
            ("WORKER_CORES", "many"),
            ("JOB_TIMEOUT_MS", "-5"),
            ("DISPATCH_MODE", "carrier-pigeon"),
            ("READINESS_HEAP_RATIO", "1.5"),
            ("BROADCAST_MIN_FPS", "20"),
            ("QUALITY_GATE_POLICY", "maybe"),
            ("REQUEST_SCHEMA", "{not json"),
            ("BIND_ADDR", "nowhere"),
            ("EMBEDDED_BACKEND", "yes please"),
        ] {
            let err = load(&[(key, value)]).unwrap_err();
            assert!(
                err.to_string().contains(key) || key == "BROADCAST_MIN_FPS",
                "{key}={value} gave {err}"
            );
        }
    }

    #[test]
    fn test_job_timeout_has_a_ceiling() {
        let err = load(&[("JOB_TIMEOUT_MS", "100000000000")]).unwrap_err();
        assert!(err.to_string().contains("JOB_TIMEOUT_MS"), "{err}");

        let config = load(&[("JOB_TIMEOUT_MS", "86400000")]).unwrap();
        assert_eq!(config.correlator.job_timeout, Duration::from_secs(24 * 60 * 60));
    }

    #[test]
    fn test_empty_values_use_defaults() {
        let config = load(&[("WORKER_CORES", ""), ("DISPATCH_MODE", "  ")]).unwrap();
        assert_eq!(config.worker.size, 2);
        assert_eq!(config.dispatch_mode, DispatchMode::Brokered);
    }
}
