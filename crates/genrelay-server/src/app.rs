// Pipeline wiring
//
// Builds every component from a ServerConfig and owns the background tasks:
//
//   gateway ──► dispatcher ──► broker `generation.request` ──► bridge ──► worker pool
//                  │                                                      │
//                  └─ correlator ◄── broker `generation.result` ◄─────────┘
//                        │
//                        └─► sinks (quality gate, broadcaster, store, dead letters)
//
// Decision: One CancellationToken stops every loop; the pool drains last
// Decision: Collaborators (backend, broker, store, core binder) are injected so tests swap them

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    extract::FromRef,
    http::{header, HeaderValue, Method},
    middleware, Router,
};
use genrelay_broker::{topics, Broker, InMemoryBroker};
use genrelay_core::{EchoBackend, GenerationBackend, InMemoryOutcomeStore, OutcomeStore};
use genrelay_worker::{CoreAffinityBinder, CoreBinder, PoolEvents, WorkerPool};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::api;
use crate::auth::AuthState;
use crate::bridge::BackendBridge;
use crate::broadcast::Broadcaster;
use crate::config::ServerConfig;
use crate::correlator::Correlator;
use crate::dead_letter::DeadLetterLog;
use crate::dispatch::{create_dispatcher, DispatchBackend, DispatchMode};
use crate::gateway::Gateway;
use crate::metrics::{track_requests, GatewayMetrics};
use crate::outbox::Outbox;
use crate::rate_limit::RateLimiter;
use crate::readiness::{BrokerCheck, MemoryCheck, ReadinessCheck, ReadinessMonitor, StoreCheck};
use crate::sinks::OutcomeSinks;

const OUTBOX_CAPACITY: usize = 1024;
const TASK_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// State shared by every handler
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub broadcaster: Arc<Broadcaster>,
    pub readiness: Arc<ReadinessMonitor>,
    pub dead_letters: Arc<DeadLetterLog>,
    pub store: Arc<dyn OutcomeStore>,
    pub metrics: Arc<GatewayMetrics>,
    pub pool: Option<Arc<WorkerPool>>,
    pub auth: AuthState,
    /// Cancelled when the pipeline stops; long-lived sessions watch it
    pub shutdown: CancellationToken,
}

impl FromRef<AppState> for AuthState {
    fn from_ref(state: &AppState) -> Self {
        state.auth.clone()
    }
}

/// External collaborators
pub struct PipelineDeps {
    pub backend: Arc<dyn GenerationBackend>,
    pub broker: Arc<dyn Broker>,
    pub store: Arc<dyn OutcomeStore>,
    pub binder: Arc<dyn CoreBinder>,
}

impl PipelineDeps {
    /// Echo backend, in-memory broker and store, pinned workers
    pub fn local() -> Self {
        Self {
            backend: Arc::new(EchoBackend::new()),
            broker: Arc::new(InMemoryBroker::new()),
            store: Arc::new(InMemoryOutcomeStore::default()),
            binder: Arc::new(CoreAffinityBinder::detect()),
        }
    }

    pub fn with_backend(mut self, backend: Arc<dyn GenerationBackend>) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = broker;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn OutcomeStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_binder(mut self, binder: Arc<dyn CoreBinder>) -> Self {
        self.binder = binder;
        self
    }
}

/// A running pipeline
pub struct Pipeline {
    state: AppState,
    cors_allowed_origins: Vec<String>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Pipeline {
    /// Build and start every component
    ///
    /// Must be called inside a tokio runtime. Fails on invalid worker configuration,
    /// thread spawn failure, or when the broker refuses a subscription.
    pub async fn start(config: ServerConfig, deps: PipelineDeps) -> Result<Self> {
        let cancel = CancellationToken::new();
        // Stops already-spawned tasks if a later step fails
        let startup_guard = cancel.clone().drop_guard();
        let mut tasks = Vec::new();

        let metrics = Arc::new(GatewayMetrics::new().context("Failed to register metrics")?);

        let (outbox, outbox_task) =
            Outbox::spawn(Arc::clone(&deps.broker), OUTBOX_CAPACITY, cancel.clone());
        tasks.push(outbox_task);

        let dead_letters = Arc::new(DeadLetterLog::new(
            config.dead_letter_retention,
            outbox.clone(),
            Arc::clone(&metrics),
        ));

        let broadcaster = Arc::new(Broadcaster::new(
            config.broadcast.clone(),
            Arc::clone(&metrics),
        ));
        tasks.push(tokio::spawn(
            Arc::clone(&broadcaster).run(cancel.clone()),
        ));

        let sinks = OutcomeSinks {
            metrics: Arc::clone(&metrics),
            dead_letters: Arc::clone(&dead_letters),
            broadcaster: Arc::clone(&broadcaster),
            store: Arc::clone(&deps.store),
            outbox,
            quality_gate: config.quality_gate,
        };

        let mut checks: Vec<Arc<dyn ReadinessCheck>> = vec![
            Arc::new(StoreCheck(Arc::clone(&deps.store))),
            Arc::new(MemoryCheck::new(
                config.readiness.heap_ratio,
                config.readiness.memory_limit_bytes,
            )),
        ];

        let (dispatcher, pool) = match config.dispatch_mode {
            DispatchMode::Inline => {
                let (pool, _events) = start_pool(&config, &deps)?;
                let pool = Arc::new(pool);
                let dispatcher = create_dispatcher(DispatchBackend::Inline {
                    pool: Arc::clone(&pool),
                    sinks,
                    job_timeout: config.correlator.job_timeout,
                    max_in_flight: config.correlator.max_pending,
                });
                (dispatcher, Some(pool))
            }
            DispatchMode::Brokered => {
                checks.insert(0, Arc::new(BrokerCheck(Arc::clone(&deps.broker))));

                let results = deps
                    .broker
                    .subscribe(topics::RESULT)
                    .await
                    .context("Failed to subscribe to the result topic")?;
                let (correlator, correlator_task) = Correlator::spawn(
                    config.correlator.clone(),
                    sinks,
                    results,
                    cancel.clone(),
                );
                tasks.push(correlator_task);

                let pool = if config.embedded_backend {
                    let (pool, events) = start_pool(&config, &deps)?;
                    let pool = Arc::new(pool);
                    let requests = deps
                        .broker
                        .subscribe(topics::REQUEST)
                        .await
                        .context("Failed to subscribe to the request topic")?;
                    tasks.push(
                        BackendBridge::new(
                            Arc::clone(&deps.broker),
                            Arc::clone(&pool),
                            Arc::clone(&dead_letters),
                        )
                        .spawn(requests, events, cancel.clone()),
                    );
                    Some(pool)
                } else {
                    None
                };

                let dispatcher = create_dispatcher(DispatchBackend::Brokered {
                    broker: Arc::clone(&deps.broker),
                    correlator,
                });
                (dispatcher, pool)
            }
        };

        if let Some(pool) = &pool {
            tasks.push(spawn_pool_gauges(pool, Arc::clone(&metrics), cancel.clone()));
        }

        let gateway = Arc::new(Gateway::new(
            RateLimiter::new(config.rate_limit.clone()),
            config.validator.clone(),
            dispatcher,
            Arc::clone(&metrics),
        ));

        let readiness = Arc::new(ReadinessMonitor::new(
            checks,
            config.readiness.check_timeout,
            Arc::clone(&metrics),
        ));
        tasks.push(tokio::spawn(
            Arc::clone(&readiness).run(config.readiness.interval, cancel.clone()),
        ));

        tracing::info!(
            dispatch_mode = %config.dispatch_mode,
            embedded_backend = config.embedded_backend,
            workers = pool.as_ref().map(|p| p.size()).unwrap_or(0),
            max_pending = config.correlator.max_pending,
            job_timeout_ms = config.correlator.job_timeout.as_millis() as u64,
            auth_mode = %config.auth.mode,
            "Pipeline started"
        );

        startup_guard.disarm();
        Ok(Self {
            state: AppState {
                gateway,
                broadcaster,
                readiness,
                dead_letters,
                store: deps.store,
                metrics,
                pool,
                auth: AuthState::new(&config.auth),
                shutdown: cancel.clone(),
            },
            cors_allowed_origins: config.cors_allowed_origins,
            cancel,
            tasks,
        })
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Router with request metrics, CORS (when configured) and tracing
    pub fn router(&self) -> Router {
        let metrics = Arc::clone(&self.state.metrics);
        let app = api::routes(self.state.clone())
            .route_layer(middleware::from_fn_with_state(metrics, track_requests));

        let cors_origins: Vec<HeaderValue> = self
            .cors_allowed_origins
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();

        let app = if cors_origins.is_empty() {
            app
        } else {
            app.layer(
                CorsLayer::new()
                    .allow_origin(AllowOrigin::list(cors_origins))
                    .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                    .allow_headers([
                        header::CONTENT_TYPE,
                        header::AUTHORIZATION,
                        header::ACCEPT,
                        header::ORIGIN,
                    ]),
            )
        };

        app.layer(TraceLayer::new_for_http())
    }

    /// Token cancelled on shutdown
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop every loop, fail remaining waiters, then drain the pool
    pub async fn shutdown(self) {
        tracing::info!("Pipeline shutting down");
        self.cancel.cancel();

        let joined = futures::future::join_all(self.tasks);
        if tokio::time::timeout(TASK_SHUTDOWN_TIMEOUT, joined)
            .await
            .is_err()
        {
            tracing::warn!("Background tasks did not stop in time");
        }

        if let Some(pool) = &self.state.pool {
            if let Err(e) = pool.shutdown().await {
                tracing::warn!(error = %e, "Worker pool shutdown incomplete");
            }
        }
        tracing::info!("Pipeline stopped");
    }
}

fn start_pool(config: &ServerConfig, deps: &PipelineDeps) -> Result<(WorkerPool, PoolEvents)> {
    WorkerPool::start(
        config.worker.clone(),
        Arc::clone(&deps.backend),
        Arc::clone(&deps.binder),
    )
    .context("Failed to start worker pool")
}

/// Mirror pool snapshots into the queue depth and busy worker gauges
fn spawn_pool_gauges(
    pool: &WorkerPool,
    metrics: Arc<GatewayMetrics>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let mut snapshots = pool.watch_snapshots();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = snapshots.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let snapshot = snapshots.borrow_and_update().clone();
                    metrics.set_pool_state(snapshot.queued, snapshot.busy);
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use genrelay_worker::NoopBinder;

    fn deps() -> PipelineDeps {
        PipelineDeps::local().with_binder(Arc::new(NoopBinder))
    }

    #[tokio::test]
    async fn test_brokered_pipeline_starts_and_stops() {
        let pipeline = Pipeline::start(ServerConfig::default(), deps()).await.unwrap();
        assert_eq!(pipeline.state().gateway.mode(), DispatchMode::Brokered);
        assert!(pipeline.state().pool.is_some());

        let report = pipeline.state().readiness.check_ready().await;
        assert!(report.dependencies.iter().any(|d| d.name == "broker"));
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_external_backend_has_no_pool() {
        let config = ServerConfig {
            embedded_backend: false,
            ..ServerConfig::default()
        };
        let pipeline = Pipeline::start(config, deps()).await.unwrap();
        assert!(pipeline.state().pool.is_none());
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_inline_pipeline_skips_broker_check() {
        let config = ServerConfig {
            dispatch_mode: DispatchMode::Inline,
            ..ServerConfig::default()
        };
        let pipeline = Pipeline::start(config, deps()).await.unwrap();
        assert_eq!(pipeline.state().gateway.mode(), DispatchMode::Inline);

        let report = pipeline.state().readiness.check_ready().await;
        assert!(report.dependencies.iter().all(|d| d.name != "broker"));
        pipeline.shutdown().await;
    }
}
