// Readiness monitor
//
// Periodically checks the dependencies the gateway needs to serve traffic:
// - the outcome store (always)
// - the broker (brokered mode only)
// - process memory against a ratio threshold
//
// Decision: check_ready never fails; every problem becomes a "<name>: <reason>" string
// Decision: Memory ratio is resident memory over MEMORY_LIMIT_BYTES, else over total system memory

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use genrelay_broker::Broker;
use genrelay_core::OutcomeStore;
use parking_lot::RwLock;
use serde::Serialize;
use sysinfo::{MemoryRefreshKind, ProcessRefreshKind, ProcessesToUpdate, RefreshKind, System};
use tokio_util::sync::CancellationToken;
use utoipa::ToSchema;

use crate::metrics::GatewayMetrics;

/// One dependency probe
#[async_trait]
pub trait ReadinessCheck: Send + Sync {
    fn name(&self) -> &'static str;

    async fn check(&self) -> Result<(), String>;
}

pub struct BrokerCheck(pub Arc<dyn Broker>);

#[async_trait]
impl ReadinessCheck for BrokerCheck {
    fn name(&self) -> &'static str {
        "broker"
    }

    async fn check(&self) -> Result<(), String> {
        self.0.ping().await.map_err(|e| e.to_string())
    }
}

pub struct StoreCheck(pub Arc<dyn OutcomeStore>);

#[async_trait]
impl ReadinessCheck for StoreCheck {
    fn name(&self) -> &'static str {
        "store"
    }

    async fn check(&self) -> Result<(), String> {
        self.0.ping().await.map_err(|e| e.to_string())
    }
}

/// Resident and reference memory in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemorySample {
    pub resident: u64,
    pub limit: u64,
}

type MemorySampler = Arc<dyn Fn() -> Result<MemorySample, String> + Send + Sync>;

pub struct MemoryCheck {
    threshold: f64,
    sampler: MemorySampler,
}

impl MemoryCheck {
    /// Sample this process with sysinfo
    pub fn new(threshold: f64, limit_bytes: Option<u64>) -> Self {
        Self {
            threshold,
            sampler: Arc::new(move || sample_process_memory(limit_bytes)),
        }
    }

    pub fn with_sampler(
        threshold: f64,
        sampler: impl Fn() -> Result<MemorySample, String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            threshold,
            sampler: Arc::new(sampler),
        }
    }
}

#[async_trait]
impl ReadinessCheck for MemoryCheck {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn check(&self) -> Result<(), String> {
        let sampler = Arc::clone(&self.sampler);
        let sample = tokio::task::spawn_blocking(move || sampler())
            .await
            .map_err(|e| format!("sampling failed: {e}"))??;

        if sample.limit == 0 {
            return Err("memory limit is unknown".to_string());
        }
        let ratio = sample.resident as f64 / sample.limit as f64;
        if memory_ratio_ok(ratio, self.threshold) {
            Ok(())
        } else {
            Err(format!(
                "memory ratio {ratio:.2} exceeds {:.2}",
                self.threshold
            ))
        }
    }
}

pub fn memory_ratio_ok(ratio: f64, threshold: f64) -> bool {
    ratio.is_finite() && ratio <= threshold
}

fn sample_process_memory(limit_bytes: Option<u64>) -> Result<MemorySample, String> {
    let pid = sysinfo::get_current_pid().map_err(|e| e.to_string())?;
    let mut system = System::new_with_specifics(
        RefreshKind::new().with_memory(MemoryRefreshKind::new().with_ram()),
    );
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[pid]),
        true,
        ProcessRefreshKind::new().with_memory(),
    );

    let resident = system
        .process(pid)
        .map(|p| p.memory())
        .ok_or_else(|| "current process not found".to_string())?;
    let limit = limit_bytes.unwrap_or_else(|| system.total_memory());

    Ok(MemorySample { resident, limit })
}

/// Health of one dependency
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct DependencyStatus {
    pub name: String,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outcome of one readiness pass
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReadinessReport {
    pub ready: bool,
    pub failures: Vec<String>,
    pub dependencies: Vec<DependencyStatus>,
    pub checked_at: DateTime<Utc>,
}

impl ReadinessReport {
    fn pending() -> Self {
        Self {
            ready: false,
            failures: vec!["readiness: not checked yet".to_string()],
            dependencies: Vec::new(),
            checked_at: Utc::now(),
        }
    }
}

pub struct ReadinessMonitor {
    checks: Vec<Arc<dyn ReadinessCheck>>,
    check_timeout: Duration,
    last: RwLock<ReadinessReport>,
    metrics: Arc<GatewayMetrics>,
}

impl ReadinessMonitor {
    pub fn new(
        checks: Vec<Arc<dyn ReadinessCheck>>,
        check_timeout: Duration,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        Self {
            checks,
            check_timeout,
            last: RwLock::new(ReadinessReport::pending()),
            metrics,
        }
    }

    /// Run every check concurrently and cache the report
    pub async fn check_ready(&self) -> ReadinessReport {
        let runs = self.checks.iter().map(|check| {
            let check = Arc::clone(check);
            let limit = self.check_timeout;
            async move {
                let name = check.name();
                let probe = AssertUnwindSafe(check.check()).catch_unwind();
                let result = match tokio::time::timeout(limit, probe).await {
                    Ok(Ok(result)) => result,
                    Ok(Err(_)) => Err("check panicked".to_string()),
                    Err(_) => Err(format!("timed out after {}ms", limit.as_millis())),
                };
                (name, result)
            }
        });
        let results = futures::future::join_all(runs).await;

        let mut failures = Vec::new();
        let dependencies = results
            .into_iter()
            .map(|(name, result)| match result {
                Ok(()) => DependencyStatus {
                    name: name.to_string(),
                    healthy: true,
                    error: None,
                },
                Err(reason) => {
                    failures.push(format!("{name}: {reason}"));
                    DependencyStatus {
                        name: name.to_string(),
                        healthy: false,
                        error: Some(reason),
                    }
                }
            })
            .collect();

        let report = ReadinessReport {
            ready: failures.is_empty(),
            failures,
            dependencies,
            checked_at: Utc::now(),
        };

        if !report.ready {
            tracing::warn!(failures = ?report.failures, "Readiness check failed");
        }
        self.metrics.set_ready(report.ready);
        *self.last.write() = report.clone();
        report
    }

    /// Last cached report
    pub fn last_report(&self) -> ReadinessReport {
        self.last.read().clone()
    }

    pub async fn run(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.check_ready().await;
                }
            }
        }
        tracing::debug!("Readiness monitor stopped");
    }
}
