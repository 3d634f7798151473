//! Active liveness probing of plugin channels
//!
//! A probe converts the raw outcome of the standard health procedure into a
//! breaker transition: serving plugins report success, everything else that
//! is the plugin's own fault reports failure.

use crate::breaker::CircuitBreakerRegistry;
use crate::descriptor::{DescriptorStore, PluginDescriptor};
use crate::error::{BrokerError, Result};
use crate::metrics::Metrics;
use crate::protocol::health::{self, HealthCheckResponse, ServingStatus};
use crate::protocol::JsonRpcId;
use crate::transport::{Connection, ConnectionManager};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::time::{interval, timeout, Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone)]
pub struct HealthProbeResult {
    pub plugin: String,
    pub status: HealthStatus,
    pub latency: Duration,
    pub error: Option<BrokerError>,
    pub checked_at: DateTime<Utc>,
}

impl HealthProbeResult {
    fn healthy(plugin: &str, latency: Duration) -> Self {
        Self {
            plugin: plugin.to_string(),
            status: HealthStatus::Healthy,
            latency,
            error: None,
            checked_at: Utc::now(),
        }
    }

    fn unhealthy(plugin: &str, latency: Duration, error: BrokerError) -> Self {
        Self {
            plugin: plugin.to_string(),
            status: HealthStatus::Unhealthy,
            latency,
            error: Some(error),
            checked_at: Utc::now(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }

    pub fn latency_ms(&self) -> u64 {
        self.latency.as_millis() as u64
    }
}

pub struct HealthMonitor {
    connections: Arc<ConnectionManager>,
    breakers: Arc<CircuitBreakerRegistry>,
    probe_timeout: Duration,
    request_id_counter: AtomicI64,
    metrics: Option<Arc<Metrics>>,
}

impl HealthMonitor {
    /// `breakers` must be the registry `connections` reports dial failures to.
    pub fn new(
        connections: Arc<ConnectionManager>,
        breakers: Arc<CircuitBreakerRegistry>,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            connections,
            breakers,
            probe_timeout,
            request_id_counter: AtomicI64::new(1),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Probe one plugin.
    ///
    /// An open breaker short-circuits to `Unhealthy` with zero latency and no
    /// network activity. Cancellation yields `Unhealthy` with
    /// [`BrokerError::Cancelled`] and leaves the breaker untouched.
    pub async fn check(
        &self,
        descriptor: &PluginDescriptor,
        cancel: &CancellationToken,
    ) -> HealthProbeResult {
        let name = descriptor.name.as_str();

        if self.breakers.is_open(name) {
            if let Some(metrics) = &self.metrics {
                metrics.record_circuit_rejection();
            }
            tracing::debug!(plugin = %name, "Skipping health check, circuit open");
            return HealthProbeResult::unhealthy(
                name,
                Duration::ZERO,
                BrokerError::CircuitOpen {
                    plugin: name.to_string(),
                },
            );
        }

        // The breaker was consulted above; the manager records dial failures itself.
        let dial_started = Instant::now();
        let conn = match self.connections.get_admitted_channel(descriptor, cancel).await {
            Ok(conn) => conn,
            Err(e) => {
                let latency = dial_started.elapsed();
                if e.counts_against_plugin() {
                    self.observe(false, latency);
                    tracing::warn!(plugin = %name, "Health check could not reach plugin: {}", e);
                } else {
                    tracing::debug!(plugin = %name, "Health check abandoned: {}", e);
                }
                return HealthProbeResult::unhealthy(name, latency, e);
            }
        };

        let start = Instant::now();
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(BrokerError::Cancelled),
            result = timeout(self.probe_timeout, self.probe(name, conn.as_ref())) => {
                result.unwrap_or_else(|_| {
                    Err(BrokerError::Timeout {
                        operation: format!("Health check of plugin {name}"),
                        after_ms: self.probe_timeout.as_millis() as u64,
                    })
                })
            }
        };
        let latency = start.elapsed();

        match outcome {
            Ok(()) => {
                self.breakers.record_success(name);
                self.observe(true, latency);
                tracing::trace!(
                    plugin = %name,
                    latency_ms = latency.as_millis() as u64,
                    "Health check passed"
                );
                HealthProbeResult::healthy(name, latency)
            }
            Err(e) => {
                if e.counts_against_plugin() {
                    self.breakers.record_failure(name);
                    self.observe(false, latency);
                    tracing::warn!(plugin = %name, "Health check failed: {}", e);
                } else {
                    tracing::debug!(plugin = %name, "Health check abandoned: {}", e);
                }
                HealthProbeResult::unhealthy(name, latency, e)
            }
        }
    }

    /// Probe several plugins concurrently
    pub async fn check_all(
        &self,
        descriptors: &[PluginDescriptor],
        cancel: &CancellationToken,
    ) -> Vec<HealthProbeResult> {
        futures::future::join_all(descriptors.iter().map(|d| self.check(d, cancel))).await
    }

    /// Re-discover and probe every plugin each `every`, until cancelled.
    pub async fn run(&self, store: &DescriptorStore, every: Duration, cancel: CancellationToken) {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_status: HashMap<String, HealthStatus> = HashMap::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("Health monitor stopping");
                    break;
                }
                _ = ticker.tick() => {}
            }

            let descriptors = store.discover();
            let results = self.check_all(&descriptors, &cancel).await;
            if cancel.is_cancelled() {
                break;
            }

            for result in &results {
                let previous = last_status.insert(result.plugin.clone(), result.status);
                if previous != Some(result.status) {
                    match result.status {
                        HealthStatus::Healthy => tracing::info!(
                            plugin = %result.plugin,
                            latency_ms = result.latency_ms(),
                            "Plugin is healthy"
                        ),
                        HealthStatus::Unhealthy => tracing::warn!(
                            plugin = %result.plugin,
                            error = ?result.error.as_ref().map(ToString::to_string),
                            "Plugin is unhealthy"
                        ),
                    }
                }
            }

            // Forget plugins whose descriptors disappeared
            last_status.retain(|name, _| descriptors.iter().any(|d| &d.name == name));
        }
    }

    async fn probe(&self, plugin: &str, conn: &dyn Connection) -> Result<()> {
        let request_id = JsonRpcId::Number(self.request_id_counter.fetch_add(1, Ordering::SeqCst));
        let request = health::create_check_request(request_id.clone());

        tracing::debug!(plugin = %plugin, id = %request_id, "Sending health check");
        let response = conn.call(request).await.map_err(|e| BrokerError::Probe {
            plugin: plugin.to_string(),
            reason: e.to_string(),
        })?;

        if response.id != request_id {
            return Err(BrokerError::Probe {
                plugin: plugin.to_string(),
                reason: format!("mismatched response id {}", response.id),
            });
        }

        if let Some(error) = response.error {
            return Err(BrokerError::Probe {
                plugin: plugin.to_string(),
                reason: format!("RPC error {}: {}", error.code, error.message),
            });
        }

        let body: HealthCheckResponse =
            serde_json::from_value(response.result.unwrap_or_default()).map_err(|e| {
                BrokerError::Probe {
                    plugin: plugin.to_string(),
                    reason: format!("invalid health response: {e}"),
                }
            })?;

        match body.status {
            ServingStatus::Serving => Ok(()),
            status => Err(BrokerError::NotServing {
                plugin: plugin.to_string(),
                status: status.to_string(),
            }),
        }
    }

    fn observe(&self, success: bool, latency: Duration) {
        if let Some(metrics) = &self.metrics {
            metrics.record_health_check(success, latency);
        }
    }
}
