use super::{Connection, Dialer};
use crate::breaker::CircuitBreakerRegistry;
use crate::descriptor::PluginDescriptor;
use crate::error::{BrokerError, Result, TransportError};
use crate::metrics::Metrics;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

type DialFuture = Shared<BoxFuture<'static, Result<Arc<dyn Connection>>>>;

/// Owns one RPC channel per plugin.
///
/// Channels are dialed lazily on first use and reused afterwards. Concurrent
/// requests for a plugin that is not yet connected share a single dial.
pub struct ConnectionManager {
    dialer: Arc<dyn Dialer>,
    breakers: Arc<CircuitBreakerRegistry>,
    dial_timeout: Duration,
    connections: Arc<DashMap<String, Arc<dyn Connection>>>,
    in_flight: Arc<DashMap<String, DialFuture>>,
    metrics: Option<Arc<Metrics>>,
}

impl ConnectionManager {
    pub fn new(
        dialer: Arc<dyn Dialer>,
        breakers: Arc<CircuitBreakerRegistry>,
        dial_timeout: Duration,
    ) -> Self {
        Self {
            dialer,
            breakers,
            dial_timeout,
            connections: Arc::new(DashMap::new()),
            in_flight: Arc::new(DashMap::new()),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// Return the channel for `descriptor`, dialing it if needed.
    ///
    /// An existing channel is returned without I/O. Otherwise the plugin's
    /// breaker is consulted and an open breaker fails fast with
    /// [`BrokerError::CircuitOpen`]. Dial failures are recorded against the
    /// plugin; cancellation is not.
    pub async fn get_channel(
        &self,
        descriptor: &PluginDescriptor,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn Connection>> {
        self.acquire(descriptor, cancel, true).await
    }

    /// Like [`get_channel`](Self::get_channel) for a caller that already
    /// consulted the breaker for this attempt.
    pub(crate) async fn get_admitted_channel(
        &self,
        descriptor: &PluginDescriptor,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn Connection>> {
        self.acquire(descriptor, cancel, false).await
    }

    async fn acquire(
        &self,
        descriptor: &PluginDescriptor,
        cancel: &CancellationToken,
        consult_breaker: bool,
    ) -> Result<Arc<dyn Connection>> {
        if cancel.is_cancelled() {
            return Err(BrokerError::Cancelled);
        }

        if let Some(conn) = self.live_connection(&descriptor.name) {
            return Ok(conn);
        }

        let dial = match self.in_flight.entry(descriptor.name.clone()) {
            Entry::Occupied(entry) => {
                // A dial racing a half-open trial must not let extra callers through.
                if consult_breaker && self.breakers.is_open(&descriptor.name) {
                    return Err(self.reject(&descriptor.name));
                }
                tracing::debug!(plugin = %descriptor.name, "Joining in-flight dial");
                entry.get().clone()
            }
            Entry::Vacant(entry) => {
                // A dial may have finished between the lookup above and taking this entry.
                if let Some(conn) = self.live_connection(&descriptor.name) {
                    return Ok(conn);
                }

                if consult_breaker && self.breakers.is_open(&descriptor.name) {
                    return Err(self.reject(&descriptor.name));
                }

                let dial = self.spawn_dial(descriptor, consult_breaker);
                entry.insert(dial.clone());
                dial
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(BrokerError::Cancelled),
            result = dial => result,
        }
    }

    fn reject(&self, name: &str) -> BrokerError {
        if let Some(metrics) = &self.metrics {
            metrics.record_circuit_rejection();
        }
        tracing::debug!(plugin = %name, "Circuit open, not dialing");
        BrokerError::CircuitOpen {
            plugin: name.to_string(),
        }
    }

    // The dial runs on its own task so it settles even if every waiter is
    // cancelled. Registration happens only on success. A dial admitted by the
    // breaker reports its success there; a health check reports its own
    // verdict after probing.
    fn spawn_dial(&self, descriptor: &PluginDescriptor, report_success: bool) -> DialFuture {
        let name = descriptor.name.clone();
        let address = descriptor.rpc_address.clone();
        let dialer = self.dialer.clone();
        let breakers = self.breakers.clone();
        let connections = self.connections.clone();
        let in_flight = self.in_flight.clone();
        let metrics = self.metrics.clone();
        let dial_timeout = self.dial_timeout;

        let handle = tokio::spawn(async move {
            tracing::debug!(plugin = %name, address = %address, "Dialing plugin");

            let result = match timeout(dial_timeout, dialer.dial(&address)).await {
                Ok(Ok(conn)) => Ok(conn),
                Ok(Err(e)) => Err(BrokerError::Dial {
                    plugin: name.clone(),
                    address: address.clone(),
                    reason: e.to_string(),
                }),
                Err(_) => Err(BrokerError::Timeout {
                    operation: format!("Dial to plugin {name}"),
                    after_ms: dial_timeout.as_millis() as u64,
                }),
            };

            if let Some(metrics) = &metrics {
                metrics.record_dial(result.is_ok());
            }

            match &result {
                Ok(conn) => {
                    if report_success {
                        breakers.record_success(&name);
                    }
                    connections.insert(name.clone(), conn.clone());
                    if let Some(metrics) = &metrics {
                        metrics.increment_active_connections();
                    }
                    tracing::info!(plugin = %name, address = %address, "Connected to plugin");
                }
                Err(e) => {
                    breakers.record_failure(&name);
                    tracing::warn!(
                        plugin = %name,
                        address = %address,
                        "Failed to connect to plugin: {}",
                        e
                    );
                }
            }

            in_flight.remove(&name);
            result
        });

        async move {
            handle.await.unwrap_or_else(|e| {
                Err(TransportError::ConnectionFailed(format!("dial task failed: {e}")).into())
            })
        }
        .boxed()
        .shared()
    }

    fn live_connection(&self, name: &str) -> Option<Arc<dyn Connection>> {
        let conn = self.connections.get(name).map(|c| c.value().clone())?;
        if !conn.is_closed() {
            return Some(conn);
        }

        // Only evict the exact channel we saw closed.
        let removed = self
            .connections
            .remove_if(name, |_, current| Arc::ptr_eq(current, &conn))
            .is_some();
        if removed {
            if let Some(metrics) = &self.metrics {
                metrics.decrement_active_connections();
            }
            tracing::info!(plugin = %name, "Discarding closed plugin connection");
        }
        None
    }

    pub fn has_connection(&self, name: &str) -> bool {
        self.connections.contains_key(name)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Close every channel and empty the pool.
    ///
    /// Individual close errors are logged, never returned. Callers must stop
    /// issuing `get_channel` requests first.
    pub async fn close(&self) {
        let held: Vec<(String, Arc<dyn Connection>)> = self
            .connections
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        self.connections.clear();
        if let Some(metrics) = &self.metrics {
            metrics.reset_active_connections();
        }

        for (name, conn) in held {
            if let Err(e) = conn.close().await {
                tracing::warn!(plugin = %name, "Error closing plugin connection: {}", e);
            } else {
                tracing::debug!(plugin = %name, "Closed plugin connection");
            }
        }
    }
}
