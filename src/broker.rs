use crate::breaker::{BreakerSettings, CircuitBreakerRegistry};
use crate::config::Config;
use crate::descriptor::{DescriptorStore, PluginDescriptor};
use crate::error::{BrokerError, Result};
use crate::health::{HealthMonitor, HealthProbeResult};
use crate::metrics::Metrics;
use crate::transport::{Connection, ConnectionManager, Dialer, TcpDialer};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Wires the descriptor store, breakers, connection pool and health monitor
/// together around one shared breaker registry.
pub struct PluginBroker {
    store: DescriptorStore,
    breakers: Arc<CircuitBreakerRegistry>,
    connections: Arc<ConnectionManager>,
    monitor: HealthMonitor,
    metrics: Arc<Metrics>,
    health_check_interval: Duration,
}

impl PluginBroker {
    /// Broker that dials plugins over TCP
    pub fn from_config(config: &Config) -> Self {
        Self::new(config, Arc::new(TcpDialer::new()))
    }

    pub fn new(config: &Config, dialer: Arc<dyn Dialer>) -> Self {
        let metrics = Arc::new(Metrics::new());
        let breakers = Arc::new(
            CircuitBreakerRegistry::new(BreakerSettings::from(&config.breaker))
                .with_metrics(metrics.clone()),
        );
        let connections = Arc::new(
            ConnectionManager::new(dialer, breakers.clone(), config.dial_timeout())
                .with_metrics(metrics.clone()),
        );
        let monitor = HealthMonitor::new(
            connections.clone(),
            breakers.clone(),
            config.health_check_timeout(),
        )
        .with_metrics(metrics.clone());

        Self {
            store: DescriptorStore::new(config.resolved_plugin_dir()),
            breakers,
            connections,
            monitor,
            metrics,
            health_check_interval: config.health_check_interval(),
        }
    }

    pub fn store(&self) -> &DescriptorStore {
        &self.store
    }

    pub fn discover(&self) -> Vec<PluginDescriptor> {
        self.store.discover()
    }

    pub fn find(&self, name: &str) -> Result<PluginDescriptor> {
        self.store
            .find(name)
            .ok_or_else(|| BrokerError::PluginNotFound(name.to_string()))
    }

    pub async fn get_channel(
        &self,
        descriptor: &PluginDescriptor,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn Connection>> {
        self.connections.get_channel(descriptor, cancel).await
    }

    pub async fn check(
        &self,
        descriptor: &PluginDescriptor,
        cancel: &CancellationToken,
    ) -> HealthProbeResult {
        self.monitor.check(descriptor, cancel).await
    }

    /// Discover every plugin and probe them all
    pub async fn check_all(&self, cancel: &CancellationToken) -> Vec<HealthProbeResult> {
        let descriptors = self.discover();
        self.monitor.check_all(&descriptors, cancel).await
    }

    /// Periodic health monitoring at the configured interval, until cancelled
    pub async fn watch(&self, cancel: CancellationToken) {
        self.monitor
            .run(&self.store, self.health_check_interval, cancel)
            .await
    }

    /// Report the outcome of an application call made on a pooled channel.
    pub fn record_success(&self, plugin: &str) {
        self.breakers.record_success(plugin);
    }

    pub fn record_failure(&self, plugin: &str) {
        self.breakers.record_failure(plugin);
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub fn monitor(&self) -> &HealthMonitor {
        &self.monitor
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub async fn shutdown(&self) {
        tracing::info!("Closing plugin connections");
        self.connections.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerState;
    use crate::test_utils::ScriptedDialer;
    use std::fs;
    use std::path::Path;

    fn write_plugin(root: &Path, name: &str) {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("plugin.json"),
            format!(
                r#"{{"name": "{name}", "version": "1.0.0", "grpc_address": "{name}.plugins.test:50051"}}"#
            ),
        )
        .unwrap();
    }

    fn broker_in(root: &Path, dialer: Arc<ScriptedDialer>) -> PluginBroker {
        let config = Config {
            plugin_dir: Some(root.to_path_buf()),
            ..Config::default()
        };
        PluginBroker::new(&config, dialer)
    }

    #[tokio::test]
    async fn test_check_all_discovers_and_probes() {
        let dir = tempfile::tempdir().unwrap();
        write_plugin(dir.path(), "aws");
        write_plugin(dir.path(), "gcp");
        let dialer = Arc::new(ScriptedDialer::new());
        let broker = broker_in(dir.path(), dialer.clone());

        let results = broker.check_all(&CancellationToken::new()).await;

        assert_eq!(results.len(), 2);
        assert!(results.iter().all(HealthProbeResult::is_healthy));
        assert_eq!(dialer.dial_count(), 2);
        assert_eq!(broker.metrics().health_checks_total.get(), 2);
    }

    #[tokio::test]
    async fn test_find_unknown_plugin() {
        let dir = tempfile::tempdir().unwrap();
        let broker = broker_in(dir.path(), Arc::new(ScriptedDialer::new()));

        let err = broker.find("nope").err().unwrap();
        assert!(matches!(err, BrokerError::PluginNotFound(name) if name == "nope"));
    }

    #[tokio::test]
    async fn test_application_failures_share_the_breaker() {
        let dir = tempfile::tempdir().unwrap();
        write_plugin(dir.path(), "aws");
        let dialer = Arc::new(ScriptedDialer::new());
        let broker = broker_in(dir.path(), dialer.clone());
        let aws = broker.find("aws").unwrap();
        let cancel = CancellationToken::new();

        broker.get_channel(&aws, &cancel).await.unwrap();
        for _ in 0..5 {
            broker.record_failure("aws");
        }
        assert_eq!(broker.breakers().state("aws"), BreakerState::Open);
        assert_eq!(broker.metrics().breaker_trips.get(), 1);

        // The health monitor honours the same breaker
        let result = broker.check(&aws, &cancel).await;
        assert!(result.error.as_ref().is_some_and(BrokerError::is_circuit_open));
    }

    #[tokio::test]
    async fn test_shutdown_empties_pool() {
        let dir = tempfile::tempdir().unwrap();
        write_plugin(dir.path(), "aws");
        let dialer = Arc::new(ScriptedDialer::new());
        let broker = broker_in(dir.path(), dialer.clone());
        let aws = broker.find("aws").unwrap();

        let conn = broker
            .get_channel(&aws, &CancellationToken::new())
            .await
            .unwrap();
        broker.shutdown().await;

        assert!(conn.is_closed());
        assert_eq!(broker.connections().connection_count(), 0);
        assert_eq!(broker.metrics().active_connections.get(), 0);
    }
}
