use crate::broker::PluginBroker;
use crate::error::{BrokerError, Result};
use crate::health::HealthProbeResult;
use prometheus::{Encoder, TextEncoder};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Print every discoverable plugin
pub fn run_list(broker: &PluginBroker) -> Result<()> {
    let root = broker.store().root().display().to_string();
    let descriptors = broker.discover();
    if descriptors.is_empty() {
        println!("No plugins found in {root}");
        return Ok(());
    }

    println!("{} plugin(s) in {root}:", descriptors.len());
    for descriptor in &descriptors {
        println!("\n{} {}", descriptor.name, descriptor.version);
        if let Some(description) = &descriptor.description {
            println!("  {description}");
        }
        println!("  Address:   {}", descriptor.rpc_address);
        if let Some(providers) = &descriptor.providers {
            println!("  Providers: {providers}");
        }
        let caps = &descriptor.capabilities;
        println!(
            "  Supports:  projected={} actual={} optimization={}",
            caps.supports_projected_cost, caps.supports_actual_cost, caps.supports_optimization
        );
    }
    Ok(())
}

/// Probe one plugin, or all of them, and report the outcome.
///
/// Returns the number of unhealthy plugins.
pub async fn run_check(
    broker: &PluginBroker,
    plugin: Option<&str>,
    show_metrics: bool,
    cancel: &CancellationToken,
) -> Result<usize> {
    let results = match plugin {
        Some(name) => {
            let descriptor = broker.find(name)?;
            vec![broker.check(&descriptor, cancel).await]
        }
        None => {
            let results = broker.check_all(cancel).await;
            if results.is_empty() {
                println!(
                    "No plugins found in {}",
                    broker.store().root().display()
                );
            }
            results
        }
    };

    for result in &results {
        print_result(broker, result);
    }

    let unhealthy = results.iter().filter(|r| !r.is_healthy()).count();
    if !results.is_empty() {
        if unhealthy == 0 {
            println!("\n✓ All {} plugin(s) healthy", results.len());
        } else {
            println!("\n✗ {unhealthy} of {} plugin(s) unhealthy", results.len());
        }
    }

    if show_metrics {
        print_metrics(broker)?;
    }

    broker.shutdown().await;
    Ok(unhealthy)
}

/// Keep probing at the configured interval until `cancel` fires
pub async fn run_watch(broker: &PluginBroker, cancel: CancellationToken) -> Result<()> {
    info!(
        "Watching plugins in {}",
        broker.store().root().display()
    );
    broker.watch(cancel).await;
    broker.shutdown().await;
    info!("Stopped watching plugins");
    Ok(())
}

fn print_result(broker: &PluginBroker, result: &HealthProbeResult) {
    match &result.error {
        None => println!("✓ {} healthy ({}ms)", result.plugin, result.latency_ms()),
        Some(e) => println!(
            "✗ {} unhealthy ({}ms): {} [breaker: {:?}, failures: {}]",
            result.plugin,
            result.latency_ms(),
            e,
            broker.breakers().state(&result.plugin),
            broker.breakers().failure_count(&result.plugin)
        ),
    }
}

fn print_metrics(broker: &PluginBroker) -> Result<()> {
    println!("\n{}", encode_metrics(broker)?);
    Ok(())
}

fn encode_metrics(broker: &PluginBroker) -> Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&broker.metrics().gather_metrics(), &mut buffer)
        .map_err(|e| BrokerError::Metrics(format!("failed to encode metrics: {e}")))?;
    String::from_utf8(buffer).map_err(|e| BrokerError::Metrics(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::test_utils::ScriptedDialer;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_check_reports_unhealthy_count_and_metrics() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            plugin_dir: Some(dir.path().to_path_buf()),
            ..Config::default()
        };
        let broker = PluginBroker::new(&config, Arc::new(ScriptedDialer::new()));

        let err = run_check(&broker, Some("missing"), false, &CancellationToken::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, BrokerError::PluginNotFound(_)));

        broker.record_failure("aws");
        let text = encode_metrics(&broker).unwrap();
        assert!(text.contains("cost_broker_dial_attempts_total"));
        assert!(text.contains("cost_broker_breaker_trips_total 0"));
    }
}
