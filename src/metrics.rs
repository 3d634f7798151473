use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};
use std::time::Duration;

pub struct Metrics {
    registry: Registry,

    // Connection metrics
    pub dial_attempts: IntCounter,
    pub dial_failures: IntCounter,
    pub active_connections: IntGauge,

    // Breaker metrics
    pub circuit_rejections: IntCounter,
    pub breaker_trips: IntCounter,

    // Health check metrics
    pub health_checks_total: IntCounter,
    pub health_checks_failed: IntCounter,
    pub health_check_latency: Histogram,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

fn counter(name: &str, help: &str) -> IntCounter {
    IntCounter::new(name, help).expect("metric creation failed")
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let dial_attempts = counter(
            "cost_broker_dial_attempts_total",
            "Total number of plugin dial attempts",
        );
        let dial_failures = counter(
            "cost_broker_dial_failures_total",
            "Total number of failed plugin dials",
        );
        let active_connections = IntGauge::new(
            "cost_broker_active_connections",
            "Number of pooled plugin connections",
        )
        .expect("metric creation failed");

        let circuit_rejections = counter(
            "cost_broker_circuit_rejections_total",
            "Calls rejected because a plugin's circuit breaker was open",
        );
        let breaker_trips = counter(
            "cost_broker_breaker_trips_total",
            "Number of times a circuit breaker opened",
        );

        let health_checks_total = counter(
            "cost_broker_health_checks_total",
            "Total number of plugin health checks",
        );
        let health_checks_failed = counter(
            "cost_broker_health_checks_failed",
            "Total number of failed plugin health checks",
        );
        let health_check_latency = Histogram::with_opts(HistogramOpts::new(
            "cost_broker_health_check_latency_seconds",
            "Plugin health check latency in seconds",
        ))
        .expect("metric creation failed");

        // Names are unique and constant, registration cannot collide.
        registry.register(Box::new(dial_attempts.clone())).unwrap();
        registry.register(Box::new(dial_failures.clone())).unwrap();
        registry
            .register(Box::new(active_connections.clone()))
            .unwrap();
        registry
            .register(Box::new(circuit_rejections.clone()))
            .unwrap();
        registry.register(Box::new(breaker_trips.clone())).unwrap();
        registry
            .register(Box::new(health_checks_total.clone()))
            .unwrap();
        registry
            .register(Box::new(health_checks_failed.clone()))
            .unwrap();
        registry
            .register(Box::new(health_check_latency.clone()))
            .unwrap();

        Self {
            registry,
            dial_attempts,
            dial_failures,
            active_connections,
            circuit_rejections,
            breaker_trips,
            health_checks_total,
            health_checks_failed,
            health_check_latency,
        }
    }

    pub fn record_dial(&self, success: bool) {
        self.dial_attempts.inc();
        if !success {
            self.dial_failures.inc();
        }
    }

    pub fn increment_active_connections(&self) {
        self.active_connections.inc();
    }

    pub fn reset_active_connections(&self) {
        self.active_connections.set(0);
    }

    pub fn decrement_active_connections(&self) {
        self.active_connections.dec();
    }

    pub fn record_circuit_rejection(&self) {
        self.circuit_rejections.inc();
    }

    pub fn record_breaker_trip(&self) {
        self.breaker_trips.inc();
    }

    pub fn record_health_check(&self, success: bool, latency: Duration) {
        self.health_checks_total.inc();
        self.health_check_latency.observe(latency.as_secs_f64());
        if !success {
            self.health_checks_failed.inc();
        }
    }

    pub fn gather_metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }
}
