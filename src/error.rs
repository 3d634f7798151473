use std::path::PathBuf;
use thiserror::Error;

// Clone is required: a single in-flight dial fans its result out to every waiter.
#[derive(Error, Debug, Clone)]
pub enum BrokerError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Descriptor error: {0}")]
    Descriptor(#[from] DescriptorError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Circuit breaker open for plugin: {plugin}")]
    CircuitOpen { plugin: String },

    #[error("Failed to dial plugin {plugin} at {address}: {reason}")]
    Dial {
        plugin: String,
        address: String,
        reason: String,
    },

    #[error("{operation} timed out after {after_ms}ms")]
    Timeout { operation: String, after_ms: u64 },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Health probe failed for plugin {plugin}: {reason}")]
    Probe { plugin: String, reason: String },

    #[error("Plugin {plugin} is not serving (status: {status})")]
    NotServing { plugin: String, status: String },

    #[error("Plugin not found: {0}")]
    PluginNotFound(String),

    #[error("Metrics error: {0}")]
    Metrics(String),
}

impl BrokerError {
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, BrokerError::CircuitOpen { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, BrokerError::Cancelled)
    }

    /// Whether this failure says something about the plugin's own health.
    ///
    /// Cancellation and breaker rejections never do: the call did not get a
    /// chance to fail on its own.
    pub fn counts_against_plugin(&self) -> bool {
        !matches!(
            self,
            BrokerError::Cancelled
                | BrokerError::CircuitOpen { .. }
                | BrokerError::Config(_)
                | BrokerError::Descriptor(_)
                | BrokerError::PluginNotFound(_)
                | BrokerError::Metrics(_)
        )
    }
}

#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Environment variable error: {0}")]
    EnvVar(String),
}

#[derive(Error, Debug, Clone)]
pub enum DescriptorError {
    #[error("Failed to read {path}: {reason}")]
    Read { path: PathBuf, reason: String },

    #[error("Failed to parse {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("Missing required field '{field}' in {path}")]
    MissingField { path: PathBuf, field: &'static str },
}

#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Transport closed")]
    Closed,

    #[error("Invalid message format: {0}")]
    InvalidFormat(String),
}

pub type Result<T> = std::result::Result<T, BrokerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancellation_does_not_count_against_plugin() {
        assert!(!BrokerError::Cancelled.counts_against_plugin());
        assert!(!BrokerError::CircuitOpen {
            plugin: "aws".to_string()
        }
        .counts_against_plugin());
    }

    #[test]
    fn test_network_failures_count_against_plugin() {
        let dial = BrokerError::Dial {
            plugin: "aws".to_string(),
            address: "127.0.0.1:1".to_string(),
            reason: "connection refused".to_string(),
        };
        assert!(dial.counts_against_plugin());
        assert!(BrokerError::Timeout {
            operation: "Health check".to_string(),
            after_ms: 2000,
        }
        .counts_against_plugin());
        assert!(BrokerError::from(TransportError::Closed).counts_against_plugin());
    }

    #[test]
    fn test_local_failures_do_not_count_against_plugin() {
        let metrics = BrokerError::Metrics("encoding failed".to_string());
        assert!(!metrics.counts_against_plugin());
        assert_eq!(metrics.to_string(), "Metrics error: encoding failed");
        assert!(!BrokerError::PluginNotFound("aws".to_string()).counts_against_plugin());
    }

    #[test]
    fn test_error_kind_helpers() {
        assert!(BrokerError::Cancelled.is_cancelled());
        let open = BrokerError::CircuitOpen {
            plugin: "gcp".to_string(),
        };
        assert!(open.is_circuit_open());
        assert_eq!(open.to_string(), "Circuit breaker open for plugin: gcp");
    }
}
