use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Root directory holding one subdirectory per plugin
    #[serde(default)]
    pub plugin_dir: Option<PathBuf>,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_open_timeout")]
    pub open_timeout_seconds: u64,
    #[serde(default = "default_failure_reset_window")]
    pub failure_reset_window_seconds: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfig {
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckConfig {
    #[serde(default = "default_health_check_timeout")]
    pub timeout_ms: u64,
    #[serde(default = "default_health_check_interval")]
    pub interval_seconds: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
    /// Write a daily-rolling log file here in addition to stderr
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

// Default value functions
fn default_failure_threshold() -> u32 {
    5
}

fn default_open_timeout() -> u64 {
    30
}

fn default_failure_reset_window() -> u64 {
    60
}

fn default_dial_timeout() -> u64 {
    5000
}

fn default_health_check_timeout() -> u64 {
    2000
}

fn default_health_check_interval() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            open_timeout_seconds: default_open_timeout(),
            failure_reset_window_seconds: default_failure_reset_window(),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            dial_timeout_ms: default_dial_timeout(),
        }
    }
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_health_check_timeout(),
            interval_seconds: default_health_check_interval(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            directory: None,
        }
    }
}

impl BreakerConfig {
    pub fn open_timeout(&self) -> Duration {
        Duration::from_secs(self.open_timeout_seconds)
    }

    pub fn failure_reset_window(&self) -> Duration {
        Duration::from_secs(self.failure_reset_window_seconds)
    }
}

impl Config {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.connection.dial_timeout_ms)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.health_check.timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check.interval_seconds)
    }

    /// Plugin directory to scan: the configured one, else
    /// `$HOME/.cost-broker/plugins`, else a directory under the system temp dir
    /// when no home directory can be determined.
    pub fn resolved_plugin_dir(&self) -> PathBuf {
        if let Some(dir) = &self.plugin_dir {
            return dir.clone();
        }
        match dirs::home_dir() {
            Some(home) => home.join(".cost-broker").join("plugins"),
            None => std::env::temp_dir().join("cost-broker").join("plugins"),
        }
    }
}
