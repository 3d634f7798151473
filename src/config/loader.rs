use super::schema::Config;
use crate::error::{ConfigError, Result};
use figment::{
    providers::{Env, Format, Json, Toml, Yaml},
    Figment,
};
use std::path::Path;

const ENV_PREFIX: &str = "COST_BROKER_";

pub async fn load_from_env_or_file() -> Result<Config> {
    let config: Config = Figment::new()
        // Try to load from various config files
        .merge(Toml::file("cost-broker.toml"))
        .merge(Json::file("cost-broker.json"))
        .merge(Yaml::file("cost-broker.yaml"))
        .merge(Yaml::file("cost-broker.yml"))
        .merge(env_provider())
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    finish(config)
}

pub async fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();

    let figment = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => Figment::new().merge(Toml::file(path)),
        Some("json") => Figment::new().merge(Json::file(path)),
        Some("yaml") | Some("yml") => Figment::new().merge(Yaml::file(path)),
        _ => {
            return Err(ConfigError::Parse(
                "Unsupported config file format. Use .toml, .json, .yaml, or .yml".into(),
            )
            .into())
        }
    };

    let config: Config = figment
        .merge(env_provider())
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    finish(config)
}

// COST_BROKER_PLUGIN_DIR -> pluginDir, COST_BROKER_BREAKER__FAILURE_THRESHOLD -> breaker.failureThreshold
fn env_provider() -> Env {
    Env::prefixed(ENV_PREFIX)
        .split("__")
        .map(|key| to_camel_case(key.as_str()).into())
}

fn to_camel_case(key: &str) -> String {
    key.split('.')
        .map(|segment| {
            let mut out = String::with_capacity(segment.len());
            let mut upper = false;
            for (i, ch) in segment.chars().enumerate() {
                if ch == '_' {
                    upper = i > 0;
                } else if upper {
                    out.extend(ch.to_uppercase());
                    upper = false;
                } else {
                    out.extend(ch.to_lowercase());
                }
            }
            out
        })
        .collect::<Vec<_>>()
        .join(".")
}

fn finish(config: Config) -> Result<Config> {
    validate(&config)?;
    apply_env_substitutions(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.breaker.failure_threshold == 0 {
        return Err(
            ConfigError::Validation("Breaker failure threshold must be at least 1".into()).into(),
        );
    }

    if config.breaker.open_timeout_seconds == 0 {
        return Err(
            ConfigError::Validation("Breaker open timeout must be greater than 0".into()).into(),
        );
    }

    if config.connection.dial_timeout_ms == 0 {
        return Err(ConfigError::Validation("Dial timeout must be greater than 0".into()).into());
    }

    if config.health_check.timeout_ms == 0 || config.health_check.interval_seconds == 0 {
        return Err(ConfigError::Validation(
            "Health check timeout and interval must be greater than 0".into(),
        )
        .into());
    }

    Ok(())
}

fn apply_env_substitutions(mut config: Config) -> Result<Config> {
    if let Some(dir) = &config.plugin_dir {
        let substituted = substitute_env_vars(&dir.to_string_lossy())?;
        config.plugin_dir = Some(substituted.into());
    }

    if let Some(dir) = &config.logging.directory {
        let substituted = substitute_env_vars(&dir.to_string_lossy())?;
        config.logging.directory = Some(substituted.into());
    }

    Ok(config)
}

fn substitute_env_vars(input: &str) -> Result<String> {
    let mut result = input.to_string();
    let re = regex::Regex::new(r"\$\{([^}]+)\}")
        .map_err(|e| ConfigError::Parse(format!("Invalid substitution pattern: {e}")))?;

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        // ${VAR:-default}
        if let Some((name, default)) = var_name.split_once(":-") {
            let value = std::env::var(name).unwrap_or_else(|_| default.to_string());
            result = result.replace(&cap[0], &value);
            continue;
        }
        match std::env::var(var_name) {
            Ok(value) => result = result.replace(&cap[0], &value),
            Err(_) => {
                return Err(ConfigError::EnvVar(format!(
                    "Environment variable '{var_name}' not found"
                ))
                .into());
            }
        }
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_env_substitution() {
        std::env::set_var("COST_BROKER_TEST_ROOT", "/srv/cost");

        let result = substitute_env_vars("${COST_BROKER_TEST_ROOT}/plugins").unwrap();
        assert_eq!(result, "/srv/cost/plugins");

        let result = substitute_env_vars("${COST_BROKER_TEST_MISSING:-/tmp}/plugins").unwrap();
        assert_eq!(result, "/tmp/plugins");

        assert!(substitute_env_vars("${COST_BROKER_TEST_MISSING}").is_err());

        std::env::remove_var("COST_BROKER_TEST_ROOT");
    }

    #[test]
    fn test_env_key_mapping() {
        assert_eq!(to_camel_case("PLUGIN_DIR"), "pluginDir");
        assert_eq!(
            to_camel_case("BREAKER.FAILURE_THRESHOLD"),
            "breaker.failureThreshold"
        );
    }

    #[test]
    fn test_validate_rejects_zero_threshold() {
        let mut config = Config::default();
        config.breaker.failure_threshold = 0;
        assert!(validate(&config).is_err());
        assert!(validate(&Config::default()).is_ok());
    }

    #[tokio::test]
    async fn test_load_from_yaml_path() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("cost-broker.yaml");
        std::fs::write(
            &path,
            "pluginDir: /var/lib/cost/plugins\nbreaker:\n  failureThreshold: 2\n  openTimeoutSeconds: 10\n",
        )
        .unwrap();

        let config = load_from_path(&path).await.unwrap();
        assert_eq!(config.plugin_dir, Some(PathBuf::from("/var/lib/cost/plugins")));
        assert_eq!(config.breaker.failure_threshold, 2);
        assert_eq!(config.breaker.open_timeout_seconds, 10);
        assert_eq!(config.breaker.failure_reset_window_seconds, 60);
    }

    #[tokio::test]
    async fn test_load_rejects_unknown_extension() {
        let result = load_from_path("cost-broker.ini").await;
        assert!(result.is_err());
    }
}
