use serde::{Deserialize, Serialize};

/// Client configuration file (YAML).
///
/// Example `config.yaml`:
/// ```yaml
/// ttl: 60
/// lock-name: mutex1
/// hold-secs: 5
/// keepalive-max-failures: 3
/// retry:
///   max-attempts: 5
///   initial-backoff-ms: 50
///   max-backoff-ms: 2000
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfigFile {
    /// Session lease TTL in seconds
    #[serde(default)]
    pub ttl: Option<i64>,
    #[serde(default, alias = "lock-name")]
    pub lock_name: Option<String>,
    #[serde(default, alias = "hold-secs")]
    pub hold_secs: Option<u64>,
    #[serde(default, alias = "keepalive-max-failures")]
    pub keepalive_max_failures: Option<u32>,
    #[serde(default)]
    pub retry: Option<RetryConfigFile>,
}

/// Backoff settings for coordinator calls.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryConfigFile {
    #[serde(default, alias = "max-attempts")]
    pub max_attempts: Option<u32>,
    #[serde(default, alias = "initial-backoff-ms")]
    pub initial_backoff_ms: Option<u64>,
    #[serde(default, alias = "max-backoff-ms")]
    pub max_backoff_ms: Option<u64>,
}

/// Load a YAML config file, returning the default if the file doesn't exist.
pub fn load_config_file<T: serde::de::DeserializeOwned + Default>(path: &str) -> anyhow::Result<T> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(T::default());
        }
        Err(e) => return Err(e.into()),
    };
    let config: T = serde_yaml::from_str(&content)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_yields_default() {
        let cfg: ClientConfigFile =
            load_config_file("/nonexistent/kvlock/config.yaml").expect("default config");
        assert!(cfg.ttl.is_none());
        assert!(cfg.retry.is_none());
    }

    #[test]
    fn test_parse_kebab_case_keys() {
        let yaml = "ttl: 10\nlock-name: jobs\nhold-secs: 2\nretry:\n  max-attempts: 7\n";
        let cfg: ClientConfigFile = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.ttl, Some(10));
        assert_eq!(cfg.lock_name.as_deref(), Some("jobs"));
        assert_eq!(cfg.hold_secs, Some(2));
        let retry = cfg.retry.unwrap();
        assert_eq!(retry.max_attempts, Some(7));
        assert!(retry.initial_backoff_ms.is_none());
    }
}
