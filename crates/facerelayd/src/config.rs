use anyhow::{Context, Result};
use facerelay_core::relay::{RelayOptions, DEFAULT_RESULT_KEY};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Daemon configuration.
///
/// Built from defaults, then an optional TOML file named by
/// `FACERELAY_CONFIG`, then `FACERELAY_*` environment variables.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Address the HTTP boundary listens on (default: 0.0.0.0:7777).
    pub listen_addr: String,
    /// Detection backend endpoint (default: http://face:10002/).
    pub backend_url: String,
    /// Upper bound on one backend exchange, in seconds.
    pub timeout_secs: u64,
    /// Reply key holding detections.
    pub result_key: String,
    /// Largest accepted request body. Base64 images are large.
    pub max_body_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:7777".to_string(),
            backend_url: "http://face:10002/".to_string(),
            timeout_secs: 180,
            result_key: DEFAULT_RESULT_KEY.to_string(),
            max_body_bytes: 64 * 1024 * 1024,
        }
    }
}

impl Config {
    /// Load configuration from the optional file and `FACERELAY_*` environment variables.
    pub fn load() -> Result<Self> {
        let base = match std::env::var("FACERELAY_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        Ok(base.with_overrides(|key| std::env::var(key).ok()))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("invalid config file {}", path.display()))
    }

    /// Apply `FACERELAY_*` overrides. Unparseable values keep the current setting.
    pub fn with_overrides(self, var: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            listen_addr: var("FACERELAY_LISTEN_ADDR").unwrap_or(self.listen_addr),
            backend_url: var("FACERELAY_BACKEND_URL").unwrap_or(self.backend_url),
            timeout_secs: parse_or(&var, "FACERELAY_TIMEOUT_SECS", self.timeout_secs),
            result_key: var("FACERELAY_RESULT_KEY").unwrap_or(self.result_key),
            max_body_bytes: parse_or(&var, "FACERELAY_MAX_BODY_BYTES", self.max_body_bytes),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn relay_options(&self) -> RelayOptions {
        RelayOptions {
            result_key: self.result_key.clone(),
            timeout: self.timeout(),
        }
    }
}

fn parse_or<T: std::str::FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match var(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "ignoring unparseable config override");
            default
        }),
        None => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.timeout(), Duration::from_secs(180));
        assert_eq!(config.result_key, "face_detection_recognition");
        assert_eq!(config.relay_options().timeout, Duration::from_secs(180));
    }

    #[test]
    fn test_env_overrides() {
        let config = Config::default().with_overrides(vars(&[
            ("FACERELAY_BACKEND_URL", "http://127.0.0.1:9000/"),
            ("FACERELAY_TIMEOUT_SECS", "30"),
        ]));
        assert_eq!(config.backend_url, "http://127.0.0.1:9000/");
        assert_eq!(config.timeout_secs, 30);
        assert_eq!(config.listen_addr, "0.0.0.0:7777");
    }

    #[test]
    fn test_bad_override_keeps_value() {
        let config = Config::default().with_overrides(vars(&[("FACERELAY_TIMEOUT_SECS", "soon")]));
        assert_eq!(config.timeout_secs, 180);
    }

    #[test]
    fn test_toml_partial_file() {
        let config: Config = toml::from_str(
            r#"
            backend_url = "http://face.internal:10002/"
            timeout_secs = 60
            "#,
        )
        .unwrap();
        assert_eq!(config.backend_url, "http://face.internal:10002/");
        assert_eq!(config.timeout_secs, 60);
        assert_eq!(config.max_body_bytes, Config::default().max_body_bytes);
    }

    #[test]
    fn test_toml_rejects_unknown_keys() {
        assert!(toml::from_str::<Config>("backend = \"x\"").is_err());
    }
}
