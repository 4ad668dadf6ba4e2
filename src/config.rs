//! Configuration management for the caching proxy

use crate::error::{ProxyError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for the caching proxy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProxyConfig {
    /// Address the proxy listens on (default: 0.0.0.0:8088)
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// Root directory of the on-disk cache (default: .cache)
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// Path segment whose following token is dropped from cache keys (default: session)
    #[serde(default = "default_session_segment")]
    pub session_segment: String,

    /// Whether to store the origin status and headers with the body (default: true)
    #[serde(default = "default_true")]
    pub persist_headers: bool,

    /// Total timeout for an origin fetch in seconds (default: none)
    #[serde(default)]
    pub origin_timeout_secs: Option<u64>,

    /// Connect timeout for the origin in seconds (default: none)
    #[serde(default)]
    pub connect_timeout_secs: Option<u64>,

    /// Static hostname to address overrides for the origin client.
    /// The port of the target URL always takes precedence.
    #[serde(default)]
    pub origin_overrides: HashMap<String, SocketAddr>,
}

fn default_listen_address() -> String {
    "0.0.0.0:8088".to_string()
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from(".cache")
}

fn default_session_segment() -> String {
    "session".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for ProxyConfig {
    fn default() -> Self {
        ProxyConfig {
            listen_address: default_listen_address(),
            cache_dir: default_cache_dir(),
            session_segment: default_session_segment(),
            persist_headers: default_true(),
            origin_timeout_secs: None,
            connect_timeout_secs: None,
            origin_overrides: HashMap::new(),
        }
    }
}

impl ProxyConfig {
    /// Load configuration from a YAML file
    ///
    /// # Returns
    /// * `Ok(ProxyConfig)` if loading and validation succeed
    /// * `Err(ProxyError)` if file cannot be read or config is invalid
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            ProxyError::ConfigError(format!("Failed to read config file: {}", e))
        })?;

        Self::from_yaml(&content)
    }

    /// Parse and validate configuration from a YAML string
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: ProxyConfig = serde_yaml::from_str(content).map_err(|e| {
            ProxyError::ConfigError(format!("Failed to parse config file: {}", e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    ///
    /// # Validation Rules
    /// - listen_address must be a socket address
    /// - cache_dir must not be empty
    /// - session_segment must be a single, non-empty path segment
    /// - timeouts, when set, must be > 0
    pub fn validate(&self) -> Result<()> {
        self.listen_addr()?;

        if self.cache_dir.as_os_str().is_empty() {
            return Err(ProxyError::ConfigError(
                "cache_dir must not be empty".to_string(),
            ));
        }

        if self.session_segment.is_empty() || self.session_segment.contains('/') {
            return Err(ProxyError::ConfigError(format!(
                "session_segment must be a single path segment, got '{}'",
                self.session_segment
            )));
        }

        if self.origin_timeout_secs == Some(0) {
            return Err(ProxyError::ConfigError(
                "origin_timeout_secs must be greater than 0".to_string(),
            ));
        }

        if self.connect_timeout_secs == Some(0) {
            return Err(ProxyError::ConfigError(
                "connect_timeout_secs must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Parsed listen address
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.listen_address.parse().map_err(|e| {
            ProxyError::ConfigError(format!(
                "Invalid listen_address '{}': {}",
                self.listen_address, e
            ))
        })
    }

    pub fn origin_timeout(&self) -> Option<Duration> {
        self.origin_timeout_secs.map(Duration::from_secs)
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ProxyConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.listen_addr().unwrap().port(), 8088);
        assert_eq!(config.cache_dir, PathBuf::from(".cache"));
        assert!(config.origin_timeout().is_none());
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let config = ProxyConfig::from_yaml("cache_dir: /tmp/proxy-cache\n").unwrap();
        assert_eq!(config.cache_dir, PathBuf::from("/tmp/proxy-cache"));
        assert_eq!(config.listen_address, "0.0.0.0:8088");
        assert_eq!(config.session_segment, "session");
        assert!(config.persist_headers);
    }

    #[test]
    fn test_invalid_listen_address() {
        let config = ProxyConfig {
            listen_address: "not-an-address".to_string(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ProxyError::ConfigError(_))));
    }

    #[test]
    fn test_session_segment_with_slash_rejected() {
        let config = ProxyConfig {
            session_segment: "a/b".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let config = ProxyConfig {
            origin_timeout_secs: Some(0),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_origin_overrides_parse() {
        let yaml = "origin_overrides:\n  example.com: 127.0.0.1:0\n";
        let config = ProxyConfig::from_yaml(yaml).unwrap();
        let addr = config.origin_overrides.get("example.com").unwrap();
        assert_eq!(addr.ip().to_string(), "127.0.0.1");
    }
}
