//! Configuration schema definitions.
//!
//! This module defines the structure of the fast-proxy configuration files:
//!
//! ```toml
//! [general]
//! log_level = "info"
//!
//! [proxy]
//! http_port = 8888
//! https_port = 8889
//! bind_address = "127.0.0.1"
//! connect_timeout_secs = 30
//! intercept = ["example.com", "*.internal.test"]
//!
//! [ca]
//! cert_path = "/etc/fast-proxy/ca.pem"
//! key_path = "/etc/fast-proxy/ca.key"
//! validity_days = 365
//!
//! [system]
//! set_system_proxy = false
//! proxy_https = false
//! ```
//!
//! Every key is optional; unset keys fall back to the defaults of
//! [`ProxyOptions`].

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use super::error::ConfigError;
use crate::ca::RootCredential;
use crate::proxy::ProxyOptions;

/// Top-level configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Config {
    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,

    /// Listener and interception settings.
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Root credential settings.
    #[serde(default)]
    pub ca: CaConfig,

    /// OS integration settings.
    #[serde(default)]
    pub system: SystemConfig,
}

impl Config {
    /// Merge another config into this one.
    ///
    /// Lists (intercept) are merged (appended).
    /// Scalars (ports, log_level, etc.) are overridden when set.
    pub fn merge(&mut self, other: Config) {
        self.general.merge(other.general);
        self.proxy.merge(other.proxy);
        self.ca.merge(other.ca);
        self.system.merge(other.system);
    }

    /// Build proxy options, loading the configured root credential.
    pub fn proxy_options(&self) -> Result<ProxyOptions, ConfigError> {
        let mut options = ProxyOptions::default();

        if let Some(port) = self.proxy.http_port {
            options.http_port = port;
        }
        if let Some(port) = self.proxy.https_port {
            options.https_port = port;
        }
        if let Some(addr) = self.proxy.bind_address {
            options.bind_address = addr;
        }
        if let Some(secs) = self.proxy.connect_timeout_secs {
            if secs == 0 {
                return Err(ConfigError::InvalidValue {
                    field: "proxy.connect_timeout_secs".to_string(),
                    message: "must be greater than zero".to_string(),
                });
            }
            options.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(days) = self.ca.validity_days {
            if days == 0 {
                return Err(ConfigError::InvalidValue {
                    field: "ca.validity_days".to_string(),
                    message: "must be greater than zero".to_string(),
                });
            }
            options.cert_validity_days = days;
        }

        options.ca = match (&self.ca.cert_path, &self.ca.key_path) {
            (Some(cert), Some(key)) => Some(Arc::new(RootCredential::load(cert, key)?)),
            (None, None) => None,
            (Some(_), None) => {
                return Err(ConfigError::InvalidValue {
                    field: "ca.key_path".to_string(),
                    message: "required when ca.cert_path is set".to_string(),
                });
            }
            (None, Some(_)) => {
                return Err(ConfigError::InvalidValue {
                    field: "ca.cert_path".to_string(),
                    message: "required when ca.key_path is set".to_string(),
                });
            }
        };

        Ok(options)
    }
}

/// General application settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
pub struct GeneralConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default)]
    pub log_level: String,
}

impl GeneralConfig {
    fn merge(&mut self, other: GeneralConfig) {
        if !other.log_level.is_empty() {
            self.log_level = other.log_level;
        }
    }
}

/// Listener and interception settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
pub struct ProxyConfig {
    /// Plain listener port. 0 picks a free one.
    #[serde(default)]
    pub http_port: Option<u16>,

    /// Loopback interception terminator port. 0 picks a free one.
    #[serde(default)]
    pub https_port: Option<u16>,

    /// Address the plain listener binds.
    #[serde(default)]
    pub bind_address: Option<IpAddr>,

    /// Upstream dial timeout in seconds.
    #[serde(default)]
    pub connect_timeout_secs: Option<u64>,

    /// Hosts whose tunnels are intercepted.
    ///
    /// Exact host names, or `*.suffix` to match any subdomain of `suffix`.
    #[serde(default)]
    pub intercept: Vec<String>,
}

impl ProxyConfig {
    fn merge(&mut self, other: ProxyConfig) {
        if other.http_port.is_some() {
            self.http_port = other.http_port;
        }
        if other.https_port.is_some() {
            self.https_port = other.https_port;
        }
        if other.bind_address.is_some() {
            self.bind_address = other.bind_address;
        }
        if other.connect_timeout_secs.is_some() {
            self.connect_timeout_secs = other.connect_timeout_secs;
        }
        for pattern in other.intercept {
            if !self.intercept.contains(&pattern) {
                self.intercept.push(pattern);
            }
        }
    }

    /// Whether tunnels to `host` should be intercepted.
    pub fn should_intercept(&self, host: &str) -> bool {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        self.intercept
            .iter()
            .any(|pattern| pattern_matches(pattern, &host))
    }
}

/// Match a lowercased host against an intercept pattern.
fn pattern_matches(pattern: &str, host: &str) -> bool {
    let pattern = pattern.trim().to_ascii_lowercase();
    match pattern.strip_prefix("*.") {
        Some(suffix) => host
            .strip_suffix(suffix)
            .is_some_and(|rest| rest.ends_with('.') && rest.len() > 1),
        None => pattern == "*" || pattern == host,
    }
}

/// Root credential settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
pub struct CaConfig {
    /// PEM root certificate.
    #[serde(default)]
    pub cert_path: Option<PathBuf>,

    /// PEM (PKCS#8) root private key.
    #[serde(default)]
    pub key_path: Option<PathBuf>,

    /// Validity of minted leaf certificates, in days.
    #[serde(default)]
    pub validity_days: Option<u32>,
}

impl CaConfig {
    fn merge(&mut self, other: CaConfig) {
        // The credential is a pair; a layer replaces both paths or neither.
        if other.cert_path.is_some() || other.key_path.is_some() {
            self.cert_path = other.cert_path;
            self.key_path = other.key_path;
        }
        if other.validity_days.is_some() {
            self.validity_days = other.validity_days;
        }
    }
}

/// OS integration settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
pub struct SystemConfig {
    /// Install the proxy as the system proxy while running.
    #[serde(default)]
    pub set_system_proxy: bool,

    /// Route HTTPS through the system proxy as well.
    #[serde(default)]
    pub proxy_https: bool,
}

impl SystemConfig {
    fn merge(&mut self, other: SystemConfig) {
        if other.set_system_proxy {
            self.set_system_proxy = true;
        }
        if other.proxy_https {
            self.proxy_https = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca::{CaInfo, create_ca};
    use crate::proxy::{DEFAULT_HTTP_PORT, DEFAULT_HTTPS_PORT};
    use tempfile::tempdir;

    #[test]
    fn test_parse_full_config() {
        let config: Config = toml::from_str(
            r#"
            [general]
            log_level = "debug"

            [proxy]
            http_port = 9000
            https_port = 0
            bind_address = "0.0.0.0"
            connect_timeout_secs = 5
            intercept = ["example.com", "*.test"]

            [ca]
            validity_days = 30

            [system]
            set_system_proxy = true
            "#,
        )
        .unwrap();

        assert_eq!(config.general.log_level, "debug");
        assert_eq!(config.proxy.http_port, Some(9000));
        assert_eq!(config.proxy.https_port, Some(0));
        assert_eq!(config.proxy.bind_address, Some("0.0.0.0".parse().unwrap()));
        assert_eq!(config.proxy.intercept.len(), 2);
        assert_eq!(config.ca.validity_days, Some(30));
        assert!(config.system.set_system_proxy);
        assert!(!config.system.proxy_https);
    }

    #[test]
    fn test_empty_config_gives_default_options() {
        let config: Config = toml::from_str("").unwrap();
        let options = config.proxy_options().unwrap();

        assert_eq!(options.http_port, DEFAULT_HTTP_PORT);
        assert_eq!(options.https_port, DEFAULT_HTTPS_PORT);
        assert!(options.ca.is_none());
        assert!(!options.auto_start);
    }

    #[test]
    fn test_merge_overrides_scalars_and_extends_lists() {
        let mut base: Config = toml::from_str(
            r#"
            [general]
            log_level = "warn"
            [proxy]
            http_port = 8000
            intercept = ["a.test"]
            "#,
        )
        .unwrap();
        let overlay: Config = toml::from_str(
            r#"
            [proxy]
            https_port = 9443
            intercept = ["a.test", "b.test"]
            "#,
        )
        .unwrap();

        base.merge(overlay);

        assert_eq!(base.general.log_level, "warn");
        assert_eq!(base.proxy.http_port, Some(8000));
        assert_eq!(base.proxy.https_port, Some(9443));
        assert_eq!(base.proxy.intercept, vec!["a.test", "b.test"]);
    }

    #[test]
    fn test_intercept_patterns() {
        let proxy = ProxyConfig {
            intercept: vec!["Example.com".to_string(), "*.internal.test".to_string()],
            ..Default::default()
        };

        assert!(proxy.should_intercept("example.com"));
        assert!(proxy.should_intercept("EXAMPLE.COM."));
        assert!(!proxy.should_intercept("www.example.com"));
        assert!(proxy.should_intercept("api.internal.test"));
        assert!(proxy.should_intercept("a.b.internal.test"));
        assert!(!proxy.should_intercept("internal.test"));
        assert!(!proxy.should_intercept("notinternal.test"));
    }

    #[test]
    fn test_wildcard_star_intercepts_everything() {
        let proxy = ProxyConfig {
            intercept: vec!["*".to_string()],
            ..Default::default()
        };
        assert!(proxy.should_intercept("anything.example"));
        assert!(!ProxyConfig::default().should_intercept("anything.example"));
    }

    #[test]
    fn test_proxy_options_loads_root() {
        let dir = tempdir().unwrap();
        let cert = dir.path().join("ca.pem");
        let key = dir.path().join("ca.key");
        create_ca(&CaInfo::default()).unwrap().save(&cert, &key).unwrap();

        let config = Config {
            ca: CaConfig {
                cert_path: Some(cert),
                key_path: Some(key),
                validity_days: Some(10),
            },
            ..Default::default()
        };
        let options = config.proxy_options().unwrap();

        assert!(options.ca.is_some());
        assert_eq!(options.cert_validity_days, 10);
    }

    #[test]
    fn test_proxy_options_rejects_half_credential() {
        let config = Config {
            ca: CaConfig {
                cert_path: Some(PathBuf::from("/tmp/ca.pem")),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(matches!(
            config.proxy_options(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_proxy_options_missing_root_is_ca_error() {
        let dir = tempdir().unwrap();
        let config = Config {
            ca: CaConfig {
                cert_path: Some(dir.path().join("missing.pem")),
                key_path: Some(dir.path().join("missing.key")),
                validity_days: None,
            },
            ..Default::default()
        };
        assert!(matches!(config.proxy_options(), Err(ConfigError::Ca(_))));
    }

    #[test]
    fn test_zero_timeout_is_invalid() {
        let mut config = Config::default();
        config.proxy.connect_timeout_secs = Some(0);
        assert!(config.proxy_options().is_err());
    }
}
