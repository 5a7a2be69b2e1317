//! Configuration system for fast-proxy.
//!
//! This module provides TOML configuration loading with hierarchy merging.
//!
//! # Configuration Hierarchy
//!
//! Configuration is loaded from multiple sources and merged in order:
//!
//! 1. System config: `/etc/fast-proxy/config.toml`
//! 2. User config: `~/.config/fast-proxy/config.toml`
//! 3. Additional config file (via `--config` flag)
//! 4. CLI flags (highest priority)
//!
//! Every source is optional; with none present the proxy runs on its
//! built-in defaults.
//!
//! # Merge Behavior
//!
//! - **Lists** (intercept) are **merged** (appended, without duplicates)
//! - **Scalars** (ports, log_level, etc.) are **overridden** when set
//! - The CA certificate and key paths are replaced as a pair

mod error;
mod loader;
mod schema;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use schema::{CaConfig, Config, GeneralConfig, ProxyConfig, SystemConfig};
