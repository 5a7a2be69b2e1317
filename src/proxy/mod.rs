//! Forward proxy engine with optional TLS interception.
//!
//! This module provides:
//! - A plain HTTP/1.1 forward proxy (absolute-URI or `Host` resolution)
//! - HTTP CONNECT tunneling, either passed through byte for byte or
//!   redirected into a local TLS terminator
//! - Per-SNI leaf certificates minted on demand and cached per domain
//! - Lifecycle hooks to inspect, redirect or answer any exchange
//! - Deterministic shutdown of every tracked connection
//!
//! # Architecture
//!
//! ```text
//!   client ──► plain listener ──┬─ GET/POST/... ─────────────► Gateway ──► target:80
//!                               │
//!                               └─ CONNECT ─► TunnelDispatcher
//!                                               │ before_connect == false
//!                                               ├──────────── raw relay ──► target:443
//!                                               │ before_connect == true
//!                                               └─► Terminator (127.0.0.1:https_port)
//!                                                     │ SNI ─► CertificateCache
//!                                                     └─ decrypted ─► Gateway ──► target:443
//! ```
//!
//! # Example
//!
//! ```ignore
//! use fast_proxy::proxy::{Hooks, Proxy, ProxyOptions};
//!
//! let hooks = Hooks::new()
//!     .on_before_connect(|target| target.host.ends_with("example.com"))
//!     .on_after_response(|head, body| {
//!         println!("{} {} -> {} bytes", head.method, head.uri, body.chunks.len());
//!         false
//!     });
//!
//! let mut proxy = Proxy::launch(ProxyOptions { auto_start: true, ..Default::default() }, hooks).await?;
//! tokio::signal::ctrl_c().await?;
//! proxy.close().await;
//! ```

pub mod body;
pub mod connect;
pub mod error;
pub mod gateway;
pub mod hooks;
pub mod registry;
pub mod server;
pub mod terminator;
pub mod tls;

// Re-export main types for convenient access
pub use body::{ProxyBody, ResponseBody, empty_body, full_body};
pub use connect::{PROXY_AGENT, RelayStats, TunnelSession, TunnelState, relay};
pub use error::{ProxyError, ProxyResult};
pub use hooks::{ConnectTarget, ForwardOptions, Hooks, RequestHead, Responder, Scheme, UpstreamResponse};
pub use registry::ConnectionRegistry;
pub use server::{
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_HTTP_PORT, DEFAULT_HTTPS_PORT, PROXY_NAME, Proxy,
    ProxyOptions, ProxyStatus,
};
pub use tls::{CachedCertificate, CertificateCache, create_tls_connector};
