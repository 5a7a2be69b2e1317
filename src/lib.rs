//! fast-proxy: Interactive HTTP/HTTPS forward proxy
//!
//! This crate provides a forward proxy that relays plain HTTP requests and
//! CONNECT tunnels, and can decrypt selected tunnels on the fly with
//! certificates it mints for each requested host.
//!
//! # Interception Model
//!
//! Tunnels are **passed through** unless a `before_connect` hook asks for
//! interception. Intercepted tunnels are routed to a loopback TLS
//! terminator that presents a leaf certificate signed by the proxy's root
//! credential; clients must trust that root.
//!
//! # Architecture
//!
//! - **Proxy**: hyper-based listener, CONNECT dispatcher, TLS terminator,
//!   lifecycle hooks and connection registries
//! - **CA**: root credential synthesis and per-domain leaf issuance (rcgen)
//! - **Config**: Hierarchical TOML configuration merged with CLI flags
//! - **State**: Temporary file store for the persisted root and proxy
//!   settings snapshots
//! - **System**: OS proxy settings and trust store helpers

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod ca;
pub mod cli;
pub mod config;
pub mod proxy;
pub mod state;
pub mod system;
