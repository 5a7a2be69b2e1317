//! HTTP CONNECT handling.
//!
//! The flow for `CONNECT host:port`:
//!
//! 1. Ask the `before_connect` hook whether to intercept the tunnel
//! 2. Intercept: dial the local interception terminator (starting it on
//!    first use). Passthrough: dial `host:port` directly
//! 3. On a successful dial answer `200 Connection established`
//! 4. After the upgrade, relay bytes verbatim in both directions until
//!    either side ends, then tear down both
//!
//! A failed dial returns an error from the service, which makes hyper
//! close the client connection instead of leaving it hanging.

use super::body::{ProxyBody, empty_body};
use super::error::{ProxyError, ProxyResult};
use super::hooks::{ConnectTarget, Hooks};
use super::registry::ConnectionRegistry;
use super::terminator::TerminatorSlot;
use hyper::body::Incoming;
use hyper::ext::ReasonPhrase;
use hyper::header::{HOST, HeaderValue};
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Value of the `Proxy-agent` header on tunnel answers.
pub const PROXY_AGENT: &str = "FXTop";

/// Lifecycle of a CONNECT tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    /// Target dialed, waiting for the client upgrade.
    Connecting,
    /// Relaying bytes.
    Piping,
    /// One side ended; both are torn down.
    Closed,
}

/// Bytes moved by a finished relay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Bytes copied client to target.
    pub client_to_target: u64,
    /// Bytes copied target to client.
    pub target_to_client: u64,
}

/// A client socket paired with its dialed target.
#[derive(Debug)]
pub struct TunnelSession<T> {
    target: ConnectTarget,
    upstream: Option<T>,
    state: TunnelState,
}

impl<T> TunnelSession<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    /// Session for an already dialed `upstream`.
    pub fn new(target: ConnectTarget, upstream: T) -> Self {
        Self {
            target,
            upstream: Some(upstream),
            state: TunnelState::Connecting,
        }
    }

    /// Current state.
    pub fn state(&self) -> TunnelState {
        self.state
    }

    /// Tunnel target as requested by the client.
    pub fn target(&self) -> &ConnectTarget {
        &self.target
    }

    /// Relay between `client` and the target until either side ends.
    pub async fn pipe<C>(&mut self, client: C) -> RelayStats
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        let Some(upstream) = self.upstream.take() else {
            self.state = TunnelState::Closed;
            return RelayStats::default();
        };

        self.state = TunnelState::Piping;
        let stats = relay(client, upstream).await;
        self.state = TunnelState::Closed;

        debug!(
            "Tunnel closed for {} ({} bytes out, {} bytes in)",
            self.target.url(),
            stats.client_to_target,
            stats.target_to_client
        );
        stats
    }
}

/// Copy bytes between `client` and `target` until either side reaches EOF
/// or fails, then shut down and drop both. Neither side is left half-open.
pub async fn relay<C, T>(client: C, target: T) -> RelayStats
where
    C: AsyncRead + AsyncWrite + Unpin,
    T: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut target_read, mut target_write) = tokio::io::split(target);
    let mut stats = RelayStats::default();

    tokio::select! {
        result = tokio::io::copy(&mut client_read, &mut target_write) => match result {
            Ok(n) => stats.client_to_target = n,
            Err(e) => debug!("Client->target copy ended: {}", e),
        },
        result = tokio::io::copy(&mut target_read, &mut client_write) => match result {
            Ok(n) => stats.target_to_client = n,
            Err(e) => debug!("Target->client copy ended: {}", e),
        },
    }

    let _ = tokio::time::timeout(Duration::from_secs(1), async {
        let _ = client_write.shutdown().await;
        let _ = target_write.shutdown().await;
    })
    .await;

    stats
}

/// Answers CONNECT requests on the plain listener.
pub struct TunnelDispatcher {
    hooks: Arc<Hooks>,
    terminator: Arc<TerminatorSlot>,
    connect_timeout: Duration,
}

impl TunnelDispatcher {
    /// Create a dispatcher.
    pub fn new(hooks: Arc<Hooks>, terminator: Arc<TerminatorSlot>, connect_timeout: Duration) -> Self {
        Self {
            hooks,
            terminator,
            connect_timeout,
        }
    }

    /// Handle one CONNECT request. Relay tasks are tracked in `registry`.
    pub async fn handle(
        &self,
        req: Request<Incoming>,
        registry: &Arc<ConnectionRegistry>,
    ) -> ProxyResult<Response<ProxyBody>> {
        let target = connect_target(&req)?;
        let intercept = self.hooks.before_connect(&target);

        debug!(
            "CONNECT {} ({})",
            target.url(),
            if intercept { "intercept" } else { "passthrough" }
        );

        let upstream = if intercept {
            let addr = self.terminator.ensure_started().await?;
            dial(&addr.ip().to_string(), addr.port(), self.connect_timeout).await?
        } else {
            dial(&target.host, target.port, self.connect_timeout).await?
        };

        let mut session = TunnelSession::new(target, upstream);
        let tracked = registry.track(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    session.pipe(TokioIo::new(upgraded)).await;
                }
                Err(e) => warn!("HTTP upgrade failed for {}: {}", session.target().url(), e),
            }
        });

        if !tracked {
            return Err(ProxyError::UpgradeFailed("proxy is closing".into()));
        }

        Ok(connection_established())
    }
}

/// `200 Connection established` with the proxy's agent header.
pub fn connection_established() -> Response<ProxyBody> {
    let mut response = Response::new(empty_body());
    *response.status_mut() = StatusCode::OK;
    response
        .headers_mut()
        .insert("proxy-agent", HeaderValue::from_static(PROXY_AGENT));
    response
        .extensions_mut()
        .insert(ReasonPhrase::from_static(b"Connection established"));
    response
}

/// Dial `host:port`, bounded by `timeout`.
pub(crate) async fn dial(host: &str, port: u16, timeout: Duration) -> ProxyResult<TcpStream> {
    let addr = format!("{}:{}", host, port);
    match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => {
            let _ = stream.set_nodelay(true);
            Ok(stream)
        }
        Ok(Err(e)) => {
            warn!("Failed to connect to {}: {}", addr, e);
            Err(ProxyError::UpstreamConnect {
                addr,
                message: e.to_string(),
            })
        }
        Err(_) => {
            warn!("Timed out connecting to {} after {:?}", addr, timeout);
            Err(ProxyError::Timeout(addr))
        }
    }
}

fn connect_target<B>(req: &Request<B>) -> ProxyResult<ConnectTarget> {
    let authority = match req.uri().authority() {
        Some(authority) => authority.to_string(),
        None => req
            .headers()
            .get(HOST)
            .and_then(|h| h.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| {
                ProxyError::InvalidConnect("Missing authority in CONNECT request".into())
            })?,
    };

    let (host, port) = parse_host_port(&authority, 443)?;
    if host.is_empty() {
        return Err(ProxyError::InvalidConnect(format!(
            "Missing host in '{}'",
            authority
        )));
    }
    info!("Tunnel requested to {}:{}", host, port);
    Ok(ConnectTarget { host, port })
}

/// Parse a `host[:port]` authority.
///
/// Examples:
/// - `api.example.com:443` -> ("api.example.com", 443)
/// - `api.example.com` -> ("api.example.com", `default_port`)
/// - `[::1]:8443` -> ("::1", 8443)
pub(crate) fn parse_host_port(authority: &str, default_port: u16) -> ProxyResult<(String, u16)> {
    if let Some(rest) = authority.strip_prefix('[') {
        // Bracketed IPv6 literal, optionally followed by a port.
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| ProxyError::InvalidConnect(format!("Unclosed '[' in {}", authority)))?;
        let port = match tail.strip_prefix(':') {
            Some(port_str) => parse_port(port_str)?,
            None if tail.is_empty() => default_port,
            None => {
                return Err(ProxyError::InvalidConnect(format!(
                    "Invalid authority: {}",
                    authority
                )));
            }
        };
        return Ok((host.to_string(), port));
    }

    match authority.rsplit_once(':') {
        // Bare IPv6 literal without a port.
        Some((host, _)) if host.contains(':') => Ok((authority.to_string(), default_port)),
        Some((host, port_str)) => Ok((host.to_string(), parse_port(port_str)?)),
        None => Ok((authority.to_string(), default_port)),
    }
}

fn parse_port(port_str: &str) -> ProxyResult<u16> {
    port_str
        .parse::<u16>()
        .map_err(|_| ProxyError::InvalidConnect(format!("Invalid port: {}", port_str)))
}
