//! Proxy instance.
//!
//! [`Proxy`] owns the plain HTTP listener, the lazily started interception
//! terminator, one connection registry per listener, and the hook registry.
//!
//! # Lifecycle
//!
//! ```text
//! Idle ──start──► Running ──close──► Closed ──start──► Running
//! ```
//!
//! `start` while Running and `close` while not Running do nothing.
//! `reset` is `close` + new options + merged hooks + `start`.
//!
//! # Architecture
//!
//! The proxy uses hyper's HTTP/1.1 server with upgrade support for CONNECT.
//! Each connection is handled in its own Tokio task, tracked by the
//! listener's [`ConnectionRegistry`] so that `close` can destroy it.
//!
//! # Example
//!
//! ```ignore
//! use fast_proxy::proxy::{Hooks, Proxy, ProxyOptions};
//!
//! let hooks = Hooks::new().on_before_connect(|target| target.host == "example.com");
//! let mut proxy = Proxy::new(ProxyOptions::default(), hooks);
//! proxy.start().await?;
//! // ...
//! proxy.close().await;
//! ```

use super::body::{ProxyBody, empty_body};
use super::connect::TunnelDispatcher;
use super::error::{ProxyError, ProxyResult};
use super::gateway::Gateway;
use super::hooks::{Hooks, Scheme};
use super::registry::ConnectionRegistry;
use super::terminator::{TerminatorConfig, TerminatorSlot};
use super::tls::CertificateCache;
use crate::ca::{DEFAULT_VALIDITY_DAYS, RootCredential};
use crate::state::TempStore;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Name used in lifecycle log lines.
pub const PROXY_NAME: &str = "Fast-Proxy Server";

/// Default plain listener port.
pub const DEFAULT_HTTP_PORT: u16 = 8888;

/// Default interception terminator port.
pub const DEFAULT_HTTPS_PORT: u16 = 8889;

/// Default upstream dial timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for a proxy instance.
#[derive(Debug, Clone)]
pub struct ProxyOptions {
    /// Root credential for interception. Resolved from the state store (or
    /// the embedded fallback) when absent.
    pub ca: Option<Arc<RootCredential>>,
    /// Plain listener port; 0 picks a free one.
    pub http_port: u16,
    /// Interception terminator port (loopback); 0 picks a free one.
    pub https_port: u16,
    /// Whether [`Proxy::launch`] starts the proxy right away.
    pub auto_start: bool,
    /// Address the plain listener binds.
    pub bind_address: IpAddr,
    /// Upstream dial timeout.
    pub connect_timeout: Duration,
    /// Validity of minted leaf certificates, in days.
    pub cert_validity_days: u32,
    /// Temporary state directory; the system default when absent.
    pub state_dir: Option<PathBuf>,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            ca: None,
            http_port: DEFAULT_HTTP_PORT,
            https_port: DEFAULT_HTTPS_PORT,
            auto_start: false,
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            cert_validity_days: DEFAULT_VALIDITY_DAYS,
            state_dir: None,
        }
    }
}

impl ProxyOptions {
    fn store(&self) -> TempStore {
        self.state_dir
            .as_ref()
            .map(TempStore::new)
            .unwrap_or_default()
    }
}

/// Lifecycle state of a proxy instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyStatus {
    /// Created, never started.
    Idle,
    /// Listening.
    Running,
    /// Closed; may be started again.
    Closed,
}

/// Everything that exists only while the proxy is running.
struct Running {
    addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    listener: JoinHandle<()>,
    registry: Arc<ConnectionRegistry>,
    terminator: Arc<TerminatorSlot>,
}

/// An HTTP/HTTPS forward proxy.
pub struct Proxy {
    options: ProxyOptions,
    hooks: Hooks,
    status: ProxyStatus,
    running: Option<Running>,
}

impl Proxy {
    /// Create an idle proxy.
    pub fn new(options: ProxyOptions, hooks: Hooks) -> Self {
        Self {
            options,
            hooks,
            status: ProxyStatus::Idle,
            running: None,
        }
    }

    /// Create a proxy and start it if `options.auto_start` is set.
    pub async fn launch(options: ProxyOptions, hooks: Hooks) -> ProxyResult<Self> {
        let auto_start = options.auto_start;
        let mut proxy = Self::new(options, hooks);
        if auto_start {
            proxy.start().await?;
        }
        Ok(proxy)
    }

    /// Current lifecycle state.
    pub fn status(&self) -> ProxyStatus {
        self.status
    }

    /// Current options.
    pub fn options(&self) -> &ProxyOptions {
        &self.options
    }

    /// Bound address of the plain listener, while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.addr)
    }

    /// Bound address of the interception terminator, once started.
    pub fn https_addr(&self) -> Option<SocketAddr> {
        self.terminator().map(|t| t.local_addr())
    }

    /// Number of bound listeners.
    pub fn listener_count(&self) -> usize {
        match &self.running {
            Some(running) => 1 + usize::from(running.terminator.get().is_some()),
            None => 0,
        }
    }

    /// Live connections across both registries.
    pub fn connection_count(&self) -> usize {
        let Some(running) = &self.running else {
            return 0;
        };
        running.registry.len() + self.terminator().map_or(0, |t| t.registry().len())
    }

    /// Certificate cache of the running terminator.
    pub fn certificate_cache(&self) -> Option<Arc<CertificateCache>> {
        self.terminator().map(|t| Arc::clone(t.certificate_cache()))
    }

    fn terminator(&self) -> Option<&super::terminator::Terminator> {
        self.running.as_ref()?.terminator.get()
    }

    /// Bind the plain listener and start serving.
    pub async fn start(&mut self) -> ProxyResult<()> {
        if self.status == ProxyStatus::Running {
            debug!("{} already running", PROXY_NAME);
            return Ok(());
        }

        self.hooks.before_start(&mut self.options);

        let addr = SocketAddr::new(self.options.bind_address, self.options.http_port);
        let listener = bind_listener(addr).await?;
        let addr = listener.local_addr()?;

        let hooks = Arc::new(self.hooks.clone());
        let gateway = Arc::new(Gateway::new(
            Arc::clone(&hooks),
            self.options.connect_timeout,
        ));
        let terminator = Arc::new(TerminatorSlot::new(TerminatorConfig {
            port: self.options.https_port,
            ca: self.options.ca.clone(),
            store: self.options.store(),
            validity_days: self.options.cert_validity_days,
            gateway: Arc::clone(&gateway),
        }));
        let dispatcher = Arc::new(TunnelDispatcher::new(
            hooks,
            Arc::clone(&terminator),
            self.options.connect_timeout,
        ));
        let registry = ConnectionRegistry::new("http");
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let ctx = Arc::new(ConnContext {
            gateway,
            dispatcher: Some(dispatcher),
            registry: Arc::clone(&registry),
        });
        let listener = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&registry),
            shutdown_rx,
            move |stream, peer| {
                let ctx = Arc::clone(&ctx);
                async move {
                    if let Err(e) = serve_connection(stream, Scheme::Http, ctx).await {
                        log_connection_error(peer, &e);
                    }
                }
            },
        ));

        self.running = Some(Running {
            addr,
            shutdown_tx,
            listener,
            registry,
            terminator,
        });
        self.status = ProxyStatus::Running;
        info!("{} listening on {}", PROXY_NAME, addr);

        self.hooks.after_start();
        Ok(())
    }

    /// Destroy every connection, unbind both listeners and mark the proxy
    /// closed. In-flight responses are cut off.
    pub async fn close(&mut self) {
        if self.status != ProxyStatus::Running {
            debug!("{} not running, nothing to close", PROXY_NAME);
            return;
        }

        self.hooks.before_close();

        if let Some(running) = self.running.take() {
            let destroyed = running.registry.destroy_all();
            let _ = running.shutdown_tx.send(true);
            if let Err(e) = running.listener.await
                && !e.is_cancelled()
            {
                warn!("Listener task failed: {}", e);
            }
            if let Some(terminator) = running.terminator.get() {
                terminator.shutdown().await;
            }
            debug!(destroyed, "Closed plain listener on {}", running.addr);
        }

        self.hooks.after_close();
        self.status = ProxyStatus::Closed;
        info!("{} closed", PROXY_NAME);
    }

    /// Close, replace the options, merge `hooks` into the registered ones
    /// and start again.
    pub async fn reset(&mut self, options: ProxyOptions, hooks: Option<Hooks>) -> ProxyResult<()> {
        self.close().await;
        self.options = options;
        if let Some(hooks) = hooks {
            self.hooks.merge(hooks);
        }
        self.start().await
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            running.registry.destroy_all();
            running.listener.abort();
        }
    }
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("status", &self.status)
            .field("local_addr", &self.local_addr())
            .field("https_addr", &self.https_addr())
            .finish()
    }
}

/// Per-listener state shared by its connection tasks.
pub(crate) struct ConnContext {
    pub(crate) gateway: Arc<Gateway>,
    /// Present on the plain listener only; the terminator refuses CONNECT.
    pub(crate) dispatcher: Option<Arc<TunnelDispatcher>>,
    pub(crate) registry: Arc<ConnectionRegistry>,
}

impl ConnContext {
    async fn route(&self, req: Request<Incoming>, scheme: Scheme) -> ProxyResult<Response<ProxyBody>> {
        if req.method() == Method::CONNECT {
            return match &self.dispatcher {
                Some(dispatcher) => dispatcher.handle(req, &self.registry).await,
                None => {
                    let mut response = Response::new(empty_body());
                    *response.status_mut() = StatusCode::METHOD_NOT_ALLOWED;
                    Ok(response)
                }
            };
        }
        self.gateway.handle(req, scheme, &self.registry).await
    }
}

/// Bind a listener, reporting an occupied port explicitly.
pub(crate) async fn bind_listener(addr: SocketAddr) -> ProxyResult<TcpListener> {
    TcpListener::bind(addr).await.map_err(|source| {
        if source.kind() == std::io::ErrorKind::AddrInUse {
            error!("{}: port is occupied ({})", PROXY_NAME, addr);
        } else {
            error!("{}: failed to bind {}: {}", PROXY_NAME, addr, source);
        }
        ProxyError::Bind { addr, source }
    })
}

/// Accept connections until `shutdown_rx` fires, spawning `handler` for
/// each one in `registry`. The listener is dropped on return.
pub(crate) async fn accept_loop<F, Fut>(
    listener: TcpListener,
    registry: Arc<ConnectionRegistry>,
    mut shutdown_rx: watch::Receiver<bool>,
    handler: F,
) where
    F: Fn(TcpStream, SocketAddr) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, peer)) => {
                        debug!(registry = registry.name(), %peer, "Accepted connection");
                        if !registry.track(handler(stream, peer)) {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("Failed to accept connection: {}", e);
                    }
                }
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
    debug!(registry = registry.name(), "Listener stopped");
}

/// Serve HTTP/1.1 on one client connection.
pub(crate) async fn serve_connection<I>(
    io: I,
    scheme: Scheme,
    ctx: Arc<ConnContext>,
) -> ProxyResult<()>
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req: Request<Incoming>| {
        let ctx = Arc::clone(&ctx);
        async move { ctx.route(req, scheme).await }
    });

    // Upgrades are needed for CONNECT.
    http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .serve_connection(TokioIo::new(io), service)
        .with_upgrades()
        .await
        .map_err(ProxyError::from)
}

fn log_connection_error(peer: SocketAddr, e: &ProxyError) {
    // Failures inside the service were already logged where they happened.
    match e {
        ProxyError::Http(http) if http.is_user() => debug!(%peer, "Connection closed: {}", e),
        _ if e.is_disconnect() => debug!(%peer, "Connection ended: {}", e),
        _ => warn!(%peer, "Connection error: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ephemeral() -> ProxyOptions {
        ProxyOptions {
            http_port: 0,
            https_port: 0,
            ..ProxyOptions::default()
        }
    }

    #[test]
    fn test_default_options() {
        let options = ProxyOptions::default();
        assert_eq!(options.http_port, 8888);
        assert_eq!(options.https_port, 8889);
        assert!(!options.auto_start);
        assert_eq!(options.connect_timeout, Duration::from_secs(30));
        assert_eq!(options.cert_validity_days, 365);
    }

    #[tokio::test]
    async fn test_new_proxy_is_idle() {
        let proxy = Proxy::launch(ephemeral(), Hooks::new()).await.unwrap();
        assert_eq!(proxy.status(), ProxyStatus::Idle);
        assert_eq!(proxy.listener_count(), 0);
        assert!(proxy.local_addr().is_none());
    }

    #[tokio::test]
    async fn test_auto_start() {
        let options = ProxyOptions {
            auto_start: true,
            ..ephemeral()
        };
        let mut proxy = Proxy::launch(options, Hooks::new()).await.unwrap();
        assert_eq!(proxy.status(), ProxyStatus::Running);
        proxy.close().await;
    }

    #[tokio::test]
    async fn test_lifecycle_hooks_run_in_order() {
        let calls = Arc::new(std::sync::Mutex::new(Vec::new()));
        let log = |name: &'static str| {
            let calls = Arc::clone(&calls);
            move || calls.lock().unwrap().push(name)
        };
        let before_start = Arc::clone(&calls);

        let hooks = Hooks::new()
            .on_before_start(move |options| {
                options.http_port = 0;
                before_start.lock().unwrap().push("before_start");
            })
            .on_after_start(log("after_start"))
            .on_before_close(log("before_close"))
            .on_after_close(log("after_close"));

        let mut proxy = Proxy::new(ProxyOptions::default(), hooks);
        proxy.start().await.unwrap();
        assert_eq!(proxy.options().http_port, 0);
        proxy.close().await;

        assert_eq!(
            *calls.lock().unwrap(),
            vec!["before_start", "after_start", "before_close", "after_close"]
        );
    }

    #[tokio::test]
    async fn test_start_and_close_are_idempotent() {
        let started = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicUsize::new(0));
        let (s, c) = (Arc::clone(&started), Arc::clone(&closed));
        let hooks = Hooks::new()
            .on_after_start(move || {
                s.fetch_add(1, Ordering::SeqCst);
            })
            .on_after_close(move || {
                c.fetch_add(1, Ordering::SeqCst);
            });

        let mut proxy = Proxy::new(ephemeral(), hooks);
        proxy.close().await;
        assert_eq!(proxy.status(), ProxyStatus::Idle);

        proxy.start().await.unwrap();
        let addr = proxy.local_addr();
        proxy.start().await.unwrap();
        assert_eq!(proxy.local_addr(), addr);
        assert_eq!(proxy.listener_count(), 1);
        assert_eq!(started.load(Ordering::SeqCst), 1);

        proxy.close().await;
        proxy.close().await;
        assert_eq!(proxy.status(), ProxyStatus::Closed);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert_eq!(proxy.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_occupied_port_is_a_bind_error() {
        let mut first = Proxy::new(ephemeral(), Hooks::new());
        first.start().await.unwrap();
        let port = first.local_addr().unwrap().port();

        let mut second = Proxy::new(
            ProxyOptions {
                http_port: port,
                ..ephemeral()
            },
            Hooks::new(),
        );
        let err = second.start().await.unwrap_err();
        assert!(matches!(err, ProxyError::Bind { .. }));
        assert_eq!(second.status(), ProxyStatus::Idle);

        first.close().await;
    }
}
