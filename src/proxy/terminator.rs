//! Interception terminator.
//!
//! A loopback TLS listener that picks the certificate to present from the
//! SNI name in each ClientHello. Intercepted tunnels are dialed into it by
//! the tunnel dispatcher; the decrypted HTTP/1.1 stream is then served by
//! the request gateway.
//!
//! The terminator is started lazily, on the first intercepted CONNECT, and
//! at most once per running proxy.

use super::error::{ProxyError, ProxyResult};
use super::gateway::Gateway;
use super::hooks::Scheme;
use super::registry::ConnectionRegistry;
use super::server::{ConnContext, accept_loop, bind_listener, serve_connection};
use super::tls::CertificateCache;
use crate::ca::{RootCredential, resolve_root};
use crate::state::TempStore;
use rustls::server::Acceptor;
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tokio::net::TcpStream;
use tokio::sync::{OnceCell, watch};
use tokio::task::JoinHandle;
use tokio_rustls::LazyConfigAcceptor;
use tracing::{debug, info};

/// Settings the terminator is started with.
#[derive(Clone)]
pub struct TerminatorConfig {
    /// Loopback port to bind; 0 picks a free one.
    pub port: u16,
    /// Root to sign leaves with; resolved from `store` when absent.
    pub ca: Option<Arc<RootCredential>>,
    /// Store holding a persisted root credential.
    pub store: TempStore,
    /// Validity of minted leaves, in days.
    pub validity_days: u32,
    /// Gateway serving decrypted requests.
    pub gateway: Arc<Gateway>,
}

/// A running terminator.
pub struct Terminator {
    addr: SocketAddr,
    cache: Arc<CertificateCache>,
    registry: Arc<ConnectionRegistry>,
    shutdown_tx: watch::Sender<bool>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl Terminator {
    async fn start(config: &TerminatorConfig) -> ProxyResult<Self> {
        let root = match &config.ca {
            Some(ca) => Arc::clone(ca),
            None => {
                let store = config.store.clone();
                let root = tokio::task::spawn_blocking(move || resolve_root(&store))
                    .await
                    .map_err(|e| ProxyError::Tls(format!("Root resolution failed: {}", e)))??;
                Arc::new(root)
            }
        };

        let listener =
            bind_listener(SocketAddr::from((Ipv4Addr::LOCALHOST, config.port))).await?;
        let addr = listener.local_addr()?;

        let cache = Arc::new(CertificateCache::new(root, config.validity_days));
        let registry = ConnectionRegistry::new("https");
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let ctx = Arc::new(ConnContext {
            gateway: Arc::clone(&config.gateway),
            dispatcher: None,
            registry: Arc::clone(&registry),
        });
        let handler_cache = Arc::clone(&cache);
        let task = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&registry),
            shutdown_rx,
            move |stream, peer| {
                let cache = Arc::clone(&handler_cache);
                let ctx = Arc::clone(&ctx);
                async move {
                    if let Err(e) = terminate(stream, cache, ctx).await {
                        debug!(%peer, "Intercepted connection ended: {}", e);
                    }
                }
            },
        ));

        info!("Interception terminator listening on {}", addr);

        Ok(Self {
            addr,
            cache,
            registry,
            shutdown_tx,
            listener: Mutex::new(Some(task)),
        })
    }

    /// Bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Certificates minted by this terminator.
    pub fn certificate_cache(&self) -> &Arc<CertificateCache> {
        &self.cache
    }

    /// Live decrypted connections.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Destroy every connection and stop accepting, waiting until the port
    /// is released.
    pub async fn shutdown(&self) {
        self.registry.destroy_all();
        let _ = self.shutdown_tx.send(true);

        let task = self.listener.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.cache.clear();
        debug!("Interception terminator on {} stopped", self.addr);
    }
}

impl Drop for Terminator {
    fn drop(&mut self) {
        self.registry.destroy_all();
        if let Some(task) = self.listener.get_mut().unwrap_or_else(|p| p.into_inner()).take() {
            task.abort();
        }
    }
}

/// Handshake with the client, choosing the certificate by SNI, then serve
/// the decrypted stream.
async fn terminate(
    stream: TcpStream,
    cache: Arc<CertificateCache>,
    ctx: Arc<ConnContext>,
) -> ProxyResult<()> {
    let start = LazyConfigAcceptor::new(Acceptor::default(), stream).await?;
    let domain = start
        .client_hello()
        .server_name()
        .map(str::to_string)
        .ok_or(ProxyError::MissingSni)?;

    let cached = cache.resolve(&domain).await?;
    let tls = start.into_stream(cached.server_config()).await?;
    debug!("TLS established with client for {}", domain);

    serve_connection(tls, Scheme::Https, ctx).await
}

/// Future returned by [`TerminatorSlot::ensure_started`].
pub type StartFuture<'a> = Pin<Box<dyn Future<Output = ProxyResult<SocketAddr>> + Send + 'a>>;

/// Lazily started terminator, owned by one running proxy.
pub struct TerminatorSlot {
    config: TerminatorConfig,
    cell: OnceCell<Terminator>,
}

impl TerminatorSlot {
    /// Empty slot; nothing is bound until [`ensure_started`](Self::ensure_started).
    pub fn new(config: TerminatorConfig) -> Self {
        Self {
            config,
            cell: OnceCell::new(),
        }
    }

    /// Start the terminator if needed and return its address. Concurrent
    /// callers share one start.
    ///
    /// Boxed: the terminator's own connections reach this through the
    /// tunnel dispatcher, and the `Send` check of the spawned accept loop
    /// cannot see through that cycle of opaque futures.
    pub fn ensure_started(&self) -> StartFuture<'_> {
        Box::pin(async move {
            self.cell
                .get_or_try_init(|| Terminator::start(&self.config))
                .await
                .map(Terminator::local_addr)
        })
    }

    /// The terminator, if started.
    pub fn get(&self) -> Option<&Terminator> {
        self.cell.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca::{CaInfo, create_ca};
    use crate::proxy::hooks::Hooks;
    use std::time::Duration;

    fn slot(ca: Arc<RootCredential>) -> TerminatorSlot {
        TerminatorSlot::new(TerminatorConfig {
            port: 0,
            ca: Some(ca),
            store: TempStore::default_location(),
            validity_days: 30,
            gateway: Arc::new(Gateway::new(Arc::new(Hooks::new()), Duration::from_secs(5))),
        })
    }

    #[tokio::test]
    async fn test_start_can_run_on_spawned_task() {
        let slot = Arc::new(slot(Arc::new(create_ca(&CaInfo::default()).unwrap())));
        let shared = Arc::clone(&slot);
        let addr = tokio::spawn(async move { shared.ensure_started().await })
            .await
            .unwrap()
            .unwrap();

        assert_eq!(slot.ensure_started().await.unwrap(), addr);
        slot.get().unwrap().shutdown().await;
    }

    #[tokio::test]
    async fn test_slot_starts_once() {
        let slot = slot(Arc::new(create_ca(&CaInfo::default()).unwrap()));
        assert!(slot.get().is_none());

        let first = slot.ensure_started().await.unwrap();
        let second = slot.ensure_started().await.unwrap();
        assert_eq!(first, second);
        assert!(first.ip().is_loopback());
        assert_ne!(first.port(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_releases_port() {
        let slot = slot(Arc::new(create_ca(&CaInfo::default()).unwrap()));
        let addr = slot.ensure_started().await.unwrap();

        slot.get().unwrap().shutdown().await;
        assert!(slot.get().unwrap().registry().is_closed());

        // The port can be bound again once the listener task has exited.
        let rebound = tokio::net::TcpListener::bind(addr).await;
        assert!(rebound.is_ok());
    }

    #[tokio::test]
    async fn test_missing_sni_fails_handshake() {
        let slot = slot(Arc::new(create_ca(&CaInfo::default()).unwrap()));
        let addr = slot.ensure_started().await.unwrap();

        let root = rustls::RootCertStore::empty();
        let config = rustls::ClientConfig::builder()
            .with_root_certificates(root)
            .with_no_client_auth();
        let connector = tokio_rustls::TlsConnector::from(Arc::new(config));
        let stream = TcpStream::connect(addr).await.unwrap();

        // An IP server name carries no SNI.
        let name = rustls_pki_types::ServerName::from(std::net::IpAddr::from(Ipv4Addr::LOCALHOST));
        assert!(connector.connect(name, stream).await.is_err());
        assert!(slot.get().unwrap().certificate_cache().is_empty());
    }
}
