//! TLS contexts for interception and upstream calls.
//!
//! This module provides:
//! - A per-domain certificate cache with single-flight issuance
//! - Server contexts for the interception terminator (proxy as server)
//! - The TLS connector for upstream connections (proxy as client)
//!
//! # Critical ALPN Note
//!
//! We **must** force HTTP/1.1 via ALPN on both sides. The request gateway
//! speaks HTTP/1.1 only; if a client negotiated H2 with the terminator the
//! decrypted stream would be unreadable.
//!
//! # Example
//!
//! ```ignore
//! use fast_proxy::proxy::tls::CertificateCache;
//! use std::sync::Arc;
//!
//! let cache = CertificateCache::new(Arc::new(root), 365);
//! let cached = cache.resolve("example.com").await?;
//! let acceptor = tokio_rustls::TlsAcceptor::from(cached.server_config());
//! ```

use super::error::{ProxyError, ProxyResult};
use crate::ca::{LeafCertificate, RootCredential};
use rustls::{ClientConfig, ServerConfig};
use rustls_pki_types::ServerName;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;
use tokio_rustls::TlsConnector;
use tracing::{debug, trace, warn};

const ALPN_HTTP1: &[u8] = b"http/1.1";

/// A minted leaf certificate and the server context built from it.
pub struct CachedCertificate {
    leaf: LeafCertificate,
    server_config: Arc<ServerConfig>,
}

impl CachedCertificate {
    fn build(leaf: LeafCertificate) -> ProxyResult<Self> {
        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(leaf.cert_chain(), leaf.private_key())?;
        config.alpn_protocols = vec![ALPN_HTTP1.to_vec()];

        Ok(Self {
            leaf,
            server_config: Arc::new(config),
        })
    }

    /// The leaf certificate.
    pub fn leaf(&self) -> &LeafCertificate {
        &self.leaf
    }

    /// Server context presenting the leaf.
    pub fn server_config(&self) -> Arc<ServerConfig> {
        Arc::clone(&self.server_config)
    }
}

impl std::fmt::Debug for CachedCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedCertificate")
            .field("domain", &self.leaf.domain())
            .finish()
    }
}

type Slot = Arc<OnceCell<Arc<CachedCertificate>>>;

/// Certificate cache for TLS interception.
///
/// Keys are lowercased domains. Each key owns a once-cell: the first
/// handshake for an unseen domain runs issuance, every concurrent handshake
/// for the same domain awaits that same result. A failed issuance leaves the
/// cell empty so the next handshake retries.
pub struct CertificateCache {
    slots: Mutex<HashMap<String, Slot>>,
    ca: Arc<RootCredential>,
    validity_days: u32,
    issued: AtomicUsize,
}

impl CertificateCache {
    /// Create an empty cache signing with `ca`.
    pub fn new(ca: Arc<RootCredential>, validity_days: u32) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            ca,
            validity_days,
            issued: AtomicUsize::new(0),
        }
    }

    /// Root credential leaves are signed with.
    pub fn root(&self) -> &Arc<RootCredential> {
        &self.ca
    }

    fn slot(&self, domain: &str) -> Slot {
        let mut slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
        Arc::clone(slots.entry(domain.to_string()).or_default())
    }

    /// Get the cached certificate for `domain`, issuing it on first use.
    pub async fn resolve(&self, domain: &str) -> ProxyResult<Arc<CachedCertificate>> {
        let key = normalize(domain);
        let slot = self.slot(&key);

        if let Some(cached) = slot.get() {
            trace!("Certificate cache hit for {}", key);
            return Ok(Arc::clone(cached));
        }

        let cached = slot
            .get_or_try_init(|| async {
                debug!("Generating certificate for {}", key);
                let ca = Arc::clone(&self.ca);
                let domain = key.clone();
                let days = self.validity_days;

                // Key generation and signing are CPU bound.
                let leaf = tokio::task::spawn_blocking(move || ca.issue(&domain, days))
                    .await
                    .map_err(|e| ProxyError::Tls(format!("Certificate task failed: {}", e)))??;
                let cached = CachedCertificate::build(leaf)?;
                self.issued.fetch_add(1, Ordering::SeqCst);
                Ok::<_, ProxyError>(Arc::new(cached))
            })
            .await
            .inspect_err(|e| warn!("Failed to issue certificate for {}: {}", key, e))?;

        Ok(Arc::clone(cached))
    }

    /// Cached certificate for `domain`, without issuing.
    pub fn get(&self, domain: &str) -> Option<Arc<CachedCertificate>> {
        let slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
        slots.get(&normalize(domain))?.get().cloned()
    }

    /// Number of domains with a cached certificate.
    pub fn len(&self) -> usize {
        let slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
        slots.values().filter(|slot| slot.initialized()).count()
    }

    /// Check if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// How many leaf certificates this cache has issued in total.
    pub fn issued_count(&self) -> usize {
        self.issued.load(Ordering::SeqCst)
    }

    /// Drop every cached certificate.
    pub fn clear(&self) {
        self.slots
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clear();
        debug!("Certificate cache cleared");
    }
}

impl std::fmt::Debug for CertificateCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateCache")
            .field("len", &self.len())
            .field("issued", &self.issued_count())
            .finish()
    }
}

fn normalize(domain: &str) -> String {
    domain.trim_end_matches('.').to_ascii_lowercase()
}

/// Create a TLS connector for upstream connections.
///
/// The proxy acts as a client here, verifying the upstream server's
/// certificate against the system root CAs.
pub fn create_tls_connector() -> ProxyResult<TlsConnector> {
    let mut root_store = rustls::RootCertStore::empty();

    let native_certs = rustls_native_certs::load_native_certs();

    // Log any errors but continue with successfully loaded certs
    for err in native_certs.errors {
        debug!("Warning loading native cert: {}", err);
    }

    for cert in native_certs.certs {
        if let Err(e) = root_store.add(cert) {
            debug!("Warning adding cert to store: {}", e);
        }
    }

    if root_store.is_empty() {
        return Err(ProxyError::Tls("No system root certificates found".into()));
    }

    debug!("Loaded {} root certificates", root_store.len());

    let mut config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    config.alpn_protocols = vec![ALPN_HTTP1.to_vec()];

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Convert a domain string to a ServerName for TLS connection.
pub fn domain_to_server_name(domain: &str) -> ProxyResult<ServerName<'static>> {
    ServerName::try_from(domain.to_string())
        .map_err(|_| ProxyError::Tls(format!("Invalid server name: {}", domain)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca::{CaInfo, create_ca};

    fn cache() -> CertificateCache {
        let root = create_ca(&CaInfo::default()).unwrap();
        CertificateCache::new(Arc::new(root), 30)
    }

    #[tokio::test]
    async fn test_certificate_generation_and_caching() {
        let cache = cache();
        assert!(cache.is_empty());

        let first = cache.resolve("example.com").await.unwrap();
        let second = cache.resolve("example.com").await.unwrap();

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.issued_count(), 1);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.leaf().domain(), "example.com");
    }

    #[tokio::test]
    async fn test_certificate_cache_case_insensitive() {
        let cache = cache();

        let lower = cache.resolve("example.com").await.unwrap();
        let upper = cache.resolve("EXAMPLE.COM.").await.unwrap();

        assert!(Arc::ptr_eq(&lower, &upper));
        assert!(cache.get("Example.Com").is_some());
    }

    #[tokio::test]
    async fn test_concurrent_resolves_issue_once() {
        let cache = Arc::new(cache());

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let cache = Arc::clone(&cache);
                tokio::spawn(async move { cache.resolve("burst.example.com").await.unwrap() })
            })
            .collect();

        let mut results = Vec::new();
        for task in tasks {
            results.push(task.await.unwrap());
        }

        assert_eq!(cache.issued_count(), 1);
        assert!(results.iter().all(|c| Arc::ptr_eq(c, &results[0])));
    }

    #[tokio::test]
    async fn test_failed_issuance_is_not_cached() {
        let cache = cache();

        assert!(cache.resolve("").await.is_err());
        assert!(cache.is_empty());
        assert_eq!(cache.issued_count(), 0);
    }

    #[tokio::test]
    async fn test_certificate_cache_clear() {
        let cache = cache();
        cache.resolve("example.com").await.unwrap();
        cache.resolve("test.com").await.unwrap();
        assert_eq!(cache.len(), 2);

        cache.clear();
        assert!(cache.is_empty());
        assert!(cache.get("example.com").is_none());
    }

    #[tokio::test]
    async fn test_server_config_forces_http1() {
        let cached = cache().resolve("example.com").await.unwrap();
        assert_eq!(cached.server_config().alpn_protocols, vec![b"http/1.1".to_vec()]);
    }

    #[test]
    fn test_domain_to_server_name() {
        assert!(domain_to_server_name("example.com").is_ok());
        assert!(domain_to_server_name("127.0.0.1").is_ok());
        assert!(domain_to_server_name("").is_err());
    }
}
