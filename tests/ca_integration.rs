use std::sync::Arc;

use fast_proxy::ca::{
    CaInfo, RootCredential, create_ca, create_cert_in, persist_root, resolve_root,
};
use fast_proxy::state::{CA_CERT_KEY, TempStore};
use rustls::client::WebPkiServerVerifier;
use rustls::client::danger::ServerCertVerifier;
use rustls::pki_types::{ServerName, UnixTime};
use tempfile::tempdir;

fn verify(root: &RootCredential, chain: &[rustls::pki_types::CertificateDer<'static>], host: &str) -> bool {
    let mut roots = rustls::RootCertStore::empty();
    roots.add(root.cert_der().clone()).unwrap();
    let verifier = WebPkiServerVerifier::builder(Arc::new(roots)).build().unwrap();
    let name = ServerName::try_from(host.to_string()).unwrap();

    verifier
        .verify_server_cert(&chain[0], &chain[1..], &name, &[], UnixTime::now())
        .is_ok()
}

#[test]
fn test_leaf_chains_to_its_root() {
    let root = create_ca(&CaInfo::default()).expect("Failed to create CA");
    let leaf = root.issue("api.example.com", 30).expect("Failed to issue leaf");

    assert_eq!(leaf.domain(), "api.example.com");
    assert!(verify(&root, &leaf.cert_chain(), "api.example.com"));
    assert!(!verify(&root, &leaf.cert_chain(), "other.example.com"));
}

#[test]
fn test_leaf_rejected_by_foreign_root() {
    let root = create_ca(&CaInfo::default()).unwrap();
    let stranger = create_ca(&CaInfo::default()).unwrap();
    let leaf = root.issue("example.com", 30).unwrap();

    assert!(!verify(&stranger, &leaf.cert_chain(), "example.com"));
}

#[test]
fn test_saved_root_signs_after_reload() {
    let dir = tempdir().unwrap();
    let cert_path = dir.path().join("nested/ca.pem");
    let key_path = dir.path().join("nested/ca.key");

    let original = create_ca(&CaInfo {
        organization: "Fast Proxy Test".to_string(),
        ..CaInfo::default()
    })
    .unwrap();
    original.save(&cert_path, &key_path).unwrap();

    let reloaded = RootCredential::load(&cert_path, &key_path).unwrap();
    assert_eq!(reloaded.cert_pem(), original.cert_pem());

    let leaf = reloaded.issue("reload.test", 7).unwrap();
    assert!(verify(&original, &leaf.cert_chain(), "reload.test"));
}

#[test]
fn test_persisted_root_is_resolved_from_store() {
    let dir = tempdir().unwrap();
    let store = TempStore::new(dir.path());
    let root = create_ca(&CaInfo::default()).unwrap();

    persist_root(&store, &root).unwrap();
    assert!(store.exists(CA_CERT_KEY));

    let resolved = resolve_root(&store).unwrap();
    assert_eq!(resolved.cert_pem(), root.cert_pem());

    let leaf = create_cert_in(&store, "stored.test", None, 30).unwrap();
    assert!(verify(&root, &leaf.cert_chain(), "stored.test"));
}

#[test]
fn test_empty_store_resolves_embedded_root() {
    let dir = tempdir().unwrap();
    let store = TempStore::new(dir.path());

    let resolved = resolve_root(&store).unwrap();
    assert_eq!(resolved.cert_pem(), fast_proxy::ca::default_ca_cert_pem());
    assert!(create_cert_in(&store, "fallback.test", None, 30).is_ok());
}
