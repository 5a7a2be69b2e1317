//! Embedded fallback root credential.
//!
//! **Insecure.** The key below ships inside every build, so anyone holding
//! a copy of this crate can impersonate any site to a client that trusts
//! this root. It exists so the proxy can intercept with zero configuration
//! during local development. Supply your own root credential (see
//! [`create_ca`](super::create_ca)) for anything else.
//!
//! The certificate carries `CN=FXTop, C=CN, ST=GuangDong, L=ShenZhen,
//! O=FXTop` and expired on 2021-11-28. Clients that check the validity of
//! their trust anchors will reject chains built on it.

use super::authority::RootCredential;
use super::error::CaError;

const DEFAULT_CA_CERT_PEM: &str = include_str!("default_ca.crt");
const DEFAULT_CA_KEY_PEM: &str = include_str!("default_ca.key");

/// Return the embedded fallback root credential.
pub fn get_default_ca() -> Result<RootCredential, CaError> {
    RootCredential::from_pem(DEFAULT_CA_CERT_PEM, DEFAULT_CA_KEY_PEM)
}

/// PEM certificate of the embedded fallback root.
pub fn default_ca_cert_pem() -> &'static str {
    DEFAULT_CA_CERT_PEM
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_ca_parses() {
        let root = get_default_ca().unwrap();
        assert_eq!(root.cert_pem(), default_ca_cert_pem());
    }

    #[test]
    fn test_default_ca_issues_leaf() {
        let root = get_default_ca().unwrap();
        let leaf = root.issue("fallback.test", 1).unwrap();
        assert_eq!(leaf.domain(), "fallback.test");
    }

    #[test]
    fn test_default_ca_is_stable() {
        let a = get_default_ca().unwrap();
        let b = get_default_ca().unwrap();
        assert_eq!(a.cert_der(), b.cert_der());
    }
}
