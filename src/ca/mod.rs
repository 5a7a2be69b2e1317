//! Certificate authority for TLS interception.
//!
//! This module synthesizes root credentials and mints per-domain leaf
//! certificates signed by them. Everything is exchanged as PEM.
//!
//! # Example
//!
//! ```ignore
//! use fast_proxy::ca::{create_ca, create_cert, CaInfo, DEFAULT_VALIDITY_DAYS};
//!
//! let root = create_ca(&CaInfo::default())?;
//! root.save(Path::new("ca.pem"), Path::new("ca.key"))?;
//!
//! let leaf = create_cert("example.com", Some(&root), DEFAULT_VALIDITY_DAYS)?;
//! println!("{}", leaf.cert_pem());
//! ```

mod authority;
mod error;
mod fallback;

pub use authority::{
    CaInfo, DEFAULT_VALIDITY_DAYS, LeafCertificate, RootCredential, create_ca, create_cert,
    create_cert_in, load_persisted_root, persist_root, resolve_root,
};
pub use error::CaError;
pub use fallback::{default_ca_cert_pem, get_default_ca};
