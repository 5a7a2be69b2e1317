//! Error types for certificate authority operations.

use crate::state::StateError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while creating, loading, or using a root credential.
#[derive(Debug, Error)]
pub enum CaError {
    /// Failed to generate a key pair.
    #[error("Failed to generate key pair: {0}")]
    KeyGeneration(String),

    /// Failed to build or self-sign a certificate.
    #[error("Failed to generate certificate: {0}")]
    CertGeneration(String),

    /// Failed to sign a leaf certificate with the root credential.
    #[error("Failed to sign certificate for '{domain}': {message}")]
    Signing {
        /// Domain the leaf was requested for.
        domain: String,
        /// Error message.
        message: String,
    },

    /// Domain name cannot be placed in a Subject Alternative Name.
    #[error("Invalid domain '{0}'")]
    InvalidDomain(String),

    /// PEM input did not contain the expected material.
    #[error("Invalid PEM: {0}")]
    InvalidPem(String),

    /// Private key could not be parsed.
    #[error("Failed to parse private key: {0}")]
    InvalidKey(String),

    /// Failed to read a certificate or key file.
    #[error("Failed to read {path}: {source}")]
    ReadFile {
        /// File that could not be read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to write a certificate or key file.
    #[error("Failed to write {path}: {source}")]
    WriteFile {
        /// File that could not be written.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Persisted root credential could not be read or written.
    #[error("Root credential state error: {0}")]
    State(#[from] StateError),
}
