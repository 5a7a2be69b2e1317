//! Error types for operating system integration.

use thiserror::Error;

/// Failures of system proxy and trust store operations.
///
/// Every variant carries a stable numeric code (see [`SysError::code`]) so
/// callers can branch on the outcome without matching on messages.
#[derive(Debug, Error)]
pub enum SysError {
    /// The current proxy settings could not be read.
    #[error("Failed to read the current proxy settings: {0}")]
    ReadConfig(String),

    /// New proxy settings could not be applied.
    #[error("Failed to apply proxy settings: {0}")]
    ApplyConfig(String),

    /// Settings were written but the system did not pick them up.
    #[error("Proxy settings did not take effect: {0}")]
    Refresh(String),

    /// No adapter exists for this operating system.
    #[error("No system integration for '{0}'")]
    UnsupportedOs(String),

    /// The root certificate could not be imported.
    #[error("Failed to import root certificate: {0}")]
    ImportCert(String),
}

impl SysError {
    /// Numeric code of this failure.
    pub fn code(&self) -> u16 {
        match self {
            SysError::ReadConfig(_) => 1,
            SysError::ApplyConfig(_) => 2,
            SysError::Refresh(_) => 3,
            SysError::UnsupportedOs(_) => 10,
            SysError::ImportCert(_) => 21,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(SysError::ReadConfig(String::new()).code(), 1);
        assert_eq!(SysError::ApplyConfig(String::new()).code(), 2);
        assert_eq!(SysError::Refresh(String::new()).code(), 3);
        assert_eq!(SysError::UnsupportedOs("plan9".into()).code(), 10);
        assert_eq!(SysError::ImportCert(String::new()).code(), 21);
    }

    #[test]
    fn test_unsupported_display() {
        let err = SysError::UnsupportedOs("freebsd".into());
        assert!(err.to_string().contains("freebsd"));
    }
}
