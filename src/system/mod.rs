//! Operating system integration.
//!
//! Installs the proxy as the system-wide HTTP(S) proxy and trusts its root
//! certificate. All of it is shell-out logic behind [`CommandRunner`]; the
//! platform adapter is chosen from the detected OS:
//!
//! | OS      | Proxy settings                         | Trust store                   |
//! |---------|----------------------------------------|-------------------------------|
//! | Windows | `reg` on the WinINet key + refresh     | elevated `certutil`           |
//! | macOS   | `networksetup` on the `Wi-Fi` service  | `security add-trusted-cert`   |
//! | other   | unsupported (code 10)                  | unsupported (code 10)         |
//!
//! Results are returned as [`SysResult`] values with numeric codes rather
//! than errors, so callers (and the CLI's JSON output) can branch on them.

mod error;
pub mod macos;
pub mod runner;
pub mod windows;

pub use error::SysError;
pub use runner::{CommandRunner, SystemCommandRunner};

use crate::ca::default_ca_cert_pem;
use crate::state::{CA_CERT_KEY, PROXY_SNAPSHOT_KEY, TempStore};
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use windows::RegSnapshot;

/// Outcome of a system integration call: `error` is 0 on success.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SysResult {
    /// 0 on success, otherwise a [`SysError::code`].
    pub error: u16,
    /// Operation specific payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Failure description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl SysResult {
    /// Successful result carrying `data`.
    pub fn ok(data: Value) -> Self {
        Self {
            error: 0,
            data: Some(data),
            message: None,
        }
    }

    /// Whether the call succeeded.
    pub fn is_ok(&self) -> bool {
        self.error == 0
    }
}

impl From<Result<Value, SysError>> for SysResult {
    fn from(result: Result<Value, SysError>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(e) => Self {
                error: e.code(),
                data: None,
                message: Some(e.to_string()),
            },
        }
    }
}

/// Human name of the running OS: `Windows`, `MacOS`, `Linux`, or empty.
pub fn get_system_name() -> &'static str {
    match std::env::consts::OS {
        "windows" => "Windows",
        "macos" => "MacOS",
        "linux" => "Linux",
        _ => "",
    }
}

/// Platform adapter for proxy settings and the trust store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SystemProxyConfigurator {
    /// WinINet registry settings.
    Windows,
    /// `networksetup` on a network service.
    MacOs {
        /// Network service name, e.g. `Wi-Fi`.
        service: String,
    },
    /// Anything else; carries the OS name.
    Unsupported(String),
}

impl SystemProxyConfigurator {
    /// Adapter for the running OS.
    pub fn detect() -> Self {
        Self::for_os(std::env::consts::OS)
    }

    /// Adapter for an OS name as reported by `std::env::consts::OS`.
    pub fn for_os(os: &str) -> Self {
        match os {
            "windows" => Self::Windows,
            "macos" => Self::MacOs {
                service: macos::DEFAULT_NETWORK_SERVICE.to_string(),
            },
            other => Self::Unsupported(other.to_string()),
        }
    }

    fn unsupported(&self) -> SysError {
        match self {
            Self::Unsupported(os) => SysError::UnsupportedOs(os.clone()),
            other => SysError::UnsupportedOs(format!("{:?}", other)),
        }
    }

    /// Route HTTP (and HTTPS, with `proxy_https`) through `127.0.0.1:port`.
    ///
    /// On Windows the data is the snapshot of the previous settings.
    pub fn start_sys_proxy(
        &self,
        runner: &dyn CommandRunner,
        port: u16,
        proxy_https: bool,
    ) -> Result<Value, SysError> {
        match self {
            Self::Windows => {
                let previous = windows::start_sys_proxy(runner, port, proxy_https)?;
                to_data(&previous).map_err(SysError::ReadConfig)
            }
            Self::MacOs { service } => {
                macos::start_sys_proxy(runner, service, port, proxy_https)?;
                Ok(Value::Object(Default::default()))
            }
            Self::Unsupported(_) => Err(self.unsupported()),
        }
    }

    /// Undo [`start_sys_proxy`](Self::start_sys_proxy), restoring `saved`
    /// settings where the platform keeps them.
    pub fn stop_sys_proxy(
        &self,
        runner: &dyn CommandRunner,
        saved: Option<RegSnapshot>,
    ) -> Result<Value, SysError> {
        match self {
            Self::Windows => {
                let written = windows::stop_sys_proxy(runner, saved)?;
                to_data(&written).map_err(SysError::ApplyConfig)
            }
            Self::MacOs { service } => {
                macos::stop_sys_proxy(runner, service)?;
                Ok(Value::Object(Default::default()))
            }
            Self::Unsupported(_) => Err(self.unsupported()),
        }
    }

    /// Import the PEM certificate at `path` into the trust store.
    pub fn import_root_cert(&self, runner: &dyn CommandRunner, path: &Path) -> bool {
        match self {
            Self::Windows => windows::import_root_cert(runner, path),
            Self::MacOs { .. } => macos::import_root_cert(runner, path),
            Self::Unsupported(_) => false,
        }
    }
}

/// System integration bound to an adapter, a command runner and the
/// temporary state store.
pub struct SystemIntegration {
    configurator: SystemProxyConfigurator,
    runner: Box<dyn CommandRunner>,
    store: TempStore,
}

impl SystemIntegration {
    /// Integration for the running OS, shelling out for real.
    pub fn detect() -> Self {
        Self::new(
            SystemProxyConfigurator::detect(),
            Box::new(SystemCommandRunner),
            TempStore::default_location(),
        )
    }

    /// Integration with explicit parts.
    pub fn new(
        configurator: SystemProxyConfigurator,
        runner: Box<dyn CommandRunner>,
        store: TempStore,
    ) -> Self {
        Self {
            configurator,
            runner,
            store,
        }
    }

    /// The selected adapter.
    pub fn configurator(&self) -> &SystemProxyConfigurator {
        &self.configurator
    }

    /// Trust the root certificate at `path`.
    ///
    /// Without a path the certificate in the state store is used, seeding it
    /// with the embedded default root first if absent.
    pub fn trust_root_cert(&self, path: Option<&Path>) -> SysResult {
        self.try_trust_root_cert(path).into()
    }

    fn try_trust_root_cert(&self, path: Option<&Path>) -> Result<Value, SysError> {
        let target: PathBuf = match path {
            Some(path) => path.to_path_buf(),
            None => {
                if self
                    .store
                    .write_if_absent(CA_CERT_KEY, default_ca_cert_pem())
                    .map_err(|e| SysError::ImportCert(e.to_string()))?
                {
                    debug!("Seeded {} with the default root certificate", CA_CERT_KEY);
                }
                self.store.path_of(CA_CERT_KEY)
            }
        };

        if let SystemProxyConfigurator::Unsupported(_) = self.configurator {
            return Err(self.configurator.unsupported());
        }

        if self.configurator.import_root_cert(self.runner.as_ref(), &target) {
            Ok(Value::String(target.display().to_string()))
        } else {
            Err(SysError::ImportCert(format!(
                "could not import {}",
                target.display()
            )))
        }
    }

    /// Install `127.0.0.1:port` as the system proxy.
    ///
    /// The first snapshot of the previous settings is kept; later calls
    /// never overwrite it.
    pub fn start_sys_proxy(&self, port: u16, proxy_https: bool) -> SysResult {
        let result = self
            .configurator
            .start_sys_proxy(self.runner.as_ref(), port, proxy_https);

        if let (SystemProxyConfigurator::Windows, Ok(previous)) = (&self.configurator, &result) {
            match self.store.write_json_if_absent(PROXY_SNAPSHOT_KEY, previous) {
                Ok(true) => debug!("Saved previous proxy settings"),
                Ok(false) => debug!("Keeping existing proxy settings snapshot"),
                Err(e) => warn!("Failed to save previous proxy settings: {}", e),
            }
        }
        result.into()
    }

    /// Remove the system proxy, restoring the saved settings if any.
    pub fn stop_sys_proxy(&self) -> SysResult {
        let saved = match self.configurator {
            SystemProxyConfigurator::Windows => self
                .store
                .read_json::<RegSnapshot>(PROXY_SNAPSHOT_KEY)
                .unwrap_or_else(|e| {
                    warn!("Ignoring unreadable proxy settings snapshot: {}", e);
                    None
                }),
            _ => None,
        };
        let had_snapshot = saved.is_some();

        let result = self.configurator.stop_sys_proxy(self.runner.as_ref(), saved);
        if result.is_ok()
            && had_snapshot
            && let Err(e) = self.store.delete(PROXY_SNAPSHOT_KEY)
        {
            warn!("Failed to delete proxy settings snapshot: {}", e);
        }
        result.into()
    }
}

impl std::fmt::Debug for SystemIntegration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemIntegration")
            .field("configurator", &self.configurator)
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

/// Encode platform settings as result data.
fn to_data<T: Serialize>(value: &T) -> Result<Value, String> {
    serde_json::to_value(value).map_err(|e| {
        warn!("Failed to encode proxy settings: {}", e);
        format!("cannot encode proxy settings: {}", e)
    })
}

/// Trust a root certificate on this machine. See
/// [`SystemIntegration::trust_root_cert`].
pub fn trust_root_cert(path: Option<&Path>) -> SysResult {
    SystemIntegration::detect().trust_root_cert(path)
}

/// Install `127.0.0.1:port` as this machine's proxy.
pub fn start_sys_proxy(port: u16, proxy_https: bool) -> SysResult {
    SystemIntegration::detect().start_sys_proxy(port, proxy_https)
}

/// Remove this machine's proxy settings.
pub fn stop_sys_proxy() -> SysResult {
    SystemIntegration::detect().stop_sys_proxy()
}
