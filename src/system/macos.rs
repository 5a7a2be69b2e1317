//! macOS adapter: `networksetup` and the login keychain.

use super::SysError;
use super::runner::CommandRunner;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Network service whose proxy settings are changed.
pub const DEFAULT_NETWORK_SERVICE: &str = "Wi-Fi";

/// Point the web proxy (and the secure web proxy, with `proxy_https`) of
/// `service` at `127.0.0.1:port`.
pub fn start_sys_proxy(
    runner: &dyn CommandRunner,
    service: &str,
    port: u16,
    proxy_https: bool,
) -> Result<(), SysError> {
    let port = port.to_string();
    runner
        .run("networksetup", &["-setwebproxy", service, "127.0.0.1", &port])
        .map_err(SysError::ApplyConfig)?;
    if proxy_https {
        runner
            .run("networksetup", &["-setsecurewebproxy", service, "127.0.0.1", &port])
            .map_err(SysError::ApplyConfig)?;
    }
    info!("System proxy for {} set to 127.0.0.1:{}", service, port);
    Ok(())
}

/// Turn both web proxies of `service` off.
pub fn stop_sys_proxy(runner: &dyn CommandRunner, service: &str) -> Result<(), SysError> {
    for flag in ["-setwebproxystate", "-setsecurewebproxystate"] {
        runner
            .run("networksetup", &[flag, service, "off"])
            .map_err(SysError::ApplyConfig)?;
    }
    info!("System proxy for {} turned off", service);
    Ok(())
}

/// Trust `path` in the user's login keychain.
pub fn import_root_cert(runner: &dyn CommandRunner, path: &Path) -> bool {
    let keychain = login_keychain();
    let keychain = keychain.to_string_lossy();
    let cert = path.to_string_lossy();

    match runner.run("security", &["add-trusted-cert", "-k", &keychain, &cert]) {
        Ok(_) => true,
        Err(e) => {
            debug!("security add-trusted-cert failed: {}", e);
            false
        }
    }
}

fn login_keychain() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("~"))
        .join("Library/Keychains/login.keychain")
}
