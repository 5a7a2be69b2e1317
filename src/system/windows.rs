//! Windows adapter: WinINet settings in the current user's registry hive.

use super::SysError;
use super::runner::CommandRunner;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

/// Registry key holding the WinINet proxy settings.
pub const REG_INET_KEY: &str =
    r"HKCU\Software\Microsoft\Windows\CurrentVersion\Internet Settings";

/// Values the adapter writes, and therefore snapshots.
const PROXY_VALUES: [&str; 5] = [
    "ProxyEnable",
    "ProxyOverride",
    "ProxyServer",
    "AutoConfigURL",
    "AutoDetect",
];

const INTERNET_OPTION_SETTINGS_CHANGED: u32 = 39;
const INTERNET_OPTION_REFRESH: u32 = 37;

/// One registry value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegValue {
    /// Registry type, `REG_SZ` or `REG_DWORD`.
    #[serde(rename = "type")]
    pub kind: String,
    /// String for `REG_SZ`, number for `REG_DWORD`.
    pub value: Value,
}

impl RegValue {
    fn sz(value: impl Into<String>) -> Self {
        Self {
            kind: "REG_SZ".to_string(),
            value: Value::String(value.into()),
        }
    }

    fn dword(value: u32) -> Self {
        Self {
            kind: "REG_DWORD".to_string(),
            value: Value::from(value),
        }
    }

    /// Data argument for `reg add /d`.
    fn data(&self) -> String {
        match &self.value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// Registry values grouped by key, as saved in the proxy snapshot.
pub type RegSnapshot = BTreeMap<String, BTreeMap<String, RegValue>>;

/// Point WinINet at `127.0.0.1:port` and return the previous settings.
pub fn start_sys_proxy(
    runner: &dyn CommandRunner,
    port: u16,
    proxy_https: bool,
) -> Result<RegSnapshot, SysError> {
    let output = runner
        .run("reg", &["query", REG_INET_KEY])
        .map_err(SysError::ReadConfig)?;
    let previous = parse_reg_query(&output);

    let mut server = format!("http=127.0.0.1:{}", port);
    if proxy_https {
        server.push_str(&format!(";https=127.0.0.1:{}", port));
    }
    let values = BTreeMap::from([
        ("ProxyEnable".to_string(), RegValue::dword(1)),
        ("ProxyOverride".to_string(), RegValue::sz("<-loopback>")),
        ("ProxyServer".to_string(), RegValue::sz(server)),
        ("AutoConfigURL".to_string(), RegValue::sz("")),
        ("AutoDetect".to_string(), RegValue::dword(0)),
    ]);

    put_values(runner, &values).map_err(SysError::ApplyConfig)?;
    refresh(runner)?;

    info!("System proxy set to 127.0.0.1:{}", port);
    Ok(BTreeMap::from([(REG_INET_KEY.to_string(), previous)]))
}

/// Restore `saved` settings, or disable the proxy when there are none.
/// Returns what was written.
pub fn stop_sys_proxy(
    runner: &dyn CommandRunner,
    saved: Option<RegSnapshot>,
) -> Result<RegSnapshot, SysError> {
    let data = saved
        .filter(|snapshot| snapshot.contains_key(REG_INET_KEY))
        .unwrap_or_else(|| {
            BTreeMap::from([(
                REG_INET_KEY.to_string(),
                BTreeMap::from([
                    ("ProxyEnable".to_string(), RegValue::dword(0)),
                    ("ProxyOverride".to_string(), RegValue::sz("")),
                    ("ProxyServer".to_string(), RegValue::sz("")),
                ]),
            )])
        });

    if let Some(values) = data.get(REG_INET_KEY) {
        put_values(runner, values).map_err(SysError::ApplyConfig)?;
    }
    refresh(runner)?;

    info!("System proxy settings restored");
    Ok(data)
}

/// Add `path` to the machine root store through an elevated `certutil`.
pub fn import_root_cert(runner: &dyn CommandRunner, path: &Path) -> bool {
    let dir = path.parent().map(|p| p.display().to_string()).unwrap_or_default();
    let file = path
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_default();
    let script = format!(
        "Start-Process cmd -Verb RunAs -ArgumentList '/c cd {} && certutil -addstore -f root {}'",
        dir, file
    );

    match runner.run("powershell", &["-Command", &script]) {
        Ok(_) => true,
        Err(e) => {
            debug!("certutil import failed: {}", e);
            false
        }
    }
}

fn put_values(runner: &dyn CommandRunner, values: &BTreeMap<String, RegValue>) -> Result<(), String> {
    for (name, value) in values {
        let data = value.data();
        runner.run(
            "reg",
            &[
                "add",
                REG_INET_KEY,
                "/v",
                name,
                "/t",
                &value.kind,
                "/d",
                &data,
                "/f",
            ],
        )?;
    }
    Ok(())
}

/// Tell WinINet the settings changed, then reload them.
fn refresh(runner: &dyn CommandRunner) -> Result<(), SysError> {
    let script = format!(
        "$sig = '[DllImport(\"wininet.dll\")] public static extern bool InternetSetOption(IntPtr h, int o, IntPtr b, int l);'; \
         $t = Add-Type -MemberDefinition $sig -Name WinInet -Namespace FastProxy -PassThru; \
         [void]$t::InternetSetOption([IntPtr]::Zero, {}, [IntPtr]::Zero, 0); \
         [void]$t::InternetSetOption([IntPtr]::Zero, {}, [IntPtr]::Zero, 0)",
        INTERNET_OPTION_SETTINGS_CHANGED, INTERNET_OPTION_REFRESH
    );
    runner
        .run("powershell", &["-NoProfile", "-Command", &script])
        .map(|_| ())
        .map_err(SysError::Refresh)
}

/// Parse `reg query` output, keeping the proxy values we manage.
///
/// Lines look like `    ProxyEnable    REG_DWORD    0x1`.
pub(crate) fn parse_reg_query(output: &str) -> BTreeMap<String, RegValue> {
    let mut values = BTreeMap::new();
    for line in output.lines() {
        let mut fields = line.split_whitespace();
        let (Some(name), Some(kind)) = (fields.next(), fields.next()) else {
            continue;
        };
        if !PROXY_VALUES.contains(&name) {
            continue;
        }
        // REG_SZ data may contain spaces; everything after the type is data.
        let data = line
            .split_once(kind)
            .map(|(_, rest)| rest.trim())
            .unwrap_or_default();

        let value = match kind {
            "REG_SZ" => RegValue::sz(data),
            "REG_DWORD" => {
                let digits = data.trim_start_matches("0x");
                match u32::from_str_radix(digits, 16) {
                    Ok(n) => RegValue::dword(n),
                    Err(_) => continue,
                }
            }
            _ => continue,
        };
        values.insert(name.to_string(), value);
    }
    values
}
