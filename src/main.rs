//! fast-proxy: interactive HTTP/HTTPS forward proxy
//!
//! This is the main entry point for the fast-proxy binary. It handles CLI
//! argument parsing, configuration loading, tracing initialization, and
//! drives the proxy until interrupted.
//!
//! # Output
//!
//! - **Logs** go to stderr, filtered by `-v` or the configured log level
//! - **Results** of the system subcommands (`trust-cert`, `sys-proxy`) are
//!   printed to stdout as JSON, so scripts can branch on the `error` code

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use fast_proxy::{
    ca::{CaInfo, create_ca, persist_root},
    cli::{Cli, Commands, SysProxyAction},
    config::{Config, ConfigLoader, ProxyConfig},
    proxy::{Hooks, Proxy},
    state::TempStore,
    system::{self, SysResult},
};
use tracing::{Level, debug, error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before any other initialization)
    let cli = Cli::parse();

    let config_loader = ConfigLoader::new();
    let config = config_loader
        .load(&cli)
        .context("Failed to load configuration")?;

    init_tracing(cli.verbose, &config.general.log_level)?;
    install_panic_hook();

    debug!("Parsed CLI arguments: {:?}", cli);
    debug!("Loaded configuration: {:?}", config);

    match cli.command {
        None | Some(Commands::Run(_)) => run_proxy(config).await,
        Some(Commands::CreateCa {
            out_dir,
            organization,
            country_code,
            state,
            locality,
            validity_days,
            persist,
        }) => {
            let info = CaInfo {
                organization,
                country_code,
                state,
                locality,
                validity_days,
            };
            create_root(&info, &out_dir, persist)
        }
        Some(Commands::TrustCert { path }) => {
            print_result(&system::trust_root_cert(path.as_deref()))
        }
        Some(Commands::SysProxy { action }) => {
            let result = match action {
                SysProxyAction::Start { port, https } => system::start_sys_proxy(port, https),
                SysProxyAction::Stop => system::stop_sys_proxy(),
            };
            print_result(&result)
        }
    }
}

/// Run the proxy until Ctrl-C.
async fn run_proxy(config: Config) -> Result<()> {
    let options = config
        .proxy_options()
        .context("Invalid proxy configuration")?;
    let hooks = build_hooks(Arc::new(config.proxy.clone()));

    let mut proxy = Proxy::new(options, hooks);
    proxy.start().await.context("Failed to start proxy")?;

    let addr = proxy
        .local_addr()
        .context("Proxy reported no listening address")?;
    info!("Listening on http://{}", addr);
    if config.proxy.intercept.is_empty() {
        info!("No intercept patterns configured; all tunnels pass through");
    }

    let system_proxy = config.system.set_system_proxy;
    if system_proxy {
        let result = system::start_sys_proxy(addr.port(), config.system.proxy_https);
        if !result.is_ok() {
            warn!(
                "Failed to install system proxy (code {}): {}",
                result.error,
                result.message.as_deref().unwrap_or("unknown error")
            );
        }
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Interrupted, shutting down");

    if system_proxy {
        let result = system::stop_sys_proxy();
        if !result.is_ok() {
            warn!(
                "Failed to restore system proxy (code {}): {}",
                result.error,
                result.message.as_deref().unwrap_or("unknown error")
            );
        }
    }

    proxy.close().await;
    Ok(())
}

/// Hooks used by the command-line proxy: interception by pattern and
/// request logging.
fn build_hooks(proxy_config: Arc<ProxyConfig>) -> Hooks {
    let hooks = Hooks::new()
        .on_before_connect(move |target| {
            let intercept = proxy_config.should_intercept(&target.host);
            debug!(
                "CONNECT {} ({})",
                target.url(),
                if intercept { "intercept" } else { "passthrough" }
            );
            intercept
        })
        .on_before_response(|head, response, _| {
            info!("{} {} -> {}", head.method, head.uri, response.status().as_u16());
            false
        });

    if tracing::enabled!(Level::DEBUG) {
        hooks.on_after_response(|head, body| {
            debug!(
                "{} {} relayed {} body bytes (encoding: {})",
                head.method,
                head.uri,
                body.chunks.len(),
                if body.encoding.is_empty() {
                    "identity"
                } else {
                    body.encoding.as_str()
                }
            );
            false
        })
    } else {
        hooks
    }
}

/// Generate a root credential into `out_dir`, optionally persisting it.
fn create_root(info: &CaInfo, out_dir: &Path, persist: bool) -> Result<()> {
    let root = create_ca(info).context("Failed to create root credential")?;

    let cert_path = out_dir.join("ca.pem");
    let key_path = out_dir.join("ca.key");
    root.save(&cert_path, &key_path)
        .context("Failed to write root credential")?;
    println!("{}", cert_path.display());
    println!("{}", key_path.display());

    if persist {
        let store = TempStore::default_location();
        persist_root(&store, &root).context("Failed to persist root credential")?;
        info!("Persisted root credential in {}", store.root().display());
    }
    Ok(())
}

/// Print a system integration result as JSON; fail the process on error.
fn print_result(result: &SysResult) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(result).context("Failed to serialize result")?
    );
    if !result.is_ok() {
        std::process::exit(i32::from(result.error));
    }
    Ok(())
}

/// Initialize the tracing subscriber.
///
/// # Verbosity Levels
/// - 0 (default): `RUST_LOG`, else the configured log level, else warnings
/// - 1 (-v): Info level
/// - 2 (-vv): Debug level
/// - 3+ (-vvv): Trace level
fn init_tracing(verbose: u8, configured: &str) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            if configured.is_empty() {
                EnvFilter::new("warn")
            } else {
                EnvFilter::new(configured)
            }
        }),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init()
        .context("Failed to initialize tracing subscriber")?;

    Ok(())
}

/// Route panics through tracing so they land in the same log stream.
fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        error!("panic: {}", panic_info);
        default_hook(panic_info);
    }));
}
