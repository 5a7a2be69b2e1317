//! Command-line interface definitions for fast-proxy.
//!
//! Uses clap's derive API for type-safe argument parsing.

use clap::{Args, Parser, Subcommand};
use std::net::IpAddr;
use std::path::PathBuf;

/// Interactive HTTP/HTTPS forward proxy with TLS interception.
///
/// fast-proxy relays plain HTTP requests and CONNECT tunnels. Tunnels to
/// hosts matching an `--intercept` pattern are decrypted with certificates
/// minted on the fly and signed by the proxy's root credential.
#[derive(Parser, Debug)]
#[command(name = "fast-proxy")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true, args_conflicts_with_subcommands = true)]
pub struct Cli {
    /// Subcommand to run (or omit to run the proxy).
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Proxy flags when no subcommand is given.
    #[command(flatten)]
    pub run: RunArgs,

    /// Path to additional config file.
    ///
    /// This config file is merged on top of system and user configs,
    /// giving it the highest priority (except for CLI flags).
    #[arg(short = 'c', long = "config", value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Increase log verbosity.
    ///
    /// Can be specified multiple times:
    /// -v    = info level
    /// -vv   = debug level
    /// -vvv  = trace level
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

/// Flags for running the proxy.
#[derive(Args, Debug, Clone, Default, PartialEq)]
pub struct RunArgs {
    /// Port of the plain HTTP listener.
    #[arg(long = "http-port", value_name = "PORT")]
    pub http_port: Option<u16>,

    /// Loopback port of the interception terminator.
    #[arg(long = "https-port", value_name = "PORT")]
    pub https_port: Option<u16>,

    /// Address the HTTP listener binds.
    #[arg(long = "bind", value_name = "ADDR")]
    pub bind: Option<IpAddr>,

    /// PEM root certificate used to sign intercepted hosts.
    #[arg(long = "ca-cert", value_name = "PATH", requires = "ca_key")]
    pub ca_cert: Option<PathBuf>,

    /// PEM (PKCS#8) private key of the root certificate.
    #[arg(long = "ca-key", value_name = "PATH", requires = "ca_cert")]
    pub ca_key: Option<PathBuf>,

    /// Intercept tunnels to this host (repeatable).
    ///
    /// Exact host names or `*.suffix` wildcards. Tunnels to other hosts are
    /// relayed untouched.
    #[arg(short = 'i', long = "intercept", value_name = "PATTERN")]
    pub intercept: Vec<String>,

    /// Install the proxy as the system proxy while running.
    #[arg(long = "system-proxy")]
    pub system_proxy: bool,

    /// With --system-proxy, route HTTPS through the proxy as well.
    #[arg(long = "proxy-https")]
    pub proxy_https: bool,
}

/// Subcommands for fast-proxy.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the proxy (the default).
    Run(RunArgs),

    /// Generate a new root certificate and key.
    #[command(name = "create-ca")]
    CreateCa {
        /// Directory to write `ca.pem` and `ca.key` into.
        #[arg(long = "out-dir", value_name = "DIR", default_value = ".")]
        out_dir: PathBuf,

        /// Organization (also the common name).
        #[arg(long, default_value = "FXTop")]
        organization: String,

        /// Two-letter country code.
        #[arg(long = "country", default_value = "CN")]
        country_code: String,

        /// State or province.
        #[arg(long, default_value = "GuangDong")]
        state: String,

        /// Locality.
        #[arg(long, default_value = "ShenZhen")]
        locality: String,

        /// Validity in days.
        #[arg(long = "days", default_value_t = 365)]
        validity_days: u32,

        /// Also persist the credential in the temporary state store, where
        /// later runs without `--ca-cert` pick it up.
        #[arg(long)]
        persist: bool,
    },

    /// Trust a root certificate in the OS trust store.
    ///
    /// Without a path the persisted (or embedded default) root is trusted.
    #[command(name = "trust-cert")]
    TrustCert {
        /// PEM certificate to trust.
        path: Option<PathBuf>,
    },

    /// Install or remove the system proxy settings.
    #[command(name = "sys-proxy")]
    SysProxy {
        /// What to do.
        #[command(subcommand)]
        action: SysProxyAction,
    },
}

/// `sys-proxy` actions.
#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum SysProxyAction {
    /// Point the system proxy at this machine.
    Start {
        /// Proxy port.
        #[arg(long, default_value_t = 8888)]
        port: u16,

        /// Route HTTPS through the proxy as well.
        #[arg(long = "https")]
        https: bool,
    },
    /// Restore the previous system proxy settings.
    Stop,
}

impl Cli {
    /// Proxy flags in effect, from `run` or the top level.
    pub fn run_args(&self) -> &RunArgs {
        match &self.command {
            Some(Commands::Run(args)) => args,
            _ => &self.run,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_top_level_run_flags() {
        let cli = Cli::parse_from([
            "fast-proxy",
            "--http-port",
            "9000",
            "-i",
            "example.com",
            "--intercept",
            "*.test",
            "-vv",
        ]);
        assert!(cli.command.is_none());
        assert_eq!(cli.run_args().http_port, Some(9000));
        assert_eq!(cli.run_args().intercept, vec!["example.com", "*.test"]);
        assert_eq!(cli.verbose, 2);
    }

    #[test]
    fn test_run_subcommand() {
        let cli = Cli::parse_from(["fast-proxy", "run", "--https-port", "9443", "--system-proxy"]);
        let args = cli.run_args();
        assert_eq!(args.https_port, Some(9443));
        assert!(args.system_proxy);
    }

    #[test]
    fn test_ca_paths_require_each_other() {
        assert!(Cli::try_parse_from(["fast-proxy", "--ca-cert", "ca.pem"]).is_err());
        assert!(
            Cli::try_parse_from(["fast-proxy", "--ca-cert", "ca.pem", "--ca-key", "ca.key"]).is_ok()
        );
    }

    #[test]
    fn test_sys_proxy_start_defaults() {
        let cli = Cli::parse_from(["fast-proxy", "sys-proxy", "start"]);
        match cli.command {
            Some(Commands::SysProxy { action }) => {
                assert_eq!(action, SysProxyAction::Start { port: 8888, https: false })
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_global_config_flag_after_subcommand() {
        let cli = Cli::parse_from(["fast-proxy", "trust-cert", "-c", "/tmp/fp.toml"]);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/fp.toml")));
        assert!(matches!(cli.command, Some(Commands::TrustCert { path: None })));
    }
}
