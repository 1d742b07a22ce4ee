//! Command-line interface definitions.
//!
//! Uses clap's derive API for type-safe argument parsing.

use clap::Parser;
use std::path::PathBuf;

/// Interactive TLS-intercepting proxy with operator-reviewed request release.
///
/// holdpoint terminates TLS with its own locally-trusted certificate
/// authority and holds every outbound request until an operator on the
/// control channel releases, edits, or drops it.
#[derive(Parser, Debug)]
#[command(name = "holdpoint")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Port for the proxy listener.
    #[arg(long = "proxy-port", value_name = "PORT")]
    pub proxy_port: Option<u16>,

    /// Port for the WebSocket control channel.
    #[arg(long = "control-port", value_name = "PORT")]
    pub control_port: Option<u16>,

    /// Address both listeners bind to.
    #[arg(long = "bind", value_name = "ADDR")]
    pub bind: Option<std::net::IpAddr>,

    /// Directory holding the root CA certificate and key.
    ///
    /// Defaults to the directory beside the executable.
    #[arg(long = "ca-dir", value_name = "PATH")]
    pub ca_dir: Option<PathBuf>,

    /// Path to a TOML config file merged under the CLI flags.
    #[arg(short = 'c', long = "config", value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Intercept browser-vendor service domains too.
    ///
    /// By default Mozilla/Firefox background traffic bypasses review.
    #[arg(long = "no-vendor-filter")]
    pub no_vendor_filter: bool,

    /// Increase log verbosity.
    ///
    /// Can be specified multiple times:
    /// -v    = info level
    /// -vv   = debug level
    /// -vvv  = trace level
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}
