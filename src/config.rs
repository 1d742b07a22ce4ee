//! Runtime settings: defaults, optional TOML file, CLI overrides.
//!
//! Precedence, lowest to highest: built-in defaults, config file, CLI
//! flags. The file is optional; every field has a default so a partial
//! file is fine.

use serde::Deserialize;
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::cli::Cli;

/// Default proxy listener port.
pub const DEFAULT_PROXY_PORT: u16 = 8181;

/// Default control channel port.
pub const DEFAULT_CONTROL_PORT: u16 = 8182;

/// Root certificate file name.
const CA_CERT_FILE: &str = "holdpoint-ca.crt";

/// Root key file name.
const CA_KEY_FILE: &str = "holdpoint-ca.key";

/// Errors from configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Config file is not valid TOML for this schema.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Resolved runtime settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Port for the proxy listener.
    pub proxy_port: u16,
    /// Port for the control channel.
    pub control_port: u16,
    /// Address both listeners bind to.
    pub bind_addr: IpAddr,
    /// Seconds to wait for an operator decision.
    pub decision_timeout_secs: u64,
    /// Whether browser-vendor service domains bypass review.
    pub filter_vendor_noise: bool,
    /// Directory holding the root CA files; `None` means beside the
    /// executable.
    pub ca_dir: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            proxy_port: DEFAULT_PROXY_PORT,
            control_port: DEFAULT_CONTROL_PORT,
            bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            decision_timeout_secs: 30,
            filter_vendor_noise: true,
            ca_dir: None,
        }
    }
}

impl Settings {
    /// Load settings: defaults, then the CLI-named config file (if any),
    /// then CLI flag overrides.
    pub fn load(cli: &Cli) -> Result<Self, ConfigError> {
        let mut settings = match &cli.config {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        if let Some(port) = cli.proxy_port {
            settings.proxy_port = port;
        }
        if let Some(port) = cli.control_port {
            settings.control_port = port;
        }
        if let Some(addr) = cli.bind {
            settings.bind_addr = addr;
        }
        if let Some(dir) = &cli.ca_dir {
            settings.ca_dir = Some(dir.clone());
        }
        if cli.no_vendor_filter {
            settings.filter_vendor_noise = false;
        }

        Ok(settings)
    }

    /// Parse settings from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    /// Socket address of the proxy listener.
    pub fn proxy_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.proxy_port)
    }

    /// Socket address of the control channel.
    pub fn control_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.control_port)
    }

    /// Paths of the root certificate and key.
    ///
    /// Without an explicit `ca_dir` they sit beside the executable, falling
    /// back to the working directory when that cannot be determined.
    pub fn ca_paths(&self) -> (PathBuf, PathBuf) {
        let dir = self.ca_dir.clone().unwrap_or_else(|| {
            std::env::current_exe()
                .ok()
                .and_then(|exe| exe.parent().map(Path::to_path_buf))
                .unwrap_or_else(|| PathBuf::from("."))
        });
        (dir.join(CA_CERT_FILE), dir.join(CA_KEY_FILE))
    }

    /// Decision timeout as a `Duration`.
    pub fn decision_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.decision_timeout_secs)
    }
}
