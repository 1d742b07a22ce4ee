//! holdpoint binary entry point.
//!
//! Wires the pieces together in dependency order: configuration, root CA
//! (plus the trust-store seam), registry, hub, control channel, proxy.
//! Failures here are fatal; once the listeners are up, everything else is
//! per-connection and recoverable.

use anyhow::{Context, Result};
use clap::Parser;
use holdpoint::{
    ca::{CertificateAuthority, LogOnlyTrustStore, TrustStore},
    cli::Cli,
    config::Settings,
    control::{ControlServer, Hub, SharedState},
    filter::DomainFilter,
    proxy::{DecisionRegistry, Interceptor, ProxyContext, ProxyServer},
};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose)?;

    let settings = Settings::load(&cli).context("Failed to load configuration")?;
    debug!("Resolved settings: {:?}", settings);

    // Root identity first: traffic must not flow before the certificate
    // exists and the trust seam has seen it.
    let (cert_path, key_path) = settings.ca_paths();
    let ca = Arc::new(
        CertificateAuthority::open(&cert_path, &key_path)
            .context("Failed to initialize certificate authority")?,
    );

    let trust = LogOnlyTrustStore;
    if !trust.is_trusted(ca.cert_path()) {
        if let Err(e) = trust.install(ca.cert_path()) {
            warn!("Trust-store installation failed: {}", e);
        }
    }
    info!("Root certificate available at {:?}", ca.cert_path());

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let registry = Arc::new(DecisionRegistry::new());
    let state = Arc::new(SharedState::new());
    let (hub, hub_handle) = Hub::new();
    tokio::spawn(hub.run());

    // Browser launches are an external collaborator's job; this build only
    // surfaces the requests.
    let (launch_tx, mut launch_rx) = tokio::sync::mpsc::channel::<serde_json::Value>(8);
    tokio::spawn(async move {
        while let Some(payload) = launch_rx.recv().await {
            info!("Browser launch requested (delegated externally): {}", payload);
        }
    });

    let control = ControlServer::bind(
        settings.control_addr(),
        hub_handle.clone(),
        registry.clone(),
        state.clone(),
        launch_tx,
        shutdown_rx.clone(),
    )
    .await
    .context("Failed to bind control channel")?;
    tokio::spawn(control.run());

    let interceptor = Interceptor::with_timeout(registry, hub_handle, settings.decision_timeout());
    let ctx = Arc::new(
        ProxyContext::new(
            ca,
            DomainFilter::new(settings.filter_vendor_noise),
            interceptor,
        )
        .context("Failed to build proxy context")?,
    );

    let proxy = ProxyServer::bind(settings.proxy_addr(), ctx, shutdown_rx)
        .await
        .context("Failed to bind proxy listener")?;

    info!(
        "holdpoint ready: proxy on {}, control on {}",
        settings.proxy_addr(),
        settings.control_addr()
    );

    tokio::select! {
        result = proxy.run() => {
            result.context("Proxy listener failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupt received, shutting down");
            let _ = shutdown_tx.send(true);
        }
    }

    Ok(())
}

/// Initialize the tracing subscriber.
///
/// # Verbosity Levels
/// - 0 (default): Only warnings and errors
/// - 1 (-v): Info level
/// - 2 (-vv): Debug level
/// - 3+ (-vvv): Trace level
fn init_tracing(verbose: u8) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
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
