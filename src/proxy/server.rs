//! Proxy listener and per-connection task management.
//!
//! One independent tokio task per accepted connection; a failure in any of
//! them is logged and never touches the listener loop or other
//! connections. Shutdown is signaled through a `watch` channel.

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::engine::{proxy_request, ProxyContext};
use super::error::{ProxyError, ProxyResult};

/// How long a connection may take to produce its request head.
const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// The proxy listener.
pub struct ProxyServer {
    listener: TcpListener,
    ctx: Arc<ProxyContext>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    /// Bind the proxy listener.
    pub async fn bind(
        addr: SocketAddr,
        ctx: Arc<ProxyContext>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> ProxyResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("Proxy listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            ctx,
            shutdown_rx,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> ProxyResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until shutdown is signaled.
    pub async fn run(mut self) -> ProxyResult<()> {
        loop {
            tokio::select! {
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, peer)) => {
                            debug!("Accepted connection from {}", peer);
                            let ctx = self.ctx.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, ctx).await {
                                    // Resets and early hangups are routine
                                    // browser behavior, not errors.
                                    let text = e.to_string();
                                    if text.contains("connection reset")
                                        || text.contains("broken pipe")
                                        || text.contains("Connection reset")
                                    {
                                        debug!("Connection ended: {}", e);
                                    } else {
                                        warn!("Connection error: {}", e);
                                    }
                                }
                            });
                        }
                        Err(e) => {
                            warn!("Failed to accept connection: {}", e);
                        }
                    }
                }
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        info!("Proxy shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

/// Serve one client connection with HTTP/1.1 + CONNECT upgrades.
async fn handle_connection(stream: TcpStream, ctx: Arc<ProxyContext>) -> ProxyResult<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req| {
        let ctx = ctx.clone();
        async move { proxy_request(req, ctx).await }
    });

    http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .timer(TokioTimer::new())
        .header_read_timeout(HEADER_READ_TIMEOUT)
        .serve_connection(io, service)
        .with_upgrades()
        .await
        .map_err(ProxyError::from)
}
