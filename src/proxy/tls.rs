//! TLS glue for the interception path.
//!
//! The proxy terminates TLS toward the client with a per-connection leaf
//! certificate and talks to origins through a client that skips
//! verification (trust decisions happen at the operator console, not in
//! upstream PKI).
//!
//! # ALPN
//!
//! The acceptor pins ALPN to `http/1.1`. Browsers negotiate HTTP/2 when
//! offered, and the engine reconstructs requests with an HTTP/1.1 parser;
//! letting H2 through would break the inner session immediately.

use rustls::ServerConfig;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::sync::Arc;
use std::time::Duration;
use tokio_rustls::TlsAcceptor;

use super::error::ProxyError;
use crate::ca::LeafIdentity;

/// Upstream request timeout.
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// Build a TLS acceptor presenting `leaf` (with the root appended).
///
/// Single-use: each intercepted connection gets its own freshly issued
/// leaf, so there is no resolver or cache layer here.
pub fn leaf_acceptor(
    leaf: &LeafIdentity,
    root_der: CertificateDer<'static>,
) -> Result<TlsAcceptor, ProxyError> {
    let chain = vec![leaf.cert_der.clone(), root_der];
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf.key_der.clone()));

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain, key)?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Build the shared upstream client.
///
/// Mirrors how the forward leg is meant to behave: certificate
/// verification off, redirects surfaced to the original client instead of
/// followed, and environment proxies ignored so the proxy can never loop
/// through itself.
pub fn upstream_client() -> Result<reqwest::Client, ProxyError> {
    // rustls 0.23 needs a process-wide default CryptoProvider. reqwest's
    // provider-less TLS path (see the `rustls-tls-*-no-provider` feature in
    // Cargo.toml) reads it at build time, so install aws-lc-rs — the single
    // provider this crate pulls in — before constructing the client.
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let client = reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .redirect(reqwest::redirect::Policy::none())
        .no_proxy()
        .timeout(UPSTREAM_TIMEOUT)
        .build()?;
    Ok(client)
}
