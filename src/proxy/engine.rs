//! Per-connection request handling.
//!
//! Every accepted connection runs the same state machine: read the leading
//! HTTP request, branch on CONNECT, reconstruct the absolute URL, consult
//! the domain filter, hold the request for the operator, then forward and
//! relay. The CONNECT branch answers `200 Connection Established`, takes
//! over the raw bytes via HTTP upgrade, terminates TLS with a freshly
//! issued leaf certificate, and feeds the decrypted requests back through
//! the same pipeline.
//!
//! Upstream requests go out with certificate verification disabled and
//! redirects unfollowed; the operator, not PKI, vets what leaves the
//! machine.

use bytes::Bytes;
use futures_util::TryStreamExt;
use http::header::HeaderMap;
use http::{Method, StatusCode, Uri};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use tracing::{debug, trace, warn};

use super::error::{ProxyError, ProxyResult};
use super::intercept::{InterceptOutcome, InterceptedRequest, Interceptor};
use super::tls::{leaf_acceptor, upstream_client};
use crate::ca::CertificateAuthority;
use crate::filter::DomainFilter;

/// Response body type used throughout the engine.
///
/// Unsync because relayed bodies wrap the upstream client's byte stream.
pub type ProxyBody = UnsyncBoxBody<Bytes, std::io::Error>;

/// Headers meaningful only for one connection leg, stripped before
/// re-sending. Host is dropped too: the origin host comes from the URL,
/// which a decision may have rewritten.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "proxy-connection",
    "connection",
    "keep-alive",
    "transfer-encoding",
    "te",
    "trailer",
    "upgrade",
];

/// Response headers dropped on relay; hyper re-frames the streamed body.
const RESPONSE_STRIP_HEADERS: &[&str] = &["connection", "transfer-encoding", "keep-alive"];

/// Shared, internally synchronized state handed to every connection task.
pub struct ProxyContext {
    /// Certificate authority for leaf issuance.
    pub ca: Arc<CertificateAuthority>,
    /// Vendor-noise filter.
    pub filter: DomainFilter,
    /// Interception controller.
    pub interceptor: Interceptor,
    /// Upstream HTTP client.
    pub upstream: reqwest::Client,
}

impl ProxyContext {
    /// Assemble the context, building the shared upstream client.
    pub fn new(
        ca: Arc<CertificateAuthority>,
        filter: DomainFilter,
        interceptor: Interceptor,
    ) -> ProxyResult<Self> {
        Ok(Self {
            ca,
            filter,
            interceptor,
            upstream: upstream_client()?,
        })
    }
}

/// Entry point for each leading request on a proxied connection.
pub async fn proxy_request(
    req: Request<Incoming>,
    ctx: Arc<ProxyContext>,
) -> ProxyResult<Response<ProxyBody>> {
    if req.method() == Method::CONNECT {
        handle_connect(req, ctx).await
    } else {
        handle_request(req, ctx, None).await
    }
}

/// CONNECT branch: acknowledge the tunnel, then intercept it.
async fn handle_connect(
    req: Request<Incoming>,
    ctx: Arc<ProxyContext>,
) -> ProxyResult<Response<ProxyBody>> {
    let authority = req
        .uri()
        .authority()
        .map(|a| a.to_string())
        .ok_or_else(|| ProxyError::InvalidConnect("missing authority".into()))?;
    let (host, port) = parse_host_port(&authority)?;

    debug!("CONNECT {}:{}", host, port);

    // The tunnel only exists after the 200 below is written; hyper resolves
    // the upgrade future at that point.
    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                if let Err(e) = serve_tls_session(upgraded, authority, host.clone(), ctx).await {
                    debug!("TLS session for {} ended: {}", host, e);
                }
            }
            Err(e) => {
                warn!("HTTP upgrade failed for {}: {}", host, e);
            }
        }
    });

    Ok(Response::builder()
        .status(StatusCode::OK)
        .body(empty_body())
        .unwrap())
}

/// Terminate TLS with a fresh leaf and serve the decrypted requests.
async fn serve_tls_session(
    upgraded: Upgraded,
    authority: String,
    host: String,
    ctx: Arc<ProxyContext>,
) -> ProxyResult<()> {
    let leaf = ctx.ca.issue_leaf(&host)?;
    let acceptor = leaf_acceptor(&leaf, ctx.ca.cert_der().clone())?;

    let tls = acceptor
        .accept(TokioIo::new(upgraded))
        .await
        .map_err(|e| ProxyError::Tls(format!("client handshake failed: {e}")))?;

    debug!("TLS interception established for {}", host);

    let service = service_fn(move |inner: Request<Incoming>| {
        let ctx = ctx.clone();
        let authority = authority.clone();
        async move { handle_request(inner, ctx, Some(authority)).await }
    });

    http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .serve_connection(TokioIo::new(tls), service)
        .await
        .map_err(ProxyError::from)
}

/// Common path for plain and decrypted requests: reconstruct the URL,
/// filter, hold, forward.
async fn handle_request(
    req: Request<Incoming>,
    ctx: Arc<ProxyContext>,
    tunnel: Option<String>,
) -> ProxyResult<Response<ProxyBody>> {
    let (parts, body) = req.into_parts();
    let url = absolute_url(&parts.uri, &parts.headers, tunnel.as_deref())?;
    let host = url_host(&url);

    let body_bytes = body.collect().await?.to_bytes();
    let intercepted = InterceptedRequest::new(parts.method, url, parts.headers, body_bytes);

    if ctx.filter.matches(&host) {
        trace!("Filtered host {}, forwarding without review", host);
        return forward(&ctx, intercepted).await;
    }

    debug!(
        "Holding {} {} for review as {}",
        intercepted.method, intercepted.url, intercepted.id
    );

    match ctx.interceptor.intercept(intercepted).await {
        InterceptOutcome::Forward(released) => forward(&ctx, released).await,
        InterceptOutcome::Drop => Ok(Response::builder()
            .status(StatusCode::NO_CONTENT)
            .body(empty_body())
            .unwrap()),
    }
}

/// Send the released request to its origin and relay the response.
async fn forward(
    ctx: &ProxyContext,
    req: InterceptedRequest,
) -> ProxyResult<Response<ProxyBody>> {
    let mut headers = req.headers;
    strip_hop_by_hop(&mut headers);

    let outcome = ctx
        .upstream
        .request(req.method.clone(), req.url.as_str())
        .headers(headers)
        .body(req.body)
        .send()
        .await;

    match outcome {
        Ok(upstream) => relay(upstream),
        Err(e) => {
            warn!("Upstream request to {} failed: {}", req.url, e);
            Ok(bad_gateway(&e))
        }
    }
}

/// Relay status, headers, and body stream back to the original client.
fn relay(upstream: reqwest::Response) -> ProxyResult<Response<ProxyBody>> {
    let mut builder = Response::builder().status(upstream.status());
    for (name, value) in upstream.headers() {
        if !RESPONSE_STRIP_HEADERS.contains(&name.as_str()) {
            builder = builder.header(name, value);
        }
    }

    let stream = upstream
        .bytes_stream()
        .map_ok(Frame::data)
        .map_err(std::io::Error::other);

    Ok(builder.body(StreamBody::new(stream).boxed_unsync())?)
}

/// Reconstruct the absolute URL for a proxied request.
///
/// Proxy-form requests already carry one. Origin-form requests combine the
/// scheme (https inside a tunnel), the tunnel authority or Host header, and
/// the path. Default ports are trimmed.
fn absolute_url(
    uri: &Uri,
    headers: &HeaderMap,
    tunnel: Option<&str>,
) -> ProxyResult<String> {
    if uri.scheme().is_some() && uri.authority().is_some() {
        return Ok(uri.to_string());
    }

    let (scheme, authority, default_port) = match tunnel {
        Some(authority) => ("https", authority.to_string(), 443),
        None => {
            let host = headers
                .get(http::header::HOST)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| {
                    ProxyError::InvalidConnect("origin-form request without Host header".into())
                })?;
            ("http", host.to_string(), 80)
        }
    };

    let authority = trim_default_port(&authority, default_port);
    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    Ok(format!("{scheme}://{authority}{path}"))
}

/// Lowercased host component of a reconstructed URL, without the port.
fn url_host(url: &str) -> String {
    url.parse::<Uri>()
        .ok()
        .and_then(|uri| uri.host().map(|h| h.to_lowercase()))
        .unwrap_or_default()
}

/// Drop an explicit `:443`/`:80` so reconstructed URLs read naturally.
fn trim_default_port(authority: &str, default_port: u16) -> String {
    match authority.rsplit_once(':') {
        Some((host, port))
            if !host.is_empty() && port.parse::<u16>().ok() == Some(default_port) =>
        {
            host.to_string()
        }
        _ => authority.to_string(),
    }
}

/// Remove headers that must not cross the proxy hop.
///
/// Host and Content-Length go too: both are derived from the outgoing
/// request, whose URL and body a decision may have rewritten.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
    headers.remove(http::header::HOST);
    headers.remove(http::header::CONTENT_LENGTH);
}

/// Parse host and port from a CONNECT authority.
///
/// `api.example.com:8443` → ("api.example.com", 8443); a missing port
/// defaults to 443; IPv6 brackets are removed.
fn parse_host_port(authority: &str) -> ProxyResult<(String, u16)> {
    if let Some((host, port_str)) = authority.rsplit_once(':') {
        let port = port_str
            .parse::<u16>()
            .map_err(|_| ProxyError::InvalidConnect(format!("invalid port: {port_str}")))?;

        if host.starts_with('[') && host.ends_with(']') {
            return Ok((host[1..host.len() - 1].to_string(), port));
        }
        Ok((host.to_string(), port))
    } else {
        Ok((authority.to_string(), 443))
    }
}

/// Empty response body.
fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(std::io::Error::other)
        .boxed_unsync()
}

/// Response body with content.
fn full_body(content: String) -> ProxyBody {
    Full::new(Bytes::from(content))
        .map_err(std::io::Error::other)
        .boxed_unsync()
}

/// Best-effort `502 Bad Gateway` for upstream transport failures.
fn bad_gateway(error: &reqwest::Error) -> Response<ProxyBody> {
    Response::builder()
        .status(StatusCode::BAD_GATEWAY)
        .header("Content-Type", "text/plain")
        .body(full_body(format!("upstream request failed: {error}")))
        .unwrap()
}
