//! Error types for proxy operations.

use thiserror::Error;

/// Unified error type for the connection engine.
///
/// Everything here is per-connection: the accept loop logs and moves on,
/// and one connection's failure never touches another.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// I/O error (socket operations).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Hyper HTTP error (parse failure, connection teardown).
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    /// Building a relayed response failed.
    #[error("response build error: {0}")]
    HttpBuild(#[from] http::Error),

    /// Invalid CONNECT request.
    #[error("invalid CONNECT request: {0}")]
    InvalidConnect(String),

    /// TLS error during handshake or server-config assembly.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Leaf or root certificate work failed.
    #[error("certificate error: {0}")]
    Cert(#[from] crate::ca::CaError),

    /// The upstream client could not be constructed.
    #[error("upstream client error: {0}")]
    UpstreamClient(#[from] reqwest::Error),
}

/// Result type for proxy operations.
pub type ProxyResult<T> = Result<T, ProxyError>;

impl From<rustls::Error> for ProxyError {
    fn from(err: rustls::Error) -> Self {
        ProxyError::Tls(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_connect_display() {
        let err = ProxyError::InvalidConnect("missing authority".to_string());
        assert!(err.to_string().contains("missing authority"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err: ProxyError = io_err.into();
        assert!(matches!(err, ProxyError::Io(_)));
    }

    #[test]
    fn test_tls_error_display() {
        let err = ProxyError::Tls("handshake failed".to_string());
        assert!(err.to_string().contains("handshake failed"));
    }
}
