//! MITM connection engine and the hold/review/release machinery.
//!
//! The engine accepts proxy-form HTTP/1.1 and CONNECT, decrypts HTTPS with
//! per-host leaf certificates, and routes every non-filtered request
//! through the interception controller before it reaches the origin.
//!
//! ```text
//! TCP accept ─→ engine ─→ (CA for HTTPS) ─→ interceptor ⇄ hub ⇄ clients
//!                              │                  │
//!                              └──── forward ◀────┘
//! ```

pub mod engine;
pub mod error;
pub mod hold;
pub mod intercept;
pub mod server;
pub mod tls;

pub use engine::{ProxyBody, ProxyContext};
pub use error::{ProxyError, ProxyResult};
pub use hold::{DecisionRegistry, DeliverOutcome};
pub use intercept::{InterceptOutcome, InterceptedRequest, Interceptor, DECISION_TIMEOUT};
pub use server::ProxyServer;
