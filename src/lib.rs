//! holdpoint: interactive TLS-intercepting proxy with operator review
//!
//! This crate sits between a browser and the open internet. HTTPS traffic is
//! decrypted via a locally-trusted certificate authority, and every
//! non-filtered request is held until an operator on the control channel
//! releases, edits, or drops it (or a timeout passes it through unchanged).
//!
//! # Architecture
//!
//! - **CA**: persistent root identity plus per-connection leaf issuance
//! - **Proxy**: connection engine (plain HTTP and CONNECT/TLS branches),
//!   interception controller, and the pending-request registry
//! - **Control**: WebSocket hub broadcasting pending requests and routing
//!   operator decisions back into the registry
//! - **Filter**: predicate suppressing browser-vendor service noise
//!
//! The CA, hub handle, and registry are the only state shared between
//! connections; each is internally synchronized and handed in by reference.

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod ca;
pub mod cli;
pub mod config;
pub mod control;
pub mod filter;
pub mod proxy;
