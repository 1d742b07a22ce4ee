//! Operator control channel.
//!
//! Control clients (typically a web UI) connect over WebSocket. The hub
//! fans pending-request notices out to every client and routes inbound
//! decisions into the pending-request registry. Clients may connect and
//! disconnect at any time; the proxy keeps running with zero clients.

pub mod hub;
pub mod protocol;
pub mod socket;
pub mod state;

pub use hub::{Hub, HubHandle};
pub use protocol::{DecisionAction, DecisionData, InboundMessage, OutboundMessage, RequestNotice};
pub use socket::{ControlError, ControlServer};
pub use state::SharedState;
