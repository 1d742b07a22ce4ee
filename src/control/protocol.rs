//! Wire protocol for the control channel.
//!
//! Every frame is a JSON envelope `{type, id?, data}`. Outbound (proxy →
//! clients) carries pending-request notices; inbound (client → proxy)
//! carries operator decisions and session toggles. Unknown message types
//! and actions deserialize into explicit `Unknown` variants so the read
//! loop can ignore them without failing the session.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Header multimap as it appears on the wire.
pub type WireHeaders = HashMap<String, Vec<String>>;

/// Lifecycle of an intercepted request, as reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    /// Waiting for an operator decision.
    Pending,
}

/// What the operator wants done with a pending request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionAction {
    /// Forward the request, applying any supplied overrides.
    Send,
    /// Abandon the request without contacting the origin.
    Drop,
    /// Anything else; treated as forward-as-is and logged.
    Unknown,
}

impl<'de> Deserialize<'de> for DecisionAction {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let action = String::deserialize(deserializer)?;
        Ok(match action.as_str() {
            "send" => DecisionAction::Send,
            "drop" => DecisionAction::Drop,
            _ => DecisionAction::Unknown,
        })
    }
}

/// A pending request as broadcast to control clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestNotice {
    /// Request id; decisions must echo it.
    pub id: Uuid,
    /// HTTP method.
    pub method: String,
    /// Reconstructed absolute URL.
    pub url: String,
    /// Request headers.
    pub headers: WireHeaders,
    /// Request body (lossy UTF-8).
    pub body: String,
    /// Always `pending` when broadcast.
    pub status: RequestStatus,
}

/// An operator decision for one pending request.
///
/// Absent or empty override fields leave the original value in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionData {
    /// Id of the pending request this decision resolves.
    pub id: Uuid,
    /// What to do with the request.
    pub action: DecisionAction,
    /// Replacement method.
    #[serde(default)]
    pub method: Option<String>,
    /// Replacement absolute URL.
    #[serde(default)]
    pub url: Option<String>,
    /// Replacement body.
    #[serde(default)]
    pub body: Option<String>,
    /// Header entries to overwrite or add.
    #[serde(default)]
    pub headers: Option<WireHeaders>,
}

/// Messages sent from the proxy to control clients.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    /// A request is being held for review.
    Request {
        /// Request id, duplicated from the notice for envelope routing.
        id: Uuid,
        /// The held request.
        data: RequestNotice,
    },
}

/// Messages received from control clients.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    /// Toggle the shared pause flag.
    Pause {
        /// New flag value.
        data: bool,
    },
    /// Clear the pause flag.
    ResumeAll,
    /// Resolve a pending request.
    ModifyRequest {
        /// The decision payload.
        data: DecisionData,
    },
    /// Launch a local browser; handled by an external collaborator.
    LaunchBrowser {
        /// Opaque launch parameters, passed through unparsed.
        #[serde(default)]
        data: Option<serde_json::Value>,
    },
    /// Any message type this build does not know.
    #[serde(other)]
    Unknown,
}

impl OutboundMessage {
    /// Serialize to the wire format.
    ///
    /// Serialization of these types cannot fail; a `None` here indicates a
    /// bug and is logged by the caller.
    pub fn to_json(&self) -> Option<String> {
        serde_json::to_string(self).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_notice_round_trip() {
        let msg = OutboundMessage::Request {
            id: Uuid::new_v4(),
            data: RequestNotice {
                id: Uuid::new_v4(),
                method: "GET".to_string(),
                url: "https://example.com/".to_string(),
                headers: HashMap::new(),
                body: String::new(),
                status: RequestStatus::Pending,
            },
        };

        let json = msg.to_json().unwrap();
        assert!(json.contains("\"type\":\"request\""));
        assert!(json.contains("\"status\":\"pending\""));
    }

    #[test]
    fn test_parse_modify_request() {
        let id = Uuid::new_v4();
        let json = format!(
            r#"{{"type":"modify_request","data":{{"id":"{id}","action":"send","url":"https://example.com/changed"}}}}"#
        );

        let msg: InboundMessage = serde_json::from_str(&json).unwrap();
        match msg {
            InboundMessage::ModifyRequest { data } => {
                assert_eq!(data.id, id);
                assert_eq!(data.action, DecisionAction::Send);
                assert_eq!(data.url.as_deref(), Some("https://example.com/changed"));
                assert!(data.method.is_none());
            }
            other => panic!("expected ModifyRequest, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_drop_action() {
        let id = Uuid::new_v4();
        let json = format!(r#"{{"type":"modify_request","data":{{"id":"{id}","action":"drop"}}}}"#);

        let msg: InboundMessage = serde_json::from_str(&json).unwrap();
        match msg {
            InboundMessage::ModifyRequest { data } => {
                assert_eq!(data.action, DecisionAction::Drop);
            }
            other => panic!("expected ModifyRequest, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_action_is_tolerated() {
        let id = Uuid::new_v4();
        let json =
            format!(r#"{{"type":"modify_request","data":{{"id":"{id}","action":"replay"}}}}"#);

        let msg: InboundMessage = serde_json::from_str(&json).unwrap();
        match msg {
            InboundMessage::ModifyRequest { data } => {
                assert_eq!(data.action, DecisionAction::Unknown);
            }
            other => panic!("expected ModifyRequest, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_pause_and_resume() {
        let msg: InboundMessage = serde_json::from_str(r#"{"type":"pause","data":true}"#).unwrap();
        assert!(matches!(msg, InboundMessage::Pause { data: true }));

        let msg: InboundMessage = serde_json::from_str(r#"{"type":"resume_all"}"#).unwrap();
        assert!(matches!(msg, InboundMessage::ResumeAll));
    }

    #[test]
    fn test_unknown_type_is_tolerated() {
        let msg: InboundMessage =
            serde_json::from_str(r#"{"type":"export_history"}"#).unwrap();
        assert!(matches!(msg, InboundMessage::Unknown));
    }

    #[test]
    fn test_launch_browser_payload_is_opaque() {
        let msg: InboundMessage =
            serde_json::from_str(r#"{"type":"launch_browser","data":{"browser":"firefox"}}"#)
                .unwrap();
        match msg {
            InboundMessage::LaunchBrowser { data } => {
                assert!(data.is_some());
            }
            other => panic!("expected LaunchBrowser, got {other:?}"),
        }
    }
}
