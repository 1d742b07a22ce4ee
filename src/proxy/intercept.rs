//! Interception controller: hold a request until the operator rules on it.
//!
//! For every non-filtered request the engine calls [`Interceptor::intercept`],
//! which publishes a pending notice to the control clients, parks the
//! connection task on the registry, and resumes it with whatever the
//! operator decided. Silence is not an error: after the decision timeout
//! the request is forwarded exactly as it arrived.

use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{Method, Uri};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};
use uuid::Uuid;

use super::hold::DecisionRegistry;
use crate::control::hub::HubHandle;
use crate::control::protocol::{
    DecisionAction, DecisionData, OutboundMessage, RequestNotice, RequestStatus, WireHeaders,
};

/// How long to wait for an operator decision.
pub const DECISION_TIMEOUT: Duration = Duration::from_secs(30);

/// A fully read request, held while the operator reviews it.
#[derive(Debug, Clone)]
pub struct InterceptedRequest {
    /// Process-unique id, echoed by the resolving decision.
    pub id: Uuid,
    /// HTTP method.
    pub method: Method,
    /// Reconstructed absolute URL.
    pub url: String,
    /// Request headers.
    pub headers: HeaderMap,
    /// Request body.
    pub body: Bytes,
}

impl InterceptedRequest {
    /// Create a request with a fresh id.
    pub fn new(method: Method, url: String, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            id: Uuid::new_v4(),
            method,
            url,
            headers,
            body,
        }
    }

    /// The wire notice broadcast to control clients.
    pub fn notice(&self) -> RequestNotice {
        RequestNotice {
            id: self.id,
            method: self.method.to_string(),
            url: self.url.clone(),
            headers: wire_headers(&self.headers),
            body: String::from_utf8_lossy(&self.body).into_owned(),
            status: RequestStatus::Pending,
        }
    }
}

/// What the engine should do once the hold resolves.
#[derive(Debug)]
pub enum InterceptOutcome {
    /// Forward the (possibly rewritten) request to the origin.
    Forward(InterceptedRequest),
    /// Abandon the request; the caller answers `204 No Content`.
    Drop,
}

/// Publishes held requests and applies the operator's decisions.
pub struct Interceptor {
    registry: Arc<DecisionRegistry>,
    hub: HubHandle,
    decision_timeout: Duration,
}

impl Interceptor {
    /// Create a controller with the default 30s decision timeout.
    pub fn new(registry: Arc<DecisionRegistry>, hub: HubHandle) -> Self {
        Self::with_timeout(registry, hub, DECISION_TIMEOUT)
    }

    /// Create a controller with a custom decision timeout.
    pub fn with_timeout(
        registry: Arc<DecisionRegistry>,
        hub: HubHandle,
        decision_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            hub,
            decision_timeout,
        }
    }

    /// Hold `req` until a decision arrives or the timeout passes.
    ///
    /// Every exit path removes the registry entry for the id, so a decision
    /// landing after resolution has no effect.
    pub async fn intercept(&self, mut req: InterceptedRequest) -> InterceptOutcome {
        let id = req.id;

        self.hub
            .broadcast(&OutboundMessage::Request {
                id,
                data: req.notice(),
            })
            .await;

        let rx = self.registry.register(id);

        let outcome = match timeout(self.decision_timeout, rx).await {
            Ok(Ok(decision)) => match decision.action {
                DecisionAction::Send => {
                    apply_overrides(&mut req, decision);
                    InterceptOutcome::Forward(req)
                }
                DecisionAction::Drop => {
                    debug!("Request {} dropped by operator", id);
                    InterceptOutcome::Drop
                }
                DecisionAction::Unknown => {
                    warn!("Unrecognized action for request {}, forwarding as-is", id);
                    InterceptOutcome::Forward(req)
                }
            },
            Ok(Err(_)) => {
                debug!("Decision channel for request {} closed, forwarding as-is", id);
                InterceptOutcome::Forward(req)
            }
            Err(_) => {
                debug!("No decision for request {} within timeout, forwarding as-is", id);
                InterceptOutcome::Forward(req)
            }
        };

        self.registry.finish(id);
        outcome
    }
}

/// Apply the decision's present, non-empty overrides onto `req`.
fn apply_overrides(req: &mut InterceptedRequest, decision: DecisionData) {
    if let Some(method) = decision.method.as_deref().filter(|m| !m.is_empty()) {
        match Method::from_bytes(method.as_bytes()) {
            Ok(method) => req.method = method,
            Err(_) => debug!("Invalid method override {:?}, keeping original", method),
        }
    }

    if let Some(url) = decision.url.filter(|u| !u.is_empty()) {
        if is_absolute_url(&url) {
            req.url = url;
        } else {
            debug!("Unparseable URL override {:?}, keeping original", url);
        }
    }

    if let Some(body) = decision.body.filter(|b| !b.is_empty()) {
        req.body = Bytes::from(body);
    }

    if let Some(headers) = decision.headers {
        merge_headers(&mut req.headers, &headers);
    }
}

/// Whether `url` parses as an absolute URL (scheme and host present).
fn is_absolute_url(url: &str) -> bool {
    url.parse::<Uri>()
        .map(|uri| uri.scheme().is_some() && uri.authority().is_some())
        .unwrap_or(false)
}

/// Overwrite or add each wire header entry; invalid names/values are
/// skipped, not fatal.
fn merge_headers(headers: &mut HeaderMap, overrides: &WireHeaders) {
    for (name, values) in overrides {
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            debug!("Invalid header name override {:?}", name);
            continue;
        };
        headers.remove(&name);
        for value in values {
            match HeaderValue::from_str(value) {
                Ok(value) => {
                    headers.append(name.clone(), value);
                }
                Err(_) => debug!("Invalid header value override for {:?}", name),
            }
        }
    }
}

/// Header multimap in wire form.
pub fn wire_headers(headers: &HeaderMap) -> WireHeaders {
    let mut map = WireHeaders::new();
    for (name, value) in headers {
        map.entry(name.as_str().to_string())
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::hub::Hub;
    use std::collections::HashMap;

    fn request() -> InterceptedRequest {
        let mut headers = HeaderMap::new();
        headers.insert("accept", HeaderValue::from_static("*/*"));
        InterceptedRequest::new(
            Method::GET,
            "https://example.com/".to_string(),
            headers,
            Bytes::new(),
        )
    }

    fn decision(id: Uuid, action: DecisionAction) -> DecisionData {
        DecisionData {
            id,
            action,
            method: None,
            url: None,
            body: None,
            headers: None,
        }
    }

    fn interceptor(timeout: Duration) -> (Interceptor, Arc<DecisionRegistry>) {
        let registry = Arc::new(DecisionRegistry::new());
        let (hub, handle) = Hub::new();
        tokio::spawn(hub.run());
        (
            Interceptor::with_timeout(registry.clone(), handle, timeout),
            registry,
        )
    }

    #[tokio::test]
    async fn test_send_decision_forwards_with_overrides() {
        let (interceptor, registry) = interceptor(Duration::from_secs(5));
        let req = request();
        let id = req.id;

        let registry_clone = registry.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let mut d = decision(id, DecisionAction::Send);
            d.url = Some("https://example.com/changed".to_string());
            registry_clone.deliver(d);
        });

        match interceptor.intercept(req).await {
            InterceptOutcome::Forward(forwarded) => {
                assert_eq!(forwarded.url, "https://example.com/changed");
            }
            InterceptOutcome::Drop => panic!("expected forward"),
        }
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_drop_decision() {
        let (interceptor, registry) = interceptor(Duration::from_secs(5));
        let req = request();
        let id = req.id;

        let registry_clone = registry.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            registry_clone.deliver(decision(id, DecisionAction::Drop));
        });

        assert!(matches!(
            interceptor.intercept(req).await,
            InterceptOutcome::Drop
        ));
    }

    #[tokio::test]
    async fn test_timeout_forwards_as_is_and_cleans_up() {
        let (interceptor, registry) = interceptor(Duration::from_millis(50));
        let req = request();
        let url = req.url.clone();

        match interceptor.intercept(req).await {
            InterceptOutcome::Forward(forwarded) => assert_eq!(forwarded.url, url),
            InterceptOutcome::Drop => panic!("expected forward"),
        }
        assert!(registry.is_empty());
        assert_eq!(registry.waiting_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_action_forwards_as_is() {
        let (interceptor, registry) = interceptor(Duration::from_secs(5));
        let req = request();
        let id = req.id;
        let url = req.url.clone();

        let registry_clone = registry.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            registry_clone.deliver(decision(id, DecisionAction::Unknown));
        });

        match interceptor.intercept(req).await {
            InterceptOutcome::Forward(forwarded) => assert_eq!(forwarded.url, url),
            InterceptOutcome::Drop => panic!("expected forward"),
        }
    }

    #[test]
    fn test_override_method_and_body() {
        let mut req = request();
        let mut d = decision(req.id, DecisionAction::Send);
        d.method = Some("POST".to_string());
        d.body = Some("payload".to_string());

        apply_overrides(&mut req, d);

        assert_eq!(req.method, Method::POST);
        assert_eq!(req.body, Bytes::from("payload"));
    }

    #[test]
    fn test_empty_overrides_keep_original() {
        let mut req = request();
        let mut d = decision(req.id, DecisionAction::Send);
        d.method = Some(String::new());
        d.url = Some(String::new());
        d.body = Some(String::new());

        apply_overrides(&mut req, d);

        assert_eq!(req.method, Method::GET);
        assert_eq!(req.url, "https://example.com/");
        assert!(req.body.is_empty());
    }

    #[test]
    fn test_unparseable_url_override_keeps_original() {
        let mut req = request();
        let mut d = decision(req.id, DecisionAction::Send);
        d.url = Some("not a url".to_string());

        apply_overrides(&mut req, d);
        assert_eq!(req.url, "https://example.com/");

        let mut d = decision(req.id, DecisionAction::Send);
        d.url = Some("/relative/only".to_string());
        apply_overrides(&mut req, d);
        assert_eq!(req.url, "https://example.com/");
    }

    #[test]
    fn test_header_overrides_replace_and_add() {
        let mut req = request();
        let mut wire = HashMap::new();
        wire.insert("Accept".to_string(), vec!["text/html".to_string()]);
        wire.insert(
            "X-Injected".to_string(),
            vec!["one".to_string(), "two".to_string()],
        );
        let mut d = decision(req.id, DecisionAction::Send);
        d.headers = Some(wire);

        apply_overrides(&mut req, d);

        assert_eq!(req.headers.get("accept").unwrap(), "text/html");
        let injected: Vec<_> = req.headers.get_all("x-injected").iter().collect();
        assert_eq!(injected.len(), 2);
    }

    #[test]
    fn test_wire_headers_multimap() {
        let mut headers = HeaderMap::new();
        headers.append("set-cookie", HeaderValue::from_static("a=1"));
        headers.append("set-cookie", HeaderValue::from_static("b=2"));

        let wire = wire_headers(&headers);
        assert_eq!(wire["set-cookie"], vec!["a=1", "b=2"]);
    }
}
