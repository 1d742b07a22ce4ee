//! Domain filter suppressing browser-vendor background noise.
//!
//! A freshly launched Firefox profile talks to a dozen Mozilla service
//! domains (sync, telemetry, extension updates, Pocket) on its own. None of
//! that is operator traffic, so requests to these domains bypass
//! interception and are forwarded quietly.

/// Domain suffixes owned by the browser vendor's service infrastructure.
const VENDOR_DOMAINS: &[&str] = &[
    "mozilla.com",
    "mozilla.org",
    "mozilla.net",
    "firefox.com",
    "firefox.org",
    "getpocket.com",
    "firefoxusercontent.com",
    "services.mozilla.com",
];

/// Predicate deciding which hosts skip interception.
#[derive(Debug, Clone)]
pub struct DomainFilter {
    enabled: bool,
}

impl DomainFilter {
    /// Create a filter; `enabled = false` disables it entirely.
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    /// Whether `host` should bypass interception.
    ///
    /// `host` must already have its port stripped. Matching is
    /// case-insensitive substring matching against the vendor domain list.
    pub fn matches(&self, host: &str) -> bool {
        if !self.enabled {
            return false;
        }
        let host = host.to_lowercase();
        VENDOR_DOMAINS.iter().any(|domain| host.contains(domain))
    }
}

impl Default for DomainFilter {
    fn default() -> Self {
        Self::new(true)
    }
}
