//! Relay URL normalization and blacklisting.
//!
//! Outbox relay lists are user-published and full of noise: trailing slashes,
//! mixed case, home-network addresses, and relays that are known to hang
//! without ever sending EOSE. Every URL goes through [`RelayUrlFilter::check`]
//! before it can become a fan-out target.
//!
//! # Normalization Rules
//!
//! - Validate websocket scheme (wss:// or ws://) and structure via nostr-sdk
//! - Remove trailing slashes
//! - Lowercase the scheme and host
//!
//! # Filtering Rules
//!
//! URLs are rejected if they:
//! - point at localhost, loopback, private or link-local addresses
//! - point at .local (mDNS) hosts
//! - start with any configured blacklist prefix

use nostr_sdk::RelayUrl;

/// Relays known to hang or never acknowledge a subscription.
pub const DEFAULT_BLACKLIST: &[&str] = &[
    "wss://nostr.mutinywallet.com",
    "wss://brb.io",
    "wss://relay.current.fyi",
];

/// Result of URL normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NormalizeResult {
    /// URL is valid and normalized.
    Ok(String),
    /// URL is syntactically invalid.
    Invalid(String),
    /// URL matches a blocklist pattern.
    Blocked(String),
}

impl NormalizeResult {
    /// Returns the normalized URL if valid.
    pub fn ok(self) -> Option<String> {
        match self {
            Self::Ok(url) => Some(url),
            _ => None,
        }
    }

    /// Returns true if the URL is valid.
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok(_))
    }
}

/// Normalize a relay URL without applying any blacklist prefix.
///
/// ```ignore
/// assert_eq!(
///     normalize_relay_url("wss://Relay.Example.COM/").ok(),
///     Some("wss://relay.example.com".to_string())
/// );
/// ```
pub fn normalize_relay_url(url: &str) -> NormalizeResult {
    let url = url.trim();

    if !url.starts_with("wss://") && !url.starts_with("ws://") {
        return NormalizeResult::Invalid("URL must start with wss:// or ws://".to_string());
    }

    let parsed = match RelayUrl::parse(url) {
        Ok(u) => u,
        Err(e) => return NormalizeResult::Invalid(format!("Invalid relay URL: {}", e)),
    };

    let mut normalized = parsed.to_string();
    while normalized.ends_with('/') {
        normalized.pop();
    }

    if let Some(reason) = check_local(&normalized) {
        return NormalizeResult::Blocked(reason);
    }

    NormalizeResult::Ok(normalized)
}

/// Normalizer plus a prefix blacklist.
#[derive(Debug, Clone)]
pub struct RelayUrlFilter {
    blacklist: Vec<String>,
}

impl Default for RelayUrlFilter {
    fn default() -> Self {
        Self::new(DEFAULT_BLACKLIST.iter().map(|s| s.to_string()))
    }
}

impl RelayUrlFilter {
    pub fn new<I>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        Self {
            blacklist: prefixes
                .into_iter()
                .map(|p| p.trim().to_lowercase())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    /// Normalize `url` and check it against the blacklist.
    pub fn check(&self, url: &str) -> NormalizeResult {
        let normalized = match normalize_relay_url(url) {
            NormalizeResult::Ok(u) => u,
            other => return other,
        };

        // Prefixes may be written with or without the trailing slash.
        let with_slash = format!("{}/", normalized);
        if let Some(prefix) = self
            .blacklist
            .iter()
            .find(|p| normalized.starts_with(p.as_str()) || with_slash.starts_with(p.as_str()))
        {
            return NormalizeResult::Blocked(format!("blacklisted prefix {}", prefix));
        }

        NormalizeResult::Ok(normalized)
    }

    /// Normalized, deduplicated, allowed URLs in input order.
    pub fn filter_list<'a, I>(&self, urls: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut out: Vec<String> = Vec::new();
        for url in urls {
            match self.check(url) {
                NormalizeResult::Ok(u) => {
                    if !out.contains(&u) {
                        out.push(u);
                    }
                }
                NormalizeResult::Invalid(reason) | NormalizeResult::Blocked(reason) => {
                    tracing::debug!("Dropping relay {}: {}", url, reason);
                }
            }
        }
        out
    }
}

/// Reject hosts that can only be reached from the operator's own network.
fn check_local(url: &str) -> Option<String> {
    let host = extract_host(url);
    let bare = host.rsplit_once(':').map(|(h, _)| h).unwrap_or(host);

    if bare == "localhost" || bare.ends_with(".localhost") {
        return Some("localhost not allowed".to_string());
    }
    if bare.starts_with("0.0.0.0") {
        return Some("unspecified address (0.0.0.0) not allowed".to_string());
    }
    if bare.starts_with("127.") {
        return Some("loopback address not allowed".to_string());
    }
    if bare.starts_with("192.168.") || bare.starts_with("10.") {
        return Some("private IP not allowed".to_string());
    }
    if bare.starts_with("172.")
        && let Some(second_octet) = bare.split('.').nth(1)
        && let Ok(n) = second_octet.parse::<u8>()
        && (16..=31).contains(&n)
    {
        return Some("private IP (172.16-31.x.x) not allowed".to_string());
    }
    if bare.starts_with("169.254.") {
        return Some("link-local address (169.254.x.x) not allowed".to_string());
    }
    if host.starts_with("[::1]") || host.starts_with("[fe80:") {
        return Some("IPv6 loopback/link-local not allowed".to_string());
    }
    if bare.ends_with(".local") {
        return Some(".local addresses not allowed".to_string());
    }
    if bare.is_empty() {
        return Some("empty host not allowed".to_string());
    }

    None
}

/// Extract the host (with port) portion from a websocket URL.
fn extract_host(url: &str) -> &str {
    let without_scheme = url
        .strip_prefix("wss://")
        .or_else(|| url.strip_prefix("ws://"))
        .unwrap_or(url);

    without_scheme.split('/').next().unwrap_or(without_scheme)
}
