//! Relay transport seam.
//!
//! The fetch engine only needs three things from the wire: open a session,
//! run a bounded query on it, and learn when the relay asks for interactive
//! authentication. [`RelayTransport`] and [`RelaySession`] capture exactly
//! that; [`SessionPool`] keeps sessions open between watch cycles.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use sitesync_core::RawEvent;
use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

/// Query filter understood by every transport.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchFilter {
    pub kinds: Vec<u16>,
    /// Hex pubkeys; empty means any author.
    pub authors: Vec<String>,
    pub since: Option<u64>,
    pub until: Option<u64>,
    pub limit: Option<usize>,
}

impl FetchFilter {
    pub fn kinds(kinds: &[u16]) -> Self {
        Self {
            kinds: kinds.to_vec(),
            ..Default::default()
        }
    }

    pub fn authors(mut self, authors: &[String]) -> Self {
        self.authors = authors.to_vec();
        self
    }

    pub fn since(mut self, since: u64) -> Self {
        self.since = Some(since);
        self
    }

    /// Returns true if `event` falls inside this filter.
    pub fn matches(&self, event: &RawEvent) -> bool {
        (self.kinds.is_empty() || self.kinds.contains(&event.kind))
            && (self.authors.is_empty() || self.authors.contains(&event.pubkey))
            && self.since.is_none_or(|since| event.created_at >= since)
            && self.until.is_none_or(|until| event.created_at <= until)
    }
}

/// An open connection to one relay.
#[async_trait]
pub trait RelaySession: Send + Sync {
    fn url(&self) -> &str;

    /// Run one query and return the stored events it matched.
    async fn query(&self, filter: &FetchFilter) -> Result<Vec<RawEvent>>;

    /// Cancelled once the relay demands authentication.
    fn challenge(&self) -> CancellationToken;

    async fn close(&self);
}

/// Opens relay sessions.
#[async_trait]
pub trait RelayTransport: Send + Sync {
    async fn connect(&self, url: &str, timeout: Duration) -> Result<Arc<dyn RelaySession>>;
}

/// Sessions kept open across watch cycles, keyed by relay URL.
pub struct SessionPool {
    transport: Arc<dyn RelayTransport>,
    connect_timeout: Duration,
    sessions: Mutex<HashMap<String, Arc<dyn RelaySession>>>,
}

impl SessionPool {
    pub fn new(transport: Arc<dyn RelayTransport>, connect_timeout: Duration) -> Self {
        Self {
            transport,
            connect_timeout,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Reuse the open session for `url`, or connect a new one.
    ///
    /// A session whose challenge has fired is never handed out again.
    pub async fn get(&self, url: &str) -> Result<Arc<dyn RelaySession>> {
        let existing = self.sessions.lock().get(url).cloned();
        if let Some(session) = existing {
            if !session.challenge().is_cancelled() {
                return Ok(session);
            }
            self.evict(url).await;
        }

        let session = tokio::time::timeout(
            self.connect_timeout,
            self.transport.connect(url, self.connect_timeout),
        )
        .await
        .map_err(|_| Error::Timeout(self.connect_timeout))??;

        self.sessions
            .lock()
            .insert(url.to_string(), Arc::clone(&session));
        Ok(session)
    }

    /// Drop and close the session for `url`, if any.
    pub async fn evict(&self, url: &str) {
        let removed = self.sessions.lock().remove(url);
        if let Some(session) = removed {
            tracing::debug!(relay = url, "Closing relay session");
            session.close().await;
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every open session.
    pub async fn close_all(&self) {
        let sessions: Vec<_> = self.sessions.lock().drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockRelay, MockTransport, event};
    use sitesync_core::KIND_NOTE;

    #[test]
    fn test_filter_matches() {
        let e = event(KIND_NOTE, &"a".repeat(64), 100, &[]);
        let filter = FetchFilter::kinds(&[KIND_NOTE]).since(50);
        assert!(filter.matches(&e));
        assert!(!FetchFilter::kinds(&[KIND_NOTE]).since(101).matches(&e));
        assert!(!filter.clone().authors(&["b".repeat(64)]).matches(&e));
        let bounded = FetchFilter {
            until: Some(99),
            ..filter
        };
        assert!(!bounded.matches(&e));
    }

    #[tokio::test]
    async fn test_pool_reuses_sessions() {
        let transport = Arc::new(MockTransport::new());
        transport.add_relay("wss://a.example.com", MockRelay::default());
        let pool = SessionPool::new(transport.clone(), Duration::from_secs(3));

        pool.get("wss://a.example.com").await.unwrap();
        pool.get("wss://a.example.com").await.unwrap();
        assert_eq!(transport.connects("wss://a.example.com"), 1);
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn test_pool_reconnects_after_challenge() {
        let transport = Arc::new(MockTransport::new());
        transport.add_relay("wss://a.example.com", MockRelay::default());
        let pool = SessionPool::new(transport.clone(), Duration::from_secs(3));

        let session = pool.get("wss://a.example.com").await.unwrap();
        session.challenge().cancel();
        pool.get("wss://a.example.com").await.unwrap();
        assert_eq!(transport.connects("wss://a.example.com"), 2);
    }

    #[tokio::test]
    async fn test_pool_connect_failure() {
        let transport = Arc::new(MockTransport::new());
        let pool = SessionPool::new(transport, Duration::from_secs(3));
        assert!(pool.get("wss://missing.example.com").await.is_err());
        assert!(pool.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pool_connect_timeout() {
        let transport = Arc::new(MockTransport::new());
        transport.add_relay(
            "wss://slow.example.com",
            MockRelay {
                connect_delay: Some(Duration::from_secs(60)),
                ..Default::default()
            },
        );
        let pool = SessionPool::new(transport, Duration::from_secs(3));
        let err = pool.get("wss://slow.example.com").await.err().unwrap();
        assert!(matches!(err, Error::Timeout(_)));
    }
}
