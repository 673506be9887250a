//! [`RelayTransport`] over nostr-sdk.
//!
//! Each session owns its own `Client` holding a single relay, so a relay that
//! demands NIP-42 authentication can be dropped without touching the others.
//! The client has no signer: reads are always unauthenticated, and an AUTH
//! challenge simply cancels the session's challenge token.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nostr_sdk::prelude::*;
use sitesync_core::RawEvent;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::transport::{FetchFilter, RelaySession, RelayTransport};
use crate::{Error, Result};

/// Transport that opens one nostr-sdk client per relay.
#[derive(Debug, Clone)]
pub struct NostrTransport {
    /// Upper bound on a single REQ; the fetch engine's own deadline is shorter.
    query_timeout: Duration,
}

impl NostrTransport {
    pub fn new(query_timeout: Duration) -> Self {
        Self { query_timeout }
    }
}

#[async_trait]
impl RelayTransport for NostrTransport {
    async fn connect(&self, url: &str, timeout: Duration) -> Result<Arc<dyn RelaySession>> {
        let client = Client::default();
        client.add_relay(url).await?;

        // Subscribe before connecting so an AUTH sent on connect is not missed.
        let notifications = client.notifications();
        let challenge = CancellationToken::new();
        let watcher = tokio::spawn(watch_notifications(
            url.to_string(),
            notifications,
            challenge.clone(),
        ));

        if let Err(e) = client.try_connect_relay(url, timeout).await {
            watcher.abort();
            let _ = client.disconnect().await;
            return Err(Error::relay(url, e));
        }

        tracing::debug!(relay = url, "Connected");
        Ok(Arc::new(NostrSession {
            url: url.to_string(),
            client,
            challenge,
            watcher,
            query_timeout: self.query_timeout,
        }))
    }
}

struct NostrSession {
    url: String,
    client: Client,
    challenge: CancellationToken,
    watcher: JoinHandle<()>,
    query_timeout: Duration,
}

#[async_trait]
impl RelaySession for NostrSession {
    fn url(&self) -> &str {
        &self.url
    }

    async fn query(&self, filter: &FetchFilter) -> Result<Vec<RawEvent>> {
        let events = self
            .client
            .fetch_events(to_nostr_filter(filter), self.query_timeout)
            .await
            .map_err(|e| Error::relay(&self.url, e))?;

        Ok(events.into_iter().map(|e| RawEvent::from(&e)).collect())
    }

    fn challenge(&self) -> CancellationToken {
        self.challenge.clone()
    }

    async fn close(&self) {
        self.watcher.abort();
        let _ = self.client.disconnect().await;
    }
}

/// Cancel `challenge` when the relay asks for authentication.
async fn watch_notifications(
    url: String,
    mut notifications: tokio::sync::broadcast::Receiver<RelayPoolNotification>,
    challenge: CancellationToken,
) {
    loop {
        let notification = match notifications.recv().await {
            Ok(n) => n,
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => return,
        };

        match notification {
            RelayPoolNotification::Message { message, .. } => match message {
                RelayMessage::Auth { .. } => {
                    tracing::debug!(relay = %url, "Relay sent AUTH challenge");
                    challenge.cancel();
                    return;
                }
                RelayMessage::Closed {
                    message: closed_msg,
                    ..
                } if closed_msg.to_lowercase().contains("auth") => {
                    tracing::debug!(relay = %url, "Subscription closed: {}", closed_msg);
                    challenge.cancel();
                    return;
                }
                RelayMessage::Notice(notice_msg) => {
                    tracing::trace!(relay = %url, "Notice: {}", notice_msg);
                }
                _ => {}
            },
            RelayPoolNotification::Shutdown => return,
            _ => {}
        }
    }
}

fn to_nostr_filter(filter: &FetchFilter) -> Filter {
    let mut out = Filter::new().kinds(filter.kinds.iter().map(|k| Kind::from(*k)));

    if !filter.authors.is_empty() {
        let authors: Vec<PublicKey> = filter
            .authors
            .iter()
            .filter_map(|a| match PublicKey::from_hex(a) {
                Ok(pk) => Some(pk),
                Err(e) => {
                    tracing::debug!("Skipping invalid author {}: {}", a, e);
                    None
                }
            })
            .collect();
        out = out.authors(authors);
    }
    if let Some(since) = filter.since {
        out = out.since(Timestamp::from(since));
    }
    if let Some(until) = filter.until {
        out = out.until(Timestamp::from(until));
    }
    if let Some(limit) = filter.limit {
        out = out.limit(limit);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_nostr_filter() {
        let pk = "35e433c42e5bb838daabd178d54620e427cccb214c55b95daac3dbd9506fbcaf";
        let filter = FetchFilter {
            kinds: vec![1, 30023],
            authors: vec![pk.to_string(), "bogus".to_string()],
            since: Some(10),
            until: Some(20),
            limit: Some(1000),
        };
        let out = to_nostr_filter(&filter);
        assert_eq!(out.limit, Some(1000));
        assert_eq!(out.since, Some(Timestamp::from(10)));
        assert_eq!(out.until, Some(Timestamp::from(20)));
        assert_eq!(out.authors.as_ref().map(|a| a.len()), Some(1));
        assert_eq!(out.kinds.as_ref().map(|k| k.len()), Some(2));
    }
}
