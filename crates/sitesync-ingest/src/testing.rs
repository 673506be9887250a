//! In-memory relays, event builders and a recording publisher for unit tests.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use nostr_sdk::prelude::{Keys, SecretKey};
use parking_lot::Mutex;
use sitesync_core::{KIND_RELAYS, KIND_SITE, RawEvent, SiteAddr};
use tokio_util::sync::CancellationToken;

use crate::relay::{FetchFilter, RelaySession, RelayTransport};
use crate::render::{Publisher, RenderScope};
use crate::{Error, Result};

/// Hex public key of the secret key `n` (`n` >= 1).
pub fn pubkey(n: u8) -> String {
    let secret = SecretKey::from_hex(&format!("{:064x}", n)).expect("secret key in range");
    Keys::new(secret).public_key().to_hex()
}

/// Build an event with an id derived from its contents.
pub fn event(kind: u16, pubkey: &str, created_at: u64, tags: &[&[&str]]) -> RawEvent {
    let tags: Vec<Vec<String>> = tags
        .iter()
        .map(|tag| tag.iter().map(|v| v.to_string()).collect())
        .collect();

    let mut hasher = DefaultHasher::new();
    (kind, pubkey, created_at, &tags).hash(&mut hasher);
    let id = format!("{:016x}", hasher.finish()).repeat(4);

    RawEvent {
        id,
        pubkey: pubkey.to_string(),
        created_at,
        kind,
        tags,
        content: String::new(),
    }
}

/// Site configuration event with one `p` tag per contributor.
pub fn site_event(owner: &str, identifier: &str, created_at: u64, contributors: &[&str]) -> RawEvent {
    let mut tags: Vec<Vec<&str>> = vec![vec!["d", identifier]];
    tags.extend(contributors.iter().map(|c| vec!["p", *c]));
    let tags: Vec<&[&str]> = tags.iter().map(Vec::as_slice).collect();
    event(KIND_SITE, owner, created_at, &tags)
}

/// Relay list naming `urls` as unmarked (read and write) relays.
pub fn relay_list(author: &str, created_at: u64, urls: &[&str]) -> RawEvent {
    let tags: Vec<Vec<&str>> = urls.iter().map(|u| vec!["r", *u]).collect();
    let tags: Vec<&[&str]> = tags.iter().map(Vec::as_slice).collect();
    event(KIND_RELAYS, author, created_at, &tags)
}

/// Scripted behaviour of one fake relay.
#[derive(Debug, Clone, Default)]
pub struct MockRelay {
    pub events: Vec<RawEvent>,
    pub connect_delay: Option<Duration>,
    pub query_delay: Option<Duration>,
    /// Queries numbered at or past this never answer.
    pub hang_after: Option<usize>,
    /// Queries numbered at or past this raise an auth challenge and never answer.
    pub challenge_after: Option<usize>,
    /// Serve pages as if `until` were absent.
    pub ignore_until: bool,
}

#[derive(Default)]
struct MockState {
    relays: Mutex<HashMap<String, MockRelay>>,
    connects: Mutex<HashMap<String, usize>>,
    queries: Mutex<Vec<(String, FetchFilter)>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// Transport over a set of in-memory relays keyed by URL.
#[derive(Default)]
pub struct MockTransport {
    state: Arc<MockState>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_relay(&self, url: &str, relay: MockRelay) {
        self.state.relays.lock().insert(url.to_string(), relay);
    }

    /// Store an event on an existing relay.
    pub fn publish(&self, url: &str, event: RawEvent) {
        self.state
            .relays
            .lock()
            .entry(url.to_string())
            .or_default()
            .events
            .push(event);
    }

    /// Change how an existing relay behaves from its next query on.
    pub fn update_relay(&self, url: &str, f: impl FnOnce(&mut MockRelay)) {
        if let Some(relay) = self.state.relays.lock().get_mut(url) {
            f(relay);
        }
    }

    pub fn connects(&self, url: &str) -> usize {
        self.state.connects.lock().get(url).copied().unwrap_or(0)
    }

    /// Filters sent to `url`, in order.
    pub fn queries(&self, url: &str) -> Vec<FetchFilter> {
        self.state
            .queries
            .lock()
            .iter()
            .filter(|(u, _)| u == url)
            .map(|(_, f)| f.clone())
            .collect()
    }

    pub fn max_in_flight(&self) -> usize {
        self.state.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RelayTransport for MockTransport {
    async fn connect(&self, url: &str, _timeout: Duration) -> Result<Arc<dyn RelaySession>> {
        let delay = match self.state.relays.lock().get(url) {
            Some(relay) => relay.connect_delay,
            None => return Err(Error::relay(url, "connection refused")),
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        *self.state.connects.lock().entry(url.to_string()).or_default() += 1;

        Ok(Arc::new(MockSession {
            url: url.to_string(),
            state: Arc::clone(&self.state),
            challenge: CancellationToken::new(),
            queries: AtomicUsize::new(0),
        }))
    }
}

struct MockSession {
    url: String,
    state: Arc<MockState>,
    challenge: CancellationToken,
    queries: AtomicUsize,
}

#[async_trait]
impl RelaySession for MockSession {
    fn url(&self) -> &str {
        &self.url
    }

    async fn query(&self, filter: &FetchFilter) -> Result<Vec<RawEvent>> {
        let n = self.queries.fetch_add(1, Ordering::SeqCst);
        self.state
            .queries
            .lock()
            .push((self.url.clone(), filter.clone()));
        let relay = self
            .state
            .relays
            .lock()
            .get(&self.url)
            .cloned()
            .unwrap_or_default();

        if relay.challenge_after.is_some_and(|c| n >= c) {
            self.challenge.cancel();
            return std::future::pending().await;
        }
        if relay.hang_after.is_some_and(|h| n >= h) {
            return std::future::pending().await;
        }

        let now = self.state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = relay.query_delay {
            tokio::time::sleep(delay).await;
        }
        self.state.in_flight.fetch_sub(1, Ordering::SeqCst);

        let effective = if relay.ignore_until {
            FetchFilter {
                until: None,
                ..filter.clone()
            }
        } else {
            filter.clone()
        };
        let mut matched: Vec<RawEvent> = relay
            .events
            .into_iter()
            .filter(|e| effective.matches(e))
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            matched.truncate(limit);
        }
        Ok(matched)
    }

    fn challenge(&self) -> CancellationToken {
        self.challenge.clone()
    }

    async fn close(&self) {}
}

type RenderHook = Box<dyn FnMut() + Send>;

/// Publisher that records every call and can be told to fail.
#[derive(Default)]
pub struct RecordingPublisher {
    calls: Mutex<Vec<(SiteAddr, RenderScope, String)>>,
    fail: AtomicBool,
    hook: Mutex<Option<RenderHook>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<(SiteAddr, RenderScope, String)> {
        self.calls.lock().clone()
    }

    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Run `f` in the middle of every render.
    pub fn on_render(&self, f: impl FnMut() + Send + 'static) {
        *self.hook.lock() = Some(Box::new(f));
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn render_and_publish(
        &self,
        site: &SiteAddr,
        scope: &RenderScope,
        domain: &str,
    ) -> Result<()> {
        self.calls
            .lock()
            .push((site.clone(), scope.clone(), domain.to_string()));
        if let Some(hook) = self.hook.lock().as_mut() {
            hook();
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Render("scripted failure".to_string()));
        }
        Ok(())
    }
}
