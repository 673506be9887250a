//! Relay Fetch Engine.
//!
//! Pulls every event matching `kinds`/`authors` since a watermark from one
//! relay by paging backwards in time: each page asks for `until = cursor`,
//! and the cursor then moves just below the oldest event of the page. An
//! empty page means the whole `since..now` range has been seen.
//!
//! Every page is raced against two abort signals, the session's AUTH
//! challenge and a per-batch deadline. An aborted fetch keeps what it
//! collected but reports `covered = false`, so the caller does not advance
//! any watermark for that relay.
//!
//! [`FetchEngine::scan`] runs one task per relay target, at most
//! `max_concurrent_relays` at a time, each draining its author chunks in
//! order on a single session.

use std::sync::Arc;
use std::time::Duration;

use sitesync_core::{CONTENT_KINDS, RawEvent, metrics};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::relay::{FetchFilter, RelaySession, SessionPool};

/// Fetch engine tuning.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Events requested per page.
    pub page_size: usize,
    /// Authors per REQ filter.
    pub author_batch: usize,
    /// Deadline for one author batch on one relay.
    pub batch_deadline: Duration,
    /// Relay tasks allowed in flight at once.
    pub max_concurrent_relays: usize,
    /// Kinds requested from contributors.
    pub kinds: Vec<u16>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            page_size: 1000,
            author_batch: 100,
            batch_deadline: Duration::from_secs(20),
            max_concurrent_relays: 100,
            kinds: CONTENT_KINDS.to_vec(),
        }
    }
}

/// Why a fetch stopped before covering its range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortCause {
    /// The relay asked for authentication.
    Challenge,
    /// The batch deadline passed.
    Deadline,
}

impl AbortCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Challenge => "challenge",
            Self::Deadline => "deadline",
        }
    }
}

/// Abort signals raced against every page of a fetch.
#[derive(Debug, Clone)]
pub struct AbortContext {
    pub challenge: CancellationToken,
    pub deadline: Instant,
}

impl AbortContext {
    pub fn new(challenge: CancellationToken, timeout: Duration) -> Self {
        Self {
            challenge,
            deadline: Instant::now() + timeout,
        }
    }
}

/// Result of paging one filter on one relay.
#[derive(Debug, Default)]
pub struct FetchOutcome {
    pub events: Vec<RawEvent>,
    /// True only if pagination reached the end of the range.
    pub covered: bool,
    pub aborted: Option<AbortCause>,
    /// Query error that ended the fetch, if any.
    pub error: Option<String>,
}

/// One relay's share of a fan-out plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayTarget {
    pub url: String,
    pub authors: Vec<String>,
    /// Minimum watermark across `authors`.
    pub since: u64,
}

/// What one relay task produced.
#[derive(Debug)]
pub struct RelayScan {
    pub url: String,
    pub authors: Vec<String>,
    pub events: Vec<RawEvent>,
    pub covered: bool,
    pub aborted: Option<AbortCause>,
    pub error: Option<String>,
}

impl RelayScan {
    fn outcome_label(&self) -> &'static str {
        match (self.covered, self.aborted, &self.error) {
            (true, _, _) => "covered",
            (false, Some(cause), _) => cause.as_str(),
            (false, None, Some(_)) => "failed",
            (false, None, None) => "uncovered",
        }
    }
}

/// Fetch engine sharing one session pool.
#[derive(Clone)]
pub struct FetchEngine {
    pool: Arc<SessionPool>,
    config: FetchConfig,
}

impl FetchEngine {
    pub fn new(pool: Arc<SessionPool>, config: FetchConfig) -> Self {
        Self { pool, config }
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    pub fn pool(&self) -> &SessionPool {
        &self.pool
    }

    /// Fetch content from `authors` published at or after `since`.
    pub async fn fetch(
        &self,
        session: &dyn RelaySession,
        authors: &[String],
        since: u64,
        abort: &AbortContext,
    ) -> FetchOutcome {
        let filter = FetchFilter::kinds(&self.config.kinds)
            .authors(authors)
            .since(since);
        self.paginate(session, filter, abort).await
    }

    /// Page backwards through `base` until an empty page or an abort.
    pub async fn paginate(
        &self,
        session: &dyn RelaySession,
        base: FetchFilter,
        abort: &AbortContext,
    ) -> FetchOutcome {
        let since = base.since.unwrap_or(0);
        let mut out = FetchOutcome::default();
        let mut until: Option<u64> = None;

        loop {
            let filter = FetchFilter {
                until,
                limit: Some(self.config.page_size),
                ..base.clone()
            };

            let page = tokio::select! {
                biased;
                _ = abort.challenge.cancelled() => {
                    out.aborted = Some(AbortCause::Challenge);
                    return out;
                }
                _ = tokio::time::sleep_until(abort.deadline) => {
                    out.aborted = Some(AbortCause::Deadline);
                    return out;
                }
                page = session.query(&filter) => page,
            };
            metrics::increment("relay_pages_total", 1);

            let page = match page {
                Ok(page) => page,
                Err(e) => {
                    tracing::debug!(relay = session.url(), "Query failed: {}", e);
                    out.error = Some(e.to_string());
                    return out;
                }
            };

            let Some(oldest) = page.iter().map(|e| e.created_at).min() else {
                out.covered = true;
                return out;
            };
            out.events.extend(page);

            // A relay that ignores `until` would repeat the same page forever.
            let mut next = oldest.saturating_sub(1);
            if let Some(current) = until
                && next >= current
            {
                next = current.saturating_sub(1);
            }

            if next < since || next == 0 {
                out.covered = true;
                return out;
            }
            until = Some(next);
        }
    }

    /// Scan every target concurrently, bounded by `max_concurrent_relays`.
    ///
    /// Returns one [`RelayScan`] per target whose task completed.
    pub async fn scan(&self, targets: Vec<RelayTarget>) -> Vec<RelayScan> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_relays.max(1)));
        let mut tasks = JoinSet::new();

        for target in targets {
            let semaphore = Arc::clone(&semaphore);
            let engine = self.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                engine.scan_relay(target).await
            });
        }

        let mut scans = Vec::new();
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(scan) => {
                    metrics::increment_labeled(
                        "relay_scans_total",
                        "outcome",
                        scan.outcome_label(),
                        1,
                    );
                    metrics::increment("relay_events_fetched_total", scan.events.len() as u64);
                    scans.push(scan);
                }
                Err(e) => tracing::error!("Relay task failed: {}", e),
            }
        }
        scans
    }

    /// Drain one relay's author chunks in order on a single session.
    async fn scan_relay(&self, target: RelayTarget) -> RelayScan {
        let RelayTarget {
            url,
            authors,
            since,
        } = target;
        let mut scan = RelayScan {
            url,
            authors,
            events: Vec::new(),
            covered: false,
            aborted: None,
            error: None,
        };

        let session = match self.pool.get(&scan.url).await {
            Ok(session) => session,
            Err(e) => {
                tracing::debug!(relay = %scan.url, "Connect failed: {}", e);
                scan.error = Some(e.to_string());
                return scan;
            }
        };

        for chunk in scan.authors.chunks(self.config.author_batch.max(1)) {
            let abort = AbortContext::new(session.challenge(), self.config.batch_deadline);
            let outcome = self.fetch(session.as_ref(), chunk, since, &abort).await;
            scan.events.extend(outcome.events);

            if !outcome.covered {
                if outcome.aborted != Some(AbortCause::Deadline) {
                    self.pool.evict(&scan.url).await;
                }
                tracing::debug!(
                    relay = %scan.url,
                    aborted = ?outcome.aborted,
                    "Relay not covered this cycle"
                );
                scan.aborted = outcome.aborted;
                scan.error = outcome.error;
                return scan;
            }
        }

        scan.covered = true;
        scan
    }

    /// Page `base` on each of `urls` concurrently under one `wait` deadline.
    ///
    /// `covered` is true only if every relay was covered.
    pub async fn query_relays(
        &self,
        urls: &[String],
        base: FetchFilter,
        wait: Duration,
    ) -> (Vec<RawEvent>, bool) {
        let mut tasks = JoinSet::new();
        for url in urls {
            let engine = self.clone();
            let url = url.clone();
            let base = base.clone();
            tasks.spawn(async move {
                let session = match engine.pool.get(&url).await {
                    Ok(session) => session,
                    Err(e) => {
                        tracing::warn!(relay = %url, "Connect failed: {}", e);
                        return FetchOutcome::default();
                    }
                };
                let abort = AbortContext::new(session.challenge(), wait);
                let outcome = engine.paginate(session.as_ref(), base, &abort).await;
                if !outcome.covered {
                    tracing::warn!(
                        relay = %url,
                        aborted = ?outcome.aborted,
                        error = ?outcome.error,
                        "Query not covered"
                    );
                    if outcome.aborted != Some(AbortCause::Deadline) {
                        engine.pool.evict(&url).await;
                    }
                }
                outcome
            });
        }

        let mut events = Vec::new();
        let mut covered = !urls.is_empty();
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(outcome) => {
                    covered &= outcome.covered;
                    events.extend(outcome.events);
                }
                Err(e) => {
                    tracing::error!("Query task failed: {}", e);
                    covered = false;
                }
            }
        }
        (events, covered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::RelayTransport;
    use crate::testing::{MockRelay, MockTransport, event, pubkey};
    use sitesync_core::KIND_NOTE;

    const URL: &str = "wss://relay.example.com";

    fn engine(transport: Arc<MockTransport>, config: FetchConfig) -> FetchEngine {
        let pool = Arc::new(SessionPool::new(transport, Duration::from_secs(3)));
        FetchEngine::new(pool, config)
    }

    fn notes(author: &str, times: impl IntoIterator<Item = u64>) -> Vec<RawEvent> {
        times
            .into_iter()
            .map(|t| event(KIND_NOTE, author, t, &[]))
            .collect()
    }

    #[tokio::test]
    async fn test_paginates_until_empty_page() {
        let author = pubkey(1);
        let transport = Arc::new(MockTransport::new());
        transport.add_relay(
            URL,
            MockRelay {
                events: notes(&author, 1..=25),
                ..Default::default()
            },
        );
        let engine = engine(
            transport.clone(),
            FetchConfig {
                page_size: 10,
                ..Default::default()
            },
        );

        let session = transport.connect(URL, Duration::from_secs(1)).await.unwrap();
        let abort = AbortContext::new(session.challenge(), Duration::from_secs(20));
        let outcome = engine
            .fetch(session.as_ref(), std::slice::from_ref(&author), 5, &abort)
            .await;

        assert!(outcome.covered);
        assert_eq!(outcome.events.len(), 21);
        assert!(outcome.events.iter().all(|e| e.created_at >= 5));

        let untils: Vec<_> = transport.queries(URL).iter().map(|f| f.until).collect();
        assert_eq!(untils, vec![None, Some(15), Some(5)]);
    }

    #[tokio::test]
    async fn test_empty_relay_is_covered() {
        let transport = Arc::new(MockTransport::new());
        transport.add_relay(URL, MockRelay::default());
        let engine = engine(transport.clone(), FetchConfig::default());

        let scans = engine
            .scan(vec![RelayTarget {
                url: URL.to_string(),
                authors: vec![pubkey(1)],
                since: 0,
            }])
            .await;
        assert_eq!(scans.len(), 1);
        assert!(scans[0].covered);
    }

    #[tokio::test]
    async fn test_stuck_cursor_moves_down() {
        let author = pubkey(1);
        let transport = Arc::new(MockTransport::new());
        transport.add_relay(
            URL,
            MockRelay {
                events: notes(&author, [100, 100, 100]),
                ignore_until: true,
                ..Default::default()
            },
        );
        let engine = engine(
            transport.clone(),
            FetchConfig {
                page_size: 2,
                ..Default::default()
            },
        );
        let session = transport.connect(URL, Duration::from_secs(1)).await.unwrap();
        let abort = AbortContext::new(session.challenge(), Duration::from_secs(20));
        let outcome = engine
            .fetch(session.as_ref(), std::slice::from_ref(&author), 97, &abort)
            .await;

        // 99, then 98, then 97, then 96 < since.
        assert!(outcome.covered);
        assert_eq!(transport.queries(URL).len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_returns_partial_uncovered() {
        let author = pubkey(1);
        let transport = Arc::new(MockTransport::new());
        transport.add_relay(
            URL,
            MockRelay {
                events: notes(&author, 1..=5),
                hang_after: Some(1),
                ..Default::default()
            },
        );
        let engine = engine(
            transport.clone(),
            FetchConfig {
                page_size: 3,
                ..Default::default()
            },
        );

        let started = Instant::now();
        let scans = engine
            .scan(vec![RelayTarget {
                url: URL.to_string(),
                authors: vec![author],
                since: 0,
            }])
            .await;

        assert_eq!(scans.len(), 1);
        assert!(!scans[0].covered);
        assert_eq!(scans[0].aborted, Some(AbortCause::Deadline));
        assert_eq!(scans[0].events.len(), 3);
        assert!(started.elapsed() >= Duration::from_secs(20));
        // Timed-out sessions stay pooled.
        assert_eq!(engine.pool().len(), 1);
    }

    #[tokio::test]
    async fn test_challenge_aborts_and_evicts() {
        let author = pubkey(1);
        let transport = Arc::new(MockTransport::new());
        transport.add_relay(
            URL,
            MockRelay {
                events: notes(&author, 1..=5),
                challenge_after: Some(1),
                ..Default::default()
            },
        );
        let engine = engine(
            transport.clone(),
            FetchConfig {
                page_size: 3,
                ..Default::default()
            },
        );

        let scans = engine
            .scan(vec![RelayTarget {
                url: URL.to_string(),
                authors: vec![author],
                since: 0,
            }])
            .await;

        assert!(!scans[0].covered);
        assert_eq!(scans[0].aborted, Some(AbortCause::Challenge));
        assert_eq!(scans[0].events.len(), 3);
        assert!(engine.pool().is_empty());
    }

    #[tokio::test]
    async fn test_connect_failure_is_uncovered() {
        let transport = Arc::new(MockTransport::new());
        let engine = engine(transport, FetchConfig::default());
        let scans = engine
            .scan(vec![RelayTarget {
                url: "wss://down.example.com".to_string(),
                authors: vec![pubkey(1)],
                since: 0,
            }])
            .await;
        assert!(!scans[0].covered);
        assert!(scans[0].error.is_some());
    }

    #[tokio::test]
    async fn test_authors_chunked_sequentially() {
        let authors: Vec<String> = (1..=5).map(pubkey).collect();
        let transport = Arc::new(MockTransport::new());
        transport.add_relay(URL, MockRelay::default());
        let engine = engine(
            transport.clone(),
            FetchConfig {
                author_batch: 2,
                ..Default::default()
            },
        );

        engine
            .scan(vec![RelayTarget {
                url: URL.to_string(),
                authors: authors.clone(),
                since: 0,
            }])
            .await;

        let sizes: Vec<_> = transport
            .queries(URL)
            .iter()
            .map(|f| f.authors.len())
            .collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        assert_eq!(transport.connects(URL), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_ceiling() {
        let transport = Arc::new(MockTransport::new());
        let mut targets = Vec::new();
        for i in 0..6 {
            let url = format!("wss://r{}.example.com", i);
            transport.add_relay(
                &url,
                MockRelay {
                    query_delay: Some(Duration::from_secs(1)),
                    ..Default::default()
                },
            );
            targets.push(RelayTarget {
                url,
                authors: vec![pubkey(1)],
                since: 0,
            });
        }
        let engine = engine(
            transport.clone(),
            FetchConfig {
                max_concurrent_relays: 2,
                ..Default::default()
            },
        );

        let started = Instant::now();
        let scans = engine.scan(targets).await;
        assert_eq!(scans.len(), 6);
        assert!(scans.iter().all(|s| s.covered));
        assert_eq!(transport.max_in_flight(), 2);
        // Three waves of one empty page each.
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(3) && elapsed < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_query_relays_requires_all_covered() {
        let transport = Arc::new(MockTransport::new());
        transport.add_relay(URL, MockRelay::default());
        let engine = engine(transport, FetchConfig::default());

        let (_, covered) = engine
            .query_relays(&[URL.to_string()], FetchFilter::kinds(&[KIND_NOTE]), Duration::from_secs(30))
            .await;
        assert!(covered);

        let (_, covered) = engine
            .query_relays(
                &[URL.to_string(), "wss://down.example.com".to_string()],
                FetchFilter::kinds(&[KIND_NOTE]),
                Duration::from_secs(30),
            )
            .await;
        assert!(!covered);
    }
}
