//! Change Watcher.
//!
//! One cycle:
//!
//! 1. Load the deployed domains.
//! 2. Pull site configurations from the registry relays; a version newer
//!    than a domain's `rendered` watermark marks a full rebuild.
//! 3. Update the author index from the site snapshots.
//! 4. Resolve write relays for new authors and scan every relay.
//! 5. Turn fetched events into rebuild marks and queue rows.
//! 6. Advance relay cursors (covered relays only) and the `fetched`
//!    watermark of every indexed domain to the cycle start minus the sync
//!    buffer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use sitesync_core::{KIND_SITE, RawEvent, SiteAddr, metrics};
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::classify::{Classified, LatestVersions, classify};
use crate::clock::Clock;
use crate::fetch::{FetchConfig, FetchEngine};
use crate::relay::{DEFAULT_BLACKLIST, FetchFilter, RelayTransport, RelayUrlFilter, SessionPool};
use crate::router::{self, AuthorIndex, OutboxConfig, OutboxResolver};
use crate::site::SiteSnapshot;
use crate::store::{DomainRecord, Store};

/// Relays that carry every site configuration.
pub const DEFAULT_REGISTRY_RELAYS: &[&str] = &["wss://relay.npubpro.com"];

/// Change Watcher configuration.
#[derive(Debug, Clone)]
pub struct WatchConfig {
    pub registry_relays: Vec<String>,
    pub outbox: OutboxConfig,
    /// Relay URL prefixes never contacted.
    pub blacklist: Vec<String>,
    pub fetch: FetchConfig,
    pub connect_timeout: Duration,
    /// Deadline for one registry query.
    pub registry_wait: Duration,
    /// Subtracted from the cycle start when advancing watermarks.
    pub sync_buffer: Duration,
    pub min_cycle: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            registry_relays: DEFAULT_REGISTRY_RELAYS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            outbox: OutboxConfig::default(),
            blacklist: DEFAULT_BLACKLIST.iter().map(|s| s.to_string()).collect(),
            fetch: FetchConfig::default(),
            connect_timeout: Duration::from_secs(3),
            registry_wait: Duration::from_secs(30),
            sync_buffer: Duration::from_secs(60),
            min_cycle: Duration::from_secs(10),
        }
    }
}

/// What one cycle did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub domains: usize,
    /// Site configuration events for deployed sites.
    pub site_events: usize,
    /// Snapshots replaced by a newer version.
    pub sites_updated: usize,
    pub authors: usize,
    pub relays_covered: usize,
    pub relays_uncovered: usize,
    pub events_fetched: usize,
    /// Events left after dedup.
    pub events_new: usize,
    pub enqueued: usize,
    pub rebuilds_marked: usize,
    pub skipped: usize,
}

/// Deployed domains keyed by the site they serve.
type DomainsBySite = HashMap<SiteAddr, Vec<DomainRecord>>;

/// Snapshot version and contributors currently registered in the index.
#[derive(Debug)]
struct IndexedSite {
    created_at: u64,
    contributors: Vec<String>,
}

pub struct Watcher {
    config: WatchConfig,
    store: Arc<Store>,
    engine: FetchEngine,
    resolver: OutboxResolver,
    clock: Arc<dyn Clock>,
    index: AuthorIndex,
    sites: HashMap<SiteAddr, SiteSnapshot>,
    indexed: HashMap<SiteAddr, IndexedSite>,
    versions: LatestVersions,
    /// Lower bound of the next registry scan; 0 until one was covered.
    registry_since: u64,
}

impl Watcher {
    /// Create a watcher, restoring relay cursors persisted by earlier runs.
    pub fn new(
        config: WatchConfig,
        store: Arc<Store>,
        transport: Arc<dyn RelayTransport>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let pool = Arc::new(SessionPool::new(transport, config.connect_timeout));
        let engine = FetchEngine::new(pool, config.fetch.clone());
        let resolver = OutboxResolver::new(
            config.outbox.clone(),
            RelayUrlFilter::new(config.blacklist.iter().cloned()),
        );

        let cursors = store.load_author_cursors()?;
        tracing::info!(authors = cursors.len(), "Restored relay cursors");

        Ok(Self {
            config,
            store,
            engine,
            resolver,
            clock,
            index: AuthorIndex::with_cursors(cursors),
            sites: HashMap::new(),
            indexed: HashMap::new(),
            versions: LatestVersions::new(),
            registry_since: 0,
        })
    }

    /// Run one watch cycle.
    pub async fn run_once(&mut self) -> Result<CycleReport> {
        let cycle_start = self.clock.now();
        let fetched_mark = cycle_start.saturating_sub(self.config.sync_buffer.as_secs());
        let mut report = CycleReport::default();

        let domains = self.store.list_active_domains()?;
        report.domains = domains.len();
        let by_site = group_by_site(&domains);

        self.scan_registry(&by_site, fetched_mark, &mut report)
            .await?;
        self.reindex(&by_site);
        self.resolve_relays().await;

        let targets = router::plan(&self.index);
        metrics::set_gauge("relay_targets", targets.len() as f64);
        tracing::debug!(
            relays = targets.len(),
            authors = self.index.len(),
            "Scanning contributor relays"
        );
        let mut scans = self.engine.scan(targets).await;

        let events: Vec<RawEvent> = scans
            .iter_mut()
            .flat_map(|scan| std::mem::take(&mut scan.events))
            .collect();
        report.events_fetched = events.len();
        self.apply_events(events, &by_site, cycle_start, &mut report)?;

        report.relays_covered = router::record_coverage(&mut self.index, &scans, cycle_start);
        report.relays_uncovered = scans.len() - report.relays_covered;
        self.store.save_author_cursors(&self.index.cursors())?;

        // Domains whose site is not indexed yet keep their watermark so they
        // still backfill once it is.
        let names: Vec<String> = domains
            .into_iter()
            .filter(|d| self.indexed.contains_key(&site_key(&d.site)))
            .map(|d| d.domain)
            .collect();
        self.store.set_fetched(&names, fetched_mark)?;

        report.authors = self.index.len();
        metrics::set_gauge("watch_authors", report.authors as f64);
        metrics::set_gauge("watch_sites_indexed", self.indexed.len() as f64);
        Ok(report)
    }

    /// Run cycles until `shutdown` is cancelled, at most one per `min_cycle`.
    pub async fn run(&mut self, shutdown: CancellationToken) {
        tracing::info!(
            registry = ?self.config.registry_relays,
            min_cycle = ?self.config.min_cycle,
            "Change watcher started"
        );

        loop {
            let started = self.clock.now();
            let timer = Instant::now();
            let result = tokio::select! {
                _ = shutdown.cancelled() => break,
                result = self.run_once() => result,
            };
            metrics::record_duration("watch_cycle_duration_seconds", timer.elapsed());

            match result {
                Ok(report) => {
                    metrics::increment("watch_cycles_total", 1);
                    tracing::info!(
                        domains = report.domains,
                        sites_updated = report.sites_updated,
                        fetched = report.events_fetched,
                        new = report.events_new,
                        enqueued = report.enqueued,
                        rebuilds = report.rebuilds_marked,
                        covered = report.relays_covered,
                        uncovered = report.relays_uncovered,
                        "Watch cycle complete"
                    );
                }
                Err(e) => {
                    metrics::increment("watch_cycle_errors_total", 1);
                    tracing::error!("Watch cycle failed: {}", e);
                }
            }

            let elapsed = Duration::from_secs(self.clock.now().saturating_sub(started));
            if let Some(rest) = self.config.min_cycle.checked_sub(elapsed)
                && !rest.is_zero()
            {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = self.clock.sleep(rest) => {}
                }
            }
        }

        self.engine.pool().close_all().await;
        tracing::info!("Change watcher stopped");
    }

    /// Pull new site configurations, plus the current one of every deployed
    /// site that has no snapshot yet.
    async fn scan_registry(
        &mut self,
        by_site: &DomainsBySite,
        fetched_mark: u64,
        report: &mut CycleReport,
    ) -> Result<()> {
        let mut covered = true;

        if self.registry_since > 0 {
            let filter = FetchFilter::kinds(&[KIND_SITE]).since(self.registry_since);
            let (events, ok) = self
                .engine
                .query_relays(&self.config.registry_relays, filter, self.config.registry_wait)
                .await;
            covered &= ok;
            self.apply_site_configs(events, by_site, report)?;
        }

        let mut owners: Vec<String> = by_site
            .keys()
            .filter(|addr| !self.sites.contains_key(*addr))
            .map(|addr| addr.pubkey.clone())
            .collect();
        owners.sort();
        owners.dedup();
        if !owners.is_empty() {
            tracing::debug!(owners = owners.len(), "Loading missing site configurations");
            let filter = FetchFilter::kinds(&[KIND_SITE]).authors(&owners);
            let (events, ok) = self
                .engine
                .query_relays(&self.config.registry_relays, filter, self.config.registry_wait)
                .await;
            covered &= ok;
            self.apply_site_configs(events, by_site, report)?;
        }

        if covered {
            self.registry_since = self.registry_since.max(fetched_mark);
        } else {
            tracing::warn!(
                since = self.registry_since,
                "Registry scan incomplete, repeating next cycle"
            );
        }
        Ok(())
    }

    fn apply_site_configs(
        &mut self,
        mut events: Vec<RawEvent>,
        by_site: &DomainsBySite,
        report: &mut CycleReport,
    ) -> Result<()> {
        events.sort_by_key(|e| e.created_at);

        for event in events {
            let snapshot = match classify(&event) {
                Ok(Classified::SiteConfig(snapshot)) => *snapshot,
                Ok(_) => continue,
                Err(e) => {
                    tracing::debug!(id = %event.id, "Skipping malformed site event: {}", e);
                    skip(report, "malformed");
                    continue;
                }
            };
            let Some(domains) = by_site.get(&snapshot.addr) else {
                continue;
            };
            report.site_events += 1;
            metrics::increment("watch_site_events_total", 1);

            for record in domains {
                if snapshot.created_at > record.rendered {
                    self.store.set_updated(&record.domain, snapshot.created_at)?;
                    mark_rebuild(report, &record.domain, snapshot.created_at, "site");
                }
            }

            let newer = self
                .sites
                .get(&snapshot.addr)
                .is_none_or(|current| snapshot.created_at > current.created_at);
            if newer {
                report.sites_updated += 1;
                self.sites.insert(snapshot.addr.clone(), snapshot);
            }
        }
        Ok(())
    }

    /// Bring the author index in line with the deployed site snapshots.
    fn reindex(&mut self, by_site: &DomainsBySite) {
        self.sites.retain(|addr, _| by_site.contains_key(addr));

        let gone: Vec<SiteAddr> = self
            .indexed
            .keys()
            .filter(|addr| !self.sites.contains_key(*addr))
            .cloned()
            .collect();
        for addr in gone {
            if let Some(site) = self.indexed.remove(&addr) {
                self.index.remove_site(&addr, &site.contributors);
                tracing::info!(site = %addr, "Site no longer deployed");
            }
        }

        for (addr, snapshot) in &self.sites {
            let fetched = by_site
                .get(addr)
                .and_then(|domains| domains.iter().map(|d| d.fetched).min())
                .unwrap_or(0);

            match self.indexed.get_mut(addr) {
                Some(site) if site.created_at == snapshot.created_at => {}
                Some(site) => {
                    let removed: Vec<String> = site
                        .contributors
                        .iter()
                        .filter(|c| !snapshot.contributors.contains(c))
                        .cloned()
                        .collect();
                    let added: Vec<String> = snapshot
                        .contributors
                        .iter()
                        .filter(|c| !site.contributors.contains(c))
                        .cloned()
                        .collect();
                    self.index.remove_site(addr, &removed);
                    self.index.add_site(addr, &added, fetched);
                    tracing::info!(
                        site = %addr,
                        added = added.len(),
                        removed = removed.len(),
                        "Site contributors changed"
                    );
                    site.created_at = snapshot.created_at;
                    site.contributors = snapshot.contributors.clone();
                }
                None => {
                    self.index.add_site(addr, &snapshot.contributors, fetched);
                    tracing::info!(
                        site = %addr,
                        contributors = snapshot.contributors.len(),
                        since = fetched,
                        "Site indexed"
                    );
                    self.indexed.insert(
                        addr.clone(),
                        IndexedSite {
                            created_at: snapshot.created_at,
                            contributors: snapshot.contributors.clone(),
                        },
                    );
                }
            }
        }
    }

    async fn resolve_relays(&mut self) {
        let unresolved = self.index.unresolved();
        if unresolved.is_empty() {
            return;
        }
        let resolved = self.resolver.resolve(&self.engine, &unresolved).await;
        tracing::debug!(
            requested = unresolved.len(),
            resolved = resolved.len(),
            "Outbox discovery finished"
        );
        for (pubkey, relays) in resolved {
            self.index.set_relays(&pubkey, relays);
        }
    }

    /// Classify deduplicated events into rebuild marks and queue rows.
    fn apply_events(
        &mut self,
        events: Vec<RawEvent>,
        by_site: &DomainsBySite,
        now: u64,
        report: &mut CycleReport,
    ) -> Result<()> {
        let fresh = self.versions.fresh(events);
        report.events_new = fresh.len();

        for event in fresh {
            match classify(&event) {
                // Site configurations only count when they come from the registry.
                Ok(Classified::SiteConfig(_)) => skip(report, "site_config"),
                Ok(Classified::PinUpdate { site, created_at }) => {
                    if !self.index.contributes_to(&event.pubkey, &site) {
                        skip(report, "foreign");
                    } else {
                        for record in domains_of(by_site, &site) {
                            self.store.set_updated(&record.domain, created_at)?;
                            mark_rebuild(report, &record.domain, created_at, "pin");
                        }
                    }
                }
                Ok(Classified::Submission { site, reference }) => {
                    if !self.index.contributes_to(&event.pubkey, &site) {
                        skip(report, "foreign");
                    } else {
                        for record in domains_of(by_site, &site) {
                            self.store.enqueue(&record.domain, &reference, now)?;
                            report.enqueued += 1;
                            metrics::increment("queue_enqueued_total", 1);
                        }
                    }
                }
                Ok(Classified::Content { reference }) => {
                    let mut matched = false;
                    for site in self.index.sites_of(&event.pubkey) {
                        let Some(snapshot) = self.sites.get(site) else {
                            continue;
                        };
                        if !snapshot.matches(&event) {
                            continue;
                        }
                        matched = true;
                        for record in domains_of(by_site, site) {
                            self.store.enqueue(&record.domain, &reference, now)?;
                            report.enqueued += 1;
                            metrics::increment("queue_enqueued_total", 1);
                        }
                    }
                    if !matched {
                        skip(report, "filtered");
                    }
                }
                Err(e) => {
                    tracing::debug!(id = %event.id, kind = event.kind, "Skipping malformed event: {}", e);
                    skip(report, "malformed");
                }
            }
            self.versions.record(&event);
        }
        Ok(())
    }
}

fn group_by_site(domains: &[DomainRecord]) -> DomainsBySite {
    let mut by_site: DomainsBySite = HashMap::new();
    for record in domains {
        by_site
            .entry(site_key(&record.site))
            .or_default()
            .push(record.clone());
    }
    by_site
}

/// Sites are keyed by owner and identifier under the site kind.
fn site_key(addr: &SiteAddr) -> SiteAddr {
    SiteAddr::site(addr.pubkey.clone(), addr.identifier.clone())
}

fn domains_of<'a>(by_site: &'a DomainsBySite, site: &SiteAddr) -> &'a [DomainRecord] {
    by_site
        .get(&site_key(site))
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

fn mark_rebuild(report: &mut CycleReport, domain: &str, version: u64, reason: &'static str) {
    report.rebuilds_marked += 1;
    metrics::increment_labeled("watch_full_rebuilds_marked_total", "reason", reason, 1);
    tracing::info!(domain, version, reason, "Full rebuild due");
}

fn skip(report: &mut CycleReport, reason: &'static str) {
    report.skipped += 1;
    metrics::increment_labeled("watch_events_skipped_total", "reason", reason, 1);
}
