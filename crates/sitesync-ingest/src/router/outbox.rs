//! Outbox discovery: which relays does an author write to?
//!
//! Authors publish their relay list as a kind 10002 event with `r` tags. A
//! tag with no marker or with the `write` marker names a write relay. The
//! newest list per author wins; authors with no list at all are assigned the
//! fallback relays.

use std::collections::HashMap;
use std::time::Duration;

use sitesync_core::{KIND_RELAYS, RawEvent, metrics};

use crate::fetch::FetchEngine;
use crate::relay::{FetchFilter, RelayUrlFilter};

/// Relays that index kind 10002 lists for everyone.
pub const DEFAULT_DISCOVERY_RELAYS: &[&str] = &[
    "wss://purplepag.es",
    "wss://user.kindpag.es",
    "wss://relay.nos.social",
];

/// Used for authors that never published a relay list.
pub const DEFAULT_FALLBACK_RELAYS: &[&str] = &[
    "wss://relay.damus.io",
    "wss://nos.lol",
    "wss://relay.npubpro.com",
];

/// Outbox resolver configuration.
#[derive(Debug, Clone)]
pub struct OutboxConfig {
    pub discovery_relays: Vec<String>,
    pub fallback_relays: Vec<String>,
    /// Authors per discovery query.
    pub batch: usize,
    /// Deadline for one discovery batch.
    pub wait: Duration,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            discovery_relays: DEFAULT_DISCOVERY_RELAYS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            fallback_relays: DEFAULT_FALLBACK_RELAYS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            batch: 100,
            wait: Duration::from_secs(20),
        }
    }
}

/// Resolves write relays through the discovery relays.
#[derive(Debug, Clone)]
pub struct OutboxResolver {
    config: OutboxConfig,
    urls: RelayUrlFilter,
}

impl OutboxResolver {
    pub fn new(config: OutboxConfig, urls: RelayUrlFilter) -> Self {
        Self { config, urls }
    }

    /// Write relays for each of `authors`.
    ///
    /// Authors are left out of the result when no discovery relay answered
    /// for their batch, so they are retried next cycle instead of being
    /// pinned to the fallback set.
    pub async fn resolve(
        &self,
        engine: &FetchEngine,
        authors: &[String],
    ) -> HashMap<String, Vec<String>> {
        let mut resolved = HashMap::new();

        for batch in authors.chunks(self.config.batch.max(1)) {
            let filter = FetchFilter::kinds(&[KIND_RELAYS]).authors(batch);
            let (events, covered) = engine
                .query_relays(&self.config.discovery_relays, filter, self.config.wait)
                .await;

            let lists = newest_per_author(events);
            for author in batch {
                match lists.get(author.as_str()) {
                    Some(list) => {
                        let relays = self.urls.filter_list(write_relays(list));
                        metrics::increment_labeled(
                            "relay_outbox_lookups_total",
                            "source",
                            "relay_list",
                            1,
                        );
                        resolved.insert(author.clone(), relays);
                    }
                    None if covered || !events_missing(&lists, batch) => {
                        metrics::increment_labeled(
                            "relay_outbox_lookups_total",
                            "source",
                            "fallback",
                            1,
                        );
                        resolved.insert(author.clone(), self.fallback());
                    }
                    None => {
                        tracing::debug!(author = %author, "Outbox lookup incomplete, retrying later");
                    }
                }
            }
        }

        resolved
    }

    fn fallback(&self) -> Vec<String> {
        self.urls
            .filter_list(self.config.fallback_relays.iter().map(String::as_str))
    }
}

/// True when nothing at all came back for `batch`, i.e. discovery failed.
fn events_missing(lists: &HashMap<String, RawEvent>, batch: &[String]) -> bool {
    !batch.iter().any(|author| lists.contains_key(author))
}

fn newest_per_author(events: Vec<RawEvent>) -> HashMap<String, RawEvent> {
    let mut newest: HashMap<String, RawEvent> = HashMap::new();
    for event in events {
        if event.kind != KIND_RELAYS {
            continue;
        }
        match newest.get(&event.pubkey) {
            Some(current) if current.created_at >= event.created_at => {}
            _ => {
                newest.insert(event.pubkey.clone(), event);
            }
        }
    }
    newest
}

/// `r` tags with no marker or the `write` marker.
fn write_relays(event: &RawEvent) -> impl Iterator<Item = &str> {
    event.tags_named("r").filter_map(|tag| {
        let url = tag.get(1)?;
        match tag.get(2).map(String::as_str) {
            None | Some("") | Some("write") => Some(url.as_str()),
            _ => None,
        }
    })
}
