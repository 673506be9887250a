//! Author/Relay Router.
//!
//! Turns the [`AuthorIndex`] into a relay → authors fan-out plan and folds
//! scan results back into per-(author, relay) cursors.
//!
//! # Watermarks
//!
//! - A relay target starts at the *minimum* cursor of its authors, so no
//!   author sharing the relay is skipped.
//! - After a cycle, only relays that reported `covered` advance, and they
//!   advance to the cycle's start time, not to "now".

mod index;
mod outbox;

use std::collections::BTreeMap;

use crate::fetch::{RelayScan, RelayTarget};

pub use index::{AuthorEntry, AuthorIndex, RelayCursors};
pub use outbox::{
    DEFAULT_DISCOVERY_RELAYS, DEFAULT_FALLBACK_RELAYS, OutboxConfig, OutboxResolver,
};

/// Build the relay → authors plan, one target per relay in URL order.
pub fn plan(index: &AuthorIndex) -> Vec<RelayTarget> {
    let mut targets: BTreeMap<&str, RelayTarget> = BTreeMap::new();

    for (pubkey, entry) in index.iter() {
        let Some(relays) = &entry.relays else {
            continue;
        };
        for (url, cursor) in relays {
            let target = targets.entry(url.as_str()).or_insert_with(|| RelayTarget {
                url: url.clone(),
                authors: Vec::new(),
                since: *cursor,
            });
            target.authors.push(pubkey.clone());
            target.since = target.since.min(*cursor);
        }
    }

    targets.into_values().collect()
}

/// Advance cursors for every author served by a covered relay.
///
/// Returns the number of covered relays.
pub fn record_coverage(index: &mut AuthorIndex, scans: &[RelayScan], cycle_start: u64) -> usize {
    let mut covered = 0;
    for scan in scans.iter().filter(|s| s.covered) {
        covered += 1;
        for author in &scan.authors {
            index.advance(author, &scan.url, cycle_start);
        }
    }
    covered
}
