//! Event classification at the watcher boundary.
//!
//! Raw tag arrays are inspected here and nowhere downstream: every event is
//! turned into one [`Classified`] variant, or an error if it is malformed.

use std::collections::HashMap;

use sitesync_core::{
    ContentRef, Error, KIND_PINNED_TO_SITE, KIND_SITE, KIND_SITE_SUBMIT, RawEvent, Result,
    SiteAddr,
};

use crate::site::{SiteSnapshot, parse_submission};

/// What an event means to the pipeline.
#[derive(Debug)]
pub enum Classified {
    /// New site configuration.
    SiteConfig(Box<SiteSnapshot>),
    /// Pinned list for a site; forces a full rebuild.
    PinUpdate { site: SiteAddr, created_at: u64 },
    /// Foreign content submitted to a site.
    Submission { site: SiteAddr, reference: ContentRef },
    /// Ordinary contributor content.
    Content { reference: ContentRef },
}

pub fn classify(event: &RawEvent) -> Result<Classified> {
    match event.kind {
        KIND_SITE => Ok(Classified::SiteConfig(Box::new(SiteSnapshot::parse(
            event.clone(),
        )?))),
        KIND_PINNED_TO_SITE => {
            // The `d` tag of a pin list is the coordinate of its site.
            let site: SiteAddr = event.identifier().parse()?;
            if site.kind != KIND_SITE {
                return Err(Error::InvalidField {
                    field: "d",
                    reason: format!("pin list must address a kind {} site", KIND_SITE),
                });
            }
            Ok(Classified::PinUpdate {
                site,
                created_at: event.created_at,
            })
        }
        KIND_SITE_SUBMIT => {
            let (site, reference) = parse_submission(event)?;
            Ok(Classified::Submission { site, reference })
        }
        _ => Ok(Classified::Content {
            reference: event.reference(),
        }),
    }
}

/// Newest `created_at` seen per normalized reference.
///
/// Kept for the life of the watcher so re-fetched versions are not queued
/// twice.
#[derive(Debug, Default)]
pub struct LatestVersions {
    seen: HashMap<ContentRef, u64>,
}

impl LatestVersions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reduce `events` to the newest version per reference, dropping any
    /// version that is not strictly newer than one already recorded.
    ///
    /// Nothing is recorded here; call [`LatestVersions::record`] once an
    /// event has been handled.
    pub fn fresh(&self, events: Vec<RawEvent>) -> Vec<RawEvent> {
        let mut newest: HashMap<ContentRef, RawEvent> = HashMap::new();
        for event in events {
            let reference = event.reference();
            match newest.get(&reference) {
                Some(current) if current.created_at >= event.created_at => {}
                _ => {
                    newest.insert(reference, event);
                }
            }
        }

        let mut selected: Vec<RawEvent> = newest
            .into_iter()
            .filter(|(reference, event)| {
                self.seen
                    .get(reference)
                    .is_none_or(|seen| event.created_at > *seen)
            })
            .map(|(_, event)| event)
            .collect();

        selected.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        selected
    }

    pub fn record(&mut self, event: &RawEvent) {
        let seen = self.seen.entry(event.reference()).or_insert(0);
        *seen = (*seen).max(event.created_at);
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
