//! Author index: who contributes to which sites, and where each author's
//! per-relay scan cursor stands.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use sitesync_core::SiteAddr;

/// Per-relay cursors keyed by relay URL.
pub type RelayCursors = BTreeMap<String, u64>;

/// One contributor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthorEntry {
    /// Sites this author contributes to.
    pub sites: BTreeSet<SiteAddr>,
    /// Starting watermark for relays discovered later.
    pub fetched: u64,
    /// Write relays with their cursors; `None` until outbox discovery ran.
    pub relays: Option<RelayCursors>,
}

/// Contributor index rebuilt from site snapshots.
#[derive(Debug, Default)]
pub struct AuthorIndex {
    authors: BTreeMap<String, AuthorEntry>,
    /// Cursors loaded from the store, claimed when an author reappears.
    restored: HashMap<String, RelayCursors>,
}

impl AuthorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index seeded with cursors persisted by a previous run.
    pub fn with_cursors(restored: HashMap<String, RelayCursors>) -> Self {
        Self {
            authors: BTreeMap::new(),
            restored,
        }
    }

    /// Register `contributors` for `site`, starting new authors at `fetched`.
    ///
    /// An author who already has cursors, indexed or restored, keeps them
    /// lowered to `fetched` so the new site's history is not skipped.
    pub fn add_site(&mut self, site: &SiteAddr, contributors: &[String], fetched: u64) {
        for pubkey in contributors {
            let restored = self.restored.remove(pubkey).map(|mut relays| {
                for cursor in relays.values_mut() {
                    *cursor = (*cursor).min(fetched);
                }
                relays
            });
            let entry = self
                .authors
                .entry(pubkey.clone())
                .or_insert_with(|| AuthorEntry {
                    sites: BTreeSet::new(),
                    fetched,
                    relays: restored,
                });

            let is_new_site = entry.sites.insert(site.clone());
            if is_new_site && fetched < entry.fetched {
                entry.fetched = fetched;
                if let Some(relays) = entry.relays.as_mut() {
                    for cursor in relays.values_mut() {
                        *cursor = (*cursor).min(fetched);
                    }
                }
            }
        }
    }

    /// Unregister `contributors` from `site`, pruning authors left with no site.
    pub fn remove_site(&mut self, site: &SiteAddr, contributors: &[String]) {
        for pubkey in contributors {
            let Some(entry) = self.authors.get_mut(pubkey) else {
                continue;
            };
            entry.sites.remove(site);
            if entry.sites.is_empty() {
                self.authors.remove(pubkey);
            }
        }
    }

    /// Sites `pubkey` contributes to.
    pub fn sites_of(&self, pubkey: &str) -> impl Iterator<Item = &SiteAddr> {
        self.authors
            .get(pubkey)
            .into_iter()
            .flat_map(|entry| entry.sites.iter())
    }

    pub fn contributes_to(&self, pubkey: &str, site: &SiteAddr) -> bool {
        self.sites_of(pubkey).any(|s| s.same_site(site))
    }

    pub fn get(&self, pubkey: &str) -> Option<&AuthorEntry> {
        self.authors.get(pubkey)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &AuthorEntry)> {
        self.authors.iter()
    }

    pub fn len(&self) -> usize {
        self.authors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.authors.is_empty()
    }

    /// Authors whose write relays are not known yet.
    pub fn unresolved(&self) -> Vec<String> {
        self.authors
            .iter()
            .filter(|(_, entry)| entry.relays.is_none())
            .map(|(pubkey, _)| pubkey.clone())
            .collect()
    }

    /// Record `urls` as the author's write relays, each starting at `fetched`.
    pub fn set_relays(&mut self, pubkey: &str, urls: Vec<String>) {
        if let Some(entry) = self.authors.get_mut(pubkey) {
            let fetched = entry.fetched;
            entry.relays = Some(urls.into_iter().map(|url| (url, fetched)).collect());
        }
    }

    /// Move `pubkey`'s cursor on `url` forward to `ts`. Never moves back.
    pub fn advance(&mut self, pubkey: &str, url: &str, ts: u64) {
        if let Some(cursor) = self
            .authors
            .get_mut(pubkey)
            .and_then(|entry| entry.relays.as_mut())
            .and_then(|relays| relays.get_mut(url))
        {
            *cursor = (*cursor).max(ts);
        }
    }

    /// Flattened `(pubkey, relay, cursor)` triples for persistence.
    pub fn cursors(&self) -> Vec<(String, String, u64)> {
        self.authors
            .iter()
            .filter_map(|(pubkey, entry)| entry.relays.as_ref().map(|r| (pubkey, r)))
            .flat_map(|(pubkey, relays)| {
                relays
                    .iter()
                    .map(move |(url, since)| (pubkey.clone(), url.clone(), *since))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::pubkey;

    fn site(n: u8) -> SiteAddr {
        SiteAddr::site(pubkey(100 + n), format!("site-{}", n))
    }

    #[test]
    fn test_add_and_remove_site() {
        let mut index = AuthorIndex::new();
        let (a, b) = (pubkey(1), pubkey(2));
        index.add_site(&site(1), &[a.clone(), b.clone()], 500);
        index.add_site(&site(2), std::slice::from_ref(&a), 500);
        assert_eq!(index.len(), 2);
        assert_eq!(index.sites_of(&a).count(), 2);

        index.remove_site(&site(1), &[a.clone(), b.clone()]);
        assert_eq!(index.len(), 1);
        assert!(index.get(&b).is_none());
        assert!(index.contributes_to(&a, &site(2)));
        assert!(!index.contributes_to(&a, &site(1)));
    }

    #[test]
    fn test_new_author_inherits_site_fetched() {
        let mut index = AuthorIndex::new();
        let a = pubkey(1);
        index.add_site(&site(1), std::slice::from_ref(&a), 700);
        index.set_relays(&a, vec!["wss://r1".to_string(), "wss://r2".to_string()]);
        let relays = index.get(&a).unwrap().relays.clone().unwrap();
        assert_eq!(relays.values().copied().collect::<Vec<_>>(), vec![700, 700]);
        assert_eq!(index.unresolved(), Vec::<String>::new());
    }

    #[test]
    fn test_older_site_lowers_cursors() {
        let mut index = AuthorIndex::new();
        let a = pubkey(1);
        index.add_site(&site(1), std::slice::from_ref(&a), 900);
        index.set_relays(&a, vec!["wss://r1".to_string()]);
        index.advance(&a, "wss://r1", 1_000);

        index.add_site(&site(2), std::slice::from_ref(&a), 0);
        assert_eq!(index.get(&a).unwrap().relays.as_ref().unwrap()["wss://r1"], 0);

        // Re-adding an existing site does not reset anything.
        index.advance(&a, "wss://r1", 1_100);
        index.add_site(&site(2), std::slice::from_ref(&a), 0);
        assert_eq!(index.get(&a).unwrap().relays.as_ref().unwrap()["wss://r1"], 1_100);
    }

    #[test]
    fn test_advance_never_moves_back() {
        let mut index = AuthorIndex::new();
        let a = pubkey(1);
        index.add_site(&site(1), std::slice::from_ref(&a), 100);
        index.set_relays(&a, vec!["wss://r1".to_string()]);
        index.advance(&a, "wss://r1", 300);
        index.advance(&a, "wss://r1", 200);
        index.advance(&a, "wss://unknown", 400);
        assert_eq!(
            index.cursors(),
            vec![(a.clone(), "wss://r1".to_string(), 300)]
        );
    }

    #[test]
    fn test_restored_cursors_are_claimed() {
        let a = pubkey(1);
        let mut restored = HashMap::new();
        restored.insert(
            a.clone(),
            RelayCursors::from([("wss://r1".to_string(), 1_234)]),
        );
        let mut index = AuthorIndex::with_cursors(restored);
        index.add_site(&site(1), std::slice::from_ref(&a), 2_000);
        assert!(index.unresolved().is_empty());
        assert_eq!(index.cursors()[0].2, 1_234);
    }

    #[test]
    fn test_restored_cursors_start_no_later_than_site() {
        let a = pubkey(1);
        let restored = HashMap::from([(
            a.clone(),
            RelayCursors::from([
                ("wss://r1".to_string(), 9_000),
                ("wss://r2".to_string(), 300),
            ]),
        )]);

        // Site order does not matter: the lowest `fetched` wins.
        for order in [[(1, 0), (2, 5_000)], [(2, 5_000), (1, 0)]] {
            let mut index = AuthorIndex::with_cursors(restored.clone());
            for (n, fetched) in order {
                index.add_site(&site(n), std::slice::from_ref(&a), fetched);
            }
            let relays = index.get(&a).unwrap().relays.clone().unwrap();
            assert_eq!(relays["wss://r1"], 0);
            assert_eq!(relays["wss://r2"], 0);
            assert_eq!(index.get(&a).unwrap().fetched, 0);
        }

        let mut index = AuthorIndex::with_cursors(restored);
        index.add_site(&site(1), std::slice::from_ref(&a), 5_000);
        let relays = index.get(&a).unwrap().relays.clone().unwrap();
        assert_eq!(relays["wss://r1"], 5_000);
        assert_eq!(relays["wss://r2"], 300);
    }
}
