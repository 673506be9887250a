//! Site snapshots and content filters.
//!
//! A site is configured by a kind 30512 event. The tags that matter here:
//!
//! - `d`: site identifier
//! - `p`: contributor pubkeys (falls back to `u`, then to the event author)
//! - `kind`: content kinds shown on the site (default: notes and long-form)
//! - `include`: `["include", "t", <hashtag>]` restricts content to hashtags;
//!   `["include", "*"]` or no include rule at all means every post
//!
//! A submission (kind 1517) points foreign content at a site: `s` names the
//! site coordinate, `a` or `e` the content.

use std::collections::BTreeSet;
use std::sync::OnceLock;

use sitesync_core::{
    ContentRef, Error, KIND_LONG_NOTE, KIND_NOTE, KIND_SITE, RawEvent, Result, SiteAddr,
    is_hex_key,
};

/// Kinds shown when a site configures none.
pub const DEFAULT_SITE_KINDS: &[u16] = &[KIND_NOTE, KIND_LONG_NOTE];

/// Latest known configuration of one site.
#[derive(Debug)]
pub struct SiteSnapshot {
    pub addr: SiteAddr,
    pub created_at: u64,
    pub contributors: Vec<String>,
    event: RawEvent,
    filter: OnceLock<ContentFilter>,
}

impl SiteSnapshot {
    /// Parse a site configuration event.
    pub fn parse(event: RawEvent) -> Result<Self> {
        if event.kind != KIND_SITE {
            return Err(Error::InvalidField {
                field: "kind",
                reason: format!("expected {}, got {}", KIND_SITE, event.kind),
            });
        }
        if event.tag_value("d").is_none() {
            return Err(Error::MissingTag {
                id: event.id.clone(),
                kind: event.kind,
                tag: "d",
            });
        }

        let mut contributors: Vec<String> = Vec::new();
        for pubkey in event.tag_values("p").filter(|p| is_hex_key(p)) {
            if !contributors.iter().any(|c| c == pubkey) {
                contributors.push(pubkey.to_string());
            }
        }
        if contributors.is_empty() {
            let owner = event
                .tag_value("u")
                .filter(|u| is_hex_key(u))
                .unwrap_or(&event.pubkey);
            contributors.push(owner.to_string());
        }

        Ok(Self {
            addr: SiteAddr::site(event.pubkey.clone(), event.identifier()),
            created_at: event.created_at,
            contributors,
            event,
            filter: OnceLock::new(),
        })
    }

    /// Content filter, compiled on first use.
    pub fn filter(&self) -> &ContentFilter {
        self.filter
            .get_or_init(|| ContentFilter::compile(&self.event, &self.contributors))
    }

    pub fn matches(&self, event: &RawEvent) -> bool {
        self.filter().matches(event)
    }
}

/// Compiled inclusion rules of a site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentFilter {
    contributors: BTreeSet<String>,
    kinds: Vec<u16>,
    /// Lowercased hashtags; `None` admits every post.
    hashtags: Option<BTreeSet<String>>,
}

impl ContentFilter {
    fn compile(event: &RawEvent, contributors: &[String]) -> Self {
        let mut kinds: Vec<u16> = event
            .tag_values("kind")
            .filter_map(|k| k.parse().ok())
            .collect();
        if kinds.is_empty() {
            kinds = DEFAULT_SITE_KINDS.to_vec();
        }

        let mut include_all = false;
        let mut hashtags = BTreeSet::new();
        for tag in event.tags_named("include") {
            match (tag.get(1).map(String::as_str), tag.get(2)) {
                (Some("*"), _) => include_all = true,
                (Some("t"), Some(hashtag)) if !hashtag.is_empty() => {
                    hashtags.insert(hashtag.to_lowercase());
                }
                _ => {}
            }
        }

        Self {
            contributors: contributors.iter().cloned().collect(),
            kinds,
            hashtags: (!include_all && !hashtags.is_empty()).then_some(hashtags),
        }
    }

    /// Author is a contributor, kind is shown, and the hashtag rule holds.
    pub fn matches(&self, event: &RawEvent) -> bool {
        if !self.contributors.contains(&event.pubkey) || !self.kinds.contains(&event.kind) {
            return false;
        }
        match &self.hashtags {
            None => true,
            Some(wanted) => event
                .tag_values("t")
                .any(|t| wanted.contains(&t.to_lowercase())),
        }
    }
}

/// Target site and canonical content reference of a submission.
pub fn parse_submission(event: &RawEvent) -> Result<(SiteAddr, ContentRef)> {
    let missing = |tag| Error::MissingTag {
        id: event.id.clone(),
        kind: event.kind,
        tag,
    };

    let site: SiteAddr = event.tag_value("s").ok_or_else(|| missing("s"))?.parse()?;

    let reference = if let Some(addr) = event.tag_value("a") {
        ContentRef::Address(addr.parse()?)
    } else if let Some(id) = event.tag_value("e") {
        if !is_hex_key(id) {
            return Err(Error::InvalidField {
                field: "e",
                reason: format!("'{}' is not a hex event id", id),
            });
        }
        ContentRef::Id(id.to_string())
    } else {
        return Err(missing("a"));
    };

    Ok((site, reference))
}
