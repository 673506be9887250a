//! Event model shared by the watcher and the scheduler.
//!
//! Relay events are converted into [`RawEvent`] at the transport boundary so
//! the rest of the pipeline never depends on the wire library's types. Two
//! derived identities are defined here:
//!
//! - [`SiteAddr`]: the `kind:pubkey:identifier` coordinate of a site
//!   configuration event (or of any parameterized-replaceable event).
//! - [`ContentRef`]: the normalized reference of a content event. Replaceable
//!   events collapse to their address so that only the newest version counts;
//!   regular events keep their id. Outside the process it is written in NIP-19
//!   form (`naddr1...` or `note1...`), as the renderer expects.

use std::fmt;
use std::str::FromStr;

use nostr::nips::nip01::Coordinate;
use nostr::nips::nip19::{FromBech32, Nip19Coordinate};
use nostr::{EventId, Kind, PublicKey, RelayUrl, ToBech32};

use crate::error::{Error, Result};

/// Profile metadata.
pub const KIND_PROFILE: u16 = 0;
/// Short text note.
pub const KIND_NOTE: u16 = 1;
/// Contact list.
pub const KIND_CONTACTS: u16 = 3;
/// Submission of foreign content to a site.
pub const KIND_SITE_SUBMIT: u16 = 1517;
/// Relay list metadata (outbox relays).
pub const KIND_RELAYS: u16 = 10002;
/// Long-form article.
pub const KIND_LONG_NOTE: u16 = 30023;
/// Site configuration.
pub const KIND_SITE: u16 = 30512;
/// Pinned/featured list addressed to a site.
pub const KIND_PINNED_TO_SITE: u16 = 30516;

/// Kinds scanned from contributors on every watch cycle.
pub const CONTENT_KINDS: &[u16] = &[
    KIND_NOTE,
    KIND_LONG_NOTE,
    KIND_PINNED_TO_SITE,
    KIND_SITE_SUBMIT,
];

/// Returns true if only the newest event per (author, kind[, identifier]) is meaningful.
pub fn is_replaceable(kind: u16) -> bool {
    kind == KIND_PROFILE
        || kind == KIND_CONTACTS
        || (10_000..20_000).contains(&kind)
        || (30_000..40_000).contains(&kind)
}

/// A relay event as seen by the pipeline.
///
/// Signatures are verified by the transport before conversion and are not
/// carried further.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub id: String,
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

impl RawEvent {
    /// First value of the first tag named `name`.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|tag| tag.first().map(String::as_str) == Some(name))
            .and_then(|tag| tag.get(1))
            .map(String::as_str)
    }

    /// Full tags (name included) whose name is `name`.
    pub fn tags_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a [String]> + 'a {
        self.tags
            .iter()
            .filter(move |tag| tag.first().map(String::as_str) == Some(name))
            .map(Vec::as_slice)
    }

    /// First value of every tag named `name`.
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags_named(name)
            .filter_map(|tag| tag.get(1))
            .map(String::as_str)
    }

    /// The `d` tag identifier, empty when absent.
    pub fn identifier(&self) -> &str {
        self.tag_value("d").unwrap_or("")
    }

    pub fn is_replaceable(&self) -> bool {
        is_replaceable(self.kind)
    }

    /// Address of this event (meaningful for replaceable kinds).
    pub fn address(&self) -> SiteAddr {
        SiteAddr {
            kind: self.kind,
            pubkey: self.pubkey.clone(),
            identifier: self.identifier().to_string(),
        }
    }

    /// Normalized content reference used for dedup and queueing.
    pub fn reference(&self) -> ContentRef {
        ContentRef::of(self)
    }
}

impl From<&nostr::Event> for RawEvent {
    fn from(event: &nostr::Event) -> Self {
        Self {
            id: event.id.to_hex(),
            pubkey: event.pubkey.to_hex(),
            created_at: event.created_at.as_u64(),
            kind: event.kind.as_u16(),
            tags: event
                .tags
                .iter()
                .map(|tag| tag.as_slice().iter().map(|s| s.to_string()).collect())
                .collect(),
            content: event.content.clone(),
        }
    }
}

/// Coordinate of an addressable event: `kind:pubkey:identifier`.
///
/// `Display` gives the coordinate form carried in `a`, `d` and `s` tags.
/// Parsing accepts that form or a NIP-19 `naddr`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SiteAddr {
    pub kind: u16,
    pub pubkey: String,
    pub identifier: String,
}

impl SiteAddr {
    /// Address of a site owned by `pubkey` with the given identifier.
    pub fn site(pubkey: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self {
            kind: KIND_SITE,
            pubkey: pubkey.into(),
            identifier: identifier.into(),
        }
    }

    /// Sites are matched by owner and identifier only; the kind is implied.
    pub fn same_site(&self, other: &SiteAddr) -> bool {
        self.pubkey == other.pubkey && self.identifier == other.identifier
    }

    pub fn to_coordinate(&self) -> Result<Coordinate> {
        let public_key = PublicKey::from_hex(&self.pubkey)
            .map_err(|e| invalid_address(&self.to_string(), e))?;
        Ok(Coordinate::new(Kind::from(self.kind), public_key).identifier(&self.identifier))
    }

    /// NIP-19 `naddr` with `relays` as hints. Unparseable relay URLs are left out.
    pub fn to_naddr(&self, relays: &[String]) -> Result<String> {
        let relays: Vec<RelayUrl> = relays
            .iter()
            .filter_map(|url| RelayUrl::parse(url).ok())
            .collect();
        Nip19Coordinate::new(self.to_coordinate()?, relays)
            .and_then(|naddr| naddr.to_bech32())
            .map_err(|e| invalid_address(&self.to_string(), e))
    }
}

impl From<&Coordinate> for SiteAddr {
    fn from(coordinate: &Coordinate) -> Self {
        Self {
            kind: coordinate.kind.as_u16(),
            pubkey: coordinate.public_key.to_hex(),
            identifier: coordinate.identifier.clone(),
        }
    }
}

impl fmt::Display for SiteAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.kind, self.pubkey, self.identifier)
    }
}

impl FromStr for SiteAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let coordinate = if s.starts_with("naddr1") {
            Nip19Coordinate::from_bech32(s)
                .map(|naddr| naddr.coordinate)
                .map_err(|e| invalid_address(s, e))?
        } else {
            Coordinate::parse(s).map_err(|e| invalid_address(s, e))?
        };
        Ok(Self::from(&coordinate))
    }
}

fn invalid_address(input: &str, reason: impl fmt::Display) -> Error {
    Error::InvalidAddress {
        input: input.to_string(),
        reason: reason.to_string(),
    }
}

/// Normalized reference to a piece of site content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ContentRef {
    /// Replaceable event, keyed by address.
    Address(SiteAddr),
    /// Regular event, keyed by hex id.
    Id(String),
}

impl ContentRef {
    pub fn of(event: &RawEvent) -> Self {
        if event.is_replaceable() {
            Self::Address(event.address())
        } else {
            Self::Id(event.id.clone())
        }
    }

    /// NIP-19 form used in queue rows and page paths: `naddr` for
    /// replaceable content, `note` otherwise.
    pub fn to_bech32(&self) -> Result<String> {
        match self {
            Self::Address(addr) => addr.to_naddr(&[]),
            Self::Id(id) => {
                let invalid = |reason: String| Error::InvalidField { field: "id", reason };
                EventId::from_hex(id)
                    .map_err(|e| invalid(format!("'{}': {}", id, e)))?
                    .to_bech32()
                    .map_err(|e| invalid(e.to_string()))
            }
        }
    }
}

/// 32-byte lowercase hex, the encoding of ids and pubkeys.
pub fn is_hex_key(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr::Keys;
    use nostr::nips::nip19::Nip19;

    const ID: &str = "4ff2236ceb2fdc6dee6317cd0b841f3f020ac985bb3f99f7f4c1f973ec28d06b";

    fn pk() -> String {
        Keys::generate().public_key().to_hex()
    }

    fn event(pubkey: &str, kind: u16, tags: &[&[&str]]) -> RawEvent {
        RawEvent {
            id: ID.to_string(),
            pubkey: pubkey.to_string(),
            created_at: 1_700_000_000,
            kind,
            tags: tags
                .iter()
                .map(|t| t.iter().map(|s| s.to_string()).collect())
                .collect(),
            content: String::new(),
        }
    }

    #[test]
    fn test_replaceable_buckets() {
        assert!(is_replaceable(KIND_PROFILE));
        assert!(is_replaceable(KIND_CONTACTS));
        assert!(is_replaceable(KIND_RELAYS));
        assert!(is_replaceable(KIND_LONG_NOTE));
        assert!(is_replaceable(KIND_PINNED_TO_SITE));
        assert!(!is_replaceable(KIND_NOTE));
        assert!(!is_replaceable(KIND_SITE_SUBMIT));
        assert!(!is_replaceable(20_000));
    }

    #[test]
    fn test_reference_regular_uses_note() {
        let e = event(&pk(), KIND_NOTE, &[["d", "ignored"].as_slice()]);
        assert_eq!(e.reference(), ContentRef::Id(ID.to_string()));

        let note = e.reference().to_bech32().unwrap();
        assert!(note.starts_with("note1"));
        assert!(matches!(
            Nip19::from_bech32(&note).unwrap(),
            Nip19::EventId(id) if id.to_hex() == ID
        ));
    }

    #[test]
    fn test_reference_replaceable_uses_naddr() {
        let pubkey = pk();
        let e = event(&pubkey, KIND_LONG_NOTE, &[["d", "my-article"].as_slice()]);
        let reference = e.reference();
        assert_eq!(
            reference,
            ContentRef::Address(SiteAddr {
                kind: KIND_LONG_NOTE,
                pubkey: pubkey.clone(),
                identifier: "my-article".to_string(),
            })
        );

        // A new version of the same article normalizes identically.
        let mut newer = e.clone();
        newer.id = "0".repeat(64);
        newer.created_at += 10;
        assert_eq!(newer.reference(), reference);

        let naddr = reference.to_bech32().unwrap();
        assert!(naddr.starts_with("naddr1"));
        let ContentRef::Address(addr) = &reference else {
            unreachable!()
        };
        assert_eq!(&naddr.parse::<SiteAddr>().unwrap(), addr);
    }

    #[test]
    fn test_invalid_id_is_not_encoded() {
        assert!(ContentRef::Id("nothex".to_string()).to_bech32().is_err());
    }

    #[test]
    fn test_site_addr_parses_coordinate_and_naddr() {
        let addr = SiteAddr::site(pk(), "blog");
        let parsed: SiteAddr = addr.to_string().parse().unwrap();
        assert_eq!(parsed, addr);
        assert_eq!(parsed.kind, KIND_SITE);

        let naddr = addr
            .to_naddr(&["wss://relay.example.com".to_string()])
            .unwrap();
        assert!(naddr.starts_with("naddr1"));
        assert_eq!(naddr.parse::<SiteAddr>().unwrap(), addr);

        let Nip19::Coordinate(decoded) = Nip19::from_bech32(&naddr).unwrap() else {
            panic!("expected naddr");
        };
        assert_eq!(decoded.relays.len(), 1);
        assert_eq!(decoded.coordinate.identifier, "blog");
    }

    #[test]
    fn test_site_addr_rejects_malformed() {
        assert!("30512".parse::<SiteAddr>().is_err());
        assert!("x:abc:d".parse::<SiteAddr>().is_err());
        assert!("naddr1garbage".parse::<SiteAddr>().is_err());
        assert!(SiteAddr::site("abc", "d").to_naddr(&[]).is_err());
    }

    #[test]
    fn test_tag_helpers() {
        let e = event(
            &pk(),
            KIND_SITE,
            &[
                ["d", "site"].as_slice(),
                ["p", "a"].as_slice(),
                ["p", "b"].as_slice(),
                ["include", "t", "rust"].as_slice(),
            ],
        );
        assert_eq!(e.identifier(), "site");
        assert_eq!(e.tag_values("p").collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(e.tags_named("include").count(), 1);
        assert_eq!(e.tag_value("r"), None);
    }
}
