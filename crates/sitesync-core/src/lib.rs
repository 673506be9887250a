//! Core types and shared utilities for the sitesync pipeline.
//!
//! This crate provides:
//! - The relay event model ([`RawEvent`]) and its conversion from `nostr::Event`
//! - Site addresses and normalized content references
//! - Prometheus metrics helpers
//! - Shared error types

mod error;
mod event;
pub mod metrics;

pub use error::{Error, Result};
pub use event::{
    CONTENT_KINDS, ContentRef, KIND_CONTACTS, KIND_LONG_NOTE, KIND_NOTE, KIND_PINNED_TO_SITE,
    KIND_PROFILE, KIND_RELAYS, KIND_SITE, KIND_SITE_SUBMIT, RawEvent, SiteAddr, is_hex_key,
    is_replaceable,
};
