//! Relay access: the transport seam, its nostr-sdk implementation, and URL
//! hygiene.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          SessionPool                            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  - Reuses open sessions across watch cycles                     │
//! │  - Connects through a RelayTransport with a short timeout       │
//! │  - Evicts sessions that were challenged or failed               │
//! └─────────────────────────────────────────────────────────────────┘
//!                │ RelayTransport / RelaySession
//!                ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  NostrTransport: one nostr-sdk Client per relay, no signer      │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

mod nostr;
mod transport;
mod url;

pub use nostr::NostrTransport;
pub use transport::{FetchFilter, RelaySession, RelayTransport, SessionPool};
pub use url::{DEFAULT_BLACKLIST, NormalizeResult, RelayUrlFilter, normalize_relay_url};
