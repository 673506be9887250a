//! Relay change detection and render scheduling for relay-published sites.
//!
//! Two loops share one SQLite store:
//!
//! ```text
//! ┌──────────────────┐  registry relays: site configurations
//! │  Change Watcher  │  contributor relays: notes, articles, pins, submissions
//! └────────┬─────────┘
//!          │  updated watermark (full rebuild due)
//!          │  event_queue rows (incremental items)
//!          ▼
//! ┌──────────────────┐
//! │      Store       │  domains, event_queue, author_relays
//! └────────┬─────────┘
//!          │
//!          ▼
//! ┌──────────────────┐
//! │ Render Scheduler │  incremental renders first, then full rebuilds
//! └────────┬─────────┘
//!          ▼
//!      Publisher
//! ```
//!
//! Watermarks only move forward, and only after the work they cover is
//! known to be complete: relay cursors advance for covered relays, queue
//! rows are deleted up to an id captured before rendering, and `rendered`
//! is set to the time the render started.

pub mod classify;
pub mod clock;
pub mod error;
pub mod fetch;
pub mod relay;
pub mod render;
pub mod router;
pub mod site;
pub mod store;
pub mod watch;

#[cfg(test)]
pub(crate) mod testing;

pub use clock::{Clock, SystemClock};
pub use error::{Error, Result};
pub use fetch::{FetchConfig, FetchEngine};
pub use relay::NostrTransport;
pub use render::{CommandPublisher, Publisher, RenderScheduler, SchedulerConfig};
pub use store::{DomainRecord, DomainStatus, Store};
pub use watch::{CycleReport, WatchConfig, Watcher};
