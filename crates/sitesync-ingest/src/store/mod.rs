//! Durable domain store.
//!
//! The only state shared by the watcher and the scheduler. Every mutation is
//! either a monotonic watermark advance (`MAX(current, new)`) or a queue
//! append / prefix delete, so the two loops can write concurrently without
//! coordinating.
//!
//! # Usage
//!
//! ```ignore
//! use sitesync_ingest::store::Store;
//!
//! let store = Store::open("./data/sitesync.db")?;
//! for domain in store.list_active_domains()? {
//!     let queued = store.list_queue(&domain.domain)?;
//! }
//! ```

mod schema;

use std::collections::HashMap;
use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Row, params};
use sitesync_core::{ContentRef, SiteAddr};

use crate::router::RelayCursors;
use crate::{Error, Result};

pub use schema::DomainStatus;

/// A domain and its watermarks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainRecord {
    pub domain: String,
    pub site: SiteAddr,
    pub pubkey: String,
    pub status: DomainStatus,
    /// Last completed full rebuild.
    pub rendered: u64,
    /// Newest change requiring a full rebuild.
    pub updated: u64,
    /// Contributor content scanned up to here.
    pub fetched: u64,
}

impl DomainRecord {
    /// Full rebuild is due when nothing rendered since the last change.
    pub fn needs_full_rebuild(&self) -> bool {
        self.updated >= self.rendered
    }
}

/// One incremental render item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueRow {
    pub id: i64,
    pub domain: String,
    pub reference: String,
    pub timestamp: u64,
}

/// SQLite-backed store.
pub struct Store {
    /// SQLite connection (protected by mutex for thread safety).
    conn: Mutex<Connection>,
}

impl Store {
    /// Open or create the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(Error::Io)?;
        }

        let conn = Connection::open(path)
            .map_err(|e| Error::Database(format!("Failed to open SQLite: {}", e)))?;

        // WAL so the watcher and scheduler processes can share the file.
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA busy_timeout=5000;",
        )
        .map_err(|e| Error::Database(format!("Failed to set PRAGMA: {}", e)))?;

        Self::init(conn)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Database(format!("Failed to open in-memory SQLite: {}", e)))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        schema::init_schema(&conn)
            .map_err(|e| Error::Database(format!("Failed to init schema: {}", e)))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // =========================================================================
    // Domains
    // =========================================================================

    /// Insert a domain or update its site and status. Watermarks are kept.
    ///
    /// The site is stored as an `naddr`.
    pub fn upsert_domain(&self, domain: &str, site: &SiteAddr, status: DomainStatus) -> Result<()> {
        let naddr = site.to_naddr(&[])?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO domains (domain, site, pubkey, status, timestamp)
             VALUES (?1, ?2, ?3, ?4, strftime('%s', 'now'))
             ON CONFLICT(domain) DO UPDATE SET
                site = excluded.site,
                pubkey = excluded.pubkey,
                status = excluded.status",
            params![domain, naddr, site.pubkey, status.as_str()],
        )?;
        Ok(())
    }

    pub fn get_domain(&self, domain: &str) -> Result<Option<DomainRecord>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT domain, site, pubkey, status, rendered, updated, fetched
                 FROM domains WHERE domain = ?",
                [domain],
                raw_domain,
            )
            .optional()?;
        Ok(row.and_then(parse_domain))
    }

    /// Every domain, any status.
    pub fn list_domains(&self) -> Result<Vec<DomainRecord>> {
        self.query_domains("SELECT domain, site, pubkey, status, rendered, updated, fetched FROM domains ORDER BY domain")
    }

    /// Domains with status `deployed`.
    pub fn list_active_domains(&self) -> Result<Vec<DomainRecord>> {
        self.query_domains(
            "SELECT domain, site, pubkey, status, rendered, updated, fetched
             FROM domains WHERE status = 'deployed' ORDER BY domain",
        )
    }

    fn query_domains(&self, sql: &str) -> Result<Vec<DomainRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map([], raw_domain)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows.into_iter().filter_map(parse_domain).collect())
    }

    pub fn set_updated(&self, domain: &str, ts: u64) -> Result<()> {
        self.advance("updated", domain, ts)
    }

    pub fn set_rendered(&self, domain: &str, ts: u64) -> Result<()> {
        self.advance("rendered", domain, ts)
    }

    /// Advance `fetched` for all `domains` in one transaction.
    pub fn set_fetched(&self, domains: &[String], ts: u64) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt =
                tx.prepare("UPDATE domains SET fetched = MAX(fetched, ?1) WHERE domain = ?2")?;
            for domain in domains {
                stmt.execute(params![ts as i64, domain])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn advance(&self, column: &'static str, domain: &str, ts: u64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            &format!(
                "UPDATE domains SET {column} = MAX({column}, ?1) WHERE domain = ?2"
            ),
            params![ts as i64, domain],
        )?;
        Ok(())
    }

    // =========================================================================
    // Event queue
    // =========================================================================

    /// Append an incremental item and return its row id.
    ///
    /// The reference is stored in NIP-19 form (`note1...` or `naddr1...`).
    pub fn enqueue(&self, domain: &str, reference: &ContentRef, ts: u64) -> Result<i64> {
        let event_id = reference.to_bech32()?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO event_queue (domain, event_id, timestamp) VALUES (?1, ?2, ?3)",
            params![domain, event_id, ts as i64],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Queue rows for `domain` in id order.
    pub fn list_queue(&self, domain: &str) -> Result<Vec<QueueRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, domain, event_id, timestamp FROM event_queue
             WHERE domain = ? ORDER BY id",
        )?;
        let rows = stmt
            .query_map([domain], queue_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Oldest queue row of any domain.
    pub fn any_queued(&self) -> Result<Option<QueueRow>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT id, domain, event_id, timestamp FROM event_queue ORDER BY id LIMIT 1",
                [],
                queue_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Highest queue row id for `domain`.
    pub fn last_queued_id(&self, domain: &str) -> Result<Option<i64>> {
        let conn = self.conn.lock();
        let id: Option<i64> = conn.query_row(
            "SELECT MAX(id) FROM event_queue WHERE domain = ?",
            [domain],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    /// Delete rows of `domain` with id <= `id`. Returns the number deleted.
    pub fn delete_queue_up_to(&self, domain: &str, id: i64) -> Result<usize> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM event_queue WHERE domain = ?1 AND id <= ?2",
            params![domain, id],
        )?;
        Ok(deleted)
    }

    pub fn delete_queue_row(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM event_queue WHERE id = ?", [id])?;
        Ok(())
    }

    // =========================================================================
    // Author relay cursors
    // =========================================================================

    pub fn load_author_cursors(&self) -> Result<HashMap<String, RelayCursors>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT pubkey, relay, since FROM author_relays")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut cursors: HashMap<String, RelayCursors> = HashMap::new();
        for (pubkey, relay, since) in rows {
            cursors
                .entry(pubkey)
                .or_default()
                .insert(relay, since.max(0) as u64);
        }
        Ok(cursors)
    }

    /// Replace the stored cursors with `(pubkey, relay, since)` triples.
    ///
    /// Cursors lowered for a backfill are stored lowered, and authors no longer
    /// indexed are forgotten.
    pub fn save_author_cursors(&self, cursors: &[(String, String, u64)]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM author_relays", [])?;
        {
            let mut stmt =
                tx.prepare("INSERT INTO author_relays (pubkey, relay, since) VALUES (?1, ?2, ?3)")?;
            for (pubkey, relay, since) in cursors {
                stmt.execute(params![pubkey, relay, *since as i64])?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}

type RawDomain = (String, String, String, String, i64, i64, i64);

fn raw_domain(row: &Row<'_>) -> rusqlite::Result<RawDomain> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn parse_domain(raw: RawDomain) -> Option<DomainRecord> {
    let (domain, site, pubkey, status, rendered, updated, fetched) = raw;
    let site = match site.parse::<SiteAddr>() {
        Ok(site) => site,
        Err(e) => {
            tracing::warn!(domain = %domain, "Skipping domain with bad site address: {}", e);
            return None;
        }
    };
    Some(DomainRecord {
        domain,
        site,
        pubkey,
        status: status.parse().unwrap_or_default(),
        rendered: rendered.max(0) as u64,
        updated: updated.max(0) as u64,
        fetched: fetched.max(0) as u64,
    })
}

fn queue_row(row: &Row<'_>) -> rusqlite::Result<QueueRow> {
    Ok(QueueRow {
        id: row.get(0)?,
        domain: row.get(1)?,
        reference: row.get(2)?,
        timestamp: row.get::<_, i64>(3)?.max(0) as u64,
    })
}
