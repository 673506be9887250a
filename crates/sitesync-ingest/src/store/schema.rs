//! SQLite schema for the domain store.
//!
//! This module defines the database schema and records its version.

use rusqlite::{Connection, Result};

/// Current schema version. Increment when making breaking changes.
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema.
///
/// Creates all tables on a fresh database; an initialized one is left as is.
pub fn init_schema(conn: &Connection) -> Result<()> {
    if get_schema_version(conn)? == 0 {
        create_tables(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    }
    Ok(())
}

/// Get the current schema version (0 if not initialized).
fn get_schema_version(conn: &Connection) -> Result<i32> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER NOT NULL
        )",
        [],
    )?;

    let version: Option<i32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
            row.get(0)
        })
        .ok();

    Ok(version.unwrap_or(0))
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?)", [version])?;
    Ok(())
}

/// Create all tables for a fresh database.
fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Deployed sites and their watermarks
        CREATE TABLE IF NOT EXISTS domains (
            domain TEXT PRIMARY KEY,
            site TEXT NOT NULL,
            pubkey TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'reserved',
            timestamp INTEGER NOT NULL DEFAULT 0,
            rendered INTEGER NOT NULL DEFAULT 0,
            updated INTEGER NOT NULL DEFAULT 0,
            fetched INTEGER NOT NULL DEFAULT 0
        );

        -- Incremental render work; ids are never reused
        CREATE TABLE IF NOT EXISTS event_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            domain TEXT NOT NULL,
            event_id TEXT NOT NULL,
            timestamp INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_domains_status ON domains(status);
        CREATE INDEX IF NOT EXISTS idx_event_queue_domain ON event_queue(domain, id);

        -- Per-(author, relay) scan cursors
        CREATE TABLE IF NOT EXISTS author_relays (
            pubkey TEXT NOT NULL,
            relay TEXT NOT NULL,
            since INTEGER NOT NULL,
            PRIMARY KEY (pubkey, relay)
        );
        "#,
    )?;

    Ok(())
}

/// Lifecycle of a domain record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DomainStatus {
    /// Name claimed, site not live yet.
    #[default]
    Reserved,
    /// Live; watched and rendered.
    Deployed,
    /// Taken down or expired.
    Released,
}

impl DomainStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reserved => "reserved",
            Self::Deployed => "deployed",
            Self::Released => "released",
        }
    }
}

impl std::str::FromStr for DomainStatus {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "reserved" => Ok(Self::Reserved),
            "deployed" => Ok(Self::Deployed),
            "released" => Ok(Self::Released),
            _ => Err(()),
        }
    }
}
