//! `SQLite` persistence layer.
//!
//! Each table lives under its storage key (`table-state-<tableId>`): the
//! latest snapshot plus a log of the deltas committed or received since.

use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use tabletop_sync_core::document::{decode_delta, encode_delta};
use tabletop_sync_core::hlc::TimestampError;
use tabletop_sync_core::{DocSnapshot, DocumentError, DurableState, TableDelta, Timestamp};
use uuid::Uuid;

/// Errors from the durable store.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    /// Database access failed
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// Stored bytes could not be encoded or decoded
    #[error("document error: {0}")]
    Document(#[from] DocumentError),
    /// Stored clock bytes are malformed
    #[error("clock error: {0}")]
    Clock(#[from] TimestampError),
}

type Result<T> = std::result::Result<T, PersistenceError>;

/// `SQLite`-backed persistence store.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open or create a `SQLite` database.
    ///
    /// # Errors
    ///
    /// Returns error if database cannot be opened or initialized.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    /// Create an in-memory database.
    ///
    /// # Errors
    ///
    /// Returns error if database cannot be created.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r"
            -- Latest full state of each table
            CREATE TABLE IF NOT EXISTS table_snapshots (
                storage_key TEXT PRIMARY KEY,
                snapshot_bytes BLOB NOT NULL,
                snapshot_clock BLOB NOT NULL,
                clock_ms INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            );

            -- Delta log
            CREATE TABLE IF NOT EXISTS delta_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                storage_key TEXT NOT NULL,
                delta_id BLOB NOT NULL,
                delta_bytes BLOB NOT NULL,
                actor_id TEXT NOT NULL,
                hlc_ms INTEGER NOT NULL,
                hlc_logical INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                UNIQUE(storage_key, delta_id)
            );

            CREATE INDEX IF NOT EXISTS idx_delta_log_key ON delta_log(storage_key);
            CREATE INDEX IF NOT EXISTS idx_delta_log_hlc ON delta_log(hlc_ms, hlc_logical);

            -- Peer progress tracking
            CREATE TABLE IF NOT EXISTS peer_progress (
                peer_id TEXT NOT NULL,
                storage_key TEXT NOT NULL,
                last_delta_id BLOB,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (peer_id, storage_key)
            );
            ",
        )?;

        Ok(())
    }

    /// Append a delta to the log. Empty deltas and duplicates are ignored.
    ///
    /// # Errors
    ///
    /// Returns error if encoding or the insert fails.
    pub fn save_delta(&self, storage_key: &str, delta: &TableDelta) -> Result<()> {
        let Some(timestamp) = delta.max_timestamp() else {
            return Ok(());
        };
        self.append(storage_key, &timestamp.to_bytes(), &timestamp, delta)
    }

    /// Append a full table state to the log under a fresh id.
    ///
    /// Unlike [`SqliteStore::save_delta`], a state is never deduplicated
    /// against an entry carrying the same newest timestamp.
    ///
    /// # Errors
    ///
    /// Returns error if encoding or the insert fails.
    pub fn save_state(&self, storage_key: &str, state: &TableDelta) -> Result<()> {
        let Some(timestamp) = state.max_timestamp() else {
            return Ok(());
        };
        let delta_id = [&b"state:"[..], Uuid::new_v4().as_bytes()].concat();
        self.append(storage_key, &delta_id, &timestamp, state)
    }

    fn append(&self, storage_key: &str, delta_id: &[u8], timestamp: &Timestamp, delta: &TableDelta) -> Result<()> {
        let bytes = encode_delta(delta)?;

        self.conn.execute(
            r"
            INSERT OR IGNORE INTO delta_log
                (storage_key, delta_id, delta_bytes, actor_id, hlc_ms, hlc_logical, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ",
            (
                storage_key,
                delta_id,
                bytes,
                timestamp.actor.to_string(),
                to_i64(timestamp.physical_ms)?,
                timestamp.logical,
                now_secs(),
            ),
        )?;

        Ok(())
    }

    /// Deltas logged at or after `from_ms`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails or a stored delta is corrupt.
    pub fn deltas_since(&self, storage_key: &str, from_ms: u64) -> Result<Vec<TableDelta>> {
        let mut stmt = self.conn.prepare(
            r"
            SELECT delta_bytes FROM delta_log
            WHERE storage_key = ?1 AND hlc_ms >= ?2
            ORDER BY hlc_ms ASC, hlc_logical ASC
            ",
        )?;

        let rows = stmt
            .query_map((storage_key, to_i64(from_ms)?), |row| row.get::<_, Vec<u8>>(0))?
            .collect::<rusqlite::Result<Vec<Vec<u8>>>>()?;

        rows.iter()
            .map(|bytes| decode_delta(bytes).map_err(PersistenceError::from))
            .collect()
    }

    /// Replace the snapshot of a table.
    ///
    /// # Errors
    ///
    /// Returns error if encoding or the insert fails.
    pub fn save_snapshot(&self, storage_key: &str, snapshot: &DocSnapshot) -> Result<()> {
        let bytes = snapshot.to_cbor()?;

        self.conn.execute(
            r"
            INSERT OR REPLACE INTO table_snapshots
                (storage_key, snapshot_bytes, snapshot_clock, clock_ms, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ",
            (
                storage_key,
                bytes,
                snapshot.clock.to_bytes(),
                to_i64(snapshot.clock.physical_ms)?,
                now_secs(),
            ),
        )?;

        Ok(())
    }

    /// Latest snapshot of a table.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails or the snapshot is corrupt.
    pub fn snapshot(&self, storage_key: &str) -> Result<Option<DocSnapshot>> {
        let bytes: Option<Vec<u8>> = self
            .conn
            .query_row(
                "SELECT snapshot_bytes FROM table_snapshots WHERE storage_key = ?1",
                [storage_key],
                |row| row.get(0),
            )
            .optional()?;

        bytes.map(|bytes| DocSnapshot::from_cbor(&bytes)).transpose().map_err(Into::into)
    }

    /// Clock recorded with the latest snapshot.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails or the clock bytes are malformed.
    pub fn snapshot_clock(&self, storage_key: &str) -> Result<Option<Timestamp>> {
        let bytes: Option<Vec<u8>> = self
            .conn
            .query_row(
                "SELECT snapshot_clock FROM table_snapshots WHERE storage_key = ?1",
                [storage_key],
                |row| row.get(0),
            )
            .optional()?;

        Ok(bytes.map(|bytes| Timestamp::from_bytes(&bytes)).transpose()?)
    }

    /// Everything needed to rebuild a table: the snapshot plus every delta
    /// still in the log.
    ///
    /// Compaction only drops deltas older than the snapshot written with it,
    /// so what remains may include late arrivals timestamped before the
    /// snapshot. Deltas already covered by the snapshot merge as no-ops.
    ///
    /// # Errors
    ///
    /// Returns error if the stored state cannot be read.
    pub fn load(&self, storage_key: &str) -> Result<DurableState> {
        let snapshot = self.snapshot(storage_key)?;
        let deltas = self.deltas_since(storage_key, 0)?;
        Ok(DurableState { snapshot, deltas })
    }

    /// Delete deltas older than `before_ms` (compaction).
    ///
    /// # Errors
    ///
    /// Returns error if delete fails.
    pub fn compact_deltas_before(&self, storage_key: &str, before_ms: u64) -> Result<usize> {
        let deleted = self.conn.execute(
            "DELETE FROM delta_log WHERE storage_key = ?1 AND hlc_ms < ?2",
            (storage_key, to_i64(before_ms)?),
        )?;

        Ok(deleted)
    }

    /// Storage keys that have a snapshot or logged deltas.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub fn storage_keys(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            r"
            SELECT storage_key FROM table_snapshots
            UNION
            SELECT storage_key FROM delta_log
            ORDER BY storage_key
            ",
        )?;

        let keys = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(keys)
    }

    /// Record the last delta received from a peer.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub fn update_peer_progress(&self, peer_id: &str, storage_key: &str, last_delta_id: &[u8]) -> Result<()> {
        self.conn.execute(
            r"
            INSERT OR REPLACE INTO peer_progress (peer_id, storage_key, last_delta_id, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ",
            (peer_id, storage_key, last_delta_id, now_secs()),
        )?;

        Ok(())
    }

    /// Last delta id recorded for a peer.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub fn peer_progress(&self, peer_id: &str, storage_key: &str) -> Result<Option<Vec<u8>>> {
        let progress: Option<Option<Vec<u8>>> = self
            .conn
            .query_row(
                "SELECT last_delta_id FROM peer_progress WHERE peer_id = ?1 AND storage_key = ?2",
                (peer_id, storage_key),
                |row| row.get(0),
            )
            .optional()?;
        Ok(progress.flatten())
    }
}

fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

fn to_i64(value: u64) -> rusqlite::Result<i64> {
    i64::try_from(value).map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
}
