//! SQLite-backed inventory store.
//!
//! The tape file is a single SQLite database with two tables: `track` (one
//! row per archive member, keyed by `arc_path`) and `tape_metadata` (a small
//! key/value area for the fingerprint and total stream size).  SQLite's
//! default BINARY collation makes `ORDER BY arc_path` a byte-wise sort, which
//! is exactly the ordering the layout pass and the stream rely on.
//!
//! Access is single-threaded: one recorder writes the tape, players open it
//! read-only afterwards.  All writes go through explicit transactions.

use std::path::Path;
use std::time::Duration;

use rusqlite::{Connection, OpenFlags, OptionalExtension, params};

use crate::error::TapeError;
use crate::track::Track;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS track (
    arc_path     TEXT PRIMARY KEY,
    rel_path     TEXT NOT NULL,
    size         INTEGER NOT NULL,
    mtime        INTEGER NOT NULL,
    mode         INTEGER NOT NULL,
    uid          INTEGER NOT NULL,
    gid          INTEGER NOT NULL,
    uname        TEXT NOT NULL,
    gname        TEXT NOT NULL,
    is_dir       INTEGER NOT NULL,
    is_symlink   INTEGER NOT NULL,
    linkname     TEXT NOT NULL,
    start_offset INTEGER NOT NULL DEFAULT 0,
    end_offset   INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS tape_metadata (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
";

const TRACK_COLUMNS: &str = "arc_path, rel_path, size, mtime, mode, uid, gid, \
     uname, gname, is_dir, is_symlink, linkname, start_offset, end_offset";

pub struct InventoryStore {
    conn: Connection,
}

impl InventoryStore {
    /// Create a fresh store at `path` (recording side).
    pub fn create(path: &Path) -> Result<Self, TapeError> {
        let conn = Connection::open(path)
            .map_err(|e| TapeError::store(format!("opening {}", path.display()), e))?;
        Self::configure(&conn)?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| TapeError::store("creating tables", e))?;
        Ok(Self { conn })
    }

    /// Open an existing tape read-only (playback side).
    pub fn open_read_only(path: &Path) -> Result<Self, TapeError> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| TapeError::store(format!("opening {}", path.display()), e))?;
        conn.busy_timeout(Duration::from_secs(10))
            .map_err(|e| TapeError::store("setting busy timeout", e))?;
        Ok(Self { conn })
    }

    fn configure(conn: &Connection) -> Result<(), TapeError> {
        // journal_mode is a query (it reports the resulting mode), the rest
        // are plain settings.
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))
            .map_err(|e| TapeError::store("enabling WAL", e))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|e| TapeError::store("setting synchronous", e))?;
        conn.pragma_update(None, "cache_size", -65536)
            .map_err(|e| TapeError::store("setting cache size", e))?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(|e| TapeError::store("enabling foreign keys", e))?;
        conn.busy_timeout(Duration::from_secs(10))
            .map_err(|e| TapeError::store("setting busy timeout", e))?;
        Ok(())
    }

    /// Insert a batch of tracks in one transaction.
    pub fn insert_tracks(&mut self, tracks: &[Track]) -> Result<(), TapeError> {
        if tracks.is_empty() {
            return Ok(());
        }
        let tx = self
            .conn
            .transaction()
            .map_err(|e| TapeError::store("starting insert transaction", e))?;
        {
            let mut stmt = tx
                .prepare_cached(
                    "INSERT OR REPLACE INTO track (arc_path, rel_path, size, mtime, mode, \
                     uid, gid, uname, gname, is_dir, is_symlink, linkname, start_offset, end_offset) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                )
                .map_err(|e| TapeError::store("preparing track insert", e))?;
            for t in tracks {
                stmt.execute(params![
                    t.arc_path,
                    t.rel_path,
                    t.size as i64,
                    t.mtime as i64,
                    t.mode as i64,
                    t.uid as i64,
                    t.gid as i64,
                    t.uname,
                    t.gname,
                    t.is_dir,
                    t.is_symlink,
                    t.linkname,
                    t.start_offset as i64,
                    t.end_offset as i64,
                ])
                .map_err(|e| TapeError::store(format!("inserting track '{}'", t.arc_path), e))?;
            }
        }
        tx.commit()
            .map_err(|e| TapeError::store("committing track inserts", e))
    }

    /// Apply the layout pass results: `(arc_path, start_offset, end_offset)`
    /// triples, all in one transaction.
    pub fn update_offsets(&mut self, updates: &[(String, u64, u64)]) -> Result<(), TapeError> {
        let tx = self
            .conn
            .transaction()
            .map_err(|e| TapeError::store("starting offset transaction", e))?;
        {
            let mut stmt = tx
                .prepare_cached(
                    "UPDATE track SET start_offset = ?2, end_offset = ?3 WHERE arc_path = ?1",
                )
                .map_err(|e| TapeError::store("preparing offset update", e))?;
            for (arc_path, start, end) in updates {
                stmt.execute(params![arc_path, *start as i64, *end as i64])
                    .map_err(|e| TapeError::store(format!("updating offsets of '{arc_path}'"), e))?;
            }
        }
        tx.commit()
            .map_err(|e| TapeError::store("committing offset updates", e))
    }

    /// All tracks in ascending `arc_path` order (the stream order).
    pub fn tracks_sorted(&self) -> Result<Vec<Track>, TapeError> {
        self.query_tracks(
            &format!("SELECT {TRACK_COLUMNS} FROM track ORDER BY arc_path"),
            params![],
        )
    }

    /// Tracks whose byte window has not fully passed `offset`, in stream
    /// order.  This is the playback query for resume.
    pub fn tracks_from_offset(&self, offset: u64) -> Result<Vec<Track>, TapeError> {
        self.query_tracks(
            &format!(
                "SELECT {TRACK_COLUMNS} FROM track WHERE end_offset > ?1 ORDER BY arc_path"
            ),
            params![offset as i64],
        )
    }

    /// Look up one track by its archive path.
    pub fn get(&self, arc_path: &str) -> Result<Option<Track>, TapeError> {
        let mut found = self.query_tracks(
            &format!("SELECT {TRACK_COLUMNS} FROM track WHERE arc_path = ?1"),
            params![arc_path],
        )?;
        Ok(found.pop())
    }

    /// The unique track whose `[start_offset, end_offset)` window contains
    /// `offset`, if any.
    pub fn find_covering_offset(&self, offset: u64) -> Result<Option<Track>, TapeError> {
        let mut found = self.query_tracks(
            &format!(
                "SELECT {TRACK_COLUMNS} FROM track \
                 WHERE start_offset <= ?1 AND end_offset > ?1 LIMIT 1"
            ),
            params![offset as i64],
        )?;
        Ok(found.pop())
    }

    pub fn count_tracks(&self) -> Result<u64, TapeError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM track", [], |row| row.get(0))
            .map_err(|e| TapeError::store("counting tracks", e))?;
        Ok(count as u64)
    }

    pub fn put_meta(&mut self, key: &str, value: &str) -> Result<(), TapeError> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO tape_metadata (key, value) VALUES (?1, ?2)",
                params![key, value],
            )
            .map_err(|e| TapeError::store(format!("storing metadata '{key}'"), e))?;
        Ok(())
    }

    pub fn get_meta(&self, key: &str) -> Result<Option<String>, TapeError> {
        self.conn
            .query_row(
                "SELECT value FROM tape_metadata WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| TapeError::store(format!("reading metadata '{key}'"), e))
    }

    /// Close the connection, surfacing any final I/O failure.
    pub fn close(self) -> Result<(), TapeError> {
        self.conn
            .close()
            .map_err(|(_, e)| TapeError::store("closing tape store", e))
    }

    fn query_tracks(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<Track>, TapeError> {
        let mut stmt = self
            .conn
            .prepare_cached(sql)
            .map_err(|e| TapeError::store("preparing track query", e))?;
        let rows = stmt
            .query_map(params, row_to_track)
            .map_err(|e| TapeError::store("querying tracks", e))?;
        let mut tracks = Vec::new();
        for row in rows {
            tracks.push(row.map_err(|e| TapeError::store("decoding track row", e))?);
        }
        Ok(tracks)
    }
}

fn row_to_track(row: &rusqlite::Row<'_>) -> rusqlite::Result<Track> {
    Ok(Track {
        arc_path: row.get(0)?,
        rel_path: row.get(1)?,
        size: row.get::<_, i64>(2)? as u64,
        mtime: row.get::<_, i64>(3)? as u64,
        mode: row.get::<_, i64>(4)? as u32,
        uid: row.get::<_, i64>(5)? as u32,
        gid: row.get::<_, i64>(6)? as u32,
        uname: row.get(7)?,
        gname: row.get(8)?,
        is_dir: row.get(9)?,
        is_symlink: row.get(10)?,
        linkname: row.get(11)?,
        start_offset: row.get::<_, i64>(12)? as u64,
        end_offset: row.get::<_, i64>(13)? as u64,
    })
}
