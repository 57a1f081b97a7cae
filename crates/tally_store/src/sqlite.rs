//! SQLite backend: one `samples` table, WAL journal.
//!
//! Scans are paged by rowid so a full-history scan never materializes the
//! whole table.

use crate::{FactBackend, SampleIter, StoreError};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags};
use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tally_types::{BucketKey, TelemetrySample};

const SCAN_PAGE: i64 = 512;

pub struct SqliteBackend {
    conn: Mutex<Connection>,
}

impl SqliteBackend {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| StoreError::Unavailable(e.to_string()))?;
            }
        }
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )
        .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        let conn =
            Connection::open_in_memory().map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        apply_pragmas(&conn)?;
        create_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Up to `SCAN_PAGE` rows with rowid greater than `after`.
    fn page(&self, bucket: Option<&str>, after: i64) -> Result<Vec<(i64, String)>, StoreError> {
        let conn = self.conn.lock();
        let map_row = |r: &rusqlite::Row<'_>| Ok((r.get::<_, i64>(0)?, r.get::<_, String>(1)?));
        let rows: rusqlite::Result<Vec<(i64, String)>> = match bucket {
            Some(bucket) => {
                let mut stmt = conn
                    .prepare_cached(
                        "SELECT id, body_json FROM samples
                         WHERE bucket = ?1 AND id > ?2
                         ORDER BY id ASC LIMIT ?3",
                    )
                    .map_err(|e| StoreError::Backend(e.to_string()))?;
                let rows = stmt
                    .query_map(params![bucket, after, SCAN_PAGE], map_row)
                    .and_then(|mapped| mapped.collect());
                rows
            }
            None => {
                let mut stmt = conn
                    .prepare_cached(
                        "SELECT id, body_json FROM samples
                         WHERE id > ?1
                         ORDER BY id ASC LIMIT ?2",
                    )
                    .map_err(|e| StoreError::Backend(e.to_string()))?;
                let rows = stmt
                    .query_map(params![after, SCAN_PAGE], map_row)
                    .and_then(|mapped| mapped.collect());
                rows
            }
        };
        rows.map_err(|e| StoreError::Backend(e.to_string()))
    }
}

fn apply_pragmas(conn: &Connection) -> Result<(), StoreError> {
    conn.pragma_update(None, "journal_mode", "WAL")
        .map_err(|e| StoreError::Backend(e.to_string()))?;
    conn.pragma_update(None, "synchronous", "NORMAL")
        .map_err(|e| StoreError::Backend(e.to_string()))?;
    conn.busy_timeout(Duration::from_millis(5_000))
        .map_err(|e| StoreError::Backend(e.to_string()))?;
    Ok(())
}

fn create_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS samples (
          id           INTEGER PRIMARY KEY AUTOINCREMENT,
          bucket       TEXT NOT NULL,
          body_json    TEXT NOT NULL,
          submitted_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_samples_bucket
        ON samples (bucket, id);
        ",
    )
    .map_err(|e| StoreError::Backend(e.to_string()))
}

impl FactBackend for SqliteBackend {
    fn append(&self, sample: &TelemetrySample) -> Result<(), StoreError> {
        let body =
            serde_json::to_string(sample).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO samples (bucket, body_json, submitted_at) VALUES (?1, ?2, ?3)",
            params![
                sample.bucket_key().storage_prefix(),
                body,
                sample.submitted_at.timestamp()
            ],
        )
        .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }

    fn scan(&self, bucket: Option<&BucketKey>) -> Result<SampleIter<'_>, StoreError> {
        Ok(Box::new(Pager {
            backend: self,
            bucket: bucket.map(BucketKey::storage_prefix),
            last_id: 0,
            buffer: VecDeque::new(),
            done: false,
        }))
    }

    fn ping(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.query_row("SELECT 1", [], |r| r.get::<_, i64>(0))
            .map(|_| ())
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }

    fn flush(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.query_row("PRAGMA wal_checkpoint(PASSIVE)", [], |_| Ok(()))
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }
}

/// Lazily walks the table one page at a time.
struct Pager<'a> {
    backend: &'a SqliteBackend,
    bucket: Option<String>,
    last_id: i64,
    buffer: VecDeque<String>,
    done: bool,
}

impl Iterator for Pager<'_> {
    type Item = Result<TelemetrySample, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.done {
            match self.backend.page(self.bucket.as_deref(), self.last_id) {
                Ok(rows) => {
                    if (rows.len() as i64) < SCAN_PAGE {
                        self.done = true;
                    }
                    if let Some((id, _)) = rows.last() {
                        self.last_id = *id;
                    }
                    self.buffer.extend(rows.into_iter().map(|(_, body)| body));
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
        let body = self.buffer.pop_front()?;
        Some(serde_json::from_str(&body).map_err(|e| StoreError::Serialization(e.to_string())))
    }
}
