use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult};
use serde::Serialize;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

/// SQLite index of stored overspeed evidence.
///
/// The image itself lives in the [`crate::storage::ImageStore`]; a row here
/// records where, plus what was measured. WAL mode lets the HTTP handlers read
/// while the persistence worker writes.
pub struct EvidenceDb {
    conn: Mutex<Connection>,
}

/// A row about to be inserted.
#[derive(Debug, Clone)]
pub struct NewEvidence<'a> {
    pub track_id: u64,
    pub speed_kmh: f64,
    pub date: &'a str,
    pub time: &'a str,
    pub captured_at_ms: i64,
    pub image_key: &'a str,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvidenceRecord {
    pub id: i64,
    pub track_id: i64,
    pub speed: f64,
    pub date: String,
    pub time: String,
    pub captured_at_ms: i64,
    pub image_key: String,
}

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS overspeed_events (
        id              INTEGER PRIMARY KEY AUTOINCREMENT,
        track_id        INTEGER NOT NULL,
        speed           REAL    NOT NULL,
        date            TEXT    NOT NULL,
        time            TEXT    NOT NULL,
        captured_at_ms  INTEGER NOT NULL,
        image_key       TEXT    NOT NULL UNIQUE
    );
    CREATE INDEX IF NOT EXISTS idx_captured_at
        ON overspeed_events(captured_at_ms);";

impl EvidenceDb {
    /// Open (or create) the database file, creating its directory if needed.
    pub fn open(path: &Path) -> SqlResult<Self> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|_e| rusqlite::Error::InvalidPath(dir.into()))?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.execute_batch(SCHEMA)?;
        info!(path = path.display().to_string(), "evidence database opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> SqlResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Returns the new row id.
    pub fn insert(&self, row: &NewEvidence<'_>) -> SqlResult<i64> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO overspeed_events (track_id, speed, date, time, captured_at_ms, image_key)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                row.track_id as i64,
                row.speed_kmh,
                row.date,
                row.time,
                row.captured_at_ms,
                row.image_key
            ],
        )?;
        let id = conn.last_insert_rowid();
        debug!(id, track_id = row.track_id, image_key = row.image_key, "inserted evidence row");
        Ok(id)
    }

    /// All records, oldest first.
    pub fn list(&self) -> SqlResult<Vec<EvidenceRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, track_id, speed, date, time, captured_at_ms, image_key
             FROM overspeed_events ORDER BY captured_at_ms ASC, id ASC",
        )?;
        let rows = stmt.query_map([], row_to_record)?;
        rows.collect()
    }

    pub fn get(&self, id: i64) -> SqlResult<Option<EvidenceRecord>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT id, track_id, speed, date, time, captured_at_ms, image_key
             FROM overspeed_events WHERE id = ?1",
            params![id],
            row_to_record,
        )
        .optional()
    }

    /// Returns whether a row was removed.
    pub fn delete(&self, id: i64) -> SqlResult<bool> {
        let conn = self.lock();
        let changed = conn.execute("DELETE FROM overspeed_events WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }

    /// Make every later statement fail.
    #[cfg(test)]
    pub(crate) fn break_schema(&self) {
        self.lock().execute_batch("DROP TABLE overspeed_events;").unwrap();
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> SqlResult<EvidenceRecord> {
    Ok(EvidenceRecord {
        id: row.get(0)?,
        track_id: row.get(1)?,
        speed: row.get(2)?,
        date: row.get(3)?,
        time: row.get(4)?,
        captured_at_ms: row.get(5)?,
        image_key: row.get(6)?,
    })
}
