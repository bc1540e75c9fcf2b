//! SQLite-backed identity and attendance-event storage.

use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use presenza_core::{Embedding, IdentityId, IdentityRecord};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

/// Timestamp format used in the database, sortable as text.
pub(crate) const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
/// Calendar-day format; the key of the per-day attendance state machine.
pub(crate) const DAY_FORMAT: &str = "%Y-%m-%d";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("identity {0} already exists")]
    DuplicateIdentity(IdentityId),
    #[error("name {0:?} is already taken")]
    DuplicateName(String),
    #[error("identity requires at least one reference embedding")]
    NoEmbeddings,
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Kind of a stored attendance event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    CheckIn,
    CheckOut,
}

impl EventKind {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            EventKind::CheckIn => "check_in",
            EventKind::CheckOut => "check_out",
        }
    }

    pub(crate) fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "check_in" => Ok(EventKind::CheckIn),
            "check_out" => Ok(EventKind::CheckOut),
            other => Err(StoreError::Corrupt(format!("unknown event kind {other:?}"))),
        }
    }
}

/// One stored attendance event. Immutable once written.
#[derive(Debug, Clone, Serialize)]
pub struct AttendanceEvent {
    pub identity_id: IdentityId,
    pub kind: EventKind,
    pub day: String,
    pub at: String,
    pub distance: Option<f32>,
}

/// One identity's attendance for a day, for reports.
#[derive(Debug, Clone, Serialize)]
pub struct DayRecord {
    pub identity_id: IdentityId,
    pub name: String,
    pub check_in: Option<String>,
    pub check_out: Option<String>,
    pub worked_hours: Option<f64>,
}

/// Handle to the SQLite database.
///
/// A single mutex-guarded connection: writers serialize on the mutex and
/// read-modify-write sequences run inside one transaction.
pub struct Store {
    pub(crate) conn: Mutex<Connection>,
}

impl Store {
    /// Open (and migrate) the database at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(dir) = path.parent() {
            let _ = std::fs::create_dir_all(dir);
        }
        let conn = Connection::open(path)?;
        let store = Self::init(conn)?;
        tracing::info!(path = %path.display(), "attendance database opened");
        Ok(store)
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS identities (
                id          TEXT PRIMARY KEY,
                name        TEXT UNIQUE NOT NULL,
                created_at  TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS reference_embeddings (
                identity_id TEXT NOT NULL REFERENCES identities(id) ON DELETE CASCADE,
                position    INTEGER NOT NULL,
                vector      BLOB NOT NULL,
                PRIMARY KEY (identity_id, position)
            );

            CREATE TABLE IF NOT EXISTS attendance_events (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                identity_id TEXT NOT NULL,
                kind        TEXT NOT NULL CHECK (kind IN ('check_in', 'check_out')),
                day         TEXT NOT NULL,
                at          TEXT NOT NULL,
                distance    REAL,
                UNIQUE (identity_id, day, kind)
            );

            CREATE INDEX IF NOT EXISTS idx_events_identity_day
                ON attendance_events(identity_id, day);
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Persist an identity and its reference embeddings atomically.
    ///
    /// An identity without embeddings can never match, so an empty set is
    /// rejected before anything is written.
    pub fn add_identity(
        &self,
        id: IdentityId,
        name: &str,
        embeddings: &[Embedding],
    ) -> Result<(), StoreError> {
        if embeddings.is_empty() {
            return Err(StoreError::NoEmbeddings);
        }
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let tx = conn.transaction()?;

        let exists = tx
            .query_row(
                "SELECT 1 FROM identities WHERE id = ?1",
                params![id.to_string()],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if exists {
            return Err(StoreError::DuplicateIdentity(id));
        }

        let created_at = Local::now().format(TIMESTAMP_FORMAT).to_string();
        tx.execute(
            "INSERT INTO identities (id, name, created_at) VALUES (?1, ?2, ?3)",
            params![id.to_string(), name, created_at],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(f, _)
                if f.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                StoreError::DuplicateName(name.to_string())
            }
            other => StoreError::Sqlite(other),
        })?;
        for (position, embedding) in embeddings.iter().enumerate() {
            tx.execute(
                "INSERT INTO reference_embeddings (identity_id, position, vector) VALUES (?1, ?2, ?3)",
                params![id.to_string(), position as i64, encode_vector(embedding)],
            )?;
        }
        tx.commit()?;
        tracing::info!(identity = %id, name, references = embeddings.len(), "identity stored");
        Ok(())
    }

    /// Delete an identity, its reference embeddings, and its attendance rows.
    ///
    /// Returns whether the identity existed.
    pub fn remove_identity(&self, id: IdentityId) -> Result<bool, StoreError> {
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM attendance_events WHERE identity_id = ?1",
            params![id.to_string()],
        )?;
        let removed = tx.execute("DELETE FROM identities WHERE id = ?1", params![id.to_string()])?;
        tx.commit()?;
        Ok(removed > 0)
    }

    /// Load all identities with their embeddings, in enrollment order.
    /// Used to rebuild the gallery at startup.
    pub fn load_identities(&self) -> Result<Vec<IdentityRecord>, StoreError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT i.id, i.name, e.vector
             FROM identities i
             LEFT JOIN reference_embeddings e ON e.identity_id = i.id
             ORDER BY i.rowid, e.position",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<Vec<u8>>>(2)?,
            ))
        })?;

        let mut records: Vec<IdentityRecord> = Vec::new();
        for row in rows {
            let (id_text, name, blob) = row?;
            let id = parse_identity_id(&id_text)?;
            if records.last().map(|r| r.id) != Some(id) {
                records.push(IdentityRecord {
                    id,
                    name,
                    embeddings: Vec::new(),
                });
            }
            if let Some(blob) = blob {
                // Presence checked just above.
                if let Some(record) = records.last_mut() {
                    record.embeddings.push(decode_vector(&blob)?);
                }
            }
        }
        Ok(records)
    }

    pub fn identity_count(&self) -> Result<usize, StoreError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM identities", [], |r| r.get(0))?;
        Ok(count as usize)
    }

    pub fn identity_name(&self, id: IdentityId) -> Result<Option<String>, StoreError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        Ok(conn
            .query_row(
                "SELECT name FROM identities WHERE id = ?1",
                params![id.to_string()],
                |r| r.get(0),
            )
            .optional()?)
    }

    /// All stored events for one identity on one day, in write order.
    pub fn events_for_day(
        &self,
        id: IdentityId,
        day: &str,
    ) -> Result<Vec<AttendanceEvent>, StoreError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT kind, at, distance FROM attendance_events
             WHERE identity_id = ?1 AND day = ?2 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![id.to_string(), day], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<f64>>(2)?,
            ))
        })?;

        let mut events = Vec::new();
        for row in rows {
            let (kind, at, distance) = row?;
            events.push(AttendanceEvent {
                identity_id: id,
                kind: EventKind::parse(&kind)?,
                day: day.to_string(),
                at,
                distance: distance.map(|d| d as f32),
            });
        }
        Ok(events)
    }

    /// Per-identity attendance summary for one day, identities without any
    /// event omitted.
    pub fn daily_report(&self, day: &str) -> Result<Vec<DayRecord>, StoreError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT i.id, i.name,
                    MAX(CASE WHEN e.kind = 'check_in'  THEN e.at END),
                    MAX(CASE WHEN e.kind = 'check_out' THEN e.at END)
             FROM identities i
             JOIN attendance_events e ON e.identity_id = i.id AND e.day = ?1
             GROUP BY i.id, i.name
             ORDER BY i.name",
        )?;
        let rows = stmt.query_map(params![day], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, Option<String>>(3)?,
            ))
        })?;

        let mut report = Vec::new();
        for row in rows {
            let (id_text, name, check_in, check_out) = row?;
            let worked_hours = match (&check_in, &check_out) {
                (Some(ci), Some(co)) => {
                    let ci = parse_timestamp(ci)?;
                    let co = parse_timestamp(co)?;
                    Some((co - ci).num_seconds() as f64 / 3600.0)
                }
                _ => None,
            };
            report.push(DayRecord {
                identity_id: parse_identity_id(&id_text)?,
                name,
                check_in,
                check_out,
                worked_hours,
            });
        }
        Ok(report)
    }
}

pub(crate) fn parse_identity_id(text: &str) -> Result<IdentityId, StoreError> {
    text.parse()
        .map_err(|_| StoreError::Corrupt(format!("invalid identity id {text:?}")))
}

pub(crate) fn parse_timestamp(text: &str) -> Result<DateTime<Local>, StoreError> {
    let naive = NaiveDateTime::parse_from_str(text, TIMESTAMP_FORMAT)
        .map_err(|e| StoreError::Corrupt(format!("invalid timestamp {text:?}: {e}")))?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .ok_or_else(|| StoreError::Corrupt(format!("ambiguous timestamp {text:?}")))
}

/// Serialize an embedding as little-endian f32 bytes.
fn encode_vector(embedding: &Embedding) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(embedding.dim() * 4);
    for v in embedding.values() {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

fn decode_vector(blob: &[u8]) -> Result<Embedding, StoreError> {
    if blob.len() % 4 != 0 {
        return Err(StoreError::Corrupt(format!(
            "embedding blob length {} is not a multiple of 4",
            blob.len()
        )));
    }
    let values = blob
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    // Stored vectors are already normalized; from_raw is idempotent on them.
    Ok(Embedding::from_raw(values))
}
