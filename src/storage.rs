use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::sync::{Mutex, MutexGuard};

use crate::cache::SourceState;

/// Sink for lifecycle transitions, called best-effort by workers.
///
/// Callers log failures and carry on; implementations must not retry.
pub trait StatusRecorder: Send + Sync {
    fn record_status(&self, source: &str, state: SourceState) -> Result<()>;
}

/// A registered camera as persisted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Camera {
    pub token: String,
    pub rtsp_url: String,
    pub status: SourceState,
}

/// SQLite registry of which cameras exist.
pub struct CameraStore {
    conn: Mutex<Connection>,
}

impl CameraStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = open_db_connection(db_path)
            .with_context(|| format!("open camera database {}", db_path))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    /// Private in-memory database, for tests and ephemeral runs.
    pub fn open_in_memory() -> Result<Self> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("camera database lock poisoned"))
    }

    fn ensure_schema(&self) -> Result<()> {
        self.conn()?.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS cameras (
              token TEXT PRIMARY KEY,
              rtsp_url TEXT NOT NULL,
              status TEXT DEFAULT 'inactive'
            );
            "#,
        )?;
        Ok(())
    }

    pub fn add_camera(&self, token: &str, rtsp_url: &str, status: SourceState) -> Result<()> {
        self.conn()?
            .execute(
                "INSERT INTO cameras (token, rtsp_url, status) VALUES (?1, ?2, ?3)",
                params![token, rtsp_url, status.as_str()],
            )
            .with_context(|| format!("insert camera {}", token))?;
        Ok(())
    }

    pub fn get_camera(&self, token: &str) -> Result<Option<Camera>> {
        let conn = self.conn()?;
        let camera = conn
            .query_row(
                "SELECT token, rtsp_url, status FROM cameras WHERE token = ?1",
                params![token],
                row_to_camera,
            )
            .optional()?;
        Ok(camera)
    }

    pub fn update_status(&self, token: &str, status: SourceState) -> Result<()> {
        self.conn()?.execute(
            "UPDATE cameras SET status = ?1 WHERE token = ?2",
            params![status.as_str(), token],
        )?;
        Ok(())
    }

    pub fn delete_camera(&self, token: &str) -> Result<()> {
        self.conn()?
            .execute("DELETE FROM cameras WHERE token = ?1", params![token])?;
        Ok(())
    }

    pub fn list_cameras(&self) -> Result<Vec<Camera>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT token, rtsp_url, status FROM cameras ORDER BY token")?;
        let rows = stmt.query_map([], row_to_camera)?;
        let mut cameras = Vec::new();
        for row in rows {
            cameras.push(row?);
        }
        Ok(cameras)
    }
}

impl StatusRecorder for CameraStore {
    fn record_status(&self, source: &str, state: SourceState) -> Result<()> {
        self.update_status(source, state)
    }
}

fn row_to_camera(row: &rusqlite::Row<'_>) -> rusqlite::Result<Camera> {
    let status: Option<String> = row.get(2)?;
    Ok(Camera {
        token: row.get(0)?,
        rtsp_url: row.get(1)?,
        status: status
            .as_deref()
            .map(SourceState::parse)
            .unwrap_or(SourceState::Inactive),
    })
}

fn open_db_connection(db_path: &str) -> Result<Connection> {
    if db_path.starts_with("file:") {
        return Ok(Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )?);
    }
    Ok(Connection::open(db_path)?)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
