//! Durable session registry backed by SQLite.
//!
//! The registry is the single source of truth for which owners hold a
//! session and which slots are occupied. Rows are written in two steps: a
//! `provisioning` reservation before any process starts, then
//! [`SessionRegistry::mark_running`] once both processes are up.

mod schema;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use buffet_shared::errors::{BuffetError, BuffetResult};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef};
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, ToSql, params};

use crate::runtime::state::SessionStatus;
use crate::runtime::types::{OwnerId, SessionId, SessionSummary};
use crate::slots::SlotPorts;
use crate::supervisor::ProcessKind;

use schema::{SCHEMA, SCHEMA_VERSION, SELECT_COLUMNS};

/// Everything the runtime remembers about a session.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub id: SessionId,
    pub owner_id: OwnerId,
    pub slot: u16,
    pub public_port: u16,
    pub display_port: u16,
    pub image_ref: String,
    pub status: SessionStatus,
    pub hypervisor_pid: Option<u32>,
    pub proxy_pid: Option<u32>,
    pub display_credential: Option<String>,
    pub control_socket: PathBuf,
    pub traffic_log: PathBuf,
    pub created_at: DateTime<Utc>,
}

impl SessionRecord {
    /// A fresh `provisioning` reservation.
    pub fn reservation(
        owner_id: OwnerId,
        ports: SlotPorts,
        image_ref: impl Into<String>,
        control_socket: PathBuf,
        traffic_log: PathBuf,
    ) -> Self {
        Self {
            id: SessionId::new(),
            owner_id,
            slot: ports.slot.index(),
            public_port: ports.public_port,
            display_port: ports.display_port,
            image_ref: image_ref.into(),
            status: SessionStatus::Provisioning,
            hypervisor_pid: None,
            proxy_pid: None,
            display_credential: None,
            control_socket,
            traffic_log,
            created_at: Utc::now(),
        }
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            owner_id: self.owner_id.clone(),
            slot: self.slot,
            public_port: self.public_port,
            display_port: self.display_port,
            image_ref: self.image_ref.clone(),
            status: self.status,
            created_at: self.created_at,
        }
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let created_at_ms: i64 = row.get(12)?;
        let created_at = DateTime::from_timestamp_millis(created_at_ms).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                12,
                rusqlite::types::Type::Integer,
                format!("timestamp {} out of range", created_at_ms).into(),
            )
        })?;

        Ok(Self {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            slot: row.get(2)?,
            public_port: row.get(3)?,
            display_port: row.get(4)?,
            image_ref: row.get(5)?,
            status: row.get(6)?,
            hypervisor_pid: row.get(7)?,
            proxy_pid: row.get(8)?,
            display_credential: row.get(9)?,
            control_socket: PathBuf::from(row.get::<_, String>(10)?),
            traffic_log: PathBuf::from(row.get::<_, String>(11)?),
            created_at,
        })
    }
}

impl std::fmt::Debug for SessionRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRecord")
            .field("id", &self.id)
            .field("owner_id", &self.owner_id)
            .field("slot", &self.slot)
            .field("image_ref", &self.image_ref)
            .field("status", &self.status)
            .field("hypervisor_pid", &self.hypervisor_pid)
            .field("proxy_pid", &self.proxy_pid)
            .field(
                "display_credential",
                &self.display_credential.as_ref().map(|_| "<redacted>"),
            )
            .finish_non_exhaustive()
    }
}

impl ToSql for SessionStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::Borrowed(ValueRef::Text(self.as_str().as_bytes())))
    }
}

impl FromSql for SessionStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: BuffetError| FromSqlError::Other(Box::new(e)))
    }
}

/// Thread-safe handle to the registry database.
///
/// Cloning shares the same connection.
#[derive(Clone)]
pub struct SessionRegistry {
    conn: Arc<Mutex<Connection>>,
}

impl SessionRegistry {
    /// Open (creating if needed) the registry at `path`.
    pub fn open(path: &Path) -> BuffetResult<Self> {
        let conn = Connection::open(path).map_err(|e| {
            BuffetError::Database(format!("failed to open {}: {}", path.display(), e))
        })?;
        let registry = Self::init(conn)?;
        tracing::debug!(path = %path.display(), "Session registry opened");
        Ok(registry)
    }

    pub fn open_in_memory() -> BuffetResult<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> BuffetResult<Self> {
        conn.busy_timeout(Duration::from_secs(5)).map_err(db_err)?;

        let version: i64 = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .map_err(db_err)?;
        if version > SCHEMA_VERSION {
            return Err(BuffetError::Database(format!(
                "registry schema version {} is newer than supported {}",
                version, SCHEMA_VERSION
            )));
        }

        conn.execute_batch(SCHEMA).map_err(db_err)?;
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)
            .map_err(db_err)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Insert a reservation row.
    ///
    /// Fails with `AlreadyHasSession` when the owner already holds a row
    /// and with `SlotTaken` when another create claimed the slot first.
    pub fn reserve(&self, record: &SessionRecord) -> BuffetResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sessions (id, owner_id, slot, public_port, display_port, image_ref, \
             status, hypervisor_pid, proxy_pid, display_credential, control_socket, \
             traffic_log, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                record.id,
                record.owner_id,
                record.slot,
                record.public_port,
                record.display_port,
                record.image_ref,
                record.status,
                record.hypervisor_pid,
                record.proxy_pid,
                record.display_credential,
                record.control_socket.to_string_lossy(),
                record.traffic_log.to_string_lossy(),
                record.created_at.timestamp_millis(),
            ],
        )
        .map_err(|e| map_reserve_err(e, record))?;

        tracing::debug!(
            session_id = %record.id,
            owner = %record.owner_id,
            slot = record.slot,
            "Reserved session slot"
        );
        Ok(())
    }

    /// Record the pid of a process as soon as it has started, so the sweep
    /// can find it even if provisioning never completes.
    pub fn record_process(&self, id: &SessionId, kind: ProcessKind, pid: u32) -> BuffetResult<()> {
        let sql = match kind {
            ProcessKind::Hypervisor => "UPDATE sessions SET hypervisor_pid = ?2 WHERE id = ?1",
            ProcessKind::Proxy => "UPDATE sessions SET proxy_pid = ?2 WHERE id = ?1",
        };
        let changed = self
            .conn
            .lock()
            .execute(sql, params![id, pid])
            .map_err(db_err)?;
        if changed == 0 {
            return Err(BuffetError::NotFound(format!("session {}", id)));
        }
        Ok(())
    }

    /// Finalize a reservation: store both pids and the credential, and
    /// move the row to `running`.
    pub fn mark_running(
        &self,
        id: &SessionId,
        hypervisor_pid: u32,
        proxy_pid: u32,
        display_credential: Option<&str>,
    ) -> BuffetResult<()> {
        let conn = self.conn.lock();
        let current = status_of(&conn, id)?;
        let next = current.transition_to(SessionStatus::Running)?;
        conn.execute(
            "UPDATE sessions SET status = ?2, hypervisor_pid = ?3, proxy_pid = ?4, \
             display_credential = ?5 WHERE id = ?1",
            params![id, next, hypervisor_pid, proxy_pid, display_credential],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Move a row along the state machine.
    pub fn set_status(&self, id: &SessionId, status: SessionStatus) -> BuffetResult<()> {
        let conn = self.conn.lock();
        let next = status_of(&conn, id)?.transition_to(status)?;
        conn.execute(
            "UPDATE sessions SET status = ?2 WHERE id = ?1",
            params![id, next],
        )
        .map_err(db_err)?;
        Ok(())
    }

    pub fn get(&self, id: &SessionId) -> BuffetResult<Option<SessionRecord>> {
        let sql = format!("SELECT {} FROM sessions WHERE id = ?1", SELECT_COLUMNS);
        self.conn
            .lock()
            .query_row(&sql, params![id], SessionRecord::from_row)
            .optional()
            .map_err(db_err)
    }

    pub fn get_by_owner(&self, owner: &OwnerId) -> BuffetResult<Option<SessionRecord>> {
        let sql = format!("SELECT {} FROM sessions WHERE owner_id = ?1", SELECT_COLUMNS);
        self.conn
            .lock()
            .query_row(&sql, params![owner], SessionRecord::from_row)
            .optional()
            .map_err(db_err)
    }

    /// Every row, in slot order.
    pub fn list(&self) -> BuffetResult<Vec<SessionRecord>> {
        let sql = format!("SELECT {} FROM sessions ORDER BY slot", SELECT_COLUMNS);
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql).map_err(db_err)?;
        let rows = stmt
            .query_map([], SessionRecord::from_row)
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;
        Ok(rows)
    }

    /// Slots held by any row, whatever its status.
    pub fn occupied_slots(&self) -> BuffetResult<Vec<u16>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT slot FROM sessions ORDER BY slot")
            .map_err(db_err)?;
        let slots = stmt
            .query_map([], |row| row.get(0))
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<u16>>>()
            .map_err(db_err)?;
        Ok(slots)
    }

    pub fn count_running(&self) -> BuffetResult<usize> {
        let count: i64 = self
            .conn
            .lock()
            .query_row(
                "SELECT COUNT(*) FROM sessions WHERE status = ?1",
                params![SessionStatus::Running],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        Ok(count as usize)
    }

    /// Remove a row. Returns whether it existed.
    pub fn delete(&self, id: &SessionId) -> BuffetResult<bool> {
        let changed = self
            .conn
            .lock()
            .execute("DELETE FROM sessions WHERE id = ?1", params![id])
            .map_err(db_err)?;
        if changed > 0 {
            tracing::debug!(session_id = %id, "Session row deleted");
        }
        Ok(changed > 0)
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry").finish_non_exhaustive()
    }
}

fn status_of(conn: &Connection, id: &SessionId) -> BuffetResult<SessionStatus> {
    conn.query_row(
        "SELECT status FROM sessions WHERE id = ?1",
        params![id],
        |row| row.get(0),
    )
    .optional()
    .map_err(db_err)?
    .ok_or_else(|| BuffetError::NotFound(format!("session {}", id)))
}

fn db_err(e: rusqlite::Error) -> BuffetError {
    BuffetError::Database(e.to_string())
}

/// SQLite reports the violated column as "UNIQUE constraint failed: sessions.<col>".
fn map_reserve_err(e: rusqlite::Error, record: &SessionRecord) -> BuffetError {
    if let rusqlite::Error::SqliteFailure(failure, Some(message)) = &e
        && failure.code == ErrorCode::ConstraintViolation
    {
        if message.contains("sessions.owner_id") {
            return BuffetError::AlreadyHasSession(record.owner_id.to_string());
        }
        if message.contains("sessions.slot") {
            return BuffetError::SlotTaken(record.slot);
        }
    }
    db_err(e)
}
