//! Instance record persistence

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{Connection, OptionalExtension};

use super::DatabaseResult;

/// Lifecycle status persisted for an instance.
///
/// Combined with `allocated_by` and `deleted_at` this yields the observable
/// state: a deleted row is finished, an active row with an allocation is
/// allocated, and so on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceStatus {
    Starting,
    Ready,
    Error,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Starting => "starting",
            InstanceStatus::Ready => "ready",
            InstanceStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromSql for InstanceStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value.as_str()? {
            "starting" => Ok(InstanceStatus::Starting),
            "ready" => Ok(InstanceStatus::Ready),
            "error" => Ok(InstanceStatus::Error),
            other => Err(FromSqlError::Other(
                format!("unknown instance status: {}", other).into(),
            )),
        }
    }
}

impl ToSql for InstanceStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

/// One container plus the daemon's bookkeeping for it
#[derive(Debug, Clone)]
pub struct Instance {
    pub id: i64,
    pub docker_id: String,
    pub pt_port: u16,
    pub vnc_port: u16,
    pub status: InstanceStatus,
    pub allocated_by: Option<i64>,
    pub created_at: i64,
    pub deleted_at: Option<i64>,
}

impl Instance {
    /// Whether the instance is still live (not finished)
    pub fn is_active(&self) -> bool {
        self.deleted_at.is_none()
    }

    /// Whether a client currently holds the instance
    pub fn is_allocated(&self) -> bool {
        self.allocated_by.is_some()
    }
}

const COLUMNS: &str =
    "id, docker_id, pt_port, vnc_port, status, allocated_by, created_at, deleted_at";

/// Store for instance records
pub struct InstanceStore;

impl InstanceStore {
    pub fn new() -> Self {
        Self
    }

    /// Persist a new instance in the STARTING state
    pub fn create(
        &self,
        conn: &Connection,
        docker_id: &str,
        pt_port: u16,
        vnc_port: u16,
    ) -> DatabaseResult<Instance> {
        conn.execute(
            "INSERT INTO instance (docker_id, pt_port, vnc_port, status) VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![docker_id, pt_port, vnc_port, InstanceStatus::Starting],
        )?;
        let id = conn.last_insert_rowid();
        self.get(conn, id)?.ok_or_else(|| {
            super::DatabaseError::Other(format!("instance {} vanished after insert", id))
        })
    }

    /// Get an instance by id
    pub fn get(&self, conn: &Connection, id: i64) -> DatabaseResult<Option<Instance>> {
        let instance = conn
            .query_row(
                &format!("SELECT {} FROM instance WHERE id = ?1", COLUMNS),
                [id],
                Self::map_row,
            )
            .optional()?;
        Ok(instance)
    }

    /// Get the instance backing a container
    pub fn get_by_docker_id(
        &self,
        conn: &Connection,
        docker_id: &str,
    ) -> DatabaseResult<Option<Instance>> {
        let instance = conn
            .query_row(
                &format!(
                    "SELECT {} FROM instance WHERE docker_id = ?1 AND deleted_at IS NULL",
                    COLUMNS
                ),
                [docker_id],
                Self::map_row,
            )
            .optional()?;
        Ok(instance)
    }

    /// Get the instance held by an allocation
    pub fn get_by_allocation(
        &self,
        conn: &Connection,
        allocation_id: i64,
    ) -> DatabaseResult<Option<Instance>> {
        let instance = conn
            .query_row(
                &format!("SELECT {} FROM instance WHERE allocated_by = ?1", COLUMNS),
                [allocation_id],
                Self::map_row,
            )
            .optional()?;
        Ok(instance)
    }

    /// Every instance the daemon has ever tracked
    pub fn all(&self, conn: &Connection) -> DatabaseResult<Vec<Instance>> {
        let mut stmt =
            conn.prepare(&format!("SELECT {} FROM instance ORDER BY id", COLUMNS))?;
        let instances = stmt
            .query_map([], Self::map_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(instances)
    }

    /// Live instances
    pub fn active(&self, conn: &Connection) -> DatabaseResult<Vec<Instance>> {
        self.query(conn, "deleted_at IS NULL")
    }

    /// Instances that were deleted
    pub fn finished(&self, conn: &Connection) -> DatabaseResult<Vec<Instance>> {
        self.query(conn, "deleted_at IS NOT NULL")
    }

    /// Live instances still warming up
    pub fn starting(&self, conn: &Connection) -> DatabaseResult<Vec<Instance>> {
        self.query(conn, "deleted_at IS NULL AND status = 'starting'")
    }

    /// Live instances currently leased to a client
    pub fn allocated(&self, conn: &Connection) -> DatabaseResult<Vec<Instance>> {
        self.query(conn, "deleted_at IS NULL AND allocated_by IS NOT NULL")
    }

    /// Live instances marked erroneous
    pub fn erroneous(&self, conn: &Connection) -> DatabaseResult<Vec<Instance>> {
        self.query(conn, "deleted_at IS NULL AND status = 'error'")
    }

    /// Lease candidates: unallocated, usable, warm ones first.
    pub fn deallocated(&self, conn: &Connection) -> DatabaseResult<Vec<Instance>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM instance
             WHERE deleted_at IS NULL AND allocated_by IS NULL
               AND status IN ('ready', 'starting')
             ORDER BY CASE status WHEN 'ready' THEN 0 ELSE 1 END, id",
            COLUMNS
        ))?;
        let instances = stmt
            .query_map([], Self::map_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(instances)
    }

    /// Update the status field
    pub fn set_status(
        &self,
        conn: &Connection,
        id: i64,
        status: InstanceStatus,
    ) -> DatabaseResult<()> {
        conn.execute(
            "UPDATE instance SET status = ?2 WHERE id = ?1",
            rusqlite::params![id, status],
        )?;
        Ok(())
    }

    /// Bind the instance to an allocation
    pub fn set_allocation(
        &self,
        conn: &Connection,
        id: i64,
        allocation_id: Option<i64>,
    ) -> DatabaseResult<()> {
        conn.execute(
            "UPDATE instance SET allocated_by = ?2 WHERE id = ?1",
            rusqlite::params![id, allocation_id],
        )?;
        Ok(())
    }

    /// Mark the instance finished
    pub fn finish(&self, conn: &Connection, id: i64) -> DatabaseResult<()> {
        conn.execute(
            "UPDATE instance SET deleted_at = strftime('%s', 'now') WHERE id = ?1 AND deleted_at IS NULL",
            [id],
        )?;
        Ok(())
    }

    fn query(&self, conn: &Connection, predicate: &str) -> DatabaseResult<Vec<Instance>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM instance WHERE {} ORDER BY id",
            COLUMNS, predicate
        ))?;
        let instances = stmt
            .query_map([], Self::map_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(instances)
    }

    fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Instance> {
        Ok(Instance {
            id: row.get(0)?,
            docker_id: row.get(1)?,
            pt_port: row.get(2)?,
            vnc_port: row.get(3)?,
            status: row.get(4)?,
            allocated_by: row.get(5)?,
            created_at: row.get(6)?,
            deleted_at: row.get(7)?,
        })
    }
}

impl Default for InstanceStore {
    fn default() -> Self {
        Self::new()
    }
}
