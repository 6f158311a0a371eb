//! Allocation (lease) persistence

use rusqlite::{Connection, OptionalExtension};

use super::DatabaseResult;

/// A lease granting one client exclusive use of an instance
#[derive(Debug, Clone)]
pub struct Allocation {
    pub id: i64,
    pub created_at: i64,
    pub deleted_at: Option<i64>,
}

impl Allocation {
    /// Whether the lease is still open
    pub fn is_current(&self) -> bool {
        self.deleted_at.is_none()
    }
}

/// Store for allocation records
pub struct AllocationStore;

impl AllocationStore {
    pub fn new() -> Self {
        Self
    }

    /// Open a new allocation
    pub fn create(&self, conn: &Connection) -> DatabaseResult<Allocation> {
        conn.execute("INSERT INTO allocation DEFAULT VALUES", [])?;
        let id = conn.last_insert_rowid();
        self.get(conn, id)?.ok_or_else(|| {
            super::DatabaseError::Other(format!("allocation {} vanished after insert", id))
        })
    }

    /// Get an allocation by id
    pub fn get(&self, conn: &Connection, id: i64) -> DatabaseResult<Option<Allocation>> {
        let allocation = conn
            .query_row(
                "SELECT id, created_at, deleted_at FROM allocation WHERE id = ?1",
                [id],
                Self::map_row,
            )
            .optional()?;
        Ok(allocation)
    }

    /// Close an allocation. Idempotent.
    pub fn close(&self, conn: &Connection, id: i64) -> DatabaseResult<()> {
        conn.execute(
            "UPDATE allocation SET deleted_at = strftime('%s', 'now') WHERE id = ?1 AND deleted_at IS NULL",
            [id],
        )?;
        Ok(())
    }

    /// Every allocation ever opened
    pub fn all(&self, conn: &Connection) -> DatabaseResult<Vec<Allocation>> {
        self.query(conn, "SELECT id, created_at, deleted_at FROM allocation ORDER BY id")
    }

    /// Open allocations
    pub fn current(&self, conn: &Connection) -> DatabaseResult<Vec<Allocation>> {
        self.query(
            conn,
            "SELECT id, created_at, deleted_at FROM allocation WHERE deleted_at IS NULL ORDER BY id",
        )
    }

    /// Closed allocations
    pub fn finished(&self, conn: &Connection) -> DatabaseResult<Vec<Allocation>> {
        self.query(
            conn,
            "SELECT id, created_at, deleted_at FROM allocation WHERE deleted_at IS NOT NULL ORDER BY id",
        )
    }

    fn query(&self, conn: &Connection, sql: &str) -> DatabaseResult<Vec<Allocation>> {
        let mut stmt = conn.prepare(sql)?;
        let allocations = stmt
            .query_map([], Self::map_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(allocations)
    }

    fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Allocation> {
        Ok(Allocation {
            id: row.get(0)?,
            created_at: row.get(1)?,
            deleted_at: row.get(2)?,
        })
    }
}

impl Default for AllocationStore {
    fn default() -> Self {
        Self::new()
    }
}
