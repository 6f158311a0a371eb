//! Port registry persistence

use rusqlite::{Connection, OptionalExtension};

use super::DatabaseResult;

/// One host port in the configured range, plus its assignment status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Port {
    pub number: u16,
    pub instance_id: i64,
}

impl Port {
    /// Free and claimable.
    pub const UNASSIGNED: i64 = -2;

    /// Claimed by a creation in flight, not yet bound to an instance.
    pub const RESERVED: i64 = -1;

    /// Whether the port can be handed to a new instance
    pub fn is_available(&self) -> bool {
        self.instance_id == Self::UNASSIGNED
    }

    /// Instance currently bound to the port, if any
    pub fn assigned_instance(&self) -> Option<i64> {
        if self.instance_id >= 0 {
            Some(self.instance_id)
        } else {
            None
        }
    }
}

/// Store for the port registry
pub struct PortStore;

impl PortStore {
    pub fn new() -> Self {
        Self
    }

    /// Seed the registry with every port in [lowest, highest].
    ///
    /// Numbers already present keep their current assignment, so re-running
    /// at boot never clobbers live instances.
    pub fn init_range(&self, conn: &Connection, lowest: u16, highest: u16) -> DatabaseResult<()> {
        let mut stmt = conn.prepare(
            "INSERT OR IGNORE INTO port (number, instance_id) VALUES (?1, ?2)",
        )?;
        for number in lowest..=highest {
            stmt.execute(rusqlite::params![number, Port::UNASSIGNED])?;
        }
        Ok(())
    }

    /// Get a port by number
    pub fn get(&self, conn: &Connection, number: u16) -> DatabaseResult<Option<Port>> {
        let port = conn
            .query_row(
                "SELECT number, instance_id FROM port WHERE number = ?1",
                [number],
                Self::map_row,
            )
            .optional()?;
        Ok(port)
    }

    /// Reserve the lowest available port, if any.
    ///
    /// Callers serialize through the database connection lock, so two
    /// reservations can never return the same number.
    pub fn allocate(&self, conn: &Connection) -> DatabaseResult<Option<Port>> {
        let number: Option<u16> = conn
            .query_row(
                "SELECT number FROM port WHERE instance_id = ?1 ORDER BY number LIMIT 1",
                [Port::UNASSIGNED],
                |row| row.get(0),
            )
            .optional()?;

        let Some(number) = number else {
            return Ok(None);
        };

        conn.execute(
            "UPDATE port SET instance_id = ?1 WHERE number = ?2",
            rusqlite::params![Port::RESERVED, number],
        )?;

        Ok(Some(Port {
            number,
            instance_id: Port::RESERVED,
        }))
    }

    /// Bind a reserved port to an instance.
    ///
    /// Fails if the port was not reserved first; assignment never skips the
    /// reservation step.
    pub fn assign(&self, conn: &Connection, number: u16, instance_id: i64) -> DatabaseResult<()> {
        let changed = conn.execute(
            "UPDATE port SET instance_id = ?1 WHERE number = ?2 AND instance_id = ?3",
            rusqlite::params![instance_id, number, Port::RESERVED],
        )?;
        if changed == 0 {
            return Err(super::DatabaseError::Other(format!(
                "port {} is not reserved",
                number
            )));
        }
        Ok(())
    }

    /// Return a port to the pool regardless of its prior state. Idempotent.
    pub fn release(&self, conn: &Connection, number: u16) -> DatabaseResult<()> {
        conn.execute(
            "UPDATE port SET instance_id = ?1 WHERE number = ?2",
            rusqlite::params![Port::UNASSIGNED, number],
        )?;
        Ok(())
    }

    /// Release the port bound to an instance, if any
    pub fn release_for_instance(&self, conn: &Connection, instance_id: i64) -> DatabaseResult<()> {
        conn.execute(
            "UPDATE port SET instance_id = ?1 WHERE instance_id = ?2",
            rusqlite::params![Port::UNASSIGNED, instance_id],
        )?;
        Ok(())
    }

    /// All ports in the range
    pub fn all(&self, conn: &Connection) -> DatabaseResult<Vec<Port>> {
        let mut stmt = conn.prepare("SELECT number, instance_id FROM port ORDER BY number")?;
        let ports = stmt
            .query_map([], Self::map_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ports)
    }

    /// Ports free for new instances
    pub fn available(&self, conn: &Connection) -> DatabaseResult<Vec<Port>> {
        self.query(
            conn,
            "SELECT number, instance_id FROM port WHERE instance_id = ?1 ORDER BY number",
            [Port::UNASSIGNED],
        )
    }

    /// Ports reserved or bound to an instance
    pub fn unavailable(&self, conn: &Connection) -> DatabaseResult<Vec<Port>> {
        self.query(
            conn,
            "SELECT number, instance_id FROM port WHERE instance_id != ?1 ORDER BY number",
            [Port::UNASSIGNED],
        )
    }

    fn query<P: rusqlite::Params>(
        &self,
        conn: &Connection,
        sql: &str,
        params: P,
    ) -> DatabaseResult<Vec<Port>> {
        let mut stmt = conn.prepare(sql)?;
        let ports = stmt
            .query_map(params, Self::map_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ports)
    }

    fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Port> {
        Ok(Port {
            number: row.get(0)?,
            instance_id: row.get(1)?,
        })
    }
}

impl Default for PortStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE port (
                number INTEGER PRIMARY KEY,
                instance_id INTEGER NOT NULL DEFAULT -2
            );
            "#,
        )
        .unwrap();
        conn
    }

    #[test]
    fn test_allocate_reserves_lowest() {
        let conn = setup_db();
        let store = PortStore::new();
        store.init_range(&conn, 50000, 50002).unwrap();

        let port = store.allocate(&conn).unwrap().unwrap();
        assert_eq!(port.number, 50000);
        assert_eq!(port.instance_id, Port::RESERVED);

        let next = store.allocate(&conn).unwrap().unwrap();
        assert_eq!(next.number, 50001);
    }

    #[test]
    fn test_allocate_exhausted_range() {
        let conn = setup_db();
        let store = PortStore::new();
        store.init_range(&conn, 50000, 50000).unwrap();

        assert!(store.allocate(&conn).unwrap().is_some());
        assert!(store.allocate(&conn).unwrap().is_none());
    }

    #[test]
    fn test_assign_requires_reservation() {
        let conn = setup_db();
        let store = PortStore::new();
        store.init_range(&conn, 50000, 50001).unwrap();

        // Unreserved port cannot be bound
        assert!(store.assign(&conn, 50001, 7).is_err());

        let port = store.allocate(&conn).unwrap().unwrap();
        store.assign(&conn, port.number, 7).unwrap();

        let bound = store.get(&conn, port.number).unwrap().unwrap();
        assert_eq!(bound.assigned_instance(), Some(7));
    }

    #[test]
    fn test_release_round_trip() {
        let conn = setup_db();
        let store = PortStore::new();
        store.init_range(&conn, 50000, 50000).unwrap();

        let port = store.allocate(&conn).unwrap().unwrap();
        store.assign(&conn, port.number, 3).unwrap();
        store.release(&conn, port.number).unwrap();

        let released = store.get(&conn, port.number).unwrap().unwrap();
        assert!(released.is_available());

        // Releasing again is a no-op
        store.release(&conn, port.number).unwrap();
        assert_eq!(store.available(&conn).unwrap().len(), 1);
    }

    #[test]
    fn test_init_range_preserves_assignments() {
        let conn = setup_db();
        let store = PortStore::new();
        store.init_range(&conn, 50000, 50001).unwrap();

        let port = store.allocate(&conn).unwrap().unwrap();
        store.assign(&conn, port.number, 12).unwrap();

        store.init_range(&conn, 50000, 50001).unwrap();
        let kept = store.get(&conn, port.number).unwrap().unwrap();
        assert_eq!(kept.assigned_instance(), Some(12));
    }

    #[test]
    fn test_views() {
        let conn = setup_db();
        let store = PortStore::new();
        store.init_range(&conn, 50000, 50002).unwrap();

        store.allocate(&conn).unwrap();
        assert_eq!(store.all(&conn).unwrap().len(), 3);
        assert_eq!(store.available(&conn).unwrap().len(), 2);
        assert_eq!(store.unavailable(&conn).unwrap().len(), 1);
    }
}
