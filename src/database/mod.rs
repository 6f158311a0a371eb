//! State persistence module
//!
//! SQLite-backed stores for instances, allocations, the port registry and
//! cached files. The `Database` wrapper serializes access through one
//! connection; every compound operation below runs under that lock, which is
//! the linearization point for state transitions.

mod allocation;
mod cached;
mod instance;
mod port;

pub use allocation::{Allocation, AllocationStore};
pub use cached::{CachedFile, CachedFileStore};
pub use instance::{Instance, InstanceStatus, InstanceStore};
pub use port::{Port, PortStore};

use std::path::Path;

use rusqlite::{Connection, Result as SqliteResult};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

/// Database errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Other(String),
}

pub type DatabaseResult<T> = Result<T, DatabaseError>;

/// Main database wrapper
pub struct Database {
    conn: Mutex<Connection>,
    instances: InstanceStore,
    allocations: AllocationStore,
    ports: PortStore,
    cached: CachedFileStore,
}

impl Database {
    /// Open or create the database
    pub fn open(path: impl AsRef<Path>) -> DatabaseResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        // Enable WAL mode for better concurrent access
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        Self::init_tables(&conn)?;

        info!("Database opened at {:?}", path);

        Ok(Self::with_connection(conn))
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> DatabaseResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_tables(&conn)?;
        Ok(Self::with_connection(conn))
    }

    fn with_connection(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
            instances: InstanceStore::new(),
            allocations: AllocationStore::new(),
            ports: PortStore::new(),
            cached: CachedFileStore::new(),
        }
    }

    /// Initialize database tables
    fn init_tables(conn: &Connection) -> SqliteResult<()> {
        conn.execute_batch(
            r#"
            -- Instance records
            CREATE TABLE IF NOT EXISTS instance (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                docker_id TEXT NOT NULL,
                pt_port INTEGER NOT NULL,
                vnc_port INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'starting',
                allocated_by INTEGER,
                created_at INTEGER DEFAULT (strftime('%s', 'now')),
                deleted_at INTEGER
            );

            -- Client leases
            CREATE TABLE IF NOT EXISTS allocation (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                created_at INTEGER DEFAULT (strftime('%s', 'now')),
                deleted_at INTEGER
            );

            -- Port registry
            CREATE TABLE IF NOT EXISTS port (
                number INTEGER PRIMARY KEY,
                instance_id INTEGER NOT NULL DEFAULT -2
            );

            -- Downloaded files on the shared cache volume
            CREATE TABLE IF NOT EXISTS cached (
                url TEXT PRIMARY KEY,
                filename TEXT NOT NULL,
                created_at INTEGER DEFAULT (strftime('%s', 'now'))
            );

            CREATE INDEX IF NOT EXISTS idx_instance_docker
                ON instance(docker_id);

            CREATE INDEX IF NOT EXISTS idx_instance_allocation
                ON instance(allocated_by);
            "#,
        )?;

        Ok(())
    }

    // ========================================================================
    // Port registry
    // ========================================================================

    /// Seed the port registry with the configured range
    pub async fn seed_ports(&self, lowest: u16, highest: u16) -> DatabaseResult<()> {
        let conn = self.conn.lock().await;
        self.ports.init_range(&conn, lowest, highest)
    }

    /// Atomically reserve any available port
    pub async fn reserve_port(&self) -> DatabaseResult<Option<Port>> {
        let conn = self.conn.lock().await;
        self.ports.allocate(&conn)
    }

    /// Bind a reserved port to an instance
    pub async fn assign_port(&self, number: u16, instance_id: i64) -> DatabaseResult<()> {
        let conn = self.conn.lock().await;
        self.ports.assign(&conn, number, instance_id)
    }

    /// Return a port to the pool
    pub async fn release_port(&self, number: u16) -> DatabaseResult<()> {
        let conn = self.conn.lock().await;
        self.ports.release(&conn, number)
    }

    /// Get a port by number
    pub async fn port(&self, number: u16) -> DatabaseResult<Option<Port>> {
        let conn = self.conn.lock().await;
        self.ports.get(&conn, number)
    }

    /// All ports
    pub async fn ports_all(&self) -> DatabaseResult<Vec<Port>> {
        let conn = self.conn.lock().await;
        self.ports.all(&conn)
    }

    /// Available ports
    pub async fn ports_available(&self) -> DatabaseResult<Vec<Port>> {
        let conn = self.conn.lock().await;
        self.ports.available(&conn)
    }

    /// Reserved or assigned ports
    pub async fn ports_unavailable(&self) -> DatabaseResult<Vec<Port>> {
        let conn = self.conn.lock().await;
        self.ports.unavailable(&conn)
    }

    // ========================================================================
    // Instances
    // ========================================================================

    /// Persist a new instance and bind its reserved port in one step
    pub async fn create_instance(
        &self,
        docker_id: &str,
        pt_port: u16,
        vnc_port: u16,
    ) -> DatabaseResult<Instance> {
        let conn = self.conn.lock().await;
        let instance = self.instances.create(&conn, docker_id, pt_port, vnc_port)?;
        self.ports.assign(&conn, pt_port, instance.id)?;
        Ok(instance)
    }

    /// Get an instance by id
    pub async fn instance(&self, id: i64) -> DatabaseResult<Option<Instance>> {
        let conn = self.conn.lock().await;
        self.instances.get(&conn, id)
    }

    /// Get the live instance backing a container
    pub async fn instance_by_docker_id(&self, docker_id: &str) -> DatabaseResult<Option<Instance>> {
        let conn = self.conn.lock().await;
        self.instances.get_by_docker_id(&conn, docker_id)
    }

    /// Get the instance held by an allocation
    pub async fn instance_for_allocation(
        &self,
        allocation_id: i64,
    ) -> DatabaseResult<Option<Instance>> {
        let conn = self.conn.lock().await;
        self.instances.get_by_allocation(&conn, allocation_id)
    }

    pub async fn instances_all(&self) -> DatabaseResult<Vec<Instance>> {
        let conn = self.conn.lock().await;
        self.instances.all(&conn)
    }

    pub async fn instances_active(&self) -> DatabaseResult<Vec<Instance>> {
        let conn = self.conn.lock().await;
        self.instances.active(&conn)
    }

    pub async fn instances_finished(&self) -> DatabaseResult<Vec<Instance>> {
        let conn = self.conn.lock().await;
        self.instances.finished(&conn)
    }

    pub async fn instances_starting(&self) -> DatabaseResult<Vec<Instance>> {
        let conn = self.conn.lock().await;
        self.instances.starting(&conn)
    }

    pub async fn instances_allocated(&self) -> DatabaseResult<Vec<Instance>> {
        let conn = self.conn.lock().await;
        self.instances.allocated(&conn)
    }

    pub async fn instances_deallocated(&self) -> DatabaseResult<Vec<Instance>> {
        let conn = self.conn.lock().await;
        self.instances.deallocated(&conn)
    }

    pub async fn instances_erroneous(&self) -> DatabaseResult<Vec<Instance>> {
        let conn = self.conn.lock().await;
        self.instances.erroneous(&conn)
    }

    /// Update an instance's status
    pub async fn set_instance_status(&self, id: i64, status: InstanceStatus) -> DatabaseResult<()> {
        let conn = self.conn.lock().await;
        self.instances.set_status(&conn, id, status)
    }

    /// Mark an instance finished: close its lease, drop the port binding,
    /// set the deletion timestamp. Returns the instance as it was before.
    pub async fn finish_instance(&self, id: i64) -> DatabaseResult<Instance> {
        let conn = self.conn.lock().await;
        let instance = self
            .instances
            .get(&conn, id)?
            .ok_or_else(|| DatabaseError::NotFound(format!("instance {}", id)))?;

        if let Some(allocation_id) = instance.allocated_by {
            self.allocations.close(&conn, allocation_id)?;
            self.instances.set_allocation(&conn, id, None)?;
        }
        self.instances.finish(&conn, id)?;
        self.ports.release_for_instance(&conn, id)?;

        Ok(instance)
    }

    // ========================================================================
    // Allocations
    // ========================================================================

    /// Open an allocation against an instance.
    ///
    /// If the instance is already leased the existing allocation is returned
    /// instead of opening a second one.
    pub async fn open_allocation(&self, instance_id: i64) -> DatabaseResult<Allocation> {
        let conn = self.conn.lock().await;
        let instance = self
            .instances
            .get(&conn, instance_id)?
            .ok_or_else(|| DatabaseError::NotFound(format!("instance {}", instance_id)))?;

        if let Some(existing) = instance.allocated_by {
            return self.allocations.get(&conn, existing)?.ok_or_else(|| {
                DatabaseError::Other(format!("allocation {} missing for instance {}", existing, instance_id))
            });
        }

        let allocation = self.allocations.create(&conn)?;
        self.instances
            .set_allocation(&conn, instance_id, Some(allocation.id))?;
        Ok(allocation)
    }

    /// Close the lease held on an instance, if any
    pub async fn close_allocation_for(
        &self,
        instance_id: i64,
    ) -> DatabaseResult<Option<Allocation>> {
        let conn = self.conn.lock().await;
        let instance = self
            .instances
            .get(&conn, instance_id)?
            .ok_or_else(|| DatabaseError::NotFound(format!("instance {}", instance_id)))?;

        let Some(allocation_id) = instance.allocated_by else {
            return Ok(None);
        };

        self.allocations.close(&conn, allocation_id)?;
        self.instances.set_allocation(&conn, instance_id, None)?;
        self.allocations.get(&conn, allocation_id)
    }

    /// Close an allocation that no instance references. Idempotent.
    pub async fn close_allocation(&self, id: i64) -> DatabaseResult<()> {
        let conn = self.conn.lock().await;
        self.allocations.close(&conn, id)
    }

    /// Get an allocation by id
    pub async fn allocation(&self, id: i64) -> DatabaseResult<Option<Allocation>> {
        let conn = self.conn.lock().await;
        self.allocations.get(&conn, id)
    }

    pub async fn allocations_all(&self) -> DatabaseResult<Vec<Allocation>> {
        let conn = self.conn.lock().await;
        self.allocations.all(&conn)
    }

    pub async fn allocations_current(&self) -> DatabaseResult<Vec<Allocation>> {
        let conn = self.conn.lock().await;
        self.allocations.current(&conn)
    }

    pub async fn allocations_finished(&self) -> DatabaseResult<Vec<Allocation>> {
        let conn = self.conn.lock().await;
        self.allocations.finished(&conn)
    }

    // ========================================================================
    // Cached files
    // ========================================================================

    /// Record a downloaded file
    pub async fn cache_record(&self, url: &str, filename: &str) -> DatabaseResult<CachedFile> {
        let conn = self.conn.lock().await;
        self.cached.create(&conn, url, filename)
    }

    /// Get the cache record for a URL
    pub async fn cached_file(&self, url: &str) -> DatabaseResult<Option<CachedFile>> {
        let conn = self.conn.lock().await;
        self.cached.get(&conn, url)
    }

    /// All cache records
    pub async fn cached_files(&self) -> DatabaseResult<Vec<CachedFile>> {
        let conn = self.conn.lock().await;
        self.cached.all(&conn)
    }

    /// Drop a cache record
    pub async fn delete_cached(&self, url: &str) -> DatabaseResult<()> {
        let conn = self.conn.lock().await;
        self.cached.delete(&conn, url)
    }
}
