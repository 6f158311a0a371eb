//! Cached file records

use rusqlite::{Connection, OptionalExtension};

use super::DatabaseResult;

/// A downloaded file kept on the shared cache volume
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedFile {
    pub url: String,
    pub filename: String,
    pub created_at: i64,
}

/// Store for cached file records
pub struct CachedFileStore;

impl CachedFileStore {
    pub fn new() -> Self {
        Self
    }

    /// Record a downloaded file
    pub fn create(&self, conn: &Connection, url: &str, filename: &str) -> DatabaseResult<CachedFile> {
        conn.execute(
            "INSERT OR REPLACE INTO cached (url, filename) VALUES (?1, ?2)",
            rusqlite::params![url, filename],
        )?;
        self.get(conn, url)?.ok_or_else(|| {
            super::DatabaseError::Other(format!("cached file for {} vanished after insert", url))
        })
    }

    /// Get the cache record for a URL
    pub fn get(&self, conn: &Connection, url: &str) -> DatabaseResult<Option<CachedFile>> {
        let cached = conn
            .query_row(
                "SELECT url, filename, created_at FROM cached WHERE url = ?1",
                [url],
                Self::map_row,
            )
            .optional()?;
        Ok(cached)
    }

    /// All cached files
    pub fn all(&self, conn: &Connection) -> DatabaseResult<Vec<CachedFile>> {
        let mut stmt =
            conn.prepare("SELECT url, filename, created_at FROM cached ORDER BY created_at")?;
        let files = stmt
            .query_map([], Self::map_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(files)
    }

    /// Drop the record for a URL. Idempotent.
    pub fn delete(&self, conn: &Connection, url: &str) -> DatabaseResult<()> {
        conn.execute("DELETE FROM cached WHERE url = ?1", [url])?;
        Ok(())
    }

    fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CachedFile> {
        Ok(CachedFile {
            url: row.get(0)?,
            filename: row.get(1)?,
            created_at: row.get(2)?,
        })
    }
}

impl Default for CachedFileStore {
    fn default() -> Self {
        Self::new()
    }
}
