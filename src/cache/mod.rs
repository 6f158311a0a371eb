//! File-URL cache
//!
//! Downloads Packet Tracer files once and keeps them on the shared cache
//! volume that every instance mounts read-only. The `cached` table maps the
//! source URL to the stored filename.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;
use url::Url;
use uuid::Uuid;

use crate::database::{CachedFile, Database};
use crate::error::{DaemonError, Result};

/// Keyed download store over the shared cache volume
pub struct FileCache {
    db: Arc<Database>,
    directory: PathBuf,
    container_directory: String,
    http: reqwest::Client,
}

impl FileCache {
    pub fn new(
        db: Arc<Database>,
        directory: impl Into<PathBuf>,
        container_directory: impl Into<String>,
    ) -> Self {
        Self {
            db,
            directory: directory.into(),
            container_directory: container_directory.into(),
            http: reqwest::Client::new(),
        }
    }

    /// Path of a cached file as instances see it
    pub fn container_path(&self, cached: &CachedFile) -> String {
        format!(
            "{}/{}",
            self.container_directory.trim_end_matches('/'),
            cached.filename
        )
    }

    /// Cache record for a URL, dropping the record if the backing file
    /// vanished from the volume.
    pub async fn lookup(&self, url: &str) -> Result<Option<CachedFile>> {
        let Some(cached) = self.db.cached_file(url).await? else {
            return Ok(None);
        };
        if self.directory.join(&cached.filename).is_file() {
            return Ok(Some(cached));
        }
        self.db.delete_cached(url).await?;
        Ok(None)
    }

    /// Every cache record
    pub async fn all(&self) -> Result<Vec<CachedFile>> {
        Ok(self.db.cached_files().await?)
    }

    /// Download a URL into the cache, reusing the existing copy when present
    pub async fn fetch(&self, url: &str) -> Result<CachedFile> {
        let parsed = Url::parse(url)
            .map_err(|e| DaemonError::BadRequest(format!("Invalid URL '{}': {}", url, e)))?;

        if let Some(cached) = self.lookup(url).await? {
            return Ok(cached);
        }

        let response = self.http.get(parsed).send().await.map_err(|e| {
            DaemonError::BadRequest(format!(
                "The URL could not be reached. Is '{}' correct? {}",
                url, e
            ))
        })?;
        if !response.status().is_success() {
            return Err(DaemonError::BadRequest(format!(
                "The URL could not be fetched: '{}' answered {}",
                url,
                response.status()
            )));
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| DaemonError::BadRequest(format!("Download of '{}' failed: {}", url, e)))?;

        let filename = format!("{}.pkt", Uuid::new_v4().simple());
        tokio::fs::write(self.directory.join(&filename), &body)
            .await
            .map_err(|e| {
                DaemonError::Internal(format!("Failed to store cached file {}: {}", filename, e))
            })?;

        let cached = self.db.cache_record(url, &filename).await?;
        info!("Cached {} as {}", url, filename);
        Ok(cached)
    }

    /// Remove one cached file. A missing backing file counts as deleted.
    pub async fn remove(&self, url: &str) -> Result<Option<CachedFile>> {
        let Some(cached) = self.db.cached_file(url).await? else {
            return Ok(None);
        };
        self.delete_backing(&cached).await?;
        self.db.delete_cached(url).await?;
        Ok(Some(cached))
    }

    /// Clear the whole cache
    pub async fn clear(&self) -> Result<Vec<CachedFile>> {
        let mut deleted = Vec::new();
        for cached in self.db.cached_files().await? {
            self.delete_backing(&cached).await?;
            self.db.delete_cached(&cached.url).await?;
            deleted.push(cached);
        }
        Ok(deleted)
    }

    async fn delete_backing(&self, cached: &CachedFile) -> Result<()> {
        match tokio::fs::remove_file(self.directory.join(&cached.filename)).await {
            Ok(()) => Ok(()),
            // We wanted it gone anyway
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DaemonError::Internal(format!(
                "Failed to delete cached file {}: {}",
                cached.filename, e
            ))),
        }
    }
}
