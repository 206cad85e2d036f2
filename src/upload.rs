//! Upload orchestration.
//!
//! An upload takes a spooled local file, leases a backend connection
//! (elevated preferred), checks the size limit of that connection's class,
//! detects the media kind, pushes the bytes with progress reporting, and
//! records the resulting [`FileRecord`].  The spooled file is removed on
//! every outcome.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use metrics::counter;
use tracing::{error, info, warn};

use crate::backend::{BackendError, UploadPayload};
use crate::config::{ConnectionClass, UploadConfig};
use crate::errors::ApiError;
use crate::media::{self, MediaKind};
use crate::metadata::store::{now_timestamp, FileRecord, MetadataStore};
use crate::metrics::UPLOADS_TOTAL;
use crate::pool::BackendPool;
use crate::progress::ProgressTracker;

/// Pushes spooled files to the backend pool and records them.
#[derive(Clone)]
pub struct Uploader {
    pool: BackendPool,
    metadata: Arc<dyn MetadataStore>,
    progress: Arc<ProgressTracker>,
    config: UploadConfig,
    max_file_size: u64,
    max_file_size_standard: u64,
}

impl Uploader {
    pub fn new(
        pool: BackendPool,
        metadata: Arc<dyn MetadataStore>,
        progress: Arc<ProgressTracker>,
        config: UploadConfig,
        max_file_size: u64,
        max_file_size_standard: u64,
    ) -> Self {
        Self {
            pool,
            metadata,
            progress,
            config,
            max_file_size,
            max_file_size_standard,
        }
    }

    /// Directory where incoming files are spooled.
    pub fn spool_dir(&self) -> PathBuf {
        self.config.temp_path()
    }

    /// Largest upload accepted by any connection class.
    pub fn max_file_size(&self) -> u64 {
        self.max_file_size.max(self.max_file_size_standard)
    }

    /// Size limit for uploads through a connection of `class`.
    pub fn limit_for(&self, class: ConnectionClass) -> u64 {
        match class {
            ConnectionClass::Elevated => self.max_file_size,
            ConnectionClass::Standard => self.max_file_size_standard,
        }
    }

    /// Upload `path` and wait for the result.
    pub async fn upload_file(
        &self,
        task_id: &str,
        path: PathBuf,
        filename: &str,
        owner_id: &str,
        size: u64,
    ) -> Result<FileRecord, ApiError> {
        self.progress.start(task_id, filename, size);
        self.run(task_id, path, filename, owner_id, size).await
    }

    /// Register the task and upload in the background. The task id is
    /// queryable as soon as this returns.
    pub fn spawn_upload(&self, path: PathBuf, filename: String, owner_id: String, size: u64) -> String {
        let task_id = ProgressTracker::new_task_id(&owner_id);
        self.progress.start(&task_id, &filename, size);
        let uploader = self.clone();
        let task = task_id.clone();
        tokio::spawn(async move {
            // Outcome is reported through the progress tracker.
            let _ = uploader.run(&task, path, &filename, &owner_id, size).await;
        });
        task_id
    }

    async fn run(
        &self,
        task_id: &str,
        path: PathBuf,
        filename: &str,
        owner_id: &str,
        size: u64,
    ) -> Result<FileRecord, ApiError> {
        let result = self.push(task_id, &path, filename, owner_id, size).await;
        remove_spooled(&path).await;

        match &result {
            Ok(record) => {
                self.progress.complete(task_id, &record.id);
                counter!(UPLOADS_TOTAL, "status" => "completed").increment(1);
                info!(
                    "Upload {} stored {} ({} bytes) via '{}'",
                    task_id, record.display_name, record.size_bytes, record.backend_identity
                );
            }
            Err(e) => {
                self.progress.fail(task_id, &e.to_string());
                counter!(UPLOADS_TOTAL, "status" => "failed").increment(1);
                error!("Upload {} of {} failed: {}", task_id, filename, e);
            }
        }
        result
    }

    async fn push(
        &self,
        task_id: &str,
        path: &Path,
        filename: &str,
        owner_id: &str,
        size: u64,
    ) -> Result<FileRecord, ApiError> {
        let lease = self.pool.acquire(true)?;
        let limit = self.limit_for(lease.class());
        if size > limit {
            return Err(ApiError::EntityTooLarge { size, limit });
        }

        let mime = media::detect_mime(path, filename)
            .await
            .map_err(|e| ApiError::InternalError(e.into()))?;
        let kind = MediaKind::probe(path, &mime).await;

        self.progress.set_uploading(task_id);
        let tracker = self.progress.clone();
        let task = task_id.to_string();
        let on_progress = Arc::new(move |sent: u64, total: u64| tracker.update(&task, sent, total));

        let payload = UploadPayload {
            path: path.to_path_buf(),
            file_name: filename.to_string(),
            size,
            kind: kind.clone(),
        };
        let remote = match lease.backend().upload(payload, on_progress).await {
            Ok(remote) => remote,
            Err(BackendError::Unauthorized(msg)) => {
                lease.evict();
                return Err(ApiError::InternalError(anyhow::anyhow!(
                    "backend connection '{}' rejected the upload: {}",
                    lease.identity(),
                    msg
                )));
            }
            Err(e) => return Err(ApiError::InternalError(e.into())),
        };

        let record = FileRecord {
            id: uuid::Uuid::new_v4().to_string(),
            owner_id: owner_id.to_string(),
            display_name: filename.to_string(),
            size_bytes: remote.size,
            content_type: mime,
            media_kind: kind,
            remote_object_id: remote.remote_id,
            backend_identity: lease.identity().to_string(),
            storage_channel: self.config.storage_channel.clone(),
            checksum: remote.checksum,
            uploaded_at: now_timestamp(),
        };
        self.metadata.put_file(record.clone()).await?;
        Ok(record)
    }

    /// Delete a file record and its backend object.
    ///
    /// The record is removed even when the backend delete fails; the
    /// failure is logged.
    pub async fn delete(&self, file_id: &str) -> Result<Option<FileRecord>, ApiError> {
        let Some(record) = self.metadata.get_file(file_id).await? else {
            return Ok(None);
        };
        match self.pool.acquire(false) {
            Ok(lease) => {
                if let Err(e) = lease.backend().delete(&record.remote_object_id).await {
                    warn!(
                        "Backend delete of {} via '{}' failed: {}",
                        record.remote_object_id,
                        lease.identity(),
                        e
                    );
                }
            }
            Err(e) => warn!("Skipping backend delete of {}: {}", record.remote_object_id, e),
        }
        Ok(self.metadata.delete_file(file_id).await?)
    }
}

async fn remove_spooled(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove spooled file {}: {}", path.display(), e),
    }
}
