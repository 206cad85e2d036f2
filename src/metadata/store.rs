//! Abstract metadata store trait.
//!
//! Any metadata backend must implement [`MetadataStore`].  The trait
//! uses `async_trait`-style methods (manual desugaring with pinned
//! futures) so it can be used with both SQLite and in-memory stores.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;

use crate::media::MediaKind;

// ── Record types ───────────────────────────────────────────────────

/// Persistent record of one stored file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct FileRecord {
    /// Server-assigned file id.
    pub id: String,
    /// Owning user.
    pub owner_id: String,
    /// Name shown to users and used for downloads.
    pub display_name: String,
    /// Object size in bytes. Immutable once stored.
    pub size_bytes: u64,
    /// MIME content type.
    pub content_type: String,
    /// Media shape detected at upload.
    pub media_kind: MediaKind,
    /// Backend-side object identifier.
    pub remote_object_id: String,
    /// Pool connection that performed the upload.
    pub backend_identity: String,
    /// Storage channel label at upload time.
    pub storage_channel: String,
    /// Hex MD5 of the content.
    pub checksum: String,
    /// ISO-8601 upload timestamp.
    pub uploaded_at: String,
}

/// The subset of a file record the streaming engine needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectDescriptor {
    pub remote_object_id: String,
    pub size_bytes: u64,
    pub content_type: String,
    pub display_name: String,
}

impl FileRecord {
    pub fn descriptor(&self) -> ObjectDescriptor {
        ObjectDescriptor {
            remote_object_id: self.remote_object_id.clone(),
            size_bytes: self.size_bytes,
            content_type: self.content_type.clone(),
            display_name: self.display_name.clone(),
        }
    }
}

/// Aggregate counters over all file records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, utoipa::ToSchema)]
pub struct StoreStats {
    pub total_files: u64,
    pub total_size: u64,
}

/// Current time as an ISO-8601 string with millisecond precision.
pub fn now_timestamp() -> String {
    chrono::Utc::now()
        .format("%Y-%m-%dT%H:%M:%S%.3fZ")
        .to_string()
}

// ── Trait ───────────────────────────────────────────────────────────

/// Async metadata store contract.
pub trait MetadataStore: Send + Sync + 'static {
    /// Insert or replace a file record (upsert on `id`).
    fn put_file(
        &self,
        record: FileRecord,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Resolve a backend object id to its descriptor.
    fn lookup(
        &self,
        remote_object_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<ObjectDescriptor>>> + Send + '_>>;

    /// Get a single file record by id.
    fn get_file(
        &self,
        id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<FileRecord>>> + Send + '_>>;

    /// List records, newest first, optionally restricted to one owner.
    fn list_files(
        &self,
        owner_id: Option<&str>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<FileRecord>>> + Send + '_>>;

    /// Delete a record, returning it if it existed.
    fn delete_file(
        &self,
        id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<FileRecord>>> + Send + '_>>;

    /// Count files and total bytes.
    fn stats(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<StoreStats>> + Send + '_>>;
}
