//! Chunked backend client trait.
//!
//! Every remote object store connection implements [`ChunkBackend`].  Reads
//! are exposed only as a forward-only [`ChunkStream`]: there is no seek, and
//! a consumer that needs an earlier byte must open a fresh stream.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::BoxStream;
use thiserror::Error;

use crate::media::MediaKind;

/// Lazy, finite, single-pass sequence of chunks for one object.
pub type ChunkStream = BoxStream<'static, Result<Bytes, BackendError>>;

/// Upload progress callback: `(bytes_sent, bytes_total)`.
pub type ProgressFn = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Boxed future returned by backend methods.
pub type BackendFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, BackendError>> + Send + 'a>>;

/// Failures reported by a backend connection.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Transient throttling; the caller must wait `wait` before pulling again.
    #[error("backend rate limited, retry after {wait:?}")]
    RateLimited { wait: Duration },

    /// The backend has no object under this id.
    #[error("remote object {0} not found")]
    NotFound(String),

    /// The connection's credentials were rejected or revoked.
    #[error("backend rejected credentials: {0}")]
    Unauthorized(String),

    #[error("backend I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A local file about to be pushed to the backend.
#[derive(Debug, Clone)]
pub struct UploadPayload {
    /// Spooled file on local disk.
    pub path: PathBuf,
    /// Original file name (used as caption).
    pub file_name: String,
    /// Size of the spooled file in bytes.
    pub size: u64,
    /// Media shape selecting the send method.
    pub kind: MediaKind,
}

/// Result of a successful upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObject {
    /// Opaque backend-side identifier.
    pub remote_id: String,
    /// Bytes stored.
    pub size: u64,
    /// Hex MD5 of the payload.
    pub checksum: String,
}

/// Async chunked object store connection.
pub trait ChunkBackend: Send + Sync + 'static {
    /// Establish the session. Called once during pool initialization.
    fn start(&self) -> BackendFuture<'_, ()>;

    /// Close the session gracefully.
    fn stop(&self) -> BackendFuture<'_, ()>;

    /// Open a chunk stream over `remote_id` from offset 0.
    ///
    /// `chunk_size` is a hint; chunks may be shorter, notably the last one.
    fn open_chunk_stream(&self, remote_id: &str, chunk_size: usize) -> BackendFuture<'_, ChunkStream>;

    /// Push a local file, reporting progress through `progress`.
    fn upload(&self, payload: UploadPayload, progress: ProgressFn) -> BackendFuture<'_, RemoteObject>;

    /// Remove the object. Deleting a missing object is not an error.
    fn delete(&self, remote_id: &str) -> BackendFuture<'_, ()>;
}

/// Progress callback that ignores updates.
pub fn no_progress() -> ProgressFn {
    Arc::new(|_, _| {})
}

/// Reject remote ids that could escape a storage namespace.
pub(crate) fn validate_remote_id(remote_id: &str) -> Result<(), BackendError> {
    let ok = !remote_id.is_empty()
        && remote_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
    if ok {
        Ok(())
    } else {
        Err(BackendError::NotFound(remote_id.to_string()))
    }
}

/// Fresh opaque id for a new remote object.
pub(crate) fn new_remote_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_remote_id() {
        assert!(validate_remote_id("abc123").is_ok());
        assert!(validate_remote_id("a-b_c").is_ok());
        assert!(validate_remote_id("").is_err());
        assert!(validate_remote_id("../etc/passwd").is_err());
        assert!(validate_remote_id("a/b").is_err());
    }

    #[test]
    fn test_new_remote_id_is_valid_and_unique() {
        let a = new_remote_id();
        let b = new_remote_id();
        assert_ne!(a, b);
        assert!(validate_remote_id(&a).is_ok());
    }
}
