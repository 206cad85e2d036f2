//! Local filesystem chunk backend.
//!
//! Objects are stored as flat files named by their remote id under a root
//! directory.  Several connections may point at the same root, which is how
//! every connection in the pool can read any stored object.
//!
//! All writes follow crash-only design: write to temp file, fsync, rename.

use std::path::PathBuf;

use bytes::Bytes;
use md5::{Digest, Md5};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use super::chunk::{
    new_remote_id, validate_remote_id, BackendError, BackendFuture, ChunkBackend, ChunkStream,
    ProgressFn, RemoteObject, UploadPayload,
};

/// Copy buffer used while uploading.
const COPY_BUFFER: usize = 256 * 1024;

/// Serves objects out of a local directory.
pub struct LocalChunkBackend {
    /// Root directory for all stored objects.
    root: PathBuf,
}

impl LocalChunkBackend {
    /// Create a backend rooted at `root`. Nothing touches disk until
    /// [`ChunkBackend::start`].
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve a remote id to its file path.
    fn resolve(&self, remote_id: &str) -> Result<PathBuf, BackendError> {
        validate_remote_id(remote_id)?;
        Ok(self.root.join(remote_id))
    }

    /// Generate a temp file path under .tmp/ for atomic writes.
    fn temp_path(&self) -> PathBuf {
        let id = uuid::Uuid::new_v4();
        self.root.join(".tmp").join(format!("tmp-{}", id))
    }
}

impl ChunkBackend for LocalChunkBackend {
    fn start(&self) -> BackendFuture<'_, ()> {
        Box::pin(async move {
            tokio::fs::create_dir_all(self.root.join(".tmp")).await?;
            debug!("Local backend ready at {}", self.root.display());
            Ok(())
        })
    }

    fn stop(&self) -> BackendFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }

    fn open_chunk_stream(&self, remote_id: &str, chunk_size: usize) -> BackendFuture<'_, ChunkStream> {
        let remote_id = remote_id.to_string();
        Box::pin(async move {
            let path = self.resolve(&remote_id)?;
            let mut file = match tokio::fs::File::open(&path).await {
                Ok(file) => file,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    return Err(BackendError::NotFound(remote_id));
                }
                Err(err) => return Err(err.into()),
            };
            let chunk_size = chunk_size.max(1);

            let stream = async_stream::stream! {
                loop {
                    let mut buf = vec![0u8; chunk_size];
                    let mut filled = 0;
                    while filled < chunk_size {
                        match file.read(&mut buf[filled..]).await {
                            Ok(0) => break,
                            Ok(n) => filled += n,
                            Err(err) => {
                                yield Err(BackendError::Io(err));
                                return;
                            }
                        }
                    }
                    if filled == 0 {
                        break;
                    }
                    buf.truncate(filled);
                    yield Ok(Bytes::from(buf));
                }
            };
            let stream: ChunkStream = Box::pin(stream);
            Ok(stream)
        })
    }

    fn upload(&self, payload: UploadPayload, progress: ProgressFn) -> BackendFuture<'_, RemoteObject> {
        Box::pin(async move {
            let remote_id = new_remote_id();
            let final_path = self.resolve(&remote_id)?;
            let tmp_path = self.temp_path();
            if let Some(parent) = tmp_path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }

            let mut src = tokio::fs::File::open(&payload.path).await?;
            let mut dst = tokio::fs::File::create(&tmp_path).await?;
            let mut hasher = Md5::new();
            let mut buf = vec![0u8; COPY_BUFFER];
            let mut sent: u64 = 0;
            loop {
                let n = src.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                dst.write_all(&buf[..n]).await?;
                hasher.update(&buf[..n]);
                sent += n as u64;
                progress(sent, payload.size.max(sent));
            }
            dst.sync_all().await?;
            drop(dst);

            tokio::fs::rename(&tmp_path, &final_path).await?;
            debug!(
                "Stored {} ({} bytes, {:?}) as {}",
                payload.file_name, sent, payload.kind, remote_id
            );

            Ok(RemoteObject {
                remote_id,
                size: sent,
                checksum: hex::encode(hasher.finalize()),
            })
        })
    }

    fn delete(&self, remote_id: &str) -> BackendFuture<'_, ()> {
        let remote_id = remote_id.to_string();
        Box::pin(async move {
            let path = self.resolve(&remote_id)?;
            match tokio::fs::remove_file(&path).await {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(err) => Err(err.into()),
            }
        })
    }
}
