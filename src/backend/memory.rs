//! In-memory chunk backend.
//!
//! Objects are held in a `tokio::sync::RwLock<HashMap<...>>` that can be
//! shared between several connections.  Useful for tests and ephemeral
//! deployments.  Faults can be scripted per stream open to exercise the
//! rate-limit and failure paths of the streaming engine.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::{stream, StreamExt};
use md5::{Digest, Md5};

use super::chunk::{
    new_remote_id, BackendError, BackendFuture, ChunkBackend, ChunkStream, ProgressFn,
    RemoteObject, UploadPayload,
};

/// Object map shareable across connections.
#[derive(Clone, Default)]
pub struct MemoryObjects {
    inner: Arc<tokio::sync::RwLock<HashMap<String, Bytes>>>,
}

/// Fault injected into the next call to `open_chunk_stream`.
#[derive(Debug, Clone)]
pub enum Fault {
    /// Opening the stream is rate limited.
    RateLimitOnOpen(Duration),
    /// A rate-limit signal arrives after `after_chunks` chunks; the stream
    /// then carries on from the same position.
    RateLimitMidStream { after_chunks: usize, wait: Duration },
    /// The stream breaks with an I/O error after `after_chunks` chunks.
    FailMidStream { after_chunks: usize },
    /// The session is revoked mid-stream.
    RevokedMidStream { after_chunks: usize },
}

/// Serves objects from process memory.
pub struct MemoryChunkBackend {
    objects: MemoryObjects,
    faults: Mutex<VecDeque<Fault>>,
    /// Chunks handed to consumers across all streams.
    chunks_served: Arc<AtomicUsize>,
    fail_start: bool,
    started: AtomicBool,
}

impl MemoryChunkBackend {
    pub fn new() -> Self {
        Self::with_objects(MemoryObjects::default())
    }

    /// A backend sharing `objects` with other connections.
    pub fn with_objects(objects: MemoryObjects) -> Self {
        Self {
            objects,
            faults: Mutex::new(VecDeque::new()),
            chunks_served: Arc::new(AtomicUsize::new(0)),
            fail_start: false,
            started: AtomicBool::new(false),
        }
    }

    /// A backend whose `start` always fails.
    pub fn failing() -> Self {
        Self {
            fail_start: true,
            ..Self::new()
        }
    }

    /// Store `data` under `remote_id` directly.
    pub async fn insert(&self, remote_id: &str, data: impl Into<Bytes>) {
        self.objects
            .inner
            .write()
            .await
            .insert(remote_id.to_string(), data.into());
    }

    /// Queue a fault for a future stream open (FIFO).
    pub fn push_fault(&self, fault: Fault) {
        self.faults.lock().expect("mutex poisoned").push_back(fault);
    }

    /// Number of chunks pulled by consumers so far.
    pub fn chunks_served(&self) -> usize {
        self.chunks_served.load(Ordering::SeqCst)
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}

impl Default for MemoryChunkBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkBackend for MemoryChunkBackend {
    fn start(&self) -> BackendFuture<'_, ()> {
        Box::pin(async move {
            if self.fail_start {
                return Err(BackendError::Unauthorized(
                    "session rejected during handshake".to_string(),
                ));
            }
            self.started.store(true, Ordering::SeqCst);
            Ok(())
        })
    }

    fn stop(&self) -> BackendFuture<'_, ()> {
        Box::pin(async move {
            self.started.store(false, Ordering::SeqCst);
            Ok(())
        })
    }

    fn open_chunk_stream(&self, remote_id: &str, chunk_size: usize) -> BackendFuture<'_, ChunkStream> {
        let remote_id = remote_id.to_string();
        Box::pin(async move {
            let fault = self.faults.lock().expect("mutex poisoned").pop_front();
            if let Some(Fault::RateLimitOnOpen(wait)) = fault {
                return Err(BackendError::RateLimited { wait });
            }

            let data = self
                .objects
                .inner
                .read()
                .await
                .get(&remote_id)
                .cloned()
                .ok_or_else(|| BackendError::NotFound(remote_id.clone()))?;

            let chunk_size = chunk_size.max(1);
            let mut items: Vec<Result<Bytes, BackendError>> = Vec::new();
            let mut offset = 0;
            while offset < data.len() {
                let end = (offset + chunk_size).min(data.len());
                items.push(Ok(data.slice(offset..end)));
                offset = end;
            }

            match fault {
                Some(Fault::RateLimitMidStream { after_chunks, wait }) => {
                    let at = after_chunks.min(items.len());
                    items.insert(at, Err(BackendError::RateLimited { wait }));
                }
                Some(Fault::FailMidStream { after_chunks }) => {
                    items.truncate(after_chunks);
                    items.push(Err(BackendError::Io(std::io::Error::new(
                        std::io::ErrorKind::ConnectionReset,
                        "backend connection reset",
                    ))));
                }
                Some(Fault::RevokedMidStream { after_chunks }) => {
                    items.truncate(after_chunks);
                    items.push(Err(BackendError::Unauthorized(
                        "session revoked".to_string(),
                    )));
                }
                _ => {}
            }

            let served = self.chunks_served.clone();
            let stream: ChunkStream = stream::iter(items)
                .inspect(move |item| {
                    if item.is_ok() {
                        served.fetch_add(1, Ordering::SeqCst);
                    }
                })
                .boxed();
            Ok(stream)
        })
    }

    fn upload(&self, payload: UploadPayload, progress: ProgressFn) -> BackendFuture<'_, RemoteObject> {
        Box::pin(async move {
            let data = tokio::fs::read(&payload.path).await?;
            let size = data.len() as u64;
            progress(size, payload.size.max(size));
            let checksum = hex::encode(Md5::digest(&data));
            let remote_id = new_remote_id();
            self.insert(&remote_id, data).await;
            Ok(RemoteObject {
                remote_id,
                size,
                checksum,
            })
        })
    }

    fn delete(&self, remote_id: &str) -> BackendFuture<'_, ()> {
        let remote_id = remote_id.to_string();
        Box::pin(async move {
            self.objects.inner.write().await.remove(&remote_id);
            Ok(())
        })
    }
}
