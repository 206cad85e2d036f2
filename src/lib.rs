//! chunkvault library — byte-range file serving over chunked backends.
//!
//! Stored files live behind a small pool of remote backend connections that
//! can only hand out data as an ordered, non-seekable sequence of chunks.
//! This crate turns HTTP `Range` requests into the right slice of that chunk
//! sequence, balances streams and uploads across the pool, and exposes the
//! surrounding file-management API.

use std::sync::Arc;

pub mod auth;
pub mod backend;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod ingest;
pub mod media;
pub mod metadata;
pub mod metrics;
pub mod pool;
pub mod progress;
pub mod range;
pub mod serialization;
pub mod server;
pub mod slicer;
pub mod streamer;
pub mod upload;

use crate::config::Config;
use crate::ingest::UrlIngest;
use crate::metadata::store::MetadataStore;
use crate::pool::BackendPool;
use crate::progress::ProgressTracker;
use crate::streamer::ByteStreamer;
use crate::upload::Uploader;

/// Shared application state passed to all handlers via `axum::extract::State`.
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    /// File record store (SQLite or in-memory).
    pub metadata: Arc<dyn MetadataStore>,
    /// Backend connection pool shared by streams and uploads.
    pub pool: BackendPool,
    /// Range-aware response builder.
    pub streamer: ByteStreamer,
    /// Upload orchestrator.
    pub uploader: Uploader,
    /// URL fetch front of the uploader.
    pub ingest: UrlIngest,
    /// Ephemeral upload progress map.
    pub progress: Arc<ProgressTracker>,
}

impl AppState {
    /// Wire the request-facing services around an initialized pool and store.
    pub fn new(
        config: Config,
        metadata: Arc<dyn MetadataStore>,
        pool: BackendPool,
    ) -> anyhow::Result<Self> {
        let progress = Arc::new(ProgressTracker::new(std::time::Duration::from_secs(
            config.uploads.progress_ttl_seconds,
        )));
        let streamer = ByteStreamer::new(pool.clone(), config.streaming.chunk_size);
        let uploader = Uploader::new(
            pool.clone(),
            metadata.clone(),
            progress.clone(),
            config.uploads.clone(),
            config.server.max_file_size,
            config.server.max_file_size_standard,
        );
        let ingest = UrlIngest::new(uploader.clone(), progress.clone())?;
        Ok(Self {
            config,
            metadata,
            pool,
            streamer,
            uploader,
            ingest,
            progress,
        })
    }
}
