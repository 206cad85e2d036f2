//! Backend connections.
//!
//! The [`chunk::ChunkBackend`] trait abstracts over where stored bytes
//! physically live.  Implementations include a shared local directory, an
//! in-process map, and a remote chunk server reached over HTTP.

pub mod chunk;
pub mod http;
pub mod local;
pub mod memory;

use std::sync::Arc;

use crate::config::{validate_connections, ConnectionConfig};

pub use chunk::{BackendError, ChunkBackend, ChunkStream, ProgressFn, RemoteObject, UploadPayload};

/// Build an unstarted backend for every configured connection.
///
/// Connections must address one store: any connection streams or deletes
/// what another uploaded. All `memory` connections share one object map.
pub fn build_backends(
    configs: &[ConnectionConfig],
) -> anyhow::Result<Vec<(ConnectionConfig, Arc<dyn ChunkBackend>)>> {
    validate_connections(configs)?;
    let shared_memory = memory::MemoryObjects::default();
    configs
        .iter()
        .map(|cfg| {
            let backend: Arc<dyn ChunkBackend> = match cfg.backend.as_str() {
                "memory" => Arc::new(memory::MemoryChunkBackend::with_objects(
                    shared_memory.clone(),
                )),
                "http" => {
                    let base_url = cfg.base_url.as_ref().ok_or_else(|| {
                        anyhow::anyhow!(
                            "connection '{}' uses the http backend but has no base_url",
                            cfg.identity
                        )
                    })?;
                    Arc::new(http::HttpChunkBackend::new(base_url, cfg.token.clone())?)
                }
                "local" => Arc::new(local::LocalChunkBackend::new(&cfg.root_dir)),
                other => anyhow::bail!(
                    "connection '{}' has unknown backend kind '{}'",
                    cfg.identity,
                    other
                ),
            };
            Ok((cfg.clone(), backend))
        })
        .collect()
}
