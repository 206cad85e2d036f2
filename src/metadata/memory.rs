//! In-memory metadata store.
//!
//! Stores all metadata in memory with no persistence. Useful for testing
//! and ephemeral deployments. Uses `RwLock<HashMap>` for thread-safe access.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::RwLock;

use super::store::{FileRecord, MetadataStore, ObjectDescriptor, StoreStats};

#[derive(Default)]
pub struct MemoryMetadataStore {
    files: RwLock<HashMap<String, FileRecord>>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetadataStore for MemoryMetadataStore {
    fn put_file(
        &self,
        record: FileRecord,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move {
            let mut files = self.files.write().expect("rwlock poisoned");
            files.insert(record.id.clone(), record);
            Ok(())
        })
    }

    fn lookup(
        &self,
        remote_object_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<ObjectDescriptor>>> + Send + '_>> {
        let remote_object_id = remote_object_id.to_string();
        Box::pin(async move {
            let files = self.files.read().expect("rwlock poisoned");
            Ok(files
                .values()
                .filter(|r| r.remote_object_id == remote_object_id)
                .max_by(|a, b| a.uploaded_at.cmp(&b.uploaded_at))
                .map(FileRecord::descriptor))
        })
    }

    fn get_file(
        &self,
        id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<FileRecord>>> + Send + '_>> {
        let id = id.to_string();
        Box::pin(async move {
            let files = self.files.read().expect("rwlock poisoned");
            Ok(files.get(&id).cloned())
        })
    }

    fn list_files(
        &self,
        owner_id: Option<&str>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<FileRecord>>> + Send + '_>> {
        let owner_id = owner_id.map(|s| s.to_string());
        Box::pin(async move {
            let files = self.files.read().expect("rwlock poisoned");
            let mut out: Vec<FileRecord> = files
                .values()
                .filter(|r| owner_id.as_deref().map_or(true, |o| r.owner_id == o))
                .cloned()
                .collect();
            out.sort_by(|a, b| {
                b.uploaded_at
                    .cmp(&a.uploaded_at)
                    .then_with(|| b.id.cmp(&a.id))
            });
            Ok(out)
        })
    }

    fn delete_file(
        &self,
        id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<FileRecord>>> + Send + '_>> {
        let id = id.to_string();
        Box::pin(async move {
            let mut files = self.files.write().expect("rwlock poisoned");
            Ok(files.remove(&id))
        })
    }

    fn stats(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<StoreStats>> + Send + '_>> {
        Box::pin(async move {
            let files = self.files.read().expect("rwlock poisoned");
            Ok(StoreStats {
                total_files: files.len() as u64,
                total_size: files.values().map(|r| r.size_bytes).sum(),
            })
        })
    }
}
