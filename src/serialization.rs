//! Metadata serialization: export/import of file records as JSON.
//!
//! The document is an envelope plus the record list:
//!
//! ```json
//! {
//!   "chunkvault_export": { "version": 1, "exported_at": "...", "source": "rust/0.1.0" },
//!   "files": [ { ...FileRecord... } ]
//! }
//! ```
//!
//! Import works against any [`MetadataStore`].  Without `replace`, records
//! whose id already exists are skipped; with `replace`, existing records are
//! removed first.

use serde::{Deserialize, Serialize};

use crate::metadata::store::{now_timestamp, FileRecord, MetadataStore};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const EXPORT_VERSION: i64 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, utoipa::ToSchema)]
pub struct ExportEnvelope {
    pub version: i64,
    pub exported_at: String,
    #[serde(default)]
    pub source: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct Backup {
    pub chunkvault_export: ExportEnvelope,
    #[serde(default)]
    pub files: Vec<FileRecord>,
}

impl Backup {
    pub fn check_version(&self) -> anyhow::Result<()> {
        let version = self.chunkvault_export.version;
        if !(1..=EXPORT_VERSION).contains(&version) {
            anyhow::bail!("unsupported export version: {}", version);
        }
        Ok(())
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ImportResult {
    pub imported: usize,
    pub skipped: usize,
    pub removed: usize,
    pub warnings: Vec<String>,
}

/// Snapshot every record in `store`, oldest first.
pub async fn export_backup(store: &dyn MetadataStore) -> anyhow::Result<Backup> {
    let mut files = store.list_files(None).await?;
    files.reverse();
    Ok(Backup {
        chunkvault_export: ExportEnvelope {
            version: EXPORT_VERSION,
            exported_at: now_timestamp(),
            source: format!("rust/{}", VERSION),
        },
        files,
    })
}

/// Pretty-printed JSON export of `store`.
pub async fn export_metadata(store: &dyn MetadataStore) -> anyhow::Result<String> {
    let backup = export_backup(store).await?;
    Ok(serde_json::to_string_pretty(&backup)?)
}

/// Parse and version-check an export document.
pub fn parse_backup(json_str: &str) -> anyhow::Result<Backup> {
    let backup: Backup = serde_json::from_str(json_str)
        .map_err(|e| anyhow::anyhow!("invalid export document: {}", e))?;
    backup.check_version()?;
    Ok(backup)
}

/// Load `backup` into `store`.
pub async fn restore_backup(
    store: &dyn MetadataStore,
    backup: Backup,
    replace: bool,
) -> anyhow::Result<ImportResult> {
    let mut result = ImportResult::default();

    if replace {
        for existing in store.list_files(None).await? {
            if store.delete_file(&existing.id).await?.is_some() {
                result.removed += 1;
            }
        }
    }

    for record in backup.files {
        if record.id.is_empty() || record.remote_object_id.is_empty() {
            result.skipped += 1;
            result
                .warnings
                .push(format!("Skipped record without id: '{}'", record.display_name));
            continue;
        }
        if !replace && store.get_file(&record.id).await?.is_some() {
            result.skipped += 1;
            continue;
        }
        store.put_file(record).await?;
        result.imported += 1;
    }
    Ok(result)
}

/// Parse `json_str` and load it into `store`.
pub async fn import_metadata(
    store: &dyn MetadataStore,
    json_str: &str,
    replace: bool,
) -> anyhow::Result<ImportResult> {
    let backup = parse_backup(json_str)?;
    restore_backup(store, backup, replace).await
}
