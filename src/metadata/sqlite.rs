//! SQLite-backed metadata store.
//!
//! Uses `rusqlite` with the `bundled` feature so no system SQLite
//! library is required.  All async trait methods are thin wrappers
//! around synchronous rusqlite calls executed under a `Mutex`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};

use super::store::{now_timestamp, FileRecord, MetadataStore, ObjectDescriptor, StoreStats};
use crate::media::MediaKind;

/// Current schema version. Bumped when migrations are added.
const SCHEMA_VERSION: i64 = 1;

const FILE_COLUMNS: &str = "id, owner_id, display_name, size_bytes, content_type, media_kind,
     remote_object_id, backend_identity, storage_channel, checksum, uploaded_at";

/// Metadata store backed by a single SQLite database file.
pub struct SqliteMetadataStore {
    /// The database connection, guarded by a mutex for Send + Sync.
    conn: Mutex<Connection>,
}

impl SqliteMetadataStore {
    /// Open (or create) the database at `path` and initialize the schema.
    ///
    /// Passing `":memory:"` creates an in-memory database (useful for tests).
    pub fn new(path: &str) -> anyhow::Result<Self> {
        if path != ":memory:" {
            if let Some(parent) = std::path::Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
        }
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.apply_pragmas()?;
        store.init_db()?;
        Ok(store)
    }

    /// Apply recommended SQLite pragmas for performance and safety.
    fn apply_pragmas(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA busy_timeout = 5000;
            ",
        )?;
        Ok(())
    }

    /// Create the required tables and indexes if they do not already exist.
    /// This is idempotent -- safe to call on every startup (crash-only design).
    fn init_db(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS schema_version (
                version    INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS files (
                id                TEXT PRIMARY KEY,
                owner_id          TEXT NOT NULL,
                display_name      TEXT NOT NULL,
                size_bytes        INTEGER NOT NULL,
                content_type      TEXT NOT NULL DEFAULT 'application/octet-stream',
                media_kind        TEXT NOT NULL DEFAULT '{\"kind\":\"document\"}',
                remote_object_id  TEXT NOT NULL,
                backend_identity  TEXT NOT NULL DEFAULT '',
                storage_channel   TEXT NOT NULL DEFAULT '',
                checksum          TEXT NOT NULL DEFAULT '',
                uploaded_at       TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_files_owner
                ON files(owner_id, uploaded_at);
            CREATE INDEX IF NOT EXISTS idx_files_remote
                ON files(remote_object_id);
            ",
        )?;

        let existing: Option<i64> = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
                row.get(0)
            })
            .optional()?
            .flatten();

        if existing.map_or(true, |v| v < SCHEMA_VERSION) {
            conn.execute(
                "INSERT OR REPLACE INTO schema_version (version, applied_at) VALUES (?1, ?2)",
                params![SCHEMA_VERSION, now_timestamp()],
            )?;
        }

        Ok(())
    }
}

fn map_file_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FileRecord> {
    let size: i64 = row.get(3)?;
    let kind_json: String = row.get(5)?;
    Ok(FileRecord {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        display_name: row.get(2)?,
        size_bytes: size as u64,
        content_type: row.get(4)?,
        media_kind: serde_json::from_str(&kind_json).unwrap_or(MediaKind::Document),
        remote_object_id: row.get(6)?,
        backend_identity: row.get(7)?,
        storage_channel: row.get(8)?,
        checksum: row.get(9)?,
        uploaded_at: row.get(10)?,
    })
}

impl MetadataStore for SqliteMetadataStore {
    fn put_file(
        &self,
        record: FileRecord,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move {
            let kind_json = serde_json::to_string(&record.media_kind)?;
            let conn = self.conn.lock().expect("mutex poisoned");
            conn.execute(
                &format!(
                    "INSERT OR REPLACE INTO files ({FILE_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
                ),
                params![
                    record.id,
                    record.owner_id,
                    record.display_name,
                    record.size_bytes as i64,
                    record.content_type,
                    kind_json,
                    record.remote_object_id,
                    record.backend_identity,
                    record.storage_channel,
                    record.checksum,
                    record.uploaded_at,
                ],
            )?;
            Ok(())
        })
    }

    fn lookup(
        &self,
        remote_object_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<ObjectDescriptor>>> + Send + '_>> {
        let remote_object_id = remote_object_id.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let result = conn
                .query_row(
                    "SELECT remote_object_id, size_bytes, content_type, display_name
                     FROM files WHERE remote_object_id = ?1
                     ORDER BY uploaded_at DESC LIMIT 1",
                    params![remote_object_id],
                    |row| {
                        let size: i64 = row.get(1)?;
                        Ok(ObjectDescriptor {
                            remote_object_id: row.get(0)?,
                            size_bytes: size as u64,
                            content_type: row.get(2)?,
                            display_name: row.get(3)?,
                        })
                    },
                )
                .optional()?;
            Ok(result)
        })
    }

    fn get_file(
        &self,
        id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<FileRecord>>> + Send + '_>> {
        let id = id.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let result = conn
                .query_row(
                    &format!("SELECT {FILE_COLUMNS} FROM files WHERE id = ?1"),
                    params![id],
                    map_file_row,
                )
                .optional()?;
            Ok(result)
        })
    }

    fn list_files(
        &self,
        owner_id: Option<&str>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<FileRecord>>> + Send + '_>> {
        let owner_id = owner_id.map(|s| s.to_string());
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let mut stmt = conn.prepare(&format!(
                "SELECT {FILE_COLUMNS} FROM files
                 WHERE ?1 IS NULL OR owner_id = ?1
                 ORDER BY uploaded_at DESC, id DESC"
            ))?;
            let rows = stmt
                .query_map(params![owner_id], map_file_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    fn delete_file(
        &self,
        id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<FileRecord>>> + Send + '_>> {
        let id = id.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let tx = conn.unchecked_transaction()?;
            let existing = tx
                .query_row(
                    &format!("SELECT {FILE_COLUMNS} FROM files WHERE id = ?1"),
                    params![id],
                    map_file_row,
                )
                .optional()?;
            if existing.is_some() {
                tx.execute("DELETE FROM files WHERE id = ?1", params![id])?;
            }
            tx.commit()?;
            Ok(existing)
        })
    }

    fn stats(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<StoreStats>> + Send + '_>> {
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let (count, total): (i64, i64) = conn.query_row(
                "SELECT COUNT(*), COALESCE(SUM(size_bytes), 0) FROM files",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            Ok(StoreStats {
                total_files: count as u64,
                total_size: total as u64,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::store::fixtures::record;

    fn test_store() -> SqliteMetadataStore {
        SqliteMetadataStore::new(":memory:").expect("failed to create in-memory store")
    }

    #[tokio::test]
    async fn test_schema_idempotent() {
        let store = test_store();
        store.init_db().expect("second init_db failed");
        store.init_db().expect("third init_db failed");
    }

    #[tokio::test]
    async fn test_put_get_and_lookup() {
        let store = test_store();
        let mut rec = record("f1", "u1", 1000, "2026-01-01T00:00:00.000Z");
        rec.media_kind = MediaKind::Video {
            duration_secs: 12,
            supports_streaming: true,
        };
        store.put_file(rec.clone()).await.unwrap();

        assert_eq!(store.get_file("f1").await.unwrap(), Some(rec.clone()));
        let d = store.lookup("remotef1").await.unwrap().unwrap();
        assert_eq!(d, rec.descriptor());
        assert!(store.lookup("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_put_is_upsert() {
        let store = test_store();
        store
            .put_file(record("f1", "u1", 10, "2026-01-01T00:00:00.000Z"))
            .await
            .unwrap();
        let mut updated = record("f1", "u1", 20, "2026-01-01T00:00:00.000Z");
        updated.display_name = "renamed.bin".to_string();
        store.put_file(updated).await.unwrap();
        let got = store.get_file("f1").await.unwrap().unwrap();
        assert_eq!(got.size_bytes, 20);
        assert_eq!(got.display_name, "renamed.bin");
        assert_eq!(store.stats().await.unwrap().total_files, 1);
    }

    #[tokio::test]
    async fn test_list_newest_first_and_by_owner() {
        let store = test_store();
        store
            .put_file(record("a", "u1", 1, "2026-01-01T00:00:00.000Z"))
            .await
            .unwrap();
        store
            .put_file(record("b", "u2", 2, "2026-01-02T00:00:00.000Z"))
            .await
            .unwrap();
        store
            .put_file(record("c", "u1", 3, "2026-01-03T00:00:00.000Z"))
            .await
            .unwrap();

        let all: Vec<String> = store
            .list_files(None)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(all, vec!["c", "b", "a"]);

        let mine: Vec<String> = store
            .list_files(Some("u1"))
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(mine, vec!["c", "a"]);
    }

    #[tokio::test]
    async fn test_delete_returns_record() {
        let store = test_store();
        let rec = record("f1", "u1", 5, "2026-01-01T00:00:00.000Z");
        store.put_file(rec.clone()).await.unwrap();
        assert_eq!(store.delete_file("f1").await.unwrap(), Some(rec));
        assert_eq!(store.delete_file("f1").await.unwrap(), None);
        assert!(store.get_file("f1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stats() {
        let store = test_store();
        assert_eq!(store.stats().await.unwrap(), StoreStats::default());
        store
            .put_file(record("a", "u1", 100, "2026-01-01T00:00:00.000Z"))
            .await
            .unwrap();
        store
            .put_file(record("b", "u1", 250, "2026-01-01T00:00:01.000Z"))
            .await
            .unwrap();
        assert_eq!(
            store.stats().await.unwrap(),
            StoreStats {
                total_files: 2,
                total_size: 350
            }
        );
    }

    #[tokio::test]
    async fn test_reopen_file_database_keeps_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("meta.db");
        let path = path.to_str().unwrap();
        {
            let store = SqliteMetadataStore::new(path).unwrap();
            store
                .put_file(record("keep", "u1", 1, "2026-01-01T00:00:00.000Z"))
                .await
                .unwrap();
        }
        let store = SqliteMetadataStore::new(path).unwrap();
        assert!(store.get_file("keep").await.unwrap().is_some());
    }
}
