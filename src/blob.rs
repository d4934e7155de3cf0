//! Blob store: the embedded database for binary attachments.
//!
//! Attachments (photos, scanned forms) are kept out of the collection sync
//! path entirely: they live in a local SQLite database, keyed by a generated
//! id, with the payload encoded as a base64 data URL so callers can render it
//! directly. A blob may carry a `relatedRecordId`: a weak, by-value
//! reference to a record in some collection, never validated against it, and
//! shared by many blobs (one-to-many).
//!
//! Blobs are immutable after creation; the only mutation is deletion. Any
//! underlying transaction failure surfaces as an error to the caller; no
//! retries here.

use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::{debug, info};

use crate::record::{self, UserIdentity};

#[derive(Error, Debug)]
pub enum BlobError {
    #[error("blob store backend error: {0}")]
    Backend(String),
    #[error("failed to read attachment: {0}")]
    Io(#[from] std::io::Error),
}

impl From<sqlx::Error> for BlobError {
    fn from(e: sqlx::Error) -> Self {
        Self::Backend(e.to_string())
    }
}

/// A stored attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobRecord {
    pub id: String,
    /// Base64 data-URL payload, usable directly for rendering.
    pub data: String,
    /// Original filename.
    pub name: String,
    /// RFC3339 creation timestamp.
    pub created_at: String,
    pub created_by: String,
    pub author_name: String,
    pub author_role: String,
    /// Free-text origin tag (e.g. "EVIDENCE", "GENERAL").
    pub category: String,
    /// Weak reference to the owning record, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub related_record_id: Option<String>,
}

/// SQLite-backed attachment store.
pub struct BlobStore {
    pool: SqlitePool,
}

impl BlobStore {
    /// Open (creating if needed) the store at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, BlobError> {
        let url = format!("sqlite://{}?mode=rwc", path.as_ref().display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await?;

        let store = Self { pool };
        store.enable_wal_mode().await?;
        store.init_schema().await?;
        info!(path = %path.as_ref().display(), "Blob store opened");
        Ok(store)
    }

    /// WAL mode: readers don't block the writer, single fsync per commit.
    async fn enable_wal_mode(&self) -> Result<(), BlobError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await?;
        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn init_schema(&self) -> Result<(), BlobError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS blobs (
                id TEXT PRIMARY KEY,
                data TEXT NOT NULL,
                name TEXT NOT NULL,
                created_at TEXT NOT NULL,
                created_by TEXT NOT NULL,
                author_name TEXT NOT NULL,
                author_role TEXT NOT NULL,
                category TEXT NOT NULL,
                related_record_id TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        // Relation lookups are a hot path; index instead of scanning.
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_blobs_related ON blobs (related_record_id)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_blobs_created ON blobs (created_at)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Store raw bytes as an attachment.
    ///
    /// Resolves with the encoded **payload string** (not the id) so the
    /// caller can use it immediately without a follow-up read.
    pub async fn save_bytes(
        &self,
        name: &str,
        bytes: &[u8],
        author: &UserIdentity,
        category: &str,
        related_record_id: Option<&str>,
    ) -> Result<String, BlobError> {
        let payload = format!("data:{};base64,{}", mime_for(name), BASE64.encode(bytes));
        let id = record::generate_id();
        let created_at = record::now_timestamp();

        sqlx::query(
            r#"
            INSERT INTO blobs
                (id, data, name, created_at, created_by, author_name, author_role, category, related_record_id)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&payload)
        .bind(name)
        .bind(&created_at)
        .bind(&author.id)
        .bind(&author.name)
        .bind(&author.role)
        .bind(category)
        .bind(related_record_id)
        .execute(&self.pool)
        .await?;

        debug!(id, name, category, "Attachment stored");
        Ok(payload)
    }

    /// Read a file from disk and store it as an attachment.
    pub async fn save_file(
        &self,
        path: impl AsRef<Path>,
        author: &UserIdentity,
        category: &str,
        related_record_id: Option<&str>,
    ) -> Result<String, BlobError> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path).await?;
        let name = path
            .file_name()
            .map_or_else(|| "attachment".to_string(), |n| n.to_string_lossy().to_string());
        self.save_bytes(&name, &bytes, author, category, related_record_id)
            .await
    }

    pub async fn get(&self, id: &str) -> Result<Option<BlobRecord>, BlobError> {
        let row = sqlx::query("SELECT * FROM blobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(row_to_record))
    }

    /// All attachments, most recent first.
    pub async fn get_all(&self) -> Result<Vec<BlobRecord>, BlobError> {
        let rows = sqlx::query("SELECT * FROM blobs ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(row_to_record).collect())
    }

    /// Every attachment whose `relatedRecordId` equals `related_id`,
    /// most recent first.
    pub async fn get_by_related_id(
        &self,
        related_id: &str,
    ) -> Result<Vec<BlobRecord>, BlobError> {
        let rows = sqlx::query(
            "SELECT * FROM blobs WHERE related_record_id = ? ORDER BY created_at DESC",
        )
        .bind(related_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_record).collect())
    }

    pub async fn delete(&self, id: &str) -> Result<(), BlobError> {
        sqlx::query("DELETE FROM blobs WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn count(&self) -> Result<u64, BlobError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM blobs")
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.get("n");
        Ok(n.max(0) as u64)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn row_to_record(row: &SqliteRow) -> BlobRecord {
    BlobRecord {
        id: row.get("id"),
        data: row.get("data"),
        name: row.get("name"),
        created_at: row.get("created_at"),
        created_by: row.get("created_by"),
        author_name: row.get("author_name"),
        author_role: row.get("author_role"),
        category: row.get("category"),
        related_record_id: row.get("related_record_id"),
    }
}

fn mime_for(name: &str) -> &'static str {
    let ext = name.rsplit('.').next().unwrap_or("").to_ascii_lowercase();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn author() -> UserIdentity {
        UserIdentity::new("u-1", "Luis", "Supervisor")
    }

    async fn open_store(dir: &tempfile::TempDir) -> BlobStore {
        BlobStore::open(dir.path().join("blobs.db")).await.unwrap()
    }

    #[tokio::test]
    async fn test_save_resolves_with_payload() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;

        let payload = store
            .save_bytes("photo.png", b"fake png bytes", &author(), "EVIDENCE", None)
            .await
            .unwrap();
        assert!(payload.starts_with("data:image/png;base64,"));
    }

    #[tokio::test]
    async fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;

        let payload = store
            .save_bytes("scan.pdf", b"%PDF-1.4", &author(), "GENERAL", Some("rec-9"))
            .await
            .unwrap();

        let all = store.get_all().await.unwrap();
        assert_eq!(all.len(), 1);
        let blob = store.get(&all[0].id).await.unwrap().unwrap();
        assert_eq!(blob.data, payload);
        assert_eq!(blob.name, "scan.pdf");
        assert_eq!(blob.created_by, "u-1");
        assert_eq!(blob.author_name, "Luis");
        assert_eq!(blob.category, "GENERAL");
        assert_eq!(blob.related_record_id.as_deref(), Some("rec-9"));
    }

    #[tokio::test]
    async fn test_get_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        assert!(store.get("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_get_all_most_recent_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;

        for name in ["first.png", "second.png", "third.png"] {
            store
                .save_bytes(name, b"x", &author(), "GENERAL", None)
                .await
                .unwrap();
            // Distinct millisecond timestamps.
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let all = store.get_all().await.unwrap();
        let names: Vec<&str> = all.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, vec!["third.png", "second.png", "first.png"]);
    }

    #[tokio::test]
    async fn test_get_by_related_id_exact_set() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;

        store
            .save_bytes("a.png", b"a", &author(), "EVIDENCE", Some("rec-1"))
            .await
            .unwrap();
        store
            .save_bytes("b.png", b"b", &author(), "EVIDENCE", Some("rec-1"))
            .await
            .unwrap();
        store
            .save_bytes("c.png", b"c", &author(), "EVIDENCE", Some("rec-2"))
            .await
            .unwrap();
        store
            .save_bytes("d.png", b"d", &author(), "EVIDENCE", None)
            .await
            .unwrap();

        let related = store.get_by_related_id("rec-1").await.unwrap();
        let mut names: Vec<&str> = related.iter().map(|b| b.name.as_str()).collect();
        names.sort_unstable();
        assert_eq!(names, vec!["a.png", "b.png"]);
        assert!(store.get_by_related_id("rec-3").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;

        store
            .save_bytes("gone.png", b"x", &author(), "GENERAL", None)
            .await
            .unwrap();
        let id = store.get_all().await.unwrap()[0].id.clone();

        store.delete(&id).await.unwrap();
        assert!(store.get(&id).await.unwrap().is_none());
        assert_eq!(store.count().await.unwrap(), 0);

        // Deleting a missing id is not an error.
        store.delete(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_save_file_reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;

        let file_path = dir.path().join("site-photo.jpg");
        std::fs::write(&file_path, b"jpeg bytes").unwrap();

        let payload = store
            .save_file(&file_path, &author(), "GENERAL", None)
            .await
            .unwrap();
        assert!(payload.starts_with("data:image/jpeg;base64,"));

        let all = store.get_all().await.unwrap();
        assert_eq!(all[0].name, "site-photo.jpg");
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blobs.db");

        {
            let store = BlobStore::open(&path).await.unwrap();
            store
                .save_bytes("keep.png", b"x", &author(), "GENERAL", None)
                .await
                .unwrap();
            store.close().await;
        }

        let reopened = BlobStore::open(&path).await.unwrap();
        assert_eq!(reopened.count().await.unwrap(), 1);
    }

    #[test]
    fn test_mime_inference() {
        assert_eq!(mime_for("x.PNG"), "image/png");
        assert_eq!(mime_for("x.jpeg"), "image/jpeg");
        assert_eq!(mime_for("report.pdf"), "application/pdf");
        assert_eq!(mime_for("no-extension"), "application/octet-stream");
    }
}
