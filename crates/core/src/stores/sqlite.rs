use super::{summary_order, validate_chunk_set};
use crate::error::StoreError;
use crate::models::{
    Chunk, Document, DocumentStatus, DocumentSummary, FileFormat, RetrievalResult, SearchScope,
};
use crate::ranking::{RankCandidate, Ranker};
use crate::traits::ChunkStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

const SCHEMA: [&str; 5] = [
    r#"
    CREATE TABLE IF NOT EXISTS documents (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL,
        filename TEXT NOT NULL,
        format TEXT NOT NULL,
        category TEXT,
        is_public INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL,
        status_detail TEXT,
        external_ref TEXT,
        checksum TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS document_departments (
        document_id TEXT NOT NULL,
        department_id TEXT NOT NULL,
        PRIMARY KEY (document_id, department_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS chunks (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        document_id TEXT NOT NULL,
        tenant_id TEXT NOT NULL,
        ordinal INTEGER NOT NULL,
        content TEXT NOT NULL,
        embedding BLOB NOT NULL,
        UNIQUE (document_id, ordinal)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_chunks_tenant ON chunks(tenant_id)",
    "CREATE INDEX IF NOT EXISTS idx_documents_external_ref ON documents(tenant_id, external_ref)",
];

const DOCUMENT_COLUMNS: &str = "id, tenant_id, filename, format, category, is_public, status, \
     status_detail, external_ref, checksum, created_at, updated_at";

/// Chunk store persisted in SQLite. Embeddings live in a BLOB column and are
/// scored in process by the shared [`Ranker`] after the tenant and
/// department predicates have been applied in SQL.
pub struct SqliteChunkStore {
    pool: SqlitePool,
    ranker: Ranker,
}

impl SqliteChunkStore {
    pub async fn open(path: &Path, ranker: Ranker) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|error| {
                StoreError::Invalid(format!("cannot create {}: {error}", parent.display()))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        info!(path = %path.display(), "opened sqlite chunk store");
        Self::with_pool(pool, ranker).await
    }

    /// A private in-memory database. The pool is pinned to one connection that
    /// never expires, since every new connection would see an empty database.
    pub async fn in_memory(ranker: Ranker) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None::<Duration>)
            .max_lifetime(None::<Duration>)
            .connect_with(options)
            .await?;

        Self::with_pool(pool, ranker).await
    }

    pub async fn with_pool(pool: SqlitePool, ranker: Ranker) -> Result<Self, StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        Ok(Self { pool, ranker })
    }

    async fn departments(&self, document_id: &str) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            "SELECT department_id FROM document_departments WHERE document_id = ? ORDER BY department_id",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| row.try_get::<String, _>("department_id").map_err(StoreError::from))
            .collect()
    }

    async fn hydrate(&self, row: Option<SqliteRow>) -> Result<Option<Document>, StoreError> {
        let Some(row) = row else {
            return Ok(None);
        };
        let mut document = document_from_row(&row)?;
        document.department_ids = self.departments(&document.id).await?;
        Ok(Some(document))
    }
}

fn to_millis(timestamp: DateTime<Utc>) -> i64 {
    timestamp.timestamp_millis()
}

fn from_millis(millis: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| StoreError::Invalid(format!("timestamp out of range: {millis}")))
}

fn vec_to_blob(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|value| value.to_le_bytes()).collect()
}

fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|bytes| f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
        .collect()
}

fn document_from_row(row: &SqliteRow) -> Result<Document, StoreError> {
    let format: String = row.try_get("format")?;
    let status: String = row.try_get("status")?;

    Ok(Document {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        filename: row.try_get("filename")?,
        format: FileFormat::parse(&format)
            .ok_or_else(|| StoreError::Invalid(format!("unknown format {format}")))?,
        category: row.try_get("category")?,
        is_public: row.try_get::<i64, _>("is_public")? != 0,
        department_ids: Vec::new(),
        status: DocumentStatus::parse(&status)
            .ok_or_else(|| StoreError::Invalid(format!("unknown status {status}")))?,
        status_detail: row.try_get("status_detail")?,
        external_ref: row.try_get("external_ref")?,
        checksum: row.try_get("checksum")?,
        created_at: from_millis(row.try_get("created_at")?)?,
        updated_at: from_millis(row.try_get("updated_at")?)?,
    })
}

async fn write_document(conn: &mut SqliteConnection, document: &Document) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO documents (id, tenant_id, filename, format, category, is_public, status,
                               status_detail, external_ref, checksum, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            filename = excluded.filename,
            format = excluded.format,
            category = excluded.category,
            is_public = excluded.is_public,
            status = excluded.status,
            status_detail = excluded.status_detail,
            external_ref = excluded.external_ref,
            checksum = excluded.checksum,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&document.id)
    .bind(&document.tenant_id)
    .bind(&document.filename)
    .bind(document.format.as_str())
    .bind(&document.category)
    .bind(i64::from(document.is_public))
    .bind(document.status.as_str())
    .bind(&document.status_detail)
    .bind(&document.external_ref)
    .bind(&document.checksum)
    .bind(to_millis(document.created_at))
    .bind(to_millis(document.updated_at))
    .execute(&mut *conn)
    .await?;

    sqlx::query("DELETE FROM document_departments WHERE document_id = ?")
        .bind(&document.id)
        .execute(&mut *conn)
        .await?;

    for department_id in &document.department_ids {
        sqlx::query(
            "INSERT OR IGNORE INTO document_departments (document_id, department_id) VALUES (?, ?)",
        )
        .bind(&document.id)
        .bind(department_id)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

async fn write_chunks(
    conn: &mut SqliteConnection,
    document_id: &str,
    chunks: &[Chunk],
) -> Result<(), StoreError> {
    sqlx::query("DELETE FROM chunks WHERE document_id = ?")
        .bind(document_id)
        .execute(&mut *conn)
        .await?;

    for chunk in chunks {
        sqlx::query(
            "INSERT INTO chunks (document_id, tenant_id, ordinal, content, embedding) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&chunk.document_id)
        .bind(&chunk.tenant_id)
        .bind(i64::from(chunk.ordinal))
        .bind(&chunk.content)
        .bind(vec_to_blob(&chunk.embedding))
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

#[async_trait]
impl ChunkStore for SqliteChunkStore {
    async fn upsert_document(&self, document: &Document) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        write_document(&mut tx, document).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn set_status(
        &self,
        document_id: &str,
        status: DocumentStatus,
        detail: Option<&str>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE documents SET status = ?, status_detail = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(detail)
        .bind(to_millis(Utc::now()))
        .bind(document_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(document_id.to_string()));
        }
        Ok(())
    }

    async fn replace_chunks(&self, document_id: &str, chunks: &[Chunk]) -> Result<(), StoreError> {
        validate_chunk_set(document_id, chunks)?;

        let mut tx = self.pool.begin().await?;

        let matches: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE id = ?")
            .bind(document_id)
            .fetch_one(&mut *tx)
            .await?;
        if matches == 0 {
            return Err(StoreError::NotFound(document_id.to_string()));
        }

        write_chunks(&mut tx, document_id, chunks).await?;

        tx.commit().await?;
        debug!(document_id, chunks = chunks.len(), "replaced chunk set");
        Ok(())
    }

    async fn commit_document(&self, document: &Document, chunks: &[Chunk]) -> Result<(), StoreError> {
        validate_chunk_set(&document.id, chunks)?;

        let mut tx = self.pool.begin().await?;
        write_document(&mut tx, document).await?;
        write_chunks(&mut tx, &document.id, chunks).await?;
        tx.commit().await?;

        debug!(document_id = %document.id, chunks = chunks.len(), "committed document");
        Ok(())
    }

    async fn delete_document(&self, document_id: &str) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM document_departments WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        let removed = sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;
        Ok(removed > 0)
    }

    async fn get_document(
        &self,
        tenant_id: &str,
        document_id: &str,
    ) -> Result<Option<Document>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE id = ? AND tenant_id = ?"
        ))
        .bind(document_id)
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        self.hydrate(row).await
    }

    async fn find_by_external_ref(
        &self,
        tenant_id: &str,
        external_ref: &str,
    ) -> Result<Option<Document>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE tenant_id = ? AND external_ref = ? \
             ORDER BY created_at LIMIT 1"
        ))
        .bind(tenant_id)
        .bind(external_ref)
        .fetch_optional(&self.pool)
        .await?;

        self.hydrate(row).await
    }

    async fn document_chunks(
        &self,
        tenant_id: &str,
        document_id: &str,
    ) -> Result<Vec<Chunk>, StoreError> {
        let rows = sqlx::query(
            "SELECT document_id, tenant_id, ordinal, content, embedding FROM chunks \
             WHERE document_id = ? AND tenant_id = ? ORDER BY ordinal",
        )
        .bind(document_id)
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<Chunk, StoreError> {
                let ordinal: i64 = row.try_get("ordinal")?;
                let embedding: Vec<u8> = row.try_get("embedding")?;
                Ok(Chunk {
                    document_id: row.try_get("document_id")?,
                    tenant_id: row.try_get("tenant_id")?,
                    ordinal: u32::try_from(ordinal)
                        .map_err(|_| StoreError::Invalid(format!("ordinal {ordinal}")))?,
                    content: row.try_get("content")?,
                    embedding: blob_to_vec(&embedding),
                })
            })
            .collect()
    }

    async fn list_documents(
        &self,
        scope: &SearchScope,
        limit: usize,
    ) -> Result<Vec<DocumentSummary>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT d.id, d.filename, d.category, d.status, d.updated_at,
                   (SELECT COUNT(*) FROM chunks c WHERE c.document_id = d.id) AS chunk_count
            FROM documents d
            WHERE d.tenant_id = ?
              AND (? IS NULL OR d.is_public = 1 OR EXISTS (
                    SELECT 1 FROM document_departments dd
                    WHERE dd.document_id = d.id AND dd.department_id = ?))
            ORDER BY d.updated_at DESC, d.filename
            LIMIT ?
            "#,
        )
        .bind(&scope.tenant_id)
        .bind(scope.department_id.as_deref())
        .bind(scope.department_id.as_deref())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        let mut summaries = rows
            .iter()
            .map(|row| -> Result<DocumentSummary, StoreError> {
                let status: String = row.try_get("status")?;
                let chunk_count: i64 = row.try_get("chunk_count")?;
                Ok(DocumentSummary {
                    id: row.try_get("id")?,
                    filename: row.try_get("filename")?,
                    category: row.try_get("category")?,
                    status: DocumentStatus::parse(&status)
                        .ok_or_else(|| StoreError::Invalid(format!("unknown status {status}")))?,
                    updated_at: from_millis(row.try_get("updated_at")?)?,
                    chunk_count: chunk_count.max(0) as usize,
                })
            })
            .collect::<Result<Vec<_>, StoreError>>()?;

        summaries.sort_by(summary_order);
        Ok(summaries)
    }

    async fn search(
        &self,
        query_vector: &[f32],
        scope: &SearchScope,
        top_k: usize,
    ) -> Result<Vec<RetrievalResult>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT c.document_id, d.filename, c.ordinal, c.content, c.embedding, d.updated_at
            FROM chunks c
            JOIN documents d ON d.id = c.document_id
            WHERE c.tenant_id = ? AND d.tenant_id = ?
              AND (? IS NULL OR d.is_public = 1 OR EXISTS (
                    SELECT 1 FROM document_departments dd
                    WHERE dd.document_id = d.id AND dd.department_id = ?))
            ORDER BY c.seq
            "#,
        )
        .bind(&scope.tenant_id)
        .bind(&scope.tenant_id)
        .bind(scope.department_id.as_deref())
        .bind(scope.department_id.as_deref())
        .fetch_all(&self.pool)
        .await?;

        let candidates = rows
            .iter()
            .map(|row| -> Result<RankCandidate, StoreError> {
                let ordinal: i64 = row.try_get("ordinal")?;
                let embedding: Vec<u8> = row.try_get("embedding")?;
                Ok(RankCandidate {
                    document_id: row.try_get("document_id")?,
                    filename: row.try_get("filename")?,
                    ordinal: u32::try_from(ordinal)
                        .map_err(|_| StoreError::Invalid(format!("ordinal {ordinal}")))?,
                    content: row.try_get("content")?,
                    embedding: blob_to_vec(&embedding),
                    updated_at: from_millis(row.try_get("updated_at")?)?,
                })
            })
            .collect::<Result<Vec<_>, StoreError>>()?;

        debug!(
            tenant = %scope.tenant_id,
            eligible = candidates.len(),
            top_k,
            "ranking chunks"
        );
        Ok(self.ranker.rank(query_vector, candidates, Utc::now(), top_k))
    }
}
