//! Document ingestion: validate, extract, chunk, index.
//!
//! Ingestion is synchronous from the caller's point of view: the upload call
//! returns once the document is fully indexed (or fails). Indexing proceeds
//! in embedding-sized batches; a batch that fails stops the pipeline and the
//! chunks indexed so far stay queryable, reported as a partial failure.

use sqlx::{Row, SqlitePool};
use tracing::{info, warn};

use crate::chunk;
use crate::config::{ChunkingConfig, EmbeddingConfig, IngestConfig};
use crate::error::{ChatError, ChatResult};
use crate::extract::{self, SupportedFormat};
use crate::models::DocumentInfo;
use crate::retrieval::Retriever;

/// Caller-supplied metadata for an upload.
#[derive(Debug, Clone)]
pub struct UploadMeta {
    pub title: String,
    pub department: String,
    pub content_type: String,
    pub uploaded_by: String,
}

/// Outcome of a successful ingestion.
#[derive(Debug, Clone, serde::Serialize)]
pub struct IngestReport {
    pub document_id: String,
    pub chunks_indexed: usize,
}

#[derive(Clone)]
pub struct Ingestor {
    pool: SqlitePool,
    retriever: Retriever,
    max_chars: usize,
    overlap_chars: usize,
    batch_size: usize,
    max_file_bytes: usize,
}

impl Ingestor {
    pub fn new(
        pool: SqlitePool,
        retriever: Retriever,
        chunking: &ChunkingConfig,
        embedding: &EmbeddingConfig,
        ingest: &IngestConfig,
    ) -> Self {
        Self {
            pool,
            retriever,
            max_chars: chunking.max_chars,
            overlap_chars: chunking.overlap_chars,
            batch_size: embedding.batch_size,
            max_file_bytes: ingest.max_file_bytes,
        }
    }

    /// Run the full pipeline for one uploaded file.
    ///
    /// Re-ingesting the same file creates a new independent document; there
    /// is no deduplication at this layer.
    pub async fn ingest(
        &self,
        filename: &str,
        bytes: &[u8],
        meta: &UploadMeta,
    ) -> ChatResult<IngestReport> {
        let format = SupportedFormat::from_filename(filename).ok_or_else(|| {
            ChatError::invalid(format!(
                "unsupported file type: {} (accepted: .txt, .md, .pdf, .docx)",
                filename
            ))
        })?;

        if bytes.is_empty() {
            return Err(ChatError::invalid("file is empty"));
        }
        if bytes.len() > self.max_file_bytes {
            return Err(ChatError::invalid(format!(
                "file exceeds maximum size of {} bytes",
                self.max_file_bytes
            )));
        }

        let text = extract::extract_text(bytes, format)
            .map_err(|e| ChatError::invalid(format!("could not extract text: {}", e)))?;
        if text.trim().is_empty() {
            return Err(ChatError::invalid("document contains no extractable text"));
        }

        let document_id = uuid::Uuid::new_v4().to_string();
        let now = chrono::Utc::now().timestamp();

        sqlx::query(
            r#"
            INSERT INTO documents
                (id, title, department, content_type, original_filename, uploaded_by, file_size, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&document_id)
        .bind(&meta.title)
        .bind(&meta.department)
        .bind(&meta.content_type)
        .bind(filename)
        .bind(&meta.uploaded_by)
        .bind(bytes.len() as i64)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let chunks = chunk::chunk_text(&document_id, &text, self.max_chars, self.overlap_chars);
        let total = chunks.len();
        let mut indexed = 0;

        for batch in chunks.chunks(self.batch_size.max(1)) {
            if let Err(e) = self.retriever.index_batch(batch).await {
                warn!(
                    document_id,
                    indexed, total, "indexing stopped mid-document: {}", e
                );
                return Err(ChatError::PartialFailure {
                    document_id,
                    indexed,
                    total,
                });
            }
            indexed += batch.len();
        }

        info!(document_id, chunks = total, filename, "document ingested");
        Ok(IngestReport {
            document_id,
            chunks_indexed: indexed,
        })
    }

    /// Metadata for a single document.
    pub async fn get_document(&self, document_id: &str) -> ChatResult<DocumentInfo> {
        let row = sqlx::query(
            r#"
            SELECT id, title, department, content_type, original_filename,
                   uploaded_by, file_size, created_at
            FROM documents
            WHERE id = ?
            "#,
        )
        .bind(document_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| ChatError::NotFound(format!("document {}", document_id)))?;

        Ok(DocumentInfo {
            id: row.get("id"),
            title: row.get("title"),
            department: row.get("department"),
            content_type: row.get("content_type"),
            original_filename: row.get("original_filename"),
            uploaded_by: row.get("uploaded_by"),
            file_size: row.get("file_size"),
            created_at: row.get("created_at"),
        })
    }

    /// Remove a document along with its chunks and vectors, so it no longer
    /// grounds any answer. Existing citations keep their document id as a
    /// historical back-reference.
    pub async fn delete_document(&self, document_id: &str) -> ChatResult<()> {
        let mut tx = self.pool.begin().await?;

        // Children before parent; foreign keys are enforced
        sqlx::query("DELETE FROM chunk_vectors WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        let deleted = sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        if deleted.rows_affected() == 0 {
            return Err(ChatError::NotFound(format!("document {}", document_id)));
        }

        tx.commit().await?;
        info!(document_id, "document deleted");
        Ok(())
    }

    /// All stored documents, newest first.
    pub async fn list_documents(&self) -> ChatResult<Vec<DocumentInfo>> {
        let rows = sqlx::query(
            r#"
            SELECT id, title, department, content_type, original_filename,
                   uploaded_by, file_size, created_at
            FROM documents
            ORDER BY created_at DESC, id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| DocumentInfo {
                id: row.get("id"),
                title: row.get("title"),
                department: row.get("department"),
                content_type: row.get("content_type"),
                original_filename: row.get("original_filename"),
                uploaded_by: row.get("uploaded_by"),
                file_size: row.get("file_size"),
                created_at: row.get("created_at"),
            })
            .collect())
    }
}
