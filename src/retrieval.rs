//! Chunk indexing and similarity search.
//!
//! The [`Retriever`] owns the vector side of the store: it writes chunk rows
//! plus their embedding BLOBs, and answers queries with the top-N chunks whose
//! cosine similarity clears the configured relevance floor. Similarity is
//! computed brute-force over all stored vectors, which is adequate for the
//! corpus sizes this service targets.

use std::sync::Arc;

use anyhow::Result;
use sqlx::{Row, SqlitePool};

use crate::config::RetrievalConfig;
use crate::embedding::{self, Embedder};
use crate::error::{ChatError, ChatResult};
use crate::models::{Chunk, RetrievedChunk};

#[derive(Clone)]
pub struct Retriever {
    pool: SqlitePool,
    embedder: Arc<dyn Embedder>,
    top_k: i64,
    min_score: f64,
}

impl Retriever {
    pub fn new(pool: SqlitePool, embedder: Arc<dyn Embedder>, config: &RetrievalConfig) -> Self {
        Self {
            pool,
            embedder,
            top_k: config.top_k,
            min_score: config.min_score,
        }
    }

    pub fn top_k(&self) -> i64 {
        self.top_k
    }

    /// Embed and persist a batch of chunks (chunk rows + vectors, one
    /// transaction). A failed batch writes nothing from that batch; chunks
    /// from earlier batches remain indexed.
    pub async fn index_batch(&self, chunks: &[Chunk]) -> Result<()> {
        if chunks.is_empty() {
            return Ok(());
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = self.embedder.embed(&texts).await?;
        anyhow::ensure!(
            vectors.len() == chunks.len(),
            "embedder returned {} vectors for {} chunks",
            vectors.len(),
            chunks.len()
        );

        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        for (chunk, vector) in chunks.iter().zip(vectors.iter()) {
            sqlx::query(
                "INSERT INTO chunks (id, document_id, chunk_index, text, hash) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&chunk.id)
            .bind(&chunk.document_id)
            .bind(chunk.chunk_index)
            .bind(&chunk.text)
            .bind(&chunk.hash)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                r#"
                INSERT INTO chunk_vectors (chunk_id, document_id, embedding, model, dims, created_at)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&chunk.id)
            .bind(&chunk.document_id)
            .bind(embedding::vec_to_blob(vector))
            .bind(self.embedder.model_name())
            .bind(self.embedder.dims() as i64)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Top-`limit` chunks for `query`, best first, scores in [0, 1], filtered
    /// by the relevance floor. An empty result is valid (no grounding
    /// available). Embedding failures surface as `ServiceUnavailable`.
    pub async fn search(&self, query: &str, limit: i64) -> ChatResult<Vec<RetrievedChunk>> {
        let query_vec = embedding::embed_query(self.embedder.as_ref(), query)
            .await
            .map_err(|e| ChatError::unavailable(format!("embedding service: {}", e), 30))?;

        let rows = sqlx::query(
            r#"
            SELECT cv.chunk_id, cv.document_id, cv.embedding, c.chunk_index, c.text
            FROM chunk_vectors cv
            JOIN chunks c ON c.id = cv.chunk_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut candidates: Vec<RetrievedChunk> = rows
            .iter()
            .filter_map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let vec = embedding::blob_to_vec(&blob);
                let similarity = embedding::cosine_similarity(&query_vec, &vec) as f64;
                // Clamp into the score domain; negative similarity means
                // "unrelated", not "negatively relevant"
                let score = similarity.max(0.0).min(1.0);
                if score < self.min_score {
                    return None;
                }
                Some(RetrievedChunk {
                    chunk_id: row.get("chunk_id"),
                    document_id: row.get("document_id"),
                    chunk_index: row.get("chunk_index"),
                    text: row.get("text"),
                    score,
                })
            })
            .collect();

        // Score desc, chunk_id asc: deterministic given the same stored vectors
        candidates.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        candidates.truncate(limit.max(0) as usize);

        Ok(candidates)
    }
}
