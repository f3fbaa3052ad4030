//! Core data types shared across the ingestion and chat pipelines.

use serde::{Deserialize, Serialize};

/// Who produced a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
}

impl TurnRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnRole::User => "user",
            TurnRole::Assistant => "assistant",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(TurnRole::User),
            "assistant" => Some(TurnRole::Assistant),
            _ => None,
        }
    }
}

/// A persistent conversation context for one user.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: String,
    pub user_email: String,
    pub title: Option<String>,
    pub created_at: i64,
    pub last_message_at: Option<i64>,
    pub is_active: bool,
}

/// One message in a session's append-only log. Immutable once written.
#[derive(Debug, Clone, Serialize)]
pub struct Turn {
    pub id: String,
    pub session_id: String,
    /// Position within the session: strictly increasing, gapless, 0-based.
    pub seq: i64,
    pub role: TurnRole,
    pub content: String,
    pub created_at: i64,
    /// Populated for assistant turns only.
    pub citations: Vec<Citation>,
}

/// Links an assistant turn to a chunk that grounded it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Citation {
    pub document_id: String,
    pub excerpt: String,
    /// Relevance in [0, 1].
    pub score: f64,
}

/// A bounded slice of a document's text, the unit of retrieval.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub text: String,
    pub hash: String,
}

/// A chunk returned from similarity search, with its relevance score.
#[derive(Debug, Clone, Serialize)]
pub struct RetrievedChunk {
    pub chunk_id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub text: String,
    pub score: f64,
}

/// Conversation listing entry.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub title: Option<String>,
    pub created_at: i64,
    pub last_message_at: Option<i64>,
    pub turn_count: i64,
}

/// Uploaded document metadata, as stored.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentInfo {
    pub id: String,
    pub title: String,
    pub department: String,
    pub content_type: String,
    pub original_filename: String,
    pub uploaded_by: String,
    pub file_size: i64,
    pub created_at: i64,
}
