//! Error taxonomy for the chat and ingestion flows.
//!
//! Every variant maps to a stable machine-readable code (see [`ChatError::code`])
//! so the HTTP layer can return `{"error": {"code", "message"}}` bodies without
//! string-matching on messages.

/// Errors surfaced by the orchestrator, ingestor, and store.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    /// Malformed or oversize input. User-correctable, never retried.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// The session exists but belongs to a different user.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// A concurrent append claimed the same sequence position. The caller
    /// retries; the append is never silently reordered.
    #[error("conflict: {0}")]
    Conflict(String),

    /// An external service (LLM or embedding) failed after exhausting retries.
    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String, retry_after_secs: u64 },

    /// Ingestion indexed some chunks before failing. The indexed chunks
    /// remain; the caller may re-ingest to top up.
    #[error("partial failure: indexed {indexed} of {total} chunks for document {document_id}")]
    PartialFailure {
        document_id: String,
        indexed: usize,
        total: usize,
    },

    /// Persistence-layer failure. Fatal for the request, never retried silently.
    #[error("storage error: {0}")]
    Store(#[from] sqlx::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ChatError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        ChatError::InvalidArgument(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>, retry_after_secs: u64) -> Self {
        ChatError::ServiceUnavailable {
            message: msg.into(),
            retry_after_secs,
        }
    }

    /// Stable wire code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            ChatError::InvalidArgument(_) => "invalid_argument",
            ChatError::NotFound(_) => "not_found",
            ChatError::PermissionDenied(_) => "permission_denied",
            ChatError::Conflict(_) => "conflict",
            ChatError::ServiceUnavailable { .. } => "service_unavailable",
            ChatError::PartialFailure { .. } => "partial_failure",
            ChatError::Store(_) => "storage_error",
            ChatError::Internal(_) => "internal",
        }
    }
}

pub type ChatResult<T> = Result<T, ChatError>;
