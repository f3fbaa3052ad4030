//! Answer orchestration: the flow from an incoming user message to a
//! persisted, cited assistant turn.
//!
//! For each message: append the user turn (atomic sequence claim), load the
//! bounded history window, retrieve grounding chunks, assemble the prompt,
//! call the completion service with bounded retry/backoff, then persist the
//! assistant turn with one citation per chunk that was supplied to the model.
//!
//! If generation fails after the user turn was committed, the user turn
//! stays; there is no rollback.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::{ChatConfig, LlmConfig};
use crate::error::{ChatError, ChatResult};
use crate::llm::{ChatMessage, CompletionClient, LlmError};
use crate::models::{Citation, RetrievedChunk, SessionSummary, Turn, TurnRole};
use crate::prompt;
use crate::retrieval::Retriever;
use crate::store::ConversationStore;

/// Citation excerpts are capped so history payloads stay bounded.
const EXCERPT_MAX_CHARS: usize = 200;

/// Internal retries when the assistant-turn append races another writer.
const APPEND_RETRY_LIMIT: u32 = 3;

/// Backoff delays are capped regardless of attempt count.
const BACKOFF_CAP_MS: u64 = 8_000;

/// Default page size for history reads.
pub const HISTORY_PAGE_SIZE: i64 = 50;

/// Upper bound for caller-supplied conversation titles.
const TITLE_LIMIT_CHARS: usize = 200;

pub struct ChatService {
    store: ConversationStore,
    retriever: Retriever,
    llm: Arc<dyn CompletionClient>,
    history_turns: i64,
    max_message_chars: usize,
    llm_max_retries: u32,
    llm_backoff_ms: u64,
}

impl ChatService {
    pub fn new(
        store: ConversationStore,
        retriever: Retriever,
        llm: Arc<dyn CompletionClient>,
        chat: &ChatConfig,
        llm_config: &LlmConfig,
    ) -> Self {
        Self {
            store,
            retriever,
            llm,
            history_turns: chat.history_turns,
            max_message_chars: chat.max_message_chars,
            llm_max_retries: llm_config.max_retries,
            llm_backoff_ms: llm_config.backoff_ms,
        }
    }

    /// Create a new session for `user_email`.
    pub async fn start_session(&self, user_email: &str) -> ChatResult<String> {
        validate_email(user_email)?;
        let session = self.store.create_session(user_email).await?;
        debug!(session_id = %session.id, "session started");
        Ok(session.id)
    }

    /// Answer `message` within the given session and persist the exchange.
    pub async fn send_message(
        &self,
        session_id: &str,
        user_email: &str,
        message: &str,
    ) -> ChatResult<Turn> {
        validate_email(user_email)?;

        let message = message.trim();
        if message.is_empty() {
            return Err(ChatError::invalid("message must not be empty"));
        }
        if message.chars().count() > self.max_message_chars {
            return Err(ChatError::invalid(format!(
                "message exceeds maximum length of {} characters",
                self.max_message_chars
            )));
        }

        let session = self.store.get_owned_session(session_id, user_email).await?;
        if !session.is_active {
            return Err(ChatError::invalid("session is closed"));
        }

        // Step 1: claim the next sequence position. A losing concurrent
        // append surfaces as Conflict and the caller retries.
        let user_turn = self
            .store
            .append_turn(session_id, TurnRole::User, message, &[])
            .await?;

        // Step 2: bounded history window, excluding the turn just written.
        let history = self
            .store
            .recent_turns_before(session_id, user_turn.seq, self.history_turns)
            .await?;

        // Step 3: grounding. Empty results are valid.
        let chunks = self
            .retriever
            .search(message, self.retriever.top_k())
            .await?;
        debug!(
            session_id,
            seq = user_turn.seq,
            chunks = chunks.len(),
            "retrieved grounding context"
        );

        // Steps 4-5: assemble and generate, with bounded backoff. On
        // exhaustion the user turn from step 1 remains.
        let messages = prompt::build_messages(&chunks, &history, message);
        let answer = self.complete_with_retry(&messages).await?;

        // Step 6: every chunk supplied to the model becomes a citation.
        let citations: Vec<Citation> = chunks.iter().map(citation_for).collect();

        let assistant_turn = self
            .append_assistant_turn(session_id, &answer, &citations)
            .await?;

        Ok(assistant_turn)
    }

    async fn complete_with_retry(&self, messages: &[ChatMessage]) -> ChatResult<String> {
        let mut last_err = None;

        for attempt in 0..=self.llm_max_retries {
            if attempt > 0 {
                let delay = (self.llm_backoff_ms << (attempt - 1).min(6)).min(BACKOFF_CAP_MS);
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }

            match self.llm.complete(messages).await {
                Ok(answer) => return Ok(answer),
                Err(LlmError::Transient(msg)) => {
                    warn!(attempt, "completion attempt failed: {}", msg);
                    last_err = Some(msg);
                }
                Err(LlmError::Permanent(msg)) => {
                    // Bad request or bad credentials; a client retry cannot
                    // change the outcome, so no retry-after hint
                    return Err(ChatError::Internal(anyhow::anyhow!(
                        "completion service rejected the request: {}",
                        msg
                    )));
                }
            }
        }

        Err(ChatError::unavailable(
            format!(
                "completion service failed after {} attempts: {}",
                self.llm_max_retries + 1,
                last_err.unwrap_or_default()
            ),
            30,
        ))
    }

    /// The assistant append may race a concurrent message in the same
    /// session; at this point the answer is already generated, so the
    /// orchestrator acts as the retrying caller.
    async fn append_assistant_turn(
        &self,
        session_id: &str,
        answer: &str,
        citations: &[Citation],
    ) -> ChatResult<Turn> {
        let mut attempt = 0;
        loop {
            match self
                .store
                .append_turn(session_id, TurnRole::Assistant, answer, citations)
                .await
            {
                Err(ChatError::Conflict(msg)) if attempt < APPEND_RETRY_LIMIT => {
                    attempt += 1;
                    debug!(session_id, attempt, "assistant append lost a race: {}", msg);
                }
                other => return other,
            }
        }
    }

    /// One page of the session's history, sequence-ascending. `cursor` is the
    /// last sequence position of the previous page.
    pub async fn get_history(
        &self,
        session_id: &str,
        user_email: &str,
        cursor: Option<i64>,
        limit: Option<i64>,
    ) -> ChatResult<(Vec<Turn>, Option<i64>)> {
        validate_email(user_email)?;
        self.store.get_owned_session(session_id, user_email).await?;

        let limit = limit.unwrap_or(HISTORY_PAGE_SIZE).clamp(1, 500);
        let turns = self.store.list_turns(session_id, cursor, limit).await?;

        let next_cursor = if turns.len() as i64 == limit {
            turns.last().map(|t| t.seq)
        } else {
            None
        };

        Ok((turns, next_cursor))
    }

    /// Active conversations for a user, most recently used first.
    pub async fn list_conversations(&self, user_email: &str) -> ChatResult<Vec<SessionSummary>> {
        validate_email(user_email)?;
        self.store.list_sessions(user_email).await
    }

    /// Soft-close a conversation; history stays readable.
    pub async fn close_conversation(&self, session_id: &str, user_email: &str) -> ChatResult<()> {
        validate_email(user_email)?;
        self.store.get_owned_session(session_id, user_email).await?;
        self.store.close_session(session_id).await
    }

    /// Replace the auto-derived conversation title.
    pub async fn rename_conversation(
        &self,
        session_id: &str,
        user_email: &str,
        title: &str,
    ) -> ChatResult<String> {
        validate_email(user_email)?;
        self.store.get_owned_session(session_id, user_email).await?;

        let title = title.trim();
        if title.is_empty() {
            return Err(ChatError::invalid("title must not be empty"));
        }
        if title.chars().count() > TITLE_LIMIT_CHARS {
            return Err(ChatError::invalid(format!(
                "title exceeds maximum length of {} characters",
                TITLE_LIMIT_CHARS
            )));
        }

        self.store.set_title(session_id, title).await?;
        Ok(title.to_string())
    }
}

fn citation_for(chunk: &RetrievedChunk) -> Citation {
    Citation {
        document_id: chunk.document_id.clone(),
        excerpt: truncate_chars(&chunk.text, EXCERPT_MAX_CHARS),
        score: chunk.score,
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let cut: String = text.chars().take(max).collect();
    format!("{}...", cut)
}

fn validate_email(email: &str) -> ChatResult<()> {
    let email = email.trim();
    if email.is_empty() {
        return Err(ChatError::invalid("user_email must not be empty"));
    }
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && domain.contains('.') => Ok(()),
        _ => Err(ChatError::invalid(format!(
            "user_email is not a valid address: {}",
            email
        ))),
    }
}
