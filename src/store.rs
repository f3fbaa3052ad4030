//! Conversation persistence: sessions, turns, and citations.
//!
//! Pure data access, no business logic. Turns form an append-only log per
//! session: [`ConversationStore::append_turn`] computes the next sequence
//! position and inserts inside one transaction, so two concurrent appends to
//! the same session can never both claim a position: the loser's UNIQUE
//! violation is mapped to [`ChatError::Conflict`] and retried by the caller.

use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::error::{ChatError, ChatResult};
use crate::models::{Citation, Session, SessionSummary, Turn, TurnRole};

/// Session titles are derived from the first user message, capped like the
/// conversation list expects.
const TITLE_MAX_CHARS: usize = 50;

#[derive(Clone)]
pub struct ConversationStore {
    pool: SqlitePool,
}

impl ConversationStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create_session(&self, user_email: &str) -> ChatResult<Session> {
        let id = Uuid::new_v4().to_string();
        let now = chrono::Utc::now().timestamp();

        sqlx::query(
            "INSERT INTO sessions (id, user_email, title, created_at, last_message_at, is_active) \
             VALUES (?, ?, NULL, ?, NULL, 1)",
        )
        .bind(&id)
        .bind(user_email)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(Session {
            id,
            user_email: user_email.to_string(),
            title: None,
            created_at: now,
            last_message_at: None,
            is_active: true,
        })
    }

    pub async fn get_session(&self, session_id: &str) -> ChatResult<Option<Session>> {
        let row = sqlx::query(
            "SELECT id, user_email, title, created_at, last_message_at, is_active \
             FROM sessions WHERE id = ?",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| Session {
            id: r.get("id"),
            user_email: r.get("user_email"),
            title: r.get("title"),
            created_at: r.get("created_at"),
            last_message_at: r.get("last_message_at"),
            is_active: r.get::<i64, _>("is_active") != 0,
        }))
    }

    /// Fetch a session and verify ownership.
    pub async fn get_owned_session(
        &self,
        session_id: &str,
        user_email: &str,
    ) -> ChatResult<Session> {
        let session = self
            .get_session(session_id)
            .await?
            .ok_or_else(|| ChatError::NotFound(format!("session {}", session_id)))?;

        if session.user_email != user_email {
            return Err(ChatError::PermissionDenied(format!(
                "session {} does not belong to {}",
                session_id, user_email
            )));
        }

        Ok(session)
    }

    /// Append a turn at the next sequence position.
    ///
    /// The transaction opens with `BEGIN IMMEDIATE` so the write lock is held
    /// before max seq is read; two concurrent appends serialize instead of
    /// racing on a stale snapshot. A writer that still loses out (lock
    /// acquisition timing out, or a duplicate position slipping through the
    /// UNIQUE(session_id, seq) constraint) surfaces as `Conflict` for the
    /// caller to retry. Citations are written in the same transaction, and
    /// the session's `last_message_at` (and, for the first user turn, its
    /// title) are updated alongside.
    pub async fn append_turn(
        &self,
        session_id: &str,
        role: TurnRole,
        content: &str,
        citations: &[Citation],
    ) -> ChatResult<Turn> {
        let id = Uuid::new_v4().to_string();
        let now = chrono::Utc::now().timestamp();

        let mut tx = self
            .pool
            .begin_with("BEGIN IMMEDIATE")
            .await
            .map_err(|e| map_append_error(e, session_id))?;

        let seq: i64 =
            sqlx::query_scalar("SELECT COALESCE(MAX(seq) + 1, 0) FROM turns WHERE session_id = ?")
                .bind(session_id)
                .fetch_one(&mut *tx)
                .await?;

        sqlx::query(
            "INSERT INTO turns (id, session_id, seq, role, content, created_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(session_id)
        .bind(seq)
        .bind(role.as_str())
        .bind(content)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_append_error(e, session_id))?;

        for citation in citations {
            sqlx::query(
                "INSERT INTO citations (turn_id, document_id, excerpt, score) VALUES (?, ?, ?, ?)",
            )
            .bind(&id)
            .bind(&citation.document_id)
            .bind(&citation.excerpt)
            .bind(citation.score)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("UPDATE sessions SET last_message_at = ? WHERE id = ?")
            .bind(now)
            .bind(session_id)
            .execute(&mut *tx)
            .await?;

        if role == TurnRole::User {
            sqlx::query("UPDATE sessions SET title = ? WHERE id = ? AND title IS NULL")
                .bind(derive_title(content))
                .bind(session_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        Ok(Turn {
            id,
            session_id: session_id.to_string(),
            seq,
            role,
            content: content.to_string(),
            created_at: now,
            citations: citations.to_vec(),
        })
    }

    /// Turns in sequence order, strictly after `after_seq` (use `None` to
    /// start from the beginning), at most `limit` rows. Repeated calls with
    /// the same cursor return the same page.
    pub async fn list_turns(
        &self,
        session_id: &str,
        after_seq: Option<i64>,
        limit: i64,
    ) -> ChatResult<Vec<Turn>> {
        let rows = sqlx::query(
            "SELECT id, session_id, seq, role, content, created_at \
             FROM turns WHERE session_id = ? AND seq > ? ORDER BY seq ASC LIMIT ?",
        )
        .bind(session_id)
        .bind(after_seq.unwrap_or(-1))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut turns = Vec::with_capacity(rows.len());
        for row in rows {
            turns.push(self.hydrate_turn(row).await?);
        }
        Ok(turns)
    }

    /// The last `k` turns strictly before `before_seq`, in sequence order.
    /// Used to bound the history window handed to the model.
    pub async fn recent_turns_before(
        &self,
        session_id: &str,
        before_seq: i64,
        k: i64,
    ) -> ChatResult<Vec<Turn>> {
        let rows = sqlx::query(
            "SELECT id, session_id, seq, role, content, created_at \
             FROM turns WHERE session_id = ? AND seq < ? ORDER BY seq DESC LIMIT ?",
        )
        .bind(session_id)
        .bind(before_seq)
        .bind(k)
        .fetch_all(&self.pool)
        .await?;

        let mut turns = Vec::with_capacity(rows.len());
        for row in rows.into_iter().rev() {
            turns.push(self.hydrate_turn(row).await?);
        }
        Ok(turns)
    }

    async fn hydrate_turn(&self, row: sqlx::sqlite::SqliteRow) -> ChatResult<Turn> {
        let id: String = row.get("id");
        let role_str: String = row.get("role");
        let role = TurnRole::parse(&role_str)
            .ok_or_else(|| ChatError::Internal(anyhow::anyhow!("unknown role: {}", role_str)))?;

        let citation_rows = sqlx::query(
            "SELECT document_id, excerpt, score FROM citations WHERE turn_id = ? ORDER BY id ASC",
        )
        .bind(&id)
        .fetch_all(&self.pool)
        .await?;

        let citations = citation_rows
            .iter()
            .map(|c| Citation {
                document_id: c.get("document_id"),
                excerpt: c.get("excerpt"),
                score: c.get("score"),
            })
            .collect();

        Ok(Turn {
            id,
            session_id: row.get("session_id"),
            seq: row.get("seq"),
            role,
            content: row.get("content"),
            created_at: row.get("created_at"),
            citations,
        })
    }

    /// Active sessions for a user, most recently used first.
    pub async fn list_sessions(&self, user_email: &str) -> ChatResult<Vec<SessionSummary>> {
        let rows = sqlx::query(
            r#"
            SELECT s.id, s.title, s.created_at, s.last_message_at,
                   (SELECT COUNT(*) FROM turns t WHERE t.session_id = s.id) AS turn_count
            FROM sessions s
            WHERE s.user_email = ? AND s.is_active = 1
            ORDER BY COALESCE(s.last_message_at, s.created_at) DESC, s.id ASC
            "#,
        )
        .bind(user_email)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|r| SessionSummary {
                session_id: r.get("id"),
                title: r.get("title"),
                created_at: r.get("created_at"),
                last_message_at: r.get("last_message_at"),
                turn_count: r.get("turn_count"),
            })
            .collect())
    }

    /// Soft close. The session and its turns are retained for audit.
    pub async fn close_session(&self, session_id: &str) -> ChatResult<()> {
        sqlx::query("UPDATE sessions SET is_active = 0 WHERE id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Replace a session's title.
    pub async fn set_title(&self, session_id: &str, title: &str) -> ChatResult<()> {
        sqlx::query("UPDATE sessions SET title = ? WHERE id = ?")
            .bind(title)
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Classify append failures: a UNIQUE(session_id, seq) violation or SQLite
/// write-lock contention (SQLITE_BUSY 5 / SQLITE_BUSY_SNAPSHOT 517) both mean
/// a concurrent writer won the position, and the caller retries.
fn map_append_error(err: sqlx::Error, session_id: &str) -> ChatError {
    if is_unique_violation(&err) || is_write_contention(&err) {
        ChatError::Conflict(format!(
            "concurrent append to session {}: {}",
            session_id, err
        ))
    } else {
        ChatError::Store(err)
    }
}

fn derive_title(content: &str) -> String {
    let trimmed = content.trim();
    if trimmed.chars().count() <= TITLE_MAX_CHARS {
        return trimmed.to_string();
    }
    let cut: String = trimmed.chars().take(TITLE_MAX_CHARS).collect();
    format!("{}...", cut)
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db) if db.message().contains("UNIQUE constraint failed")
    )
}

pub(crate) fn is_write_contention(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            matches!(db.code().as_deref(), Some("5") | Some("517"))
                || db.message().contains("database is locked")
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db, migrate};

    async fn test_store() -> (tempfile::TempDir, ConversationStore) {
        let tmp = tempfile::tempdir().unwrap();
        let pool = db::connect_path(&tmp.path().join("test.sqlite"))
            .await
            .unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        (tmp, ConversationStore::new(pool))
    }

    #[tokio::test]
    async fn appends_are_gapless_and_zero_based() {
        let (_tmp, store) = test_store().await;
        let session = store.create_session("ann@example.com").await.unwrap();

        for i in 0..5 {
            let turn = store
                .append_turn(&session.id, TurnRole::User, &format!("msg {}", i), &[])
                .await
                .unwrap();
            assert_eq!(turn.seq, i);
        }

        let turns = store.list_turns(&session.id, None, 100).await.unwrap();
        let seqs: Vec<i64> = turns.iter().map(|t| t.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn duplicate_sequence_is_a_conflict() {
        let (_tmp, store) = test_store().await;
        let session = store.create_session("ann@example.com").await.unwrap();
        store
            .append_turn(&session.id, TurnRole::User, "hello", &[])
            .await
            .unwrap();

        // Simulate the losing side of a race: another writer already holds seq 0
        let err = sqlx::query(
            "INSERT INTO turns (id, session_id, seq, role, content, created_at) \
             VALUES ('dup', ?, 0, 'user', 'loser', 0)",
        )
        .bind(&session.id)
        .execute(&store.pool)
        .await
        .unwrap_err();

        assert!(is_unique_violation(&err));
    }

    #[tokio::test]
    async fn ownership_is_enforced() {
        let (_tmp, store) = test_store().await;
        let session = store.create_session("ann@example.com").await.unwrap();

        let err = store
            .get_owned_session(&session.id, "bob@example.com")
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::PermissionDenied(_)));

        let err = store
            .get_owned_session("no-such-session", "ann@example.com")
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::NotFound(_)));
    }

    #[tokio::test]
    async fn citations_round_trip_with_assistant_turns() {
        let (_tmp, store) = test_store().await;
        let session = store.create_session("ann@example.com").await.unwrap();

        let citations = vec![Citation {
            document_id: "doc-1".into(),
            excerpt: "Employees may work remotely up to 3 days per week.".into(),
            score: 0.92,
        }];
        store
            .append_turn(&session.id, TurnRole::Assistant, "You may.", &citations)
            .await
            .unwrap();

        let turns = store.list_turns(&session.id, None, 10).await.unwrap();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].citations.len(), 1);
        assert_eq!(turns[0].citations[0].document_id, "doc-1");
        assert!((turns[0].citations[0].score - 0.92).abs() < 1e-9);
    }

    #[tokio::test]
    async fn pagination_cursor_is_restartable() {
        let (_tmp, store) = test_store().await;
        let session = store.create_session("ann@example.com").await.unwrap();
        for i in 0..7 {
            store
                .append_turn(&session.id, TurnRole::User, &format!("m{}", i), &[])
                .await
                .unwrap();
        }

        let page1 = store.list_turns(&session.id, None, 3).await.unwrap();
        assert_eq!(page1.len(), 3);
        let cursor = page1.last().unwrap().seq;

        let page2a = store.list_turns(&session.id, Some(cursor), 3).await.unwrap();
        let page2b = store.list_turns(&session.id, Some(cursor), 3).await.unwrap();
        assert_eq!(
            page2a.iter().map(|t| t.seq).collect::<Vec<_>>(),
            page2b.iter().map(|t| t.seq).collect::<Vec<_>>()
        );
        assert_eq!(page2a[0].seq, cursor + 1);
    }

    #[tokio::test]
    async fn first_user_message_titles_the_session() {
        let (_tmp, store) = test_store().await;
        let session = store.create_session("ann@example.com").await.unwrap();
        store
            .append_turn(&session.id, TurnRole::User, "What is the travel policy?", &[])
            .await
            .unwrap();
        store
            .append_turn(&session.id, TurnRole::User, "A different question", &[])
            .await
            .unwrap();

        let fetched = store.get_session(&session.id).await.unwrap().unwrap();
        assert_eq!(fetched.title.as_deref(), Some("What is the travel policy?"));
    }

    #[tokio::test]
    async fn closed_sessions_leave_the_listing_but_not_the_store() {
        let (_tmp, store) = test_store().await;
        let session = store.create_session("ann@example.com").await.unwrap();
        store
            .append_turn(&session.id, TurnRole::User, "hi", &[])
            .await
            .unwrap();
        store.close_session(&session.id).await.unwrap();

        let listed = store.list_sessions("ann@example.com").await.unwrap();
        assert!(listed.is_empty());

        // Retained for audit
        let fetched = store.get_session(&session.id).await.unwrap().unwrap();
        assert!(!fetched.is_active);
        assert_eq!(
            store.list_turns(&session.id, None, 10).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn contended_appends_serialize_or_conflict_never_storage_error() {
        let (_tmp, store) = test_store().await;
        let session = store.create_session("ann@example.com").await.unwrap();

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            let session_id = session.id.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    match store
                        .append_turn(&session_id, TurnRole::User, &format!("m{}", i), &[])
                        .await
                    {
                        Err(ChatError::Conflict(_)) => continue,
                        other => return other,
                    }
                }
            }));
        }
        for handle in handles {
            // Anything but Ok or a retried Conflict (e.g. a Store error from
            // lock contention) fails here
            handle.await.unwrap().unwrap();
        }

        let turns = store.list_turns(&session.id, None, 100).await.unwrap();
        let seqs: Vec<i64> = turns.iter().map(|t| t.seq).collect();
        assert_eq!(seqs, (0..16).collect::<Vec<i64>>());
    }

    #[tokio::test]
    async fn titles_can_be_replaced() {
        let (_tmp, store) = test_store().await;
        let session = store.create_session("ann@example.com").await.unwrap();
        store
            .append_turn(&session.id, TurnRole::User, "original question", &[])
            .await
            .unwrap();

        store.set_title(&session.id, "Travel policy").await.unwrap();
        let fetched = store.get_session(&session.id).await.unwrap().unwrap();
        assert_eq!(fetched.title.as_deref(), Some("Travel policy"));
    }

    #[test]
    fn long_titles_are_truncated() {
        let long = "x".repeat(80);
        let title = derive_title(&long);
        assert_eq!(title.chars().count(), TITLE_MAX_CHARS + 3);
        assert!(title.ends_with("..."));
    }
}
