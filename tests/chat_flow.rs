//! End-to-end chat flow against a real SQLite store, with deterministic
//! local stand-ins for the embedding and completion services.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tempfile::TempDir;

use docqa::config::{ChatConfig, ChunkingConfig, EmbeddingConfig, IngestConfig, RetrievalConfig};
use docqa::db;
use docqa::embedding::Embedder;
use docqa::error::ChatError;
use docqa::ingest::{Ingestor, UploadMeta};
use docqa::llm::{ChatMessage, CompletionClient, LlmError};
use docqa::migrate;
use docqa::models::TurnRole;
use docqa::orchestrator::ChatService;
use docqa::retrieval::Retriever;
use docqa::store::ConversationStore;

/// Deterministic embedder: hashes words into a small bag-of-words vector, so
/// texts sharing vocabulary land close together in cosine space.
struct HashEmbedder;

#[async_trait]
impl Embedder for HashEmbedder {
    fn model_name(&self) -> &str {
        "hash-test"
    }

    fn dims(&self) -> usize {
        32
    }

    async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|text| {
                let mut vec = vec![0.0f32; 32];
                for word in text.to_lowercase().split_whitespace() {
                    let mut h: u32 = 2166136261;
                    for b in word.bytes() {
                        h ^= b as u32;
                        h = h.wrapping_mul(16777619);
                    }
                    vec[(h % 32) as usize] += 1.0;
                }
                vec
            })
            .collect())
    }
}

/// Scripted completion client, counting attempts.
struct ScriptedLlm {
    answer: String,
    calls: AtomicUsize,
}

impl ScriptedLlm {
    fn new(answer: &str) -> Self {
        Self {
            answer: answer.to_string(),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl CompletionClient for ScriptedLlm {
    async fn complete(&self, _messages: &[ChatMessage]) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.answer.clone())
    }
}

/// Completion client that never succeeds.
struct FlakyLlm {
    calls: AtomicUsize,
}

#[async_trait]
impl CompletionClient for FlakyLlm {
    async fn complete(&self, _messages: &[ChatMessage]) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(LlmError::Transient("simulated outage".to_string()))
    }
}

/// Completion client whose requests are rejected outright.
struct RejectingLlm {
    calls: AtomicUsize,
}

#[async_trait]
impl CompletionClient for RejectingLlm {
    async fn complete(&self, _messages: &[ChatMessage]) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(LlmError::Permanent("invalid API key".to_string()))
    }
}

struct Harness {
    _tmp: TempDir,
    store: ConversationStore,
    chat: ChatService,
    ingestor: Ingestor,
}

async fn harness(llm: Arc<dyn CompletionClient>) -> Harness {
    let tmp = tempfile::tempdir().unwrap();
    let pool = db::connect_path(&tmp.path().join("test.sqlite"))
        .await
        .unwrap();
    migrate::run_migrations(&pool).await.unwrap();

    // min_score 0 so the hash embedder's coarse similarity always qualifies
    let retrieval = RetrievalConfig {
        top_k: 4,
        min_score: 0.0,
    };
    let llm_config = docqa::config::LlmConfig {
        backoff_ms: 1,
        max_retries: 2,
        ..Default::default()
    };

    let embedder = Arc::new(HashEmbedder);
    let retriever = Retriever::new(pool.clone(), embedder, &retrieval);
    let store = ConversationStore::new(pool.clone());
    let chat = ChatService::new(
        store.clone(),
        retriever.clone(),
        llm,
        &ChatConfig::default(),
        &llm_config,
    );
    let ingestor = Ingestor::new(
        pool,
        retriever,
        &ChunkingConfig::default(),
        &EmbeddingConfig::default(),
        &IngestConfig::default(),
    );

    Harness {
        _tmp: tmp,
        store,
        chat,
        ingestor,
    }
}

#[tokio::test]
async fn question_over_ingested_document_gets_cited_answer() {
    let h = harness(Arc::new(ScriptedLlm::new(
        "Employees may work remotely up to 3 days per week.",
    )))
    .await;

    let meta = UploadMeta {
        title: "Remote Work Policy".into(),
        department: "hr".into(),
        content_type: "policy".into(),
        uploaded_by: "hr@example.com".into(),
    };
    let report = h
        .ingestor
        .ingest(
            "policy.txt",
            b"Employees may work remotely up to 3 days per week.",
            &meta,
        )
        .await
        .unwrap();
    assert!(report.chunks_indexed >= 1);

    let session_id = h.chat.start_session("ann@example.com").await.unwrap();
    let turn = h
        .chat
        .send_message(&session_id, "ann@example.com", "What's our remote work policy?")
        .await
        .unwrap();

    assert_eq!(turn.role, TurnRole::Assistant);
    assert!(!turn.content.is_empty());
    assert!(!turn.citations.is_empty());
    assert!(turn
        .citations
        .iter()
        .any(|c| c.document_id == report.document_id));
    for citation in &turn.citations {
        assert!((0.0..=1.0).contains(&citation.score));
        assert!(citation.excerpt.chars().count() <= 203);
    }
}

#[tokio::test]
async fn empty_message_is_rejected_without_persisting() {
    let h = harness(Arc::new(ScriptedLlm::new("unused"))).await;
    let session_id = h.chat.start_session("ann@example.com").await.unwrap();

    let err = h
        .chat
        .send_message(&session_id, "ann@example.com", "   ")
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::InvalidArgument(_)));

    let turns = h.store.list_turns(&session_id, None, 10).await.unwrap();
    assert!(turns.is_empty());
}

#[tokio::test]
async fn exhausted_llm_leaves_exactly_the_user_turn() {
    let llm = Arc::new(FlakyLlm {
        calls: AtomicUsize::new(0),
    });
    let h = harness(llm.clone()).await;
    let session_id = h.chat.start_session("ann@example.com").await.unwrap();

    let err = h
        .chat
        .send_message(&session_id, "ann@example.com", "hello?")
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::ServiceUnavailable { .. }));

    // max_retries = 2 means three attempts total
    assert_eq!(llm.calls.load(Ordering::SeqCst), 3);

    let turns = h.store.list_turns(&session_id, None, 10).await.unwrap();
    assert_eq!(turns.len(), 1);
    assert_eq!(turns[0].role, TurnRole::User);
    assert_eq!(turns[0].seq, 0);
}

#[tokio::test]
async fn permanent_llm_failure_is_not_retried() {
    let llm = Arc::new(RejectingLlm {
        calls: AtomicUsize::new(0),
    });
    let h = harness(llm.clone()).await;
    let session_id = h.chat.start_session("ann@example.com").await.unwrap();

    let err = h
        .chat
        .send_message(&session_id, "ann@example.com", "hello?")
        .await
        .unwrap_err();

    // Retrying cannot help, so no retry-after hint and exactly one attempt
    assert!(matches!(err, ChatError::Internal(_)));
    assert_eq!(llm.calls.load(Ordering::SeqCst), 1);

    let turns = h.store.list_turns(&session_id, None, 10).await.unwrap();
    assert_eq!(turns.len(), 1);
    assert_eq!(turns[0].role, TurnRole::User);
}

#[tokio::test]
async fn concurrent_messages_yield_a_gapless_log() {
    let h = Arc::new(harness(Arc::new(ScriptedLlm::new("ok"))).await);
    let session_id = h.chat.start_session("ann@example.com").await.unwrap();

    let mut handles = Vec::new();
    for i in 0..4 {
        let h = h.clone();
        let session_id = session_id.clone();
        handles.push(tokio::spawn(async move {
            // The caller owns the retry on Conflict
            loop {
                match h
                    .chat
                    .send_message(&session_id, "ann@example.com", &format!("question {}", i))
                    .await
                {
                    Err(ChatError::Conflict(_)) => continue,
                    other => return other,
                }
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let turns = h.store.list_turns(&session_id, None, 100).await.unwrap();
    let seqs: Vec<i64> = turns.iter().map(|t| t.seq).collect();
    assert_eq!(seqs, (0..8).collect::<Vec<i64>>());
}

#[tokio::test]
async fn sessions_sequence_independently() {
    let h = harness(Arc::new(ScriptedLlm::new("ok"))).await;
    let a = h.chat.start_session("ann@example.com").await.unwrap();
    let b = h.chat.start_session("ann@example.com").await.unwrap();

    h.chat.send_message(&a, "ann@example.com", "one").await.unwrap();
    h.chat.send_message(&b, "ann@example.com", "uno").await.unwrap();

    let turns_a = h.store.list_turns(&a, None, 10).await.unwrap();
    let turns_b = h.store.list_turns(&b, None, 10).await.unwrap();
    assert_eq!(turns_a[0].seq, 0);
    assert_eq!(turns_b[0].seq, 0);
    assert!(turns_a.iter().all(|t| t.session_id == a));
    assert!(turns_b.iter().all(|t| t.session_id == b));
}

#[tokio::test]
async fn history_pages_are_stable_and_cursor_terminates() {
    let h = harness(Arc::new(ScriptedLlm::new("ok"))).await;
    let session_id = h.chat.start_session("ann@example.com").await.unwrap();
    for i in 0..3 {
        h.chat
            .send_message(&session_id, "ann@example.com", &format!("q{}", i))
            .await
            .unwrap();
    }
    // 3 exchanges = 6 turns

    let (page1, cursor1) = h
        .chat
        .get_history(&session_id, "ann@example.com", None, Some(4))
        .await
        .unwrap();
    assert_eq!(page1.len(), 4);
    let cursor1 = cursor1.unwrap();
    assert_eq!(cursor1, page1.last().unwrap().seq);

    let (page2, cursor2) = h
        .chat
        .get_history(&session_id, "ann@example.com", Some(cursor1), Some(4))
        .await
        .unwrap();
    assert_eq!(page2.len(), 2);
    assert!(cursor2.is_none());
    assert_eq!(page2[0].seq, cursor1 + 1);

    // Same cursor, same page
    let (page2_again, _) = h
        .chat
        .get_history(&session_id, "ann@example.com", Some(cursor1), Some(4))
        .await
        .unwrap();
    assert_eq!(
        page2.iter().map(|t| t.id.clone()).collect::<Vec<_>>(),
        page2_again.iter().map(|t| t.id.clone()).collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn closed_sessions_refuse_new_messages() {
    let h = harness(Arc::new(ScriptedLlm::new("ok"))).await;
    let session_id = h.chat.start_session("ann@example.com").await.unwrap();
    h.chat
        .send_message(&session_id, "ann@example.com", "before close")
        .await
        .unwrap();
    h.chat
        .close_conversation(&session_id, "ann@example.com")
        .await
        .unwrap();

    let err = h
        .chat
        .send_message(&session_id, "ann@example.com", "after close")
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::InvalidArgument(_)));

    // History stays readable after close
    let (turns, _) = h
        .chat
        .get_history(&session_id, "ann@example.com", None, None)
        .await
        .unwrap();
    assert_eq!(turns.len(), 2);
}

#[tokio::test]
async fn other_users_cannot_touch_a_session() {
    let h = harness(Arc::new(ScriptedLlm::new("ok"))).await;
    let session_id = h.chat.start_session("ann@example.com").await.unwrap();

    let err = h
        .chat
        .send_message(&session_id, "bob@example.com", "mine now")
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::PermissionDenied(_)));

    let err = h
        .chat
        .get_history(&session_id, "bob@example.com", None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::PermissionDenied(_)));
}

#[tokio::test]
async fn unsupported_and_empty_uploads_are_rejected() {
    let h = harness(Arc::new(ScriptedLlm::new("ok"))).await;
    let meta = UploadMeta {
        title: "t".into(),
        department: "d".into(),
        content_type: "c".into(),
        uploaded_by: "u@example.com".into(),
    };

    let err = h
        .ingestor
        .ingest("data.csv", b"a,b,c", &meta)
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::InvalidArgument(_)));

    let err = h.ingestor.ingest("empty.txt", b"", &meta).await.unwrap_err();
    assert!(matches!(err, ChatError::InvalidArgument(_)));

    let err = h
        .ingestor
        .ingest("blank.txt", b"   \n  ", &meta)
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::InvalidArgument(_)));
}

#[tokio::test]
async fn oversize_upload_is_rejected_before_extraction() {
    let tmp = tempfile::tempdir().unwrap();
    let pool = db::connect_path(&tmp.path().join("test.sqlite"))
        .await
        .unwrap();
    migrate::run_migrations(&pool).await.unwrap();

    let retriever = Retriever::new(
        pool.clone(),
        Arc::new(HashEmbedder),
        &RetrievalConfig::default(),
    );
    let ingestor = Ingestor::new(
        pool,
        retriever,
        &ChunkingConfig::default(),
        &EmbeddingConfig::default(),
        &IngestConfig { max_file_bytes: 64 },
    );

    let meta = UploadMeta {
        title: "t".into(),
        department: "d".into(),
        content_type: "c".into(),
        uploaded_by: "u@example.com".into(),
    };
    let big = "x".repeat(65);
    let err = ingestor
        .ingest("big.txt", big.as_bytes(), &meta)
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::InvalidArgument(_)));
    assert!(err.to_string().contains("maximum size"));
}

#[tokio::test]
async fn deleted_documents_no_longer_ground_answers() {
    let h = harness(Arc::new(ScriptedLlm::new("ok"))).await;
    let meta = UploadMeta {
        title: "Remote Work Policy".into(),
        department: "hr".into(),
        content_type: "policy".into(),
        uploaded_by: "hr@example.com".into(),
    };
    let report = h
        .ingestor
        .ingest(
            "policy.txt",
            b"Employees may work remotely up to 3 days per week.",
            &meta,
        )
        .await
        .unwrap();

    h.ingestor.delete_document(&report.document_id).await.unwrap();

    let err = h
        .ingestor
        .get_document(&report.document_id)
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::NotFound(_)));
    assert!(h.ingestor.list_documents().await.unwrap().is_empty());

    let session_id = h.chat.start_session("ann@example.com").await.unwrap();
    let turn = h
        .chat
        .send_message(&session_id, "ann@example.com", "What's our remote work policy?")
        .await
        .unwrap();
    assert!(turn.citations.is_empty());

    let err = h
        .ingestor
        .delete_document(&report.document_id)
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::NotFound(_)));
}

#[tokio::test]
async fn conversations_can_be_renamed() {
    let h = harness(Arc::new(ScriptedLlm::new("ok"))).await;
    let session_id = h.chat.start_session("ann@example.com").await.unwrap();
    h.chat
        .send_message(&session_id, "ann@example.com", "first question")
        .await
        .unwrap();

    let title = h
        .chat
        .rename_conversation(&session_id, "ann@example.com", "  Travel policy  ")
        .await
        .unwrap();
    assert_eq!(title, "Travel policy");

    let listed = h.chat.list_conversations("ann@example.com").await.unwrap();
    assert_eq!(listed[0].title.as_deref(), Some("Travel policy"));

    let err = h
        .chat
        .rename_conversation(&session_id, "ann@example.com", "   ")
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::InvalidArgument(_)));

    let err = h
        .chat
        .rename_conversation(&session_id, "bob@example.com", "mine")
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::PermissionDenied(_)));
}

#[tokio::test]
async fn uploaded_documents_appear_in_the_listing() {
    let h = harness(Arc::new(ScriptedLlm::new("ok"))).await;
    let meta = UploadMeta {
        title: "Handbook".into(),
        department: "hr".into(),
        content_type: "policy".into(),
        uploaded_by: "hr@example.com".into(),
    };
    let report = h
        .ingestor
        .ingest("handbook.md", b"# Handbook\n\nBe kind.", &meta)
        .await
        .unwrap();

    let docs = h.ingestor.list_documents().await.unwrap();
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].id, report.document_id);
    assert_eq!(docs[0].title, "Handbook");
    assert_eq!(docs[0].original_filename, "handbook.md");
}
