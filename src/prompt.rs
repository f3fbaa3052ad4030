//! Grounding-prompt assembly.
//!
//! Combines retrieved chunks, the bounded turn history, and the new question
//! into the message list sent to the completion service. Assembly is pure and
//! deterministic given the same inputs.

use crate::llm::ChatMessage;
use crate::models::{RetrievedChunk, Turn, TurnRole};

const SYSTEM_PROMPT: &str = "\
You are a helpful AI assistant for company employees. Use the provided context \
from company documents to answer questions accurately and helpfully.

Instructions:
1. Answer based primarily on the provided context.
2. If the context doesn't contain relevant information, say so clearly.
3. Always be professional and helpful.
4. Cite specific documents when possible.
5. If asked about something not in company documents, politely redirect to \
appropriate resources.";

/// Build the message list: system prompt with grounding context, then the
/// history window in order, then the new question.
pub fn build_messages(
    chunks: &[RetrievedChunk],
    history: &[Turn],
    question: &str,
) -> Vec<ChatMessage> {
    let mut system = String::from(SYSTEM_PROMPT);
    system.push_str("\n\nContext from company documents:\n");

    if chunks.is_empty() {
        system.push_str("(no relevant documents found)\n");
    } else {
        for chunk in chunks {
            system.push_str(&format!(
                "\n[document {} / chunk {}]\n{}\n",
                chunk.document_id, chunk.chunk_index, chunk.text
            ));
        }
    }

    let mut messages = Vec::with_capacity(history.len() + 2);
    messages.push(ChatMessage::system(system));

    for turn in history {
        messages.push(match turn.role {
            TurnRole::User => ChatMessage::user(turn.content.clone()),
            TurnRole::Assistant => ChatMessage::assistant(turn.content.clone()),
        });
    }

    messages.push(ChatMessage::user(question.to_string()));
    messages
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(doc: &str, idx: i64, text: &str) -> RetrievedChunk {
        RetrievedChunk {
            chunk_id: format!("{}-{}", doc, idx),
            document_id: doc.to_string(),
            chunk_index: idx,
            text: text.to_string(),
            score: 0.9,
        }
    }

    fn turn(role: TurnRole, content: &str) -> Turn {
        Turn {
            id: "t".into(),
            session_id: "s".into(),
            seq: 0,
            role,
            content: content.into(),
            created_at: 0,
            citations: vec![],
        }
    }

    #[test]
    fn context_chunks_land_in_system_message() {
        let chunks = vec![chunk("doc-1", 0, "Remote work is allowed 3 days per week.")];
        let messages = build_messages(&chunks, &[], "What's the remote work policy?");

        assert_eq!(messages[0].role, "system");
        assert!(messages[0].content.contains("doc-1"));
        assert!(messages[0].content.contains("Remote work is allowed"));
        assert_eq!(messages.last().unwrap().role, "user");
        assert_eq!(
            messages.last().unwrap().content,
            "What's the remote work policy?"
        );
    }

    #[test]
    fn empty_retrieval_is_stated_not_omitted() {
        let messages = build_messages(&[], &[], "Anything?");
        assert!(messages[0].content.contains("no relevant documents"));
    }

    #[test]
    fn history_preserves_order_and_roles() {
        let history = vec![
            turn(TurnRole::User, "first question"),
            turn(TurnRole::Assistant, "first answer"),
        ];
        let messages = build_messages(&[], &history, "follow-up");
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[1].role, "user");
        assert_eq!(messages[1].content, "first question");
        assert_eq!(messages[2].role, "assistant");
        assert_eq!(messages[3].content, "follow-up");
    }

    #[test]
    fn assembly_is_deterministic() {
        let chunks = vec![chunk("d", 0, "text")];
        let a = build_messages(&chunks, &[], "q");
        let b = build_messages(&chunks, &[], "q");
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.content, y.content);
        }
    }
}
