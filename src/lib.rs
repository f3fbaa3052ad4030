//! Retrieval-grounded document Q&A service.
//!
//! Employees upload company documents (text, Markdown, PDF, Word), which are
//! chunked, embedded, and indexed into SQLite. Chat sessions hold an
//! append-only turn log with gapless sequence numbers; each question is
//! answered by a hosted language model grounded on the most relevant chunks,
//! and every answer records citations back to the documents that informed it.

pub mod chunk;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod ingest;
pub mod llm;
pub mod migrate;
pub mod models;
pub mod orchestrator;
pub mod prompt;
pub mod retrieval;
pub mod server;
pub mod store;
