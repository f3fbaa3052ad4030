use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};

use docqa::config::load_config;
use docqa::db;
use docqa::embedding::OpenAiEmbedder;
use docqa::ingest::{Ingestor, UploadMeta};
use docqa::migrate;
use docqa::retrieval::Retriever;
use docqa::server;

#[derive(Parser)]
#[command(name = "docqa", about = "Document Q&A service", version)]
struct Cli {
    /// Path to config file
    #[arg(long, global = true, default_value = "./config/docqa.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database and run migrations
    Init,
    /// Ingest a document from disk
    Ingest {
        /// Path to the file (.txt, .md, .pdf, .docx)
        path: PathBuf,
        /// Document title (defaults to the filename)
        #[arg(long)]
        title: Option<String>,
        #[arg(long, default_value = "general")]
        department: String,
        #[arg(long, default_value = "document")]
        content_type: String,
        #[arg(long, default_value = "cli")]
        uploader: String,
    },
    /// Search indexed chunks
    Search {
        query: String,
        #[arg(long, default_value_t = 5)]
        limit: i64,
    },
    /// Run the HTTP server
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&config).await?;
            migrate::run_migrations(&pool).await?;
            println!("Database initialized at {}", config.db.path.display());
        }
        Commands::Ingest {
            path,
            title,
            department,
            content_type,
            uploader,
        } => {
            let pool = db::connect(&config).await?;
            migrate::run_migrations(&pool).await?;

            let embedder = Arc::new(OpenAiEmbedder::new(&config.embedding));
            let retriever = Retriever::new(pool.clone(), embedder, &config.retrieval);
            let ingestor = Ingestor::new(
                pool,
                retriever,
                &config.chunking,
                &config.embedding,
                &config.ingest,
            );

            let filename = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.to_string())
                .ok_or_else(|| anyhow::anyhow!("invalid file path: {}", path.display()))?;
            let bytes = std::fs::read(&path)?;

            let meta = UploadMeta {
                title: title.unwrap_or_else(|| filename.clone()),
                department,
                content_type,
                uploaded_by: uploader,
            };

            let report = ingestor.ingest(&filename, &bytes, &meta).await?;
            println!(
                "Ingested {} as document {} ({} chunks indexed)",
                filename, report.document_id, report.chunks_indexed
            );
        }
        Commands::Search { query, limit } => {
            let pool = db::connect(&config).await?;
            migrate::run_migrations(&pool).await?;

            let embedder = Arc::new(OpenAiEmbedder::new(&config.embedding));
            let retriever = Retriever::new(pool, embedder, &config.retrieval);

            let results = retriever.search(&query, limit).await?;
            if results.is_empty() {
                println!("No results.");
            }
            for (i, chunk) in results.iter().enumerate() {
                println!(
                    "{}. [{:.3}] document {} chunk {}",
                    i + 1,
                    chunk.score,
                    chunk.document_id,
                    chunk.chunk_index
                );
                let preview: String = chunk.text.chars().take(160).collect();
                println!("   {}", preview.replace('\n', " "));
            }
        }
        Commands::Serve => {
            server::run_server(&config).await?;
        }
    }

    Ok(())
}
