use anyhow::Result;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use kb_rag::config::IndexBackend;
use kb_rag::{RagEngine, Settings};

#[derive(Parser, Debug)]
#[command(name = "rag-indexer")]
#[command(about = "Build the knowledge base vector index")]
struct Args {
    /// Settings file (defaults to ./rag.toml when present)
    #[arg(short, long, env = "RAG_CONFIG")]
    config: Option<PathBuf>,

    /// Directory of markdown documents to index
    #[arg(short, long)]
    dir: Option<PathBuf>,

    /// Directory for the cache, index and document embeddings
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Use Qdrant at this URL instead of the configured backend
    #[arg(long, env = "QDRANT_URL")]
    qdrant_url: Option<String>,

    /// Maximum chunk size in characters
    #[arg(long)]
    chunk_size: Option<usize>,

    /// Overlap between chunks in characters
    #[arg(long)]
    chunk_overlap: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let args = Args::parse();
    let mut settings = Settings::load(args.config.as_deref())?;
    if let Some(dir) = args.dir {
        settings.paths.kb_dir = dir;
    }
    if let Some(data_dir) = args.data_dir {
        settings.paths.data_dir = data_dir;
    }
    if let Some(url) = args.qdrant_url {
        settings.index.backend = IndexBackend::Qdrant;
        settings.index.qdrant_url = url;
    }
    let chunk_size = args.chunk_size.unwrap_or(settings.index.chunk_size);
    let chunk_overlap = args.chunk_overlap.unwrap_or(settings.index.chunk_overlap);

    if !settings.paths.kb_dir.exists() {
        anyhow::bail!("Directory does not exist: {}", settings.paths.kb_dir.display());
    }

    println!("Initializing embedding providers...");
    let engine = RagEngine::from_settings(&settings).await?;

    println!("Indexing {}", settings.paths.kb_dir.display());
    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {msg}")?);
    pb.set_message("chunking and embedding documents");
    pb.enable_steady_tick(Duration::from_millis(120));

    let result = engine.build_index(chunk_size, chunk_overlap).await;
    pb.finish_and_clear();
    let report = result?;

    println!("\nIndexing complete!");
    println!("  Documents:       {}", report.documents);
    println!("  Total chunks:    {}", report.chunks);
    println!("  Chunking:        {} / {} overlap", chunk_size, chunk_overlap);
    println!("  Provider:        {} ({})", report.provider, report.model);
    println!("  Dimension:       {}", report.dimension);
    if report.used_fallback {
        println!("  Note:            primary provider unavailable, fallback model used");
    }
    println!("  Backend:         {:?}", settings.index.backend);
    let cache = engine.indexer().embedders().for_model(&report.model)?.cache().stats().await?;
    println!("  Cached vectors:  {} ({})", cache.entries, cache.dir.display());
    println!("  Elapsed:         {} ms", report.elapsed_ms);

    Ok(())
}
