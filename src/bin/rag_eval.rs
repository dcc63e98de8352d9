use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use kb_rag::eval::{
    evaluate_recommendations, evaluate_retrieval, load_json, write_summary, EvalQuestion,
    EvalSummary, UserProfile, DEFAULT_EVAL_QUERY,
};
use kb_rag::{RagEngine, Settings};

#[derive(Parser, Debug)]
#[command(name = "rag-eval")]
#[command(about = "Evaluate retrieval recall and recommendations on simulated data")]
struct Args {
    /// Settings file (defaults to ./rag.toml when present)
    #[arg(short, long, env = "RAG_CONFIG")]
    config: Option<PathBuf>,

    /// JSON array of {id, question, references}
    #[arg(long, default_value = "tests/simulated_data/test_questions.json")]
    questions: PathBuf,

    /// JSON array of {user_id, history: [{q, a, refs}]}
    #[arg(long, default_value = "tests/simulated_data/user_profiles.json")]
    profiles: PathBuf,

    /// Query used for profiles without history
    #[arg(long, default_value = DEFAULT_EVAL_QUERY)]
    default_query: String,

    /// Where to write the JSON summary (defaults to <data_dir>/metrics_summary.json)
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let settings = Settings::load(args.config.as_deref())?;

    let questions: Vec<EvalQuestion> = load_json(&args.questions)
        .with_context(|| format!("Failed to load {}", args.questions.display()))?;
    let profiles: Vec<UserProfile> = load_json(&args.profiles)
        .with_context(|| format!("Failed to load {}", args.profiles.display()))?;

    let engine = RagEngine::from_settings(&settings).await?;

    let rag = evaluate_retrieval(&engine, &questions, settings.retrieval.top_k).await;
    println!(
        "RAG Summary: Total={}, Failed={}, AvgRecall={:.2}%",
        rag.total_queries,
        rag.failed,
        rag.avg_recall * 100.0
    );

    let recs = evaluate_recommendations(
        &engine,
        &profiles,
        &args.default_query,
        settings.recommendation.top_k,
        settings.recommendation.alpha,
    )
    .await;
    println!(
        "Recs Summary: Users={}, Failed={}, AvgRecs={:.2}, AvgUnique={:.2}",
        recs.total_users, recs.failed, recs.avg_recs, recs.avg_unique
    );

    let output = args.output.unwrap_or_else(|| settings.metrics_summary_path());
    write_summary(&output, &EvalSummary { rag, recs }).await?;
    println!("Saved metrics summary to {}", output.display());

    Ok(())
}
