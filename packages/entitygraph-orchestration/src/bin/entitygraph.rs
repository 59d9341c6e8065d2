//! Entitygraph pipeline runner
//!
//! Replays pre-extracted candidates through the full six-phase pipeline and
//! prints the final status plus the aggregate snapshot.
//!
//! Usage:
//!   entitygraph run --corpus docs.json --candidates candidates.json
//!   entitygraph run --corpus docs.json --candidates candidates.json --database graph.db --force
//!   entitygraph config > entitygraph.yaml

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use entitygraph_orchestration::fixtures::{
    CountingMaterializer, FixtureExtractor, StaticContentSource,
};
use entitygraph_orchestration::telemetry::init_tracing;
use entitygraph_orchestration::{
    Document, ExtractedCandidate, InMemoryTaskQueue, PipelineOrchestrator, PipelineServices,
    PipelineSettings, PropagationEngine, QueueWorker, RunConfig,
};
use entitygraph_storage::{
    CanonicalStore, DocumentId, InMemoryCanonicalStore, InMemoryKeyValueStore, KeyValueStore,
    MokaTtlCache, SqliteCanonicalStore,
};
use serde_json::json;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "entitygraph")]
#[command(about = "Resumable entity extraction pipeline", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline over a corpus with recorded extraction results
    Run {
        /// JSON array of documents
        #[arg(long)]
        corpus: PathBuf,

        /// JSON object mapping document id to extracted candidates
        #[arg(long)]
        candidates: PathBuf,

        /// YAML settings file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// SQLite database path (in-memory store when omitted)
        #[arg(short, long)]
        database: Option<PathBuf>,

        /// Re-extract documents that were already extracted
        #[arg(long)]
        force: bool,

        /// Items per batch for the fixed-size phases
        #[arg(long)]
        batch_size: Option<usize>,

        /// Only process documents of this content type
        #[arg(long)]
        content_type: Option<String>,
    },

    /// Print the default settings as YAML
    Config,
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))
}

fn open_stores(
    database: Option<&Path>,
) -> Result<(Arc<dyn CanonicalStore>, Arc<dyn KeyValueStore>)> {
    match database {
        Some(path) => {
            let store = SqliteCanonicalStore::open(path)
                .with_context(|| format!("failed to open {}", path.display()))?;
            let kv = store.kv_store();
            Ok((Arc::new(store), Arc::new(kv)))
        }
        None => Ok((
            Arc::new(InMemoryCanonicalStore::new()),
            Arc::new(InMemoryKeyValueStore::new()),
        )),
    }
}

#[allow(clippy::too_many_arguments)]
async fn run(
    corpus: PathBuf,
    candidates: PathBuf,
    config: Option<PathBuf>,
    database: Option<PathBuf>,
    force: bool,
    batch_size: Option<usize>,
    content_type: Option<String>,
) -> Result<()> {
    let settings = match config {
        Some(path) => PipelineSettings::from_yaml(&path)
            .with_context(|| format!("invalid settings in {}", path.display()))?,
        None => PipelineSettings::default(),
    };

    let documents: Vec<Document> = read_json(&corpus)?;
    let candidates: HashMap<DocumentId, Vec<ExtractedCandidate>> = read_json(&candidates)?;
    info!(
        "Loaded {} documents, candidates for {}",
        documents.len(),
        candidates.len()
    );

    let source = StaticContentSource::new(documents);
    let extractor =
        FixtureExtractor::for_corpus(&source, settings.preparation.max_content_length, candidates);
    let materializer = Arc::new(CountingMaterializer::new());
    let (store, kv) = open_stores(database.as_deref())?;

    let retry = settings.queue.retry.clone();
    let services = Arc::new(
        PipelineServices::new(
            store,
            kv,
            Arc::new(MokaTtlCache::default()),
            Arc::new(source),
            Arc::new(extractor),
            materializer.clone(),
        )
        .with_settings(settings),
    );

    let queue = Arc::new(InMemoryTaskQueue::new());
    let orchestrator = Arc::new(PipelineOrchestrator::new(services.clone(), queue.clone()));
    let propagation = Arc::new(PropagationEngine::new(services, queue.clone()));
    let mut worker = QueueWorker::new(queue, retry);
    orchestrator.register_jobs(&mut worker);
    propagation.register_jobs(&mut worker);

    let mut run_config = RunConfig::new("cli").with_force(force);
    if let Some(size) = batch_size {
        run_config = run_config.with_batch_size(size);
    }
    if let Some(content_type) = content_type {
        run_config = run_config.with_content_type(content_type);
    }
    orchestrator.start(run_config).await?;

    let stats = worker.run_until_idle().await?;

    let output = json!({
        "status": orchestrator.status().await?,
        "snapshot": orchestrator.aggregate_snapshot().await?,
        "worker": stats,
        "regenerated_documents": materializer.total_regenerations(),
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("entitygraph=info,entitygraph_orchestration=info,entitygraph_storage=warn");
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            corpus,
            candidates,
            config,
            database,
            force,
            batch_size,
            content_type,
        } => run(corpus, candidates, config, database, force, batch_size, content_type).await,
        Commands::Config => {
            print!("{}", PipelineSettings::default().to_yaml()?);
            Ok(())
        }
    }
}
