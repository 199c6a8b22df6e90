//! Casetrace Worker
//!
//! Wires the pipeline processors to their named queues:
//! 1. Loads configuration and connects the database, job store and providers
//! 2. Registers the repeating case tick
//! 3. Runs the scheduler plus one worker per queue
//! 4. Drains in-flight jobs on ctrl-c

use casetrace_common::config::AppConfig;
use casetrace_common::db::DbPool;
use casetrace_common::embeddings::create_embedder;
use casetrace_common::llm::OpenAiExtractor;
use casetrace_common::metrics::register_metrics;
use casetrace_common::ocr::{AnalysisClient, PageOcrEngine, TesseractEngine, TextractClient};
use casetrace_common::queue::{
    JobProcessor, JobStore, MemoryJobStore, RedisJobStore, Scheduler, Worker, WorkerConfig,
    QUEUE_CASE_TICK, QUEUE_DOCUMENT_MERGE, QUEUE_DOCUMENT_SPLIT, QUEUE_OCR_POLL,
    QUEUE_PAGE_EMBED, QUEUE_PAGE_EXTRACT, QUEUE_PAGE_STRUCTURE,
};
use casetrace_common::{BundleExtractor, Repository, VERSION};
use casetrace_pipeline::merge::MergeProcessor;
use casetrace_pipeline::ocr_poller::OcrPollProcessor;
use casetrace_pipeline::orchestrator::{register_case_tick, CaseTickProcessor};
use casetrace_pipeline::page_extractor::PageExtractProcessor;
use casetrace_pipeline::splitter::SplitProcessor;
use casetrace_pipeline::structuring::{EmbedProcessor, StructureProcessor};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(true)
        .json()
        .init();

    info!("Starting Casetrace Worker v{}", VERSION);

    let config = Arc::new(AppConfig::load().map_err(|e| {
        tracing::error!(error = %e, "Failed to load configuration");
        anyhow::anyhow!(e)
    })?);

    // Metrics recorder (scraped out-of-band)
    let _metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install metrics recorder: {}", e))?;
    register_metrics();

    info!("Connecting to database...");
    let db = DbPool::new(&config.database).await?;
    let repository = Repository::new(db);

    let store: Arc<dyn JobStore> = match config.queue.backend.as_str() {
        "memory" => {
            info!("Using in-memory job store");
            Arc::new(MemoryJobStore::new())
        }
        _ => {
            info!(url = %config.queue.redis_url, "Connecting to Redis job store...");
            Arc::new(RedisJobStore::connect(&config.queue.redis_url, &config.queue.key_prefix).await?)
        }
    };

    // Providers
    let embedder = create_embedder(&config.embedding)?;
    info!(
        model = %embedder.model_name(),
        dimension = embedder.dimension(),
        "Embedder initialized"
    );

    let extractor: Arc<dyn BundleExtractor> = Arc::new(OpenAiExtractor::new(&config.extraction)?);
    info!(model = %extractor.model_name(), "Structured extractor initialized");

    let local_ocr: Option<Arc<dyn PageOcrEngine>> = if config.ocr.local_enabled {
        info!(command = %config.ocr.tesseract_cmd, "Local OCR engine enabled");
        Some(Arc::new(TesseractEngine::new(&config.ocr)))
    } else {
        info!("Local OCR engine disabled, cloud analysis is the only fallback");
        None
    };

    let analysis: Arc<dyn AnalysisClient> = Arc::new(TextractClient::from_env(&config.ocr).await?);

    // The repeating "process next pending case" tick
    register_case_tick(&store, config.case_tick_interval()).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = Vec::new();

    // Scheduler
    let scheduler = Scheduler::new(
        store.clone(),
        Duration::from_secs(config.queue.scheduler_poll_secs),
    );
    handles.push(tokio::spawn(scheduler.run(shutdown_rx.clone())));

    // One worker per named queue
    let bindings: Vec<(&str, Arc<dyn JobProcessor>)> = vec![
        (
            QUEUE_CASE_TICK,
            Arc::new(CaseTickProcessor::new(repository.clone(), store.clone())),
        ),
        (
            QUEUE_DOCUMENT_SPLIT,
            Arc::new(SplitProcessor::new(
                repository.clone(),
                store.clone(),
                config.pipeline.clone(),
            )),
        ),
        (
            QUEUE_PAGE_EXTRACT,
            Arc::new(PageExtractProcessor::new(
                repository.clone(),
                store.clone(),
                analysis.clone(),
                local_ocr.clone(),
                config.clone(),
            )),
        ),
        (
            QUEUE_OCR_POLL,
            Arc::new(OcrPollProcessor::new(
                repository.clone(),
                store.clone(),
                analysis.clone(),
                config.clone(),
            )),
        ),
        (
            QUEUE_PAGE_EMBED,
            Arc::new(EmbedProcessor::new(
                repository.clone(),
                store.clone(),
                embedder.clone(),
            )),
        ),
        (
            QUEUE_PAGE_STRUCTURE,
            Arc::new(StructureProcessor::new(
                repository.clone(),
                store.clone(),
                embedder.clone(),
                extractor.clone(),
                config.clone(),
            )),
        ),
        (
            QUEUE_DOCUMENT_MERGE,
            Arc::new(MergeProcessor::new(repository.clone())),
        ),
    ];

    for (queue, processor) in bindings {
        let worker = Arc::new(Worker::new(
            store.clone(),
            processor,
            WorkerConfig::for_queue(queue, &config.queue),
        ));
        handles.push(tokio::spawn(worker.run(shutdown_rx.clone())));
    }

    info!("All workers running, waiting for shutdown signal");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, draining workers...");
    shutdown_tx.send(true)?;

    for handle in handles {
        let _ = handle.await;
    }

    info!("Casetrace worker shut down");
    Ok(())
}
