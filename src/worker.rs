use std::sync::Arc;

use docsum::{
  config::Config,
  extraction::{ExtractorRegistry, GeminiExtractor, PdfTextExtractor},
  gemini::GeminiClient,
  logging,
  messaging::{RedisWorkLog, create_redis_connection},
  status_store::{RedisStore, StatusStore},
  summarizer::ChunkedSummarizer,
  worker_loop::Worker,
  worker_processing::DocumentProcessor,
};
use tokio::sync::watch;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  logging::init("info");
  let config = Config::from_env();
  info!(?config, "Starting worker");

  if config.gemini.api_key.is_empty() {
    warn!("GOOGLE_API_KEY is not set; summaries and gemini extraction will fail");
  }
  let gemini = Arc::new(GeminiClient::new(config.gemini.clone())?);

  let mut extractors = ExtractorRegistry::new();
  extractors.register(Arc::new(PdfTextExtractor::default()));
  extractors.register(Arc::new(GeminiExtractor::new(gemini.clone())));
  let extractors = Arc::new(extractors);
  let summarizer = Arc::new(ChunkedSummarizer::new(gemini, config.chunk_size));

  let (shutdown_tx, shutdown_rx) = watch::channel(false);
  let mut handles = Vec::with_capacity(config.worker_concurrency);
  for slot in 0..config.worker_concurrency {
    // Each slot blocks on its own connection.
    let conn = create_redis_connection(&config.redis_url).await?;
    let log = Arc::new(RedisWorkLog::new(conn.clone(), &config.stream_name, &config.consumer_group));
    let status = Arc::new(StatusStore::new(Arc::new(RedisStore::new(conn)), config.task_expiration));
    let processor = Arc::new(DocumentProcessor::new(extractors.clone(), summarizer.clone(), status.clone()));
    let worker = Worker::new(config.worker_config(slot), log, status, processor);
    let rx = shutdown_rx.clone();
    handles.push(tokio::spawn(async move { worker.run(rx).await }));
  }
  info!(slots = handles.len(), "Workers running");

  tokio::signal::ctrl_c().await?;
  info!("Shutdown requested; finishing in-flight tasks");
  let _ = shutdown_tx.send(true);
  for result in futures::future::join_all(handles).await {
    if let Err(e) = result {
      warn!(error = %e, "Worker task panicked");
    }
  }
  info!("All workers stopped");
  Ok(())
}
