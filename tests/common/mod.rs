#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use docsum::errors::{BrokerError, GenerationError, ProcessingError};
use docsum::extraction::{Extractor, ExtractorRegistry};
use docsum::gemini::TextGenerator;
use docsum::memory::{MemoryStore, MemoryWorkLog};
use docsum::messaging::WorkLog;
use docsum::models::{ExtractionMode, StatusSnapshot};
use docsum::status_store::{KeyValueStore, StatusStore, status_key};
use docsum::submitter::{Submitter, UploadedFile};
use docsum::summarizer::ChunkedSummarizer;
use docsum::worker_loop::{Worker, WorkerConfig};
use docsum::worker_processing::DocumentProcessor;
use tokio::sync::Mutex;

pub const SUMMARY: &str = "A short summary.";

pub fn pdf(name: &str) -> UploadedFile {
  UploadedFile {
    filename: name.into(),
    content: format!("%PDF-1.4 {}", name).into_bytes(),
  }
}

pub fn extracted_text(filename: &str) -> String {
  format!("# {}\n\n## Page 1\n\nsome words about {}\n\n", filename, filename)
}

/// Extractor that renders canned markdown, optionally failing or stalling.
pub struct FakeExtractor {
  mode: ExtractionMode,
  fail_for: Option<String>,
  delay: Duration,
  pub calls: AtomicUsize,
}

impl FakeExtractor {
  pub fn new(mode: ExtractionMode) -> Self {
    Self {
      mode,
      fail_for: None,
      delay: Duration::ZERO,
      calls: AtomicUsize::new(0),
    }
  }

  pub fn failing_for(mut self, filename: &str) -> Self {
    self.fail_for = Some(filename.to_string());
    self
  }

  pub fn with_delay(mut self, delay: Duration) -> Self {
    self.delay = delay;
    self
  }
}

#[async_trait]
impl Extractor for FakeExtractor {
  fn mode(&self) -> ExtractionMode {
    self.mode
  }

  async fn extract(&self, _data: &[u8], filename: &str) -> Result<String, ProcessingError> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    if !self.delay.is_zero() {
      tokio::time::sleep(self.delay).await;
    }
    if self.fail_for.as_deref() == Some(filename) {
      return Err(ProcessingError::Extraction(format!("File '{}' is corrupt", filename)));
    }
    Ok(extracted_text(filename))
  }
}

pub struct FixedGenerator;

#[async_trait]
impl TextGenerator for FixedGenerator {
  async fn generate(&self, _prompt: &str) -> Result<String, GenerationError> {
    Ok(format!("{}\n", SUMMARY))
  }
}

/// Wraps a [`MemoryStore`] and keeps every status body that was written.
pub struct RecordingStore {
  inner: MemoryStore,
  pub status_writes: Mutex<Vec<StatusSnapshot>>,
}

impl RecordingStore {
  pub fn new() -> Self {
    Self {
      inner: MemoryStore::new(),
      status_writes: Mutex::new(Vec::new()),
    }
  }

  async fn record(&self, key: &str, value: &str) {
    if key.ends_with(":status")
      && let Ok(snapshot) = serde_json::from_str(value)
    {
      self.status_writes.lock().await.push(snapshot);
    }
  }

  pub fn set_unavailable(&self, unavailable: bool) {
    self.inner.set_unavailable(unavailable);
  }
}

#[async_trait]
impl KeyValueStore for RecordingStore {
  async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), BrokerError> {
    self.inner.set_with_ttl(key, value, ttl).await?;
    self.record(key, value).await;
    Ok(())
  }

  async fn replace_keep_ttl(&self, key: &str, value: &str) -> Result<bool, BrokerError> {
    let written = self.inner.replace_keep_ttl(key, value).await?;
    if written {
      self.record(key, value).await;
    }
    Ok(written)
  }

  async fn get(&self, key: &str) -> Result<Option<String>, BrokerError> {
    self.inner.get(key).await
  }

  async fn remaining_ttl(&self, key: &str) -> Result<Option<Duration>, BrokerError> {
    self.inner.remaining_ttl(key).await
  }

  async fn ping(&self) -> Result<(), BrokerError> {
    self.inner.ping().await
  }
}

pub fn worker_config(consumer: &str) -> WorkerConfig {
  WorkerConfig {
    consumer: consumer.to_string(),
    reclaim_idle: Duration::from_secs(60),
    read_block: Duration::from_millis(100),
    reclaim_batch: 10,
    error_backoff: Duration::from_secs(1),
  }
}

/// Submitter and worker sharing in-memory backends.
pub struct Harness {
  pub log: Arc<MemoryWorkLog>,
  pub kv: Arc<RecordingStore>,
  pub status: Arc<StatusStore>,
  pub extractor: Arc<FakeExtractor>,
  pub submitter: Submitter,
  pub processor: Arc<DocumentProcessor>,
  pub worker: Arc<Worker>,
}

impl Harness {
  pub async fn new(extractor: FakeExtractor, ttl: Duration) -> Self {
    let log = Arc::new(MemoryWorkLog::new());
    let kv = Arc::new(RecordingStore::new());
    let status = Arc::new(StatusStore::new(kv.clone(), ttl));
    let extractor = Arc::new(extractor);

    let mut registry = ExtractorRegistry::new();
    registry.register(extractor.clone());
    let summarizer = Arc::new(ChunkedSummarizer::new(Arc::new(FixedGenerator), 5000));
    let processor = Arc::new(DocumentProcessor::new(Arc::new(registry), summarizer, status.clone()));

    let worker = Arc::new(Worker::new(worker_config("worker_1"), log.clone(), status.clone(), processor.clone()));
    let submitter = Submitter::new(log.clone(), status.clone());
    log.ensure_group().await.expect("group");

    Self {
      log,
      kv,
      status,
      extractor,
      submitter,
      processor,
      worker,
    }
  }

  pub async fn local() -> Self {
    Self::new(FakeExtractor::new(ExtractionMode::Local), Duration::from_secs(3600)).await
  }

  /// Another consumer of the same log and stores.
  pub fn worker_named(&self, consumer: &str) -> Arc<Worker> {
    Arc::new(Worker::new(
      worker_config(consumer),
      self.log.clone(),
      self.status.clone(),
      self.processor.clone(),
    ))
  }

  pub async fn status_of(&self, task_id: &str) -> Option<StatusSnapshot> {
    self.status.get(task_id).await.expect("status read")
  }

  pub async fn has_status_key(&self, task_id: &str) -> bool {
    self.kv.get(&status_key(task_id)).await.expect("kv read").is_some()
  }
}
