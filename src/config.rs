use std::env;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::worker_loop::WorkerConfig;

const DEFAULT_CORS_ORIGINS: &str = "http://localhost:5173,http://localhost:3000";

#[derive(Debug, Clone)]
pub struct Config {
  pub redis_url: String,
  pub stream_name: String,
  pub consumer_group: String,
  pub consumer_name: String,
  pub worker_concurrency: usize,
  /// Words per summarization call.
  pub chunk_size: usize,
  /// Lifetime of a task's status record and artifacts, counted from submission.
  pub task_expiration: Duration,
  pub reclaim_idle: Duration,
  pub read_block: Duration,
  pub reclaim_batch: usize,
  pub error_backoff: Duration,
  pub server_port: u16,
  /// Browser origins allowed to call the API.
  pub cors_origins: Vec<String>,
  pub gemini: GeminiConfig,
}

#[derive(Clone)]
pub struct GeminiConfig {
  pub api_key: String,
  pub model: String,
  pub base_url: String,
  pub timeout: Duration,
}

impl std::fmt::Debug for GeminiConfig {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("GeminiConfig")
      .field("api_key", &if self.api_key.is_empty() { "<unset>" } else { "<redacted>" })
      .field("model", &self.model)
      .field("base_url", &self.base_url)
      .field("timeout", &self.timeout)
      .finish()
  }
}

impl Default for GeminiConfig {
  fn default() -> Self {
    Self {
      api_key: String::new(),
      model: "gemini-2.0-flash".into(),
      base_url: "https://generativelanguage.googleapis.com/v1beta".into(),
      timeout: Duration::from_secs(120),
    }
  }
}

impl Default for Config {
  fn default() -> Self {
    Self {
      redis_url: "redis://localhost:6379/0".into(),
      stream_name: "pdf_processing_tasks".into(),
      consumer_group: "pdf_workers".into(),
      consumer_name: "worker_1".into(),
      worker_concurrency: 1,
      chunk_size: 5000,
      task_expiration: Duration::from_secs(3600),
      reclaim_idle: Duration::from_millis(60_000),
      read_block: Duration::from_millis(5_000),
      reclaim_batch: 10,
      error_backoff: Duration::from_millis(5_000),
      server_port: 8000,
      cors_origins: parse_origins(DEFAULT_CORS_ORIGINS),
      gemini: GeminiConfig::default(),
    }
  }
}

impl Config {
  pub fn from_env() -> Self {
    let defaults = Self::default();
    Self {
      redis_url: env::var("REDIS_URL").unwrap_or(defaults.redis_url),
      stream_name: env::var("STREAM_NAME").unwrap_or(defaults.stream_name),
      consumer_group: env::var("CONSUMER_GROUP").unwrap_or(defaults.consumer_group),
      consumer_name: env::var("WORKER_NAME").unwrap_or(defaults.consumer_name),
      worker_concurrency: parse_var("WORKER_CONCURRENCY", defaults.worker_concurrency).max(1),
      chunk_size: parse_var("CHUNK_SIZE", defaults.chunk_size).max(1),
      task_expiration: Duration::from_secs(parse_var("TASK_EXPIRATION", defaults.task_expiration.as_secs())),
      reclaim_idle: Duration::from_millis(parse_var("RECLAIM_IDLE_MS", 60_000)),
      read_block: Duration::from_millis(parse_var("READ_BLOCK_MS", 5_000)),
      reclaim_batch: parse_var("RECLAIM_BATCH", defaults.reclaim_batch).max(1),
      error_backoff: Duration::from_millis(parse_var("ERROR_BACKOFF_MS", 5_000)),
      server_port: parse_var("SERVER_PORT", defaults.server_port),
      cors_origins: env::var("CORS_ORIGINS")
        .ok()
        .map(|v| parse_origins(&v))
        .filter(|origins| !origins.is_empty())
        .unwrap_or(defaults.cors_origins),
      gemini: GeminiConfig {
        api_key: env::var("GOOGLE_API_KEY").unwrap_or_default(),
        model: env::var("GEMINI_MODEL").unwrap_or(defaults.gemini.model),
        base_url: env::var("GEMINI_BASE_URL").unwrap_or(defaults.gemini.base_url),
        timeout: defaults.gemini.timeout,
      },
    }
  }

  /// Worker settings for one slot of the worker pool. A single slot keeps the
  /// configured consumer name so restarts reclaim their own pending entries.
  pub fn worker_config(&self, slot: usize) -> WorkerConfig {
    let consumer = if self.worker_concurrency > 1 {
      format!("{}-{}", self.consumer_name, slot)
    } else {
      self.consumer_name.clone()
    };
    WorkerConfig {
      consumer,
      reclaim_idle: self.reclaim_idle,
      read_block: self.read_block,
      reclaim_batch: self.reclaim_batch,
      error_backoff: self.error_backoff,
    }
  }
}

/// Comma-separated `scheme://host[:port]` origins. Anything else is skipped.
pub fn parse_origins(raw: &str) -> Vec<String> {
  raw
    .split(',')
    .map(str::trim)
    .filter(|origin| !origin.is_empty())
    .filter_map(|origin| match origin.split_once("://") {
      Some((scheme, host)) if !scheme.is_empty() && !host.is_empty() && !host.contains('/') => {
        Some(origin.to_string())
      }
      _ => {
        warn!(origin, "Ignoring invalid CORS origin");
        None
      }
    })
    .collect()
}

fn parse_var<T: FromStr>(name: &str, default: T) -> T {
  env::var(name)
    .ok()
    .and_then(|v| v.trim().parse().ok())
    .unwrap_or(default)
}
