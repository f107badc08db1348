use thiserror::Error;

use crate::models::TaskState;

/// Failure talking to the work log or the status store.
#[derive(Debug, Error)]
pub enum BrokerError {
  #[error("redis error: {0}")]
  Redis(#[from] redis::RedisError),
  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
  /// A stored status record exists but cannot be decoded.
  #[error("status record for task {task_id} is unreadable: {reason}")]
  CorruptRecord { task_id: String, reason: String },
  #[error("{0}")]
  Unavailable(String),
}

/// Errors surfaced to callers of the submission and retrieval operations.
#[derive(Debug, Error)]
pub enum ServiceError {
  #[error("{0}")]
  Validation(String),
  #[error("Invalid file: {filename}. {reason}")]
  InvalidFile { filename: String, reason: String },
  #[error("Service unavailable: {0}")]
  BrokerUnavailable(String),
  #[error("Task not found or expired")]
  TaskNotFound(String),
  #[error("Task is not complete yet. Current state: {state}")]
  TaskNotComplete { task_id: String, state: TaskState },
  #[error("Processed files have expired or were not found")]
  ArtifactsExpired(String),
  #[error("No processed files found")]
  NoProcessedFiles(String),
  #[error("Task status record is unreadable")]
  CorruptStatus { task_id: String, reason: String },
}

impl ServiceError {
  pub fn kind(&self) -> &'static str {
    match self {
      ServiceError::Validation(_) => "ValidationError",
      ServiceError::InvalidFile { .. } => "InvalidFileError",
      ServiceError::BrokerUnavailable(_) => "BrokerUnavailable",
      ServiceError::TaskNotFound(_) => "TaskNotFound",
      ServiceError::TaskNotComplete { .. } => "TaskNotComplete",
      ServiceError::ArtifactsExpired(_) => "ArtifactsExpired",
      ServiceError::NoProcessedFiles(_) => "ProcessingError",
      ServiceError::CorruptStatus { .. } => "CorruptStatus",
    }
  }

  pub fn is_retryable(&self) -> bool {
    matches!(self, ServiceError::BrokerUnavailable(_))
  }
}

impl From<BrokerError> for ServiceError {
  fn from(err: BrokerError) -> Self {
    match err {
      BrokerError::CorruptRecord { task_id, reason } => ServiceError::CorruptStatus { task_id, reason },
      other => ServiceError::BrokerUnavailable(other.to_string()),
    }
  }
}

/// A log entry that cannot be turned into a task.
#[derive(Debug, Error)]
pub enum EntryError {
  #[error("log entry is missing field `{0}`")]
  MissingField(&'static str),
  #[error("unsupported mode `{0}`")]
  UnknownMode(String),
  #[error("malformed files_data: {0}")]
  Files(#[from] serde_json::Error),
}

/// Failure of one file inside a task. Never escapes the file boundary.
#[derive(Debug, Error)]
pub enum ProcessingError {
  #[error("invalid base64 content: {0}")]
  Decode(#[from] base64::DecodeError),
  #[error("{0}")]
  Extraction(String),
  #[error("failed to store artifact: {0}")]
  Storage(#[from] BrokerError),
}

/// Failure of the text generation capability.
#[derive(Debug, Error)]
pub enum GenerationError {
  #[error("request failed: {0}")]
  Request(#[from] reqwest::Error),
  #[error("model returned {status}: {body}")]
  Status { status: u16, body: String },
  #[error("model returned no text")]
  Empty,
  #[error("{0}")]
  Unavailable(String),
}

impl From<GenerationError> for ProcessingError {
  fn from(err: GenerationError) -> Self {
    ProcessingError::Extraction(err.to_string())
  }
}
