use std::sync::{Arc, LazyLock};

use regex::Regex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::errors::ServiceError;
use crate::messaging::WorkLog;
use crate::models::{ExtractionMode, FileData, QueueEntry, StatusSnapshot};
use crate::status_store::StatusStore;

static ACCEPTED_NAME: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)^[^/\\]+\.pdf$").expect("static pattern"));

#[derive(Debug, Clone)]
pub struct UploadedFile {
  pub filename: String,
  pub content: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct Submission {
  pub task_id: Uuid,
  pub entry_id: String,
  pub mode: ExtractionMode,
  pub filenames: Vec<String>,
}

pub struct Submitter {
  log: Arc<dyn WorkLog>,
  status: Arc<StatusStore>,
}

impl Submitter {
  pub fn new(log: Arc<dyn WorkLog>, status: Arc<StatusStore>) -> Self {
    Self { log, status }
  }

  pub fn validate(files: &[UploadedFile], mode: &str) -> Result<ExtractionMode, ServiceError> {
    let mode: ExtractionMode = mode.parse().map_err(|_| {
      ServiceError::Validation(format!(
        "Mode must be one of {}",
        ExtractionMode::SUPPORTED.join(", ")
      ))
    })?;
    if files.is_empty() {
      return Err(ServiceError::Validation(
        "No files provided. Please upload at least one PDF file.".into(),
      ));
    }
    if let Some(file) = files.iter().find(|f| !ACCEPTED_NAME.is_match(&f.filename)) {
      return Err(ServiceError::InvalidFile {
        filename: file.filename.clone(),
        reason: "Only PDF files are accepted".into(),
      });
    }
    Ok(mode)
  }

  /// Queue a batch. The log entry is written before the PENDING status; if the
  /// second write fails the entry is already queued and the caller still sees
  /// `BrokerUnavailable`.
  pub async fn submit(&self, files: Vec<UploadedFile>, mode: &str) -> Result<Submission, ServiceError> {
    let mode = Self::validate(&files, mode).inspect_err(|e| warn!("Rejected submission: {}", e))?;

    let task_id = Uuid::new_v4();
    let total = files.len();
    let total_bytes: usize = files.iter().map(|f| f.content.len()).sum();
    let encoded: Vec<FileData> = files
      .iter()
      .map(|f| FileData::encode(&f.filename, &f.content))
      .collect();
    debug!(%task_id, total_bytes, "Encoded upload");

    let entry = QueueEntry::new(&task_id, mode, &encoded)
      .map_err(|e| ServiceError::Validation(format!("Unable to encode files: {}", e)))?;
    let entry_id = self.log.append(&entry.fields()).await.map_err(|e| {
      error!(%task_id, error = %e, "Failed to append task to the work log");
      ServiceError::from(e)
    })?;
    info!(%task_id, entry_id = %entry_id, "Task added to the work log");

    self
      .status
      .initialize(&StatusSnapshot::pending(&task_id.to_string(), total))
      .await
      .map_err(|e| {
        error!(%task_id, entry_id = %entry_id, error = %e, "Task queued without a status record");
        ServiceError::from(e)
      })?;
    info!(%task_id, total, %mode, "Task initialized");

    Ok(Submission {
      task_id,
      entry_id,
      mode,
      filenames: files.into_iter().map(|f| f.filename).collect(),
    })
  }
}
