use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::EntryError;

/// Extraction strategy chosen at submission time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionMode {
  /// Text layer extraction with poppler's `pdftotext`.
  #[serde(alias = "pypdf")]
  Local,
  /// Page-by-page transcription by the Gemini model.
  Gemini,
}

impl ExtractionMode {
  pub const SUPPORTED: [&'static str; 3] = ["local", "pypdf", "gemini"];

  pub fn as_str(&self) -> &'static str {
    match self {
      ExtractionMode::Local => "local",
      ExtractionMode::Gemini => "gemini",
    }
  }
}

impl FromStr for ExtractionMode {
  type Err = EntryError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "local" | "pypdf" => Ok(ExtractionMode::Local),
      "gemini" => Ok(ExtractionMode::Gemini),
      other => Err(EntryError::UnknownMode(other.to_string())),
    }
  }
}

impl fmt::Display for ExtractionMode {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// One submitted file as carried on the work log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileData {
  pub filename: String,
  /// Base64 of the raw bytes.
  pub content: String,
}

impl FileData {
  pub fn encode(filename: &str, bytes: &[u8]) -> Self {
    Self {
      filename: filename.to_string(),
      content: STANDARD.encode(bytes),
    }
  }

  pub fn decode(&self) -> Result<Vec<u8>, base64::DecodeError> {
    STANDARD.decode(self.content.as_bytes())
  }
}

/// Log payload: `{task_id, mode, files_data}` where `files_data` is a JSON
/// list of [`FileData`].
#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
  pub task_id: String,
  pub mode: String,
  pub files_data: String,
}

impl QueueEntry {
  pub fn new(task_id: &Uuid, mode: ExtractionMode, files: &[FileData]) -> Result<Self, serde_json::Error> {
    Ok(Self {
      task_id: task_id.to_string(),
      mode: mode.as_str().to_string(),
      files_data: serde_json::to_string(files)?,
    })
  }

  pub fn fields(&self) -> Vec<(&'static str, String)> {
    vec![
      ("task_id", self.task_id.clone()),
      ("mode", self.mode.clone()),
      ("files_data", self.files_data.clone()),
    ]
  }

  pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self, EntryError> {
    let field = |name: &'static str| fields.get(name).cloned().ok_or(EntryError::MissingField(name));
    Ok(Self {
      task_id: field("task_id")?,
      mode: field("mode")?,
      files_data: field("files_data")?,
    })
  }

  pub fn into_task(self) -> Result<Task, EntryError> {
    let mode = self.mode.parse()?;
    let files: Vec<FileData> = serde_json::from_str(&self.files_data)?;
    Ok(Task {
      id: self.task_id,
      mode,
      files,
    })
  }
}

/// A decoded task, owned by the worker that is running it.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
  pub id: String,
  pub mode: ExtractionMode,
  pub files: Vec<FileData>,
}

impl Task {
  pub fn total(&self) -> usize {
    self.files.len()
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskState {
  Pending,
  Processing,
  Success,
  Failure,
}

impl TaskState {
  pub fn is_terminal(&self) -> bool {
    matches!(self, TaskState::Success | TaskState::Failure)
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      TaskState::Pending => "PENDING",
      TaskState::Processing => "PROCESSING",
      TaskState::Success => "SUCCESS",
      TaskState::Failure => "FAILURE",
    }
  }

  /// Position in the lifecycle; a snapshot never moves to a lower rank.
  pub fn rank(&self) -> u8 {
    match self {
      TaskState::Pending => 0,
      TaskState::Processing => 1,
      TaskState::Success | TaskState::Failure => 2,
    }
  }
}

impl fmt::Display for TaskState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum FileRecord {
  Success {
    filename: String,
    md_filename: String,
    size: usize,
  },
  Failed {
    filename: String,
    error: String,
  },
}

impl FileRecord {
  pub fn filename(&self) -> &str {
    match self {
      FileRecord::Success { filename, .. } | FileRecord::Failed { filename, .. } => filename,
    }
  }

  pub fn is_success(&self) -> bool {
    matches!(self, FileRecord::Success { .. })
  }
}

/// The single, overwritten record a poller sees for a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "UPPERCASE")]
pub enum StatusSnapshot {
  Pending {
    task_id: String,
    total: usize,
    current: usize,
    message: String,
  },
  Processing {
    task_id: String,
    total: usize,
    current: usize,
    message: String,
    #[serde(default)]
    processed: Vec<FileRecord>,
    #[serde(default)]
    failed: Vec<FileRecord>,
  },
  Success {
    task_id: String,
    total: usize,
    processed: usize,
    failed: usize,
    files: Vec<FileRecord>,
    #[serde(default)]
    errors: Vec<FileRecord>,
    mode: ExtractionMode,
    message: String,
  },
  Failure {
    task_id: String,
    error: String,
    message: String,
  },
}

impl StatusSnapshot {
  pub fn pending(task_id: &str, total: usize) -> Self {
    StatusSnapshot::Pending {
      task_id: task_id.to_string(),
      total,
      current: 0,
      message: "Task queued for processing".into(),
    }
  }

  pub fn success(task_id: &str, mode: ExtractionMode, files: Vec<FileRecord>, errors: Vec<FileRecord>) -> Self {
    StatusSnapshot::Success {
      task_id: task_id.to_string(),
      total: files.len() + errors.len(),
      processed: files.len(),
      failed: errors.len(),
      files,
      errors,
      mode,
      message: "Processing complete".into(),
    }
  }

  pub fn failure(task_id: &str, error: impl fmt::Display) -> Self {
    StatusSnapshot::Failure {
      task_id: task_id.to_string(),
      error: error.to_string(),
      message: format!("Task failed: {}", error),
    }
  }

  pub fn state(&self) -> TaskState {
    match self {
      StatusSnapshot::Pending { .. } => TaskState::Pending,
      StatusSnapshot::Processing { .. } => TaskState::Processing,
      StatusSnapshot::Success { .. } => TaskState::Success,
      StatusSnapshot::Failure { .. } => TaskState::Failure,
    }
  }

  pub fn is_terminal(&self) -> bool {
    self.state().is_terminal()
  }

  pub fn task_id(&self) -> &str {
    match self {
      StatusSnapshot::Pending { task_id, .. }
      | StatusSnapshot::Processing { task_id, .. }
      | StatusSnapshot::Success { task_id, .. }
      | StatusSnapshot::Failure { task_id, .. } => task_id,
    }
  }

  pub fn message(&self) -> &str {
    match self {
      StatusSnapshot::Pending { message, .. }
      | StatusSnapshot::Processing { message, .. }
      | StatusSnapshot::Success { message, .. }
      | StatusSnapshot::Failure { message, .. } => message,
    }
  }
}

/// `report.pdf` -> `report.md`; names without an extension get `.md` appended.
pub fn markdown_filename(filename: &str) -> String {
  match filename.rsplit_once('.') {
    Some((stem, _)) => format!("{}.md", stem),
    None => format!("{}.md", filename),
  }
}
