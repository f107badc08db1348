use std::sync::Arc;

use tracing::{error, info, warn};

use crate::errors::{BrokerError, ProcessingError};
use crate::extraction::ExtractorRegistry;
use crate::models::{FileData, FileRecord, StatusSnapshot, Task, markdown_filename};
use crate::status_store::StatusStore;
use crate::summarizer::ChunkedSummarizer;

/// Outcomes accumulated while a task's files are processed.
#[derive(Debug, Default, Clone)]
pub struct FileProgress {
  pub processed: Vec<FileRecord>,
  pub failed: Vec<FileRecord>,
}

impl FileProgress {
  pub fn record(&mut self, filename: &str, outcome: Result<FileRecord, ProcessingError>) {
    match outcome {
      Ok(record) => self.processed.push(record),
      Err(e) => {
        error!(filename, error = %e, "Error processing file");
        self.failed.push(FileRecord::Failed {
          filename: filename.to_string(),
          error: e.to_string(),
        });
      }
    }
  }

  pub fn snapshot(&self, task: &Task, current: usize, message: String) -> StatusSnapshot {
    StatusSnapshot::Processing {
      task_id: task.id.clone(),
      total: task.total(),
      current,
      message,
      processed: self.processed.clone(),
      failed: self.failed.clone(),
    }
  }

  pub fn finish(self, task: &Task) -> StatusSnapshot {
    StatusSnapshot::success(&task.id, task.mode, self.processed, self.failed)
  }
}

struct Extracted {
  md_filename: String,
  markdown: String,
}

/// Runs every file of a task through extraction, summarization and artifact
/// storage, one file at a time.
pub struct DocumentProcessor {
  extractors: Arc<ExtractorRegistry>,
  summarizer: Arc<ChunkedSummarizer>,
  status: Arc<StatusStore>,
}

impl DocumentProcessor {
  pub fn new(extractors: Arc<ExtractorRegistry>, summarizer: Arc<ChunkedSummarizer>, status: Arc<StatusStore>) -> Self {
    Self {
      extractors,
      summarizer,
      status,
    }
  }

  /// Drive a task to SUCCESS. File failures are folded into the snapshot; an
  /// `Err` means a status write failed and the task did not reach a terminal state.
  pub async fn process_task(&self, task: &Task) -> Result<StatusSnapshot, BrokerError> {
    let total = task.total();
    info!(task_id = %task.id, total, mode = %task.mode, "Processing task");

    let mut progress = FileProgress::default();
    self.publish(task, progress.snapshot(task, 0, "Starting processing...".into())).await?;

    for (idx, file) in task.files.iter().enumerate() {
      let current = idx + 1;
      self
        .publish(task, progress.snapshot(task, current, format!("Processing {}...", file.filename)))
        .await?;
      info!(task_id = %task.id, "Processing file {}/{}: {}", current, total, file.filename);

      let outcome = match self.extract_file(task, file).await {
        Ok(extracted) => {
          self
            .publish(task, progress.snapshot(task, current, format!("Summarizing {}...", file.filename)))
            .await?;
          self.summarize_file(task, file, extracted).await
        }
        Err(e) => Err(e),
      };
      progress.record(&file.filename, outcome);

      self
        .publish(task, progress.snapshot(task, current, format!("Finished {}", file.filename)))
        .await?;
    }

    let snapshot = progress.finish(task);
    self.publish(task, snapshot.clone()).await?;
    info!(task_id = %task.id, "Task completed successfully");
    Ok(snapshot)
  }

  async fn extract_file(&self, task: &Task, file: &FileData) -> Result<Extracted, ProcessingError> {
    let content = file.decode()?;
    let markdown = self.extractors.extract(task.mode, &content, &file.filename).await?;
    let md_filename = markdown_filename(&file.filename);
    self.status.put_markdown(&task.id, &md_filename, &markdown).await?;
    Ok(Extracted { md_filename, markdown })
  }

  async fn summarize_file(&self, task: &Task, file: &FileData, extracted: Extracted) -> Result<FileRecord, ProcessingError> {
    info!(task_id = %task.id, filename = %file.filename, "Generating summary");
    let summary = self.summarizer.summarize(&extracted.markdown, &file.filename).await;
    self.status.put_summary(&task.id, &file.filename, &summary).await?;
    info!(task_id = %task.id, filename = %file.filename, "Successfully processed and summarized");
    Ok(FileRecord::Success {
      filename: file.filename.clone(),
      md_filename: extracted.md_filename,
      size: extracted.markdown.chars().count(),
    })
  }

  async fn publish(&self, task: &Task, snapshot: StatusSnapshot) -> Result<(), BrokerError> {
    if !self.status.update(&snapshot).await? {
      warn!(
        task_id = %task.id,
        state = %snapshot.state(),
        "Status record missing (expired or never written); progress is not visible to pollers"
      );
    }
    Ok(())
  }
}
