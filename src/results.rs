use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::errors::ServiceError;
use crate::models::{FileRecord, StatusSnapshot};
use crate::status_store::StatusStore;

pub const SUMMARY_UNAVAILABLE: &str = "Summary not available";

/// Summaries of a completed task, keyed by original filename.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskArtifacts {
  pub summaries: BTreeMap<String, String>,
  pub files: Vec<FileRecord>,
}

/// Read side of the task lifecycle used by pollers.
#[derive(Clone)]
pub struct TaskResults {
  status: Arc<StatusStore>,
}

impl TaskResults {
  pub fn new(status: Arc<StatusStore>) -> Self {
    Self { status }
  }

  pub async fn get_status(&self, task_id: &str) -> Result<StatusSnapshot, ServiceError> {
    match self.status.get(task_id).await? {
      Some(snapshot) => {
        debug!(task_id, state = %snapshot.state(), "Status read");
        Ok(snapshot)
      }
      None => {
        warn!(task_id, "Task not found or expired");
        Err(ServiceError::TaskNotFound(task_id.to_string()))
      }
    }
  }

  pub async fn get_artifacts(&self, task_id: &str) -> Result<TaskArtifacts, ServiceError> {
    let files = self.completed_files(task_id).await?;
    let mut summaries = BTreeMap::new();
    for file in &files {
      let name = file.filename();
      let summary = match self.status.summary(task_id, name).await? {
        Some(summary) => summary,
        None => {
          warn!(task_id, filename = name, "Summary not available");
          SUMMARY_UNAVAILABLE.to_string()
        }
      };
      summaries.insert(name.to_string(), summary);
    }
    info!(task_id, count = summaries.len(), "Returning summaries");
    Ok(TaskArtifacts { summaries, files })
  }

  /// Converted text keyed by derived markdown filename.
  pub async fn get_markdown_artifacts(&self, task_id: &str) -> Result<BTreeMap<String, String>, ServiceError> {
    let files = self.completed_files(task_id).await?;
    let mut documents = BTreeMap::new();
    for file in &files {
      if let FileRecord::Success { md_filename, .. } = file
        && let Some(text) = self.status.markdown(task_id, md_filename).await?
      {
        documents.insert(md_filename.clone(), text);
      }
    }
    if documents.is_empty() {
      warn!(task_id, "Markdown artifacts expired or missing");
      return Err(ServiceError::ArtifactsExpired(task_id.to_string()));
    }
    Ok(documents)
  }

  async fn completed_files(&self, task_id: &str) -> Result<Vec<FileRecord>, ServiceError> {
    match self.get_status(task_id).await? {
      StatusSnapshot::Success { files, .. } if files.is_empty() => {
        Err(ServiceError::NoProcessedFiles(task_id.to_string()))
      }
      StatusSnapshot::Success { files, .. } => Ok(files),
      other => Err(ServiceError::TaskNotComplete {
        task_id: task_id.to_string(),
        state: other.state(),
      }),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::memory::MemoryStore;
  use crate::models::{ExtractionMode, TaskState};
  use std::time::Duration;

  fn results() -> (Arc<StatusStore>, TaskResults) {
    let status = Arc::new(StatusStore::new(Arc::new(MemoryStore::new()), Duration::from_secs(3600)));
    (status.clone(), TaskResults::new(status))
  }

  fn done(task_id: &str) -> StatusSnapshot {
    StatusSnapshot::success(
      task_id,
      ExtractionMode::Local,
      vec![
        FileRecord::Success { filename: "a.pdf".into(), md_filename: "a.md".into(), size: 3 },
        FileRecord::Success { filename: "b.pdf".into(), md_filename: "b.md".into(), size: 3 },
      ],
      vec![],
    )
  }

  #[tokio::test]
  async fn unknown_task_is_not_found() {
    let (_, results) = results();
    assert!(matches!(results.get_status("nope").await, Err(ServiceError::TaskNotFound(_))));
    assert!(matches!(results.get_artifacts("nope").await, Err(ServiceError::TaskNotFound(_))));
  }

  #[tokio::test]
  async fn pending_task_is_not_complete() {
    let (status, results) = results();
    status.initialize(&StatusSnapshot::pending("t1", 1)).await.unwrap();
    match results.get_artifacts("t1").await {
      Err(ServiceError::TaskNotComplete { state, .. }) => assert_eq!(state, TaskState::Pending),
      other => panic!("unexpected {:?}", other),
    }
    assert!(matches!(
      results.get_markdown_artifacts("t1").await,
      Err(ServiceError::TaskNotComplete { state: TaskState::Pending, .. })
    ));
  }

  #[tokio::test]
  async fn failed_task_is_not_complete() {
    let (status, results) = results();
    status.initialize(&StatusSnapshot::failure("t1", "bad entry")).await.unwrap();
    assert!(matches!(
      results.get_artifacts("t1").await,
      Err(ServiceError::TaskNotComplete { state: TaskState::Failure, .. })
    ));
  }

  #[tokio::test]
  async fn missing_summary_is_reported_inline() {
    let (status, results) = results();
    status.initialize(&done("t1")).await.unwrap();
    status.put_summary("t1", "a.pdf", "about a").await.unwrap();

    let artifacts = results.get_artifacts("t1").await.unwrap();
    assert_eq!(artifacts.summaries["a.pdf"], "about a");
    assert_eq!(artifacts.summaries["b.pdf"], SUMMARY_UNAVAILABLE);
    assert_eq!(artifacts.files.len(), 2);
  }

  #[tokio::test]
  async fn markdown_requires_stored_text() {
    let (status, results) = results();
    status.initialize(&done("t1")).await.unwrap();
    assert!(matches!(
      results.get_markdown_artifacts("t1").await,
      Err(ServiceError::ArtifactsExpired(_))
    ));

    status.put_markdown("t1", "b.md", "# b.pdf").await.unwrap();
    let docs = results.get_markdown_artifacts("t1").await.unwrap();
    assert_eq!(docs.len(), 1);
    assert_eq!(docs["b.md"], "# b.pdf");
  }

  #[tokio::test]
  async fn success_without_files() {
    let (status, results) = results();
    let snapshot = StatusSnapshot::success(
      "t1",
      ExtractionMode::Local,
      vec![],
      vec![FileRecord::Failed { filename: "a.pdf".into(), error: "x".into() }],
    );
    status.initialize(&snapshot).await.unwrap();
    assert!(matches!(results.get_artifacts("t1").await, Err(ServiceError::NoProcessedFiles(_))));
  }
}
