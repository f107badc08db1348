use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, instrument, warn};

use crate::errors::BrokerError;
use crate::messaging::{Delivery, WorkLog};
use crate::models::{QueueEntry, StatusSnapshot, TaskState};
use crate::status_store::StatusStore;
use crate::worker_processing::DocumentProcessor;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
  /// Consumer identity within the group.
  pub consumer: String,
  /// Entries pending at least this long are reclaimed.
  pub reclaim_idle: Duration,
  pub read_block: Duration,
  pub reclaim_batch: usize,
  pub error_backoff: Duration,
}

/// What happened to one delivered entry before it was acknowledged.
#[derive(Debug, Clone, PartialEq)]
pub enum EntryOutcome {
  /// The task ran to the given terminal state.
  Completed(TaskState),
  /// The task was already terminal; it was not run again.
  AlreadyTerminal(TaskState),
  /// The entry carried no task id and could not be reported on.
  Discarded,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Iteration {
  Idle { reclaimed: usize },
  Handled { reclaimed: usize, outcome: EntryOutcome },
  Stopped,
}

/// Consumes the work log: reclaim stale entries, then wait for a new one, run
/// it to a terminal state and only then acknowledge it.
pub struct Worker {
  config: WorkerConfig,
  log: Arc<dyn WorkLog>,
  status: Arc<StatusStore>,
  processor: Arc<DocumentProcessor>,
}

impl Worker {
  pub fn new(
    config: WorkerConfig,
    log: Arc<dyn WorkLog>,
    status: Arc<StatusStore>,
    processor: Arc<DocumentProcessor>,
  ) -> Self {
    Self {
      config,
      log,
      status,
      processor,
    }
  }

  pub fn consumer(&self) -> &str {
    &self.config.consumer
  }

  /// Loop until `shutdown` flips to true (or its sender is dropped). A task in
  /// flight is finished first; errors are logged and retried after a backoff.
  #[instrument(skip_all, fields(consumer = %self.config.consumer))]
  pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
    while let Err(e) = self.log.ensure_group().await {
      error!(error = %e, "Error creating consumer group");
      if self.backoff(&mut shutdown).await {
        return;
      }
    }
    info!("Worker started, waiting for tasks...");

    loop {
      if *shutdown.borrow() {
        break;
      }
      match self.run_iteration(&mut shutdown).await {
        Ok(Iteration::Stopped) => break,
        Ok(_) => {}
        Err(e) => {
          error!(error = %e, "Error in worker loop");
          if self.backoff(&mut shutdown).await {
            break;
          }
        }
      }
    }
    info!("Worker stopped");
  }

  /// One reclaim pass followed by one bounded wait for a new entry.
  pub async fn run_iteration(&self, shutdown: &mut watch::Receiver<bool>) -> Result<Iteration, BrokerError> {
    let reclaimed = self.reclaim_pass().await?;

    let delivery = tokio::select! {
      biased;
      _ = shutdown.changed() => return Ok(Iteration::Stopped),
      delivery = self.log.read_new(&self.config.consumer, self.config.read_block) => delivery?,
    };

    match delivery {
      Some(delivery) => {
        let outcome = self.handle(delivery).await?;
        Ok(Iteration::Handled { reclaimed, outcome })
      }
      None => Ok(Iteration::Idle { reclaimed }),
    }
  }

  /// Take over entries left unacknowledged past the idle threshold and run
  /// them exactly like new ones. Each entry is claimed right before it runs,
  /// so the rest of the batch stays claimable by other consumers meanwhile.
  /// Returns how many were handled.
  pub async fn reclaim_pass(&self) -> Result<usize, BrokerError> {
    let idle = self
      .log
      .idle_entries(self.config.reclaim_idle, self.config.reclaim_batch)
      .await?;
    let mut handled = 0;
    for entry in idle {
      let Some(delivery) = self
        .log
        .claim(&self.config.consumer, &entry, self.config.reclaim_idle)
        .await?
      else {
        continue;
      };
      info!(
        entry_id = %delivery.entry_id,
        previous_consumer = %entry.consumer,
        times_delivered = delivery.times_delivered,
        "Reclaiming pending entry"
      );
      self.handle(delivery).await?;
      handled += 1;
    }
    Ok(handled)
  }

  /// Run one entry and acknowledge it. On `Err` the entry stays pending.
  pub async fn handle(&self, delivery: Delivery) -> Result<EntryOutcome, BrokerError> {
    let outcome = self.run_entry(&delivery).await?;
    self.log.ack(&delivery.entry_id).await?;
    info!(entry_id = %delivery.entry_id, ?outcome, "Entry acknowledged");
    Ok(outcome)
  }

  async fn run_entry(&self, delivery: &Delivery) -> Result<EntryOutcome, BrokerError> {
    let Some(task_id) = delivery.fields.get("task_id").cloned() else {
      error!(entry_id = %delivery.entry_id, "Entry has no task_id; discarding");
      return Ok(EntryOutcome::Discarded);
    };

    match self.status.get(&task_id).await {
      Ok(Some(existing)) if existing.is_terminal() => {
        warn!(task_id = %task_id, state = %existing.state(), "Task already finished; not running it again");
        return Ok(EntryOutcome::AlreadyTerminal(existing.state()));
      }
      Ok(_) => {}
      // Retrying cannot repair the record, so the task fails instead.
      Err(BrokerError::CorruptRecord { reason, .. }) => {
        return self.fail_task(&task_id, format!("status record is unreadable: {}", reason)).await;
      }
      Err(e) => return Err(e),
    }

    let task = match QueueEntry::from_fields(&delivery.fields).and_then(QueueEntry::into_task) {
      Ok(task) => task,
      Err(e) => return self.fail_task(&task_id, e).await,
    };

    let snapshot = self.processor.process_task(&task).await?;
    Ok(EntryOutcome::Completed(snapshot.state()))
  }

  async fn fail_task(&self, task_id: &str, reason: impl std::fmt::Display) -> Result<EntryOutcome, BrokerError> {
    error!(task_id = %task_id, error = %reason, "Task failed");
    if !self.status.update(&StatusSnapshot::failure(task_id, reason)).await? {
      warn!(task_id = %task_id, "Status record missing; failure is not visible to pollers");
    }
    Ok(EntryOutcome::Completed(TaskState::Failure))
  }

  /// Sleep for the error backoff; true if shutdown was requested meanwhile.
  async fn backoff(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
      _ = tokio::time::sleep(self.config.error_backoff) => *shutdown.borrow(),
      _ = shutdown.changed() => true,
    }
  }
}
