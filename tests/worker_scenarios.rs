mod common;

use std::time::Duration;

use common::{FakeExtractor, Harness, SUMMARY, extracted_text, pdf};
use docsum::errors::ServiceError;
use docsum::messaging::WorkLog;
use docsum::status_store::{KeyValueStore, status_key};
use docsum::models::{ExtractionMode, FileData, FileRecord, QueueEntry, StatusSnapshot, TaskState};
use docsum::results::TaskResults;
use docsum::worker_loop::{EntryOutcome, Iteration};
use tokio::sync::watch;
use tokio_test::{assert_err, assert_ok};

#[tokio::test(start_paused = true)]
async fn single_local_file_completes() {
  let h = Harness::local().await;
  let submission = h.submitter.submit(vec![pdf("report.pdf")], "local").await.unwrap();
  let task_id = submission.task_id.to_string();

  let (_tx, mut rx) = watch::channel(false);
  let iteration = h.worker.run_iteration(&mut rx).await.unwrap();
  assert_eq!(
    iteration,
    Iteration::Handled { reclaimed: 0, outcome: EntryOutcome::Completed(TaskState::Success) }
  );

  match h.status_of(&task_id).await {
    Some(StatusSnapshot::Success { processed, failed, total, files, mode, .. }) => {
      assert_eq!((processed, failed, total), (1, 0, 1));
      assert_eq!(mode, ExtractionMode::Local);
      assert_eq!(
        files[0],
        FileRecord::Success {
          filename: "report.pdf".into(),
          md_filename: "report.md".into(),
          size: extracted_text("report.pdf").chars().count(),
        }
      );
    }
    other => panic!("expected SUCCESS, got {:?}", other),
  }

  let results = TaskResults::new(h.status.clone());
  let artifacts = results.get_artifacts(&task_id).await.unwrap();
  assert_eq!(artifacts.summaries["report.pdf"], SUMMARY);
  let markdown = results.get_markdown_artifacts(&task_id).await.unwrap();
  assert_eq!(markdown["report.md"], extracted_text("report.pdf"));

  assert!(h.log.pending().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn failed_file_is_reported_without_failing_the_task() {
  let h = Harness::new(
    FakeExtractor::new(ExtractionMode::Local).failing_for("b.pdf"),
    Duration::from_secs(3600),
  )
  .await;
  let submission = h.submitter.submit(vec![pdf("a.pdf"), pdf("b.pdf")], "local").await.unwrap();

  let (_tx, mut rx) = watch::channel(false);
  assert_ok!(h.worker.run_iteration(&mut rx).await);

  match h.status_of(&submission.task_id.to_string()).await {
    Some(StatusSnapshot::Success { processed, failed, files, errors, .. }) => {
      assert_eq!((processed, failed), (1, 1));
      assert_eq!(files[0].filename(), "a.pdf");
      match &errors[0] {
        FileRecord::Failed { filename, error } => {
          assert_eq!(filename, "b.pdf");
          assert!(error.contains("corrupt"), "error was {}", error);
        }
        other => panic!("unexpected record {:?}", other),
      }
    }
    other => panic!("expected SUCCESS, got {:?}", other),
  }
}

#[tokio::test(start_paused = true)]
async fn unknown_task_is_not_found() {
  let h = Harness::local().await;
  let results = TaskResults::new(h.status.clone());
  assert!(matches!(
    results.get_status("3f1e2d4c-0000-0000-0000-000000000000").await,
    Err(ServiceError::TaskNotFound(_))
  ));
}

#[tokio::test(start_paused = true)]
async fn artifacts_are_refused_until_terminal() {
  let h = Harness::new(
    FakeExtractor::new(ExtractionMode::Local).with_delay(Duration::from_secs(5)),
    Duration::from_secs(3600),
  )
  .await;
  let submission = h.submitter.submit(vec![pdf("a.pdf")], "local").await.unwrap();
  let task_id = submission.task_id.to_string();
  let results = TaskResults::new(h.status.clone());

  assert!(matches!(
    results.get_artifacts(&task_id).await,
    Err(ServiceError::TaskNotComplete { state: TaskState::Pending, .. })
  ));

  let (tx, rx) = watch::channel(false);
  let worker = h.worker.clone();
  let handle = tokio::spawn(async move { worker.run(rx).await });

  tokio::time::sleep(Duration::from_secs(1)).await;
  assert!(matches!(
    results.get_artifacts(&task_id).await,
    Err(ServiceError::TaskNotComplete { state: TaskState::Processing, .. })
  ));

  tx.send(true).unwrap();
  handle.await.unwrap();
  assert_ok!(results.get_artifacts(&task_id).await);
}

#[tokio::test(start_paused = true)]
async fn stale_entry_is_reclaimed_and_then_gone() {
  let h = Harness::local().await;
  let submission = h.submitter.submit(vec![pdf("a.pdf")], "local").await.unwrap();

  // Delivered to a consumer that dies before acknowledging.
  let lost = h.log.read_new("crashed", Duration::from_millis(10)).await.unwrap();
  assert!(lost.is_some());

  let (_tx, mut rx) = watch::channel(false);
  assert_eq!(h.worker.run_iteration(&mut rx).await.unwrap(), Iteration::Idle { reclaimed: 0 });

  tokio::time::advance(Duration::from_secs(61)).await;
  assert_eq!(h.worker.run_iteration(&mut rx).await.unwrap(), Iteration::Idle { reclaimed: 1 });
  let status = h.status_of(&submission.task_id.to_string()).await.unwrap();
  assert_eq!(status.state(), TaskState::Success);
  assert!(h.log.pending().await.is_empty());

  tokio::time::advance(Duration::from_secs(120)).await;
  assert_eq!(h.worker.reclaim_pass().await.unwrap(), 0);
  assert_eq!(h.extractor.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn reclaimed_entries_are_claimed_one_at_a_time() {
  let h = Harness::new(
    FakeExtractor::new(ExtractionMode::Local).with_delay(Duration::from_secs(30)),
    Duration::from_secs(3600),
  )
  .await;
  let mut task_ids = vec![];
  for name in ["a.pdf", "b.pdf", "c.pdf"] {
    let submission = h.submitter.submit(vec![pdf(name)], "local").await.unwrap();
    task_ids.push(submission.task_id.to_string());
    assert!(h.log.read_new("crashed", Duration::from_millis(10)).await.unwrap().is_some());
  }

  tokio::time::advance(Duration::from_secs(61)).await;
  let first = h.worker.clone();
  let running = tokio::spawn(async move { first.reclaim_pass().await });

  // worker_1 is on its third entry by now and claimed it only when it started.
  tokio::time::sleep(Duration::from_secs(69)).await;
  let second = h.worker_named("worker_2");
  assert_eq!(second.reclaim_pass().await.unwrap(), 0);

  assert_eq!(running.await.unwrap().unwrap(), 3);
  assert_eq!(h.extractor.calls.load(std::sync::atomic::Ordering::SeqCst), 3);
  for task_id in &task_ids {
    assert_eq!(h.status_of(task_id).await.map(|s| s.state()), Some(TaskState::Success));
  }
  assert!(h.log.pending().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn entry_claimed_by_another_consumer_is_skipped() {
  let h = Harness::local().await;
  h.submitter.submit(vec![pdf("a.pdf")], "local").await.unwrap();
  assert!(h.log.read_new("crashed", Duration::from_millis(10)).await.unwrap().is_some());
  tokio::time::advance(Duration::from_secs(61)).await;

  let idle = h.log.idle_entries(Duration::from_secs(60), 10).await.unwrap();
  assert_eq!(idle.len(), 1);
  let claimed = h.log.claim("worker_2", &idle[0], Duration::from_secs(60)).await.unwrap();
  assert_eq!(claimed.map(|d| d.times_delivered), Some(2));

  // The listing is stale now; claiming from it must not steal the entry back.
  assert!(h.log.claim("worker_1", &idle[0], Duration::from_secs(60)).await.unwrap().is_none());
  assert_eq!(h.worker.reclaim_pass().await.unwrap(), 0);
  assert_eq!(h.log.pending().await[0].consumer, "worker_2");
}

#[tokio::test(start_paused = true)]
async fn infrastructure_failure_leaves_entry_pending() {
  let h = Harness::local().await;
  let submission = h.submitter.submit(vec![pdf("a.pdf")], "local").await.unwrap();

  h.kv.set_unavailable(true);
  let (_tx, mut rx) = watch::channel(false);
  assert_err!(h.worker.run_iteration(&mut rx).await);

  let pending = h.log.pending().await;
  assert_eq!(pending.len(), 1);
  assert_eq!(pending[0].consumer, "worker_1");

  h.kv.set_unavailable(false);
  tokio::time::advance(Duration::from_secs(60)).await;
  assert_eq!(h.worker.run_iteration(&mut rx).await.unwrap(), Iteration::Idle { reclaimed: 1 });
  assert_eq!(
    h.status_of(&submission.task_id.to_string()).await.map(|s| s.state()),
    Some(TaskState::Success)
  );
  assert!(h.log.pending().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn malformed_entry_fails_the_task() {
  let h = Harness::local().await;
  h.status.initialize(&StatusSnapshot::pending("t-bad", 1)).await.unwrap();
  h.log
    .append(&[
      ("task_id", "t-bad".to_string()),
      ("mode", "local".to_string()),
      ("files_data", "not json".to_string()),
    ])
    .await
    .unwrap();

  let (_tx, mut rx) = watch::channel(false);
  let iteration = h.worker.run_iteration(&mut rx).await.unwrap();
  assert_eq!(
    iteration,
    Iteration::Handled { reclaimed: 0, outcome: EntryOutcome::Completed(TaskState::Failure) }
  );
  match h.status_of("t-bad").await {
    Some(StatusSnapshot::Failure { error, message, .. }) => {
      assert!(!error.is_empty());
      assert!(message.starts_with("Task failed"));
    }
    other => panic!("expected FAILURE, got {:?}", other),
  }
  assert!(h.log.pending().await.is_empty());
  assert_eq!(h.extractor.calls.load(std::sync::atomic::Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn unreadable_status_record_fails_the_task() {
  let h = Harness::local().await;
  let submission = h.submitter.submit(vec![pdf("a.pdf")], "local").await.unwrap();
  let task_id = submission.task_id.to_string();
  h.kv
    .set_with_ttl(&status_key(&task_id), "{\"state\": \"PEND", Duration::from_secs(3600))
    .await
    .unwrap();

  let results = TaskResults::new(h.status.clone());
  match results.get_status(&task_id).await {
    Err(e @ ServiceError::CorruptStatus { .. }) => assert!(!e.is_retryable()),
    other => panic!("expected CorruptStatus, got {:?}", other),
  }

  let (_tx, mut rx) = watch::channel(false);
  assert_eq!(
    h.worker.run_iteration(&mut rx).await.unwrap(),
    Iteration::Handled { reclaimed: 0, outcome: EntryOutcome::Completed(TaskState::Failure) }
  );
  match h.status_of(&task_id).await {
    Some(StatusSnapshot::Failure { error, .. }) => assert!(error.contains("unreadable"), "error was {}", error),
    other => panic!("expected FAILURE, got {:?}", other),
  }
  assert!(h.log.pending().await.is_empty());
  assert_eq!(h.extractor.calls.load(std::sync::atomic::Ordering::SeqCst), 0);

  // Nothing is left for a later reclaim to retry.
  tokio::time::advance(Duration::from_secs(120)).await;
  assert_eq!(h.worker.reclaim_pass().await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn entry_without_task_id_is_discarded() {
  let h = Harness::local().await;
  h.log.append(&[("mode", "local".to_string())]).await.unwrap();

  let (_tx, mut rx) = watch::channel(false);
  assert_eq!(
    h.worker.run_iteration(&mut rx).await.unwrap(),
    Iteration::Handled { reclaimed: 0, outcome: EntryOutcome::Discarded }
  );
  assert!(h.log.pending().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn duplicate_delivery_of_finished_task_is_skipped() {
  let h = Harness::local().await;
  let submission = h.submitter.submit(vec![pdf("a.pdf")], "local").await.unwrap();
  let (_tx, mut rx) = watch::channel(false);
  assert_ok!(h.worker.run_iteration(&mut rx).await);

  let entry = QueueEntry::new(&submission.task_id, ExtractionMode::Local, &[FileData::encode("a.pdf", b"%PDF")]).unwrap();
  h.log.append(&entry.fields()).await.unwrap();

  assert_eq!(
    h.worker.run_iteration(&mut rx).await.unwrap(),
    Iteration::Handled { reclaimed: 0, outcome: EntryOutcome::AlreadyTerminal(TaskState::Success) }
  );
  assert_eq!(h.extractor.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
  assert!(h.log.pending().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn terminal_status_reads_the_same_every_time() {
  let h = Harness::local().await;
  let submission = h.submitter.submit(vec![pdf("a.pdf")], "local").await.unwrap();
  let task_id = submission.task_id.to_string();
  let (_tx, mut rx) = watch::channel(false);
  assert_ok!(h.worker.run_iteration(&mut rx).await);

  let results = TaskResults::new(h.status.clone());
  let first = results.get_status(&task_id).await.unwrap();
  assert_eq!(first.state(), TaskState::Success);
  assert_eq!(results.get_status(&task_id).await.unwrap(), first);

  let entry = QueueEntry::new(&submission.task_id, ExtractionMode::Local, &[FileData::encode("a.pdf", b"%PDF")]).unwrap();
  h.log.append(&entry.fields()).await.unwrap();
  assert_ok!(h.worker.run_iteration(&mut rx).await);

  tokio::time::advance(Duration::from_secs(1800)).await;
  assert_eq!(results.get_status(&task_id).await.unwrap(), first);
  let summaries = results.get_artifacts(&task_id).await.unwrap().summaries;
  assert_eq!(summaries["a.pdf"], SUMMARY);
}

#[tokio::test(start_paused = true)]
async fn status_expiring_mid_task_stays_not_found() {
  let h = Harness::new(
    FakeExtractor::new(ExtractionMode::Local).with_delay(Duration::from_secs(20)),
    Duration::from_secs(10),
  )
  .await;
  let submission = h.submitter.submit(vec![pdf("a.pdf")], "local").await.unwrap();
  let task_id = submission.task_id.to_string();

  let (_tx, mut rx) = watch::channel(false);
  let iteration = h.worker.run_iteration(&mut rx).await.unwrap();
  assert_eq!(
    iteration,
    Iteration::Handled { reclaimed: 0, outcome: EntryOutcome::Completed(TaskState::Success) }
  );

  assert!(!h.has_status_key(&task_id).await);
  let results = TaskResults::new(h.status.clone());
  assert!(matches!(results.get_status(&task_id).await, Err(ServiceError::TaskNotFound(_))));
  assert!(h.log.pending().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn observed_states_never_move_backwards() {
  let h = Harness::local().await;
  h.submitter.submit(vec![pdf("a.pdf"), pdf("b.pdf"), pdf("c.pdf")], "gemini").await.ok();
  let submission = h.submitter.submit(vec![pdf("a.pdf"), pdf("b.pdf")], "local").await.unwrap();
  let task_id = submission.task_id.to_string();

  let (_tx, mut rx) = watch::channel(false);
  // The gemini task has no registered extractor; both files fail but the task succeeds.
  assert_ok!(h.worker.run_iteration(&mut rx).await);
  assert_ok!(h.worker.run_iteration(&mut rx).await);

  let writes = h.kv.status_writes.lock().await;
  let ours: Vec<&StatusSnapshot> = writes.iter().filter(|s| s.task_id() == task_id).collect();
  assert_eq!(ours.first().map(|s| s.state()), Some(TaskState::Pending));
  assert_eq!(ours.last().map(|s| s.state()), Some(TaskState::Success));
  assert_eq!(ours.iter().filter(|s| s.is_terminal()).count(), 1);

  let mut last_rank = 0;
  let mut last_current = 0;
  for snapshot in &ours {
    assert!(snapshot.state().rank() >= last_rank, "regressed at {:?}", snapshot);
    last_rank = snapshot.state().rank();
    if let StatusSnapshot::Processing { current, .. } = snapshot {
      assert!(*current >= last_current);
      last_current = *current;
    }
  }
}

#[tokio::test(start_paused = true)]
async fn shutdown_stops_an_idle_worker() {
  let h = Harness::local().await;
  let (tx, rx) = watch::channel(false);
  let worker = h.worker.clone();
  let handle = tokio::spawn(async move { worker.run(rx).await });

  tokio::time::sleep(Duration::from_secs(3)).await;
  tx.send(true).unwrap();
  assert_ok!(tokio::time::timeout(Duration::from_secs(1), handle).await);
}

#[tokio::test(start_paused = true)]
async fn shutdown_finishes_the_task_in_flight() {
  let h = Harness::new(
    FakeExtractor::new(ExtractionMode::Local).with_delay(Duration::from_secs(5)),
    Duration::from_secs(3600),
  )
  .await;
  let submission = h.submitter.submit(vec![pdf("a.pdf")], "local").await.unwrap();

  let (tx, rx) = watch::channel(false);
  let worker = h.worker.clone();
  let handle = tokio::spawn(async move { worker.run(rx).await });
  tokio::time::sleep(Duration::from_secs(1)).await;
  tx.send(true).unwrap();
  handle.await.unwrap();

  assert_eq!(
    h.status_of(&submission.task_id.to_string()).await.map(|s| s.state()),
    Some(TaskState::Success)
  );
  assert!(h.log.pending().await.is_empty());
}
