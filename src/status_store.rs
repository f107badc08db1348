use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tracing::debug;

use crate::errors::BrokerError;
use crate::models::StatusSnapshot;

/// The slice of a key-value store with per-key expiry that task state needs.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
  async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), BrokerError>;

  /// Overwrite an existing, unexpired key without touching its expiry.
  /// Returns `false` (and writes nothing) when the key is absent.
  async fn replace_keep_ttl(&self, key: &str, value: &str) -> Result<bool, BrokerError>;

  async fn get(&self, key: &str) -> Result<Option<String>, BrokerError>;

  async fn remaining_ttl(&self, key: &str) -> Result<Option<Duration>, BrokerError>;

  async fn ping(&self) -> Result<(), BrokerError>;
}

#[derive(Clone)]
pub struct RedisStore {
  conn: ConnectionManager,
}

impl RedisStore {
  pub fn new(conn: ConnectionManager) -> Self {
    Self { conn }
  }
}

#[async_trait]
impl KeyValueStore for RedisStore {
  async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), BrokerError> {
    let mut conn = self.conn.clone();
    let _: () = conn.pset_ex(key, value, ttl.as_millis().max(1) as u64).await?;
    Ok(())
  }

  async fn replace_keep_ttl(&self, key: &str, value: &str) -> Result<bool, BrokerError> {
    let mut conn = self.conn.clone();
    let reply: Option<String> = redis::cmd("SET")
      .arg(key)
      .arg(value)
      .arg("XX")
      .arg("KEEPTTL")
      .query_async(&mut conn)
      .await?;
    Ok(reply.is_some())
  }

  async fn get(&self, key: &str) -> Result<Option<String>, BrokerError> {
    let mut conn = self.conn.clone();
    let value: Option<String> = conn.get(key).await?;
    Ok(value)
  }

  async fn remaining_ttl(&self, key: &str) -> Result<Option<Duration>, BrokerError> {
    let mut conn = self.conn.clone();
    // -2: missing, -1: no expiry
    let ttl_ms: i64 = conn.pttl(key).await?;
    Ok((ttl_ms > 0).then(|| Duration::from_millis(ttl_ms as u64)))
  }

  async fn ping(&self) -> Result<(), BrokerError> {
    let mut conn = self.conn.clone();
    let _: String = redis::cmd("PING").query_async(&mut conn).await?;
    Ok(())
  }
}

pub fn status_key(task_id: &str) -> String {
  format!("task:{}:status", task_id)
}

pub fn markdown_key(task_id: &str, md_filename: &str) -> String {
  format!("task:{}:file:{}", task_id, md_filename)
}

pub fn summary_key(task_id: &str, filename: &str) -> String {
  format!("task:{}:summary:{}", task_id, filename)
}

/// Task snapshots and artifacts on top of a [`KeyValueStore`].
///
/// The retention window starts when the status is created at submission.
/// Later snapshot writes keep the remaining expiry and are dropped once the
/// record is gone, so a task that outlives its window stays "not found" to
/// pollers. Artifacts inherit whatever is left of the window.
#[derive(Clone)]
pub struct StatusStore {
  kv: Arc<dyn KeyValueStore>,
  ttl: Duration,
}

impl StatusStore {
  pub fn new(kv: Arc<dyn KeyValueStore>, ttl: Duration) -> Self {
    Self { kv, ttl }
  }

  pub fn ttl(&self) -> Duration {
    self.ttl
  }

  pub async fn initialize(&self, snapshot: &StatusSnapshot) -> Result<(), BrokerError> {
    let body = serde_json::to_string(snapshot)?;
    self.kv.set_with_ttl(&status_key(snapshot.task_id()), &body, self.ttl).await
  }

  /// Returns `false` if the record had already expired (or was never written).
  pub async fn update(&self, snapshot: &StatusSnapshot) -> Result<bool, BrokerError> {
    let body = serde_json::to_string(snapshot)?;
    self.kv.replace_keep_ttl(&status_key(snapshot.task_id()), &body).await
  }

  pub async fn get(&self, task_id: &str) -> Result<Option<StatusSnapshot>, BrokerError> {
    match self.kv.get(&status_key(task_id)).await? {
      Some(body) => serde_json::from_str(&body).map(Some).map_err(|e| BrokerError::CorruptRecord {
        task_id: task_id.to_string(),
        reason: e.to_string(),
      }),
      None => Ok(None),
    }
  }

  pub async fn put_markdown(&self, task_id: &str, md_filename: &str, text: &str) -> Result<(), BrokerError> {
    self.put_artifact(task_id, &markdown_key(task_id, md_filename), text).await
  }

  pub async fn put_summary(&self, task_id: &str, filename: &str, summary: &str) -> Result<(), BrokerError> {
    self.put_artifact(task_id, &summary_key(task_id, filename), summary).await
  }

  pub async fn markdown(&self, task_id: &str, md_filename: &str) -> Result<Option<String>, BrokerError> {
    self.kv.get(&markdown_key(task_id, md_filename)).await
  }

  pub async fn summary(&self, task_id: &str, filename: &str) -> Result<Option<String>, BrokerError> {
    self.kv.get(&summary_key(task_id, filename)).await
  }

  pub async fn ping(&self) -> Result<(), BrokerError> {
    self.kv.ping().await
  }

  async fn put_artifact(&self, task_id: &str, key: &str, body: &str) -> Result<(), BrokerError> {
    let ttl = match self.kv.remaining_ttl(&status_key(task_id)).await? {
      Some(remaining) => remaining,
      None => {
        debug!(task_id, key, "Status record gone, storing artifact with the full window");
        self.ttl
      }
    };
    self.kv.set_with_ttl(key, body, ttl).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::memory::MemoryStore;

  fn store(ttl: u64) -> StatusStore {
    StatusStore::new(Arc::new(MemoryStore::new()), Duration::from_secs(ttl))
  }

  #[tokio::test(start_paused = true)]
  async fn window_is_counted_from_initialization() {
    let store = store(100);
    store.initialize(&StatusSnapshot::pending("t1", 1)).await.unwrap();

    tokio::time::advance(Duration::from_secs(60)).await;
    let processing = StatusSnapshot::Processing {
      task_id: "t1".into(),
      total: 1,
      current: 1,
      message: "Processing a.pdf...".into(),
      processed: vec![],
      failed: vec![],
    };
    assert!(store.update(&processing).await.unwrap());

    tokio::time::advance(Duration::from_secs(40)).await;
    assert_eq!(store.get("t1").await.unwrap(), None);
    assert!(!store.update(&processing).await.unwrap());
    assert_eq!(store.get("t1").await.unwrap(), None);
  }

  #[tokio::test(start_paused = true)]
  async fn artifacts_share_the_remaining_window() {
    let store = store(100);
    store.initialize(&StatusSnapshot::pending("t1", 1)).await.unwrap();
    tokio::time::advance(Duration::from_secs(30)).await;
    store.put_summary("t1", "a.pdf", "short").await.unwrap();

    tokio::time::advance(Duration::from_secs(69)).await;
    assert_eq!(store.summary("t1", "a.pdf").await.unwrap().as_deref(), Some("short"));
    tokio::time::advance(Duration::from_secs(1)).await;
    assert_eq!(store.summary("t1", "a.pdf").await.unwrap(), None);
  }

  #[test]
  fn key_layout() {
    assert_eq!(status_key("abc"), "task:abc:status");
    assert_eq!(markdown_key("abc", "a.md"), "task:abc:file:a.md");
    assert_eq!(summary_key("abc", "a.pdf"), "task:abc:summary:a.pdf");
  }
}
