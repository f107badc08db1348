//! In-process work log and key-value store.
//!
//! Both follow the Redis semantics the worker relies on (consumer group
//! ownership, idle-based reclaim, per-key expiry) and run on `tokio::time`, so
//! tests can drive idle thresholds and TTLs with a paused clock.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::errors::BrokerError;
use crate::messaging::{Delivery, PendingEntry, WorkLog};
use crate::status_store::KeyValueStore;

struct PendingState {
  consumer: String,
  delivered_at: Instant,
  times_delivered: usize,
}

#[derive(Default)]
struct LogState {
  group_created: bool,
  next_seq: u64,
  entries: BTreeMap<u64, HashMap<String, String>>,
  last_delivered: u64,
  pending: BTreeMap<u64, PendingState>,
}

impl LogState {
  fn delivery(&self, seq: u64) -> Option<Delivery> {
    let fields = self.entries.get(&seq)?.clone();
    let times_delivered = self.pending.get(&seq).map(|p| p.times_delivered).unwrap_or(0);
    Some(Delivery {
      entry_id: entry_id(seq),
      fields,
      times_delivered,
    })
  }
}

#[derive(Default)]
pub struct MemoryWorkLog {
  state: Mutex<LogState>,
  appended: Notify,
  unavailable: AtomicBool,
}

impl MemoryWorkLog {
  pub fn new() -> Self {
    Self::default()
  }

  /// Make every call fail as if the broker could not be reached.
  pub fn set_unavailable(&self, unavailable: bool) {
    self.unavailable.store(unavailable, Ordering::SeqCst);
  }

  pub async fn len(&self) -> usize {
    self.state.lock().await.entries.len()
  }

  pub async fn pending(&self) -> Vec<PendingEntry> {
    let state = self.state.lock().await;
    let now = Instant::now();
    state
      .pending
      .iter()
      .map(|(seq, p)| PendingEntry {
        entry_id: entry_id(*seq),
        consumer: p.consumer.clone(),
        idle: now.duration_since(p.delivered_at),
        times_delivered: p.times_delivered,
      })
      .collect()
  }

  fn check_available(&self) -> Result<(), BrokerError> {
    if self.unavailable.load(Ordering::SeqCst) {
      return Err(BrokerError::Unavailable("work log unreachable".into()));
    }
    Ok(())
  }

  async fn try_deliver(&self, consumer: &str) -> Result<Option<Delivery>, BrokerError> {
    let mut state = self.state.lock().await;
    if !state.group_created {
      return Err(BrokerError::Unavailable("NOGROUP consumer group does not exist".into()));
    }
    let next = state
      .entries
      .range(state.last_delivered + 1..)
      .next()
      .map(|(seq, _)| *seq);
    let Some(seq) = next else {
      return Ok(None);
    };
    state.last_delivered = seq;
    state.pending.insert(
      seq,
      PendingState {
        consumer: consumer.to_string(),
        delivered_at: Instant::now(),
        times_delivered: 1,
      },
    );
    Ok(state.delivery(seq))
  }
}

#[async_trait]
impl WorkLog for MemoryWorkLog {
  async fn ensure_group(&self) -> Result<(), BrokerError> {
    self.check_available()?;
    self.state.lock().await.group_created = true;
    Ok(())
  }

  async fn append(&self, fields: &[(&'static str, String)]) -> Result<String, BrokerError> {
    self.check_available()?;
    let mut state = self.state.lock().await;
    state.next_seq += 1;
    let seq = state.next_seq;
    state.entries.insert(
      seq,
      fields.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
    );
    drop(state);
    self.appended.notify_waiters();
    Ok(entry_id(seq))
  }

  async fn idle_entries(&self, min_idle: Duration, count: usize) -> Result<Vec<PendingEntry>, BrokerError> {
    self.check_available()?;
    let now = Instant::now();
    let state = self.state.lock().await;
    Ok(
      state
        .pending
        .iter()
        .filter(|(_, p)| now.duration_since(p.delivered_at) >= min_idle)
        .take(count)
        .map(|(seq, p)| PendingEntry {
          entry_id: entry_id(*seq),
          consumer: p.consumer.clone(),
          idle: now.duration_since(p.delivered_at),
          times_delivered: p.times_delivered,
        })
        .collect(),
    )
  }

  async fn claim(&self, consumer: &str, entry: &PendingEntry, min_idle: Duration) -> Result<Option<Delivery>, BrokerError> {
    self.check_available()?;
    let Some(seq) = parse_entry_id(&entry.entry_id) else {
      return Ok(None);
    };
    let now = Instant::now();
    let mut state = self.state.lock().await;
    match state.pending.get_mut(&seq) {
      Some(p) if now.duration_since(p.delivered_at) >= min_idle => {
        p.consumer = consumer.to_string();
        p.delivered_at = now;
        p.times_delivered += 1;
      }
      _ => return Ok(None),
    }
    Ok(state.delivery(seq))
  }

  async fn read_new(&self, consumer: &str, block: Duration) -> Result<Option<Delivery>, BrokerError> {
    self.check_available()?;
    let deadline = Instant::now() + block;
    loop {
      let appended = self.appended.notified();
      if let Some(delivery) = self.try_deliver(consumer).await? {
        return Ok(Some(delivery));
      }
      if tokio::time::timeout_at(deadline, appended).await.is_err() {
        return Ok(None);
      }
    }
  }

  async fn ack(&self, entry_id: &str) -> Result<(), BrokerError> {
    self.check_available()?;
    if let Some(seq) = parse_entry_id(entry_id) {
      self.state.lock().await.pending.remove(&seq);
    }
    Ok(())
  }
}

fn entry_id(seq: u64) -> String {
  format!("{}-0", seq)
}

fn parse_entry_id(entry_id: &str) -> Option<u64> {
  entry_id.split('-').next()?.parse().ok()
}

/// Key-value store with lazy per-key expiry.
#[derive(Default)]
pub struct MemoryStore {
  entries: Mutex<HashMap<String, (String, Option<Instant>)>>,
  unavailable: AtomicBool,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn set_unavailable(&self, unavailable: bool) {
    self.unavailable.store(unavailable, Ordering::SeqCst);
  }

  fn check_available(&self) -> Result<(), BrokerError> {
    if self.unavailable.load(Ordering::SeqCst) {
      return Err(BrokerError::Unavailable("status store unreachable".into()));
    }
    Ok(())
  }
}

fn live(entry: &(String, Option<Instant>), now: Instant) -> bool {
  entry.1.is_none_or(|expires_at| expires_at > now)
}

#[async_trait]
impl KeyValueStore for MemoryStore {
  async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), BrokerError> {
    self.check_available()?;
    let expires_at = Instant::now() + ttl;
    self
      .entries
      .lock()
      .await
      .insert(key.to_string(), (value.to_string(), Some(expires_at)));
    Ok(())
  }

  async fn replace_keep_ttl(&self, key: &str, value: &str) -> Result<bool, BrokerError> {
    self.check_available()?;
    let now = Instant::now();
    let mut entries = self.entries.lock().await;
    match entries.get_mut(key) {
      Some(entry) if live(entry, now) => {
        entry.0 = value.to_string();
        Ok(true)
      }
      Some(_) => {
        entries.remove(key);
        Ok(false)
      }
      None => Ok(false),
    }
  }

  async fn get(&self, key: &str) -> Result<Option<String>, BrokerError> {
    self.check_available()?;
    let now = Instant::now();
    let entries = self.entries.lock().await;
    Ok(entries.get(key).filter(|e| live(e, now)).map(|e| e.0.clone()))
  }

  async fn remaining_ttl(&self, key: &str) -> Result<Option<Duration>, BrokerError> {
    self.check_available()?;
    let now = Instant::now();
    let entries = self.entries.lock().await;
    Ok(
      entries
        .get(key)
        .filter(|e| live(e, now))
        .and_then(|e| e.1)
        .map(|expires_at| expires_at.duration_since(now)),
    )
  }

  async fn ping(&self) -> Result<(), BrokerError> {
    self.check_available()
  }
}
