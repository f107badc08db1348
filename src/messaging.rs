use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{
  StreamClaimReply, StreamId, StreamInfoConsumersReply, StreamPendingCountReply, StreamRangeReply,
  StreamReadOptions, StreamReadReply,
};
use redis::{AsyncCommands, Client};
use tokio_retry::Retry;
use tokio_retry::strategy::ExponentialBackoff;
use tracing::{debug, info, warn};

use crate::errors::BrokerError;

static MAX_RETRIES: usize = 5;
static DELAY: u64 = 100;

pub async fn create_redis_connection(redis_url: &str) -> Result<ConnectionManager> {
  let client = Client::open(redis_url)?;
  let conn = Retry::spawn(ExponentialBackoff::from_millis(DELAY).take(MAX_RETRIES), || {
    ConnectionManager::new(client.clone())
  })
    .await?;
  info!("Redis connection established");
  Ok(conn)
}

/// An entry handed to a consumer. It stays pending until acknowledged.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
  pub entry_id: String,
  pub fields: HashMap<String, String>,
  pub times_delivered: usize,
}

/// An unacknowledged entry as seen by the consumer group.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEntry {
  pub entry_id: String,
  pub consumer: String,
  pub idle: Duration,
  pub times_delivered: usize,
}

/// Durable ordered log consumed through a single consumer group.
#[async_trait]
pub trait WorkLog: Send + Sync {
  /// Create the consumer group if it does not exist yet. Safe to race.
  async fn ensure_group(&self) -> Result<(), BrokerError>;

  async fn append(&self, fields: &[(&'static str, String)]) -> Result<String, BrokerError>;

  /// Entries that have been pending for at least `min_idle`, oldest first.
  async fn idle_entries(&self, min_idle: Duration, count: usize) -> Result<Vec<PendingEntry>, BrokerError>;

  /// Take ownership of one idle entry. `None` if it is no longer idle enough,
  /// e.g. another consumer claimed it first or it was acknowledged.
  async fn claim(&self, consumer: &str, entry: &PendingEntry, min_idle: Duration) -> Result<Option<Delivery>, BrokerError>;

  /// Wait up to `block` for one never-delivered entry.
  async fn read_new(&self, consumer: &str, block: Duration) -> Result<Option<Delivery>, BrokerError>;

  async fn ack(&self, entry_id: &str) -> Result<(), BrokerError>;
}

/// [`WorkLog`] over a Redis stream.
#[derive(Clone)]
pub struct RedisWorkLog {
  conn: ConnectionManager,
  stream: String,
  group: String,
}

impl RedisWorkLog {
  pub fn new(conn: ConnectionManager, stream: &str, group: &str) -> Self {
    Self {
      conn,
      stream: stream.to_string(),
      group: group.to_string(),
    }
  }

  pub fn stream(&self) -> &str {
    &self.stream
  }

  pub async fn length(&self) -> Result<usize, BrokerError> {
    let mut conn = self.conn.clone();
    let len: usize = conn.xlen(&self.stream).await?;
    Ok(len)
  }

  pub async fn pending(&self, count: usize) -> Result<Vec<PendingEntry>, BrokerError> {
    let mut conn = self.conn.clone();
    let reply: StreamPendingCountReply = conn
      .xpending_count(&self.stream, &self.group, "-", "+", count)
      .await?;
    Ok(
      reply
        .ids
        .into_iter()
        .map(|p| PendingEntry {
          entry_id: p.id,
          consumer: p.consumer,
          idle: Duration::from_millis(p.last_delivered_ms as u64),
          times_delivered: p.times_delivered,
        })
        .collect(),
    )
  }

  /// Consumer name with its pending count and idle time.
  pub async fn consumers(&self) -> Result<Vec<(String, usize, Duration)>, BrokerError> {
    let mut conn = self.conn.clone();
    let reply: StreamInfoConsumersReply = conn.xinfo_consumers(&self.stream, &self.group).await?;
    Ok(
      reply
        .consumers
        .into_iter()
        .map(|c| (c.name, c.pending, Duration::from_millis(c.idle as u64)))
        .collect(),
    )
  }

  /// Latest entries, newest first.
  pub async fn recent(&self, count: usize) -> Result<Vec<Delivery>, BrokerError> {
    let mut conn = self.conn.clone();
    let reply: StreamRangeReply = conn.xrevrange_count(&self.stream, "+", "-", count).await?;
    Ok(reply.ids.into_iter().map(|id| into_delivery(id, 0)).collect())
  }
}

#[async_trait]
impl WorkLog for RedisWorkLog {
  async fn ensure_group(&self) -> Result<(), BrokerError> {
    let mut conn = self.conn.clone();
    let created: redis::RedisResult<()> = conn.xgroup_create_mkstream(&self.stream, &self.group, "0").await;
    match created {
      Ok(()) => {
        info!(group = %self.group, stream = %self.stream, "Created consumer group");
        Ok(())
      }
      Err(e) if e.code() == Some("BUSYGROUP") => {
        info!(group = %self.group, "Consumer group already exists");
        Ok(())
      }
      Err(e) => Err(e.into()),
    }
  }

  async fn append(&self, fields: &[(&'static str, String)]) -> Result<String, BrokerError> {
    let mut conn = self.conn.clone();
    let entry_id: String = conn.xadd(&self.stream, "*", fields).await?;
    Ok(entry_id)
  }

  async fn idle_entries(&self, min_idle: Duration, count: usize) -> Result<Vec<PendingEntry>, BrokerError> {
    let mut conn = self.conn.clone();
    // IDLE filters server side so live in-flight entries do not crowd out stale ones.
    let pending: StreamPendingCountReply = redis::cmd("XPENDING")
      .arg(&self.stream)
      .arg(&self.group)
      .arg("IDLE")
      .arg(min_idle.as_millis() as u64)
      .arg("-")
      .arg("+")
      .arg(count)
      .query_async(&mut conn)
      .await?;
    Ok(
      pending
        .ids
        .into_iter()
        .map(|p| PendingEntry {
          entry_id: p.id,
          consumer: p.consumer,
          idle: Duration::from_millis(p.last_delivered_ms as u64),
          times_delivered: p.times_delivered,
        })
        .collect(),
    )
  }

  async fn claim(
    &self,
    consumer: &str,
    entry: &PendingEntry,
    min_idle: Duration,
  ) -> Result<Option<Delivery>, BrokerError> {
    let mut conn = self.conn.clone();
    // XCLAIM re-checks the idle time, so an entry another consumer took in the
    // meantime comes back empty.
    let claimed: StreamClaimReply = conn
      .xclaim(&self.stream, &self.group, consumer, min_idle.as_millis() as u64, &[&entry.entry_id])
      .await?;
    let delivery = claimed
      .ids
      .into_iter()
      .next()
      .map(|id| into_delivery(id, entry.times_delivered + 1));
    if delivery.is_none() {
      debug!(entry_id = %entry.entry_id, consumer, "Entry already claimed elsewhere");
    }
    Ok(delivery)
  }

  async fn read_new(&self, consumer: &str, block: Duration) -> Result<Option<Delivery>, BrokerError> {
    let mut conn = self.conn.clone();
    let opts = StreamReadOptions::default()
      .group(&self.group, consumer)
      .count(1)
      .block(block.as_millis() as usize);
    let reply: Option<StreamReadReply> = conn.xread_options(&[&self.stream], &[">"], &opts).await?;
    Ok(
      reply
        .and_then(|r| r.keys.into_iter().next())
        .and_then(|key| key.ids.into_iter().next())
        .map(|id| into_delivery(id, 1)),
    )
  }

  async fn ack(&self, entry_id: &str) -> Result<(), BrokerError> {
    let mut conn = self.conn.clone();
    let acked: i64 = conn.xack(&self.stream, &self.group, &[entry_id]).await?;
    if acked == 0 {
      warn!(entry_id, "Entry was not pending at acknowledgement");
    }
    Ok(())
  }
}

fn into_delivery(id: StreamId, times_delivered: usize) -> Delivery {
  let fields = id
    .map
    .iter()
    .filter_map(|(k, v)| match redis::from_redis_value::<String>(v) {
      Ok(value) => Some((k.clone(), value)),
      Err(e) => {
        warn!(entry_id = %id.id, field = %k, error = %e, "Skipping non-string field");
        None
      }
    })
    .collect();
  Delivery {
    entry_id: id.id,
    fields,
    times_delivered,
  }
}
