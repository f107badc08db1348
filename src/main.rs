use std::sync::Arc;

use docsum::{
  config::Config,
  logging,
  messaging::{RedisWorkLog, create_redis_connection},
  routes::{AppState, api},
  status_store::{RedisStore, StatusStore},
};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  logging::init("info");
  let config = Config::from_env();
  info!(?config, "Starting API");

  let conn = create_redis_connection(&config.redis_url).await?;
  let log = Arc::new(RedisWorkLog::new(conn.clone(), &config.stream_name, &config.consumer_group));
  let status = Arc::new(StatusStore::new(Arc::new(RedisStore::new(conn)), config.task_expiration));

  let filter = api(AppState::new(log, status), &config.cors_origins);

  let (addr, server) = warp::serve(filter).bind_with_graceful_shutdown(([0, 0, 0, 0], config.server_port), async {
    let _ = tokio::signal::ctrl_c().await;
  });
  info!(%addr, "Listening");
  server.await;
  Ok(())
}
