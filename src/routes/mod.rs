use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use serde_json::json;
use tracing::{error, info};
use uuid::Uuid;
use warp::http::header::{HeaderName, HeaderValue};
use warp::http::{Method, StatusCode};
use warp::path::FullPath;
use warp::{Filter, Rejection, Reply};

use crate::errors::ServiceError;
use crate::messaging::WorkLog;
use crate::results::TaskResults;
use crate::status_store::StatusStore;
use crate::submitter::Submitter;

pub mod sse;
pub mod tasks;

impl warp::reject::Reject for ServiceError {}

/// Shared handles for every route.
#[derive(Clone)]
pub struct AppState {
  pub submitter: Arc<Submitter>,
  pub results: TaskResults,
  pub status: Arc<StatusStore>,
}

impl AppState {
  pub fn new(log: Arc<dyn WorkLog>, status: Arc<StatusStore>) -> Self {
    Self {
      submitter: Arc::new(Submitter::new(log, status.clone())),
      results: TaskResults::new(status.clone()),
      status,
    }
  }
}

pub fn with_state(state: AppState) -> impl Filter<Extract = (AppState,), Error = Infallible> + Clone {
  warp::any().map(move || state.clone())
}

pub fn routes(state: AppState) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
  tasks::task_routes(state.clone())
    .or(sse::sse_route(state))
    .recover(handle_rejection)
}

/// The served surface: [`routes`] plus CORS and per-request id, timing and logging.
pub fn api(
  state: AppState,
  cors_origins: &[String],
) -> impl Filter<Extract = impl Reply + use<>, Error = Infallible> + Clone + use<> {
  request_context()
    .and(routes(state))
    .map(|ctx: RequestContext, reply| finish_request(ctx, reply))
    .with(cors(cors_origins))
    .recover(handle_rejection)
}

pub fn cors(origins: &[String]) -> warp::cors::Builder {
  warp::cors()
    .allow_origins(origins.iter().map(String::as_str))
    .allow_methods([
      Method::GET,
      Method::POST,
      Method::PUT,
      Method::PATCH,
      Method::DELETE,
      Method::OPTIONS,
    ])
    .allow_headers(["accept", "authorization", "content-type", "x-requested-with"])
    .expose_headers(["x-request-id", "x-process-time"])
    .allow_credentials(true)
}

struct RequestContext {
  id: Uuid,
  method: Method,
  path: String,
  started: Instant,
}

fn request_context() -> impl Filter<Extract = (RequestContext,), Error = Infallible> + Clone {
  warp::method()
    .and(warp::path::full())
    .and(warp::addr::remote())
    .map(|method: Method, path: FullPath, client: Option<SocketAddr>| {
      let ctx = RequestContext {
        id: Uuid::new_v4(),
        method,
        path: path.as_str().to_string(),
        started: Instant::now(),
      };
      info!(request_id = %ctx.id, method = %ctx.method, path = %ctx.path, client = ?client, "Request started");
      ctx
    })
}

fn finish_request(ctx: RequestContext, reply: impl Reply) -> warp::reply::Response {
  let mut res = reply.into_response();
  let elapsed = ctx.started.elapsed().as_secs_f64();
  info!(
    request_id = %ctx.id,
    method = %ctx.method,
    path = %ctx.path,
    status = res.status().as_u16(),
    elapsed_secs = elapsed,
    "Request completed"
  );
  let headers = res.headers_mut();
  if let Ok(id) = HeaderValue::from_str(&ctx.id.to_string()) {
    headers.insert(HeaderName::from_static("x-request-id"), id);
  }
  if let Ok(took) = HeaderValue::from_str(&format!("{:.3}", elapsed)) {
    headers.insert(HeaderName::from_static("x-process-time"), took);
  }
  res
}

pub fn status_code(err: &ServiceError) -> StatusCode {
  match err {
    ServiceError::Validation(_) | ServiceError::InvalidFile { .. } | ServiceError::TaskNotComplete { .. } => {
      StatusCode::BAD_REQUEST
    }
    ServiceError::TaskNotFound(_) | ServiceError::ArtifactsExpired(_) => StatusCode::NOT_FOUND,
    ServiceError::BrokerUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
    ServiceError::NoProcessedFiles(_) | ServiceError::CorruptStatus { .. } => StatusCode::INTERNAL_SERVER_ERROR,
  }
}

fn details(err: &ServiceError) -> serde_json::Value {
  match err {
    ServiceError::InvalidFile { filename, reason } => json!({"filename": filename, "reason": reason}),
    ServiceError::BrokerUnavailable(_) => json!({"service": "redis", "retryable": true}),
    ServiceError::TaskNotFound(task_id)
    | ServiceError::ArtifactsExpired(task_id)
    | ServiceError::NoProcessedFiles(task_id) => json!({"task_id": task_id}),
    ServiceError::TaskNotComplete { task_id, state } => json!({"task_id": task_id, "state": state}),
    ServiceError::CorruptStatus { task_id, reason } => json!({"task_id": task_id, "reason": reason}),
    ServiceError::Validation(_) => json!({}),
  }
}

pub fn error_reply(err: &ServiceError) -> warp::reply::WithStatus<warp::reply::Json> {
  let body = json!({
    "error": err.kind(),
    "message": err.to_string(),
    "details": details(err),
  });
  warp::reply::with_status(warp::reply::json(&body), status_code(err))
}

pub async fn handle_rejection(err: Rejection) -> Result<impl Reply, Infallible> {
  if let Some(e) = err.find::<ServiceError>() {
    return Ok(error_reply(e));
  }

  let (code, kind, message) = if err.is_not_found() {
    (StatusCode::NOT_FOUND, "NotFound", "Resource not found".to_string())
  } else if let Some(e) = err.find::<warp::cors::CorsForbidden>() {
    (StatusCode::FORBIDDEN, "Forbidden", e.to_string())
  } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
    (StatusCode::METHOD_NOT_ALLOWED, "MethodNotAllowed", "Method not allowed".to_string())
  } else if err.find::<warp::reject::PayloadTooLarge>().is_some() {
    (StatusCode::PAYLOAD_TOO_LARGE, "PayloadTooLarge", "Upload is too large".to_string())
  } else if let Some(e) = err.find::<warp::reject::InvalidQuery>() {
    (StatusCode::BAD_REQUEST, "ValidationError", e.to_string())
  } else if let Some(e) = err.find::<warp::reject::InvalidHeader>() {
    (StatusCode::BAD_REQUEST, "ValidationError", e.to_string())
  } else {
    error!("Unhandled rejection: {:?}", err);
    (StatusCode::INTERNAL_SERVER_ERROR, "InternalError", "Internal server error".to_string())
  };
  let body = json!({"error": kind, "message": message, "details": {}});
  Ok(warp::reply::with_status(warp::reply::json(&body), code))
}
