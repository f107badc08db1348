use futures::TryStreamExt;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{error, info};
use warp::http::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use warp::http::{Response, StatusCode};
use warp::multipart::{FormData, Part};
use warp::{Buf, Filter, Reply};

use super::{AppState, with_state};
use crate::errors::ServiceError;
use crate::models::{FileRecord, StatusSnapshot};
use crate::submitter::UploadedFile;

const MAX_UPLOAD_BYTES: u64 = 200 * 1024 * 1024;

#[derive(Serialize)]
pub struct UploadResponse {
  pub task_id: String,
  pub status: String,
  pub message: String,
  pub files: Vec<String>,
  pub mode: String,
  pub endpoints: Value,
}

#[derive(Serialize)]
pub struct DownloadResponse {
  pub task_id: String,
  pub summaries: std::collections::BTreeMap<String, String>,
  pub files: Vec<FileRecord>,
  pub markdown_download_endpoint: String,
}

pub fn task_routes(state: AppState) -> impl Filter<Extract = impl Reply, Error = warp::Rejection> + Clone {
  upload_route(state.clone())
    .or(status_route(state.clone()))
    .or(download_route(state.clone()))
    .or(download_markdown_route(state.clone()))
    .or(health_route(state))
    .or(root_route())
}

pub fn upload_route(state: AppState) -> impl Filter<Extract = impl Reply, Error = warp::Rejection> + Clone {
  warp::path("upload")
    .and(warp::path::end())
    .and(warp::post())
    .and(warp::multipart::form().max_length(MAX_UPLOAD_BYTES))
    .and(with_state(state))
    .and_then(handle_upload)
}

pub fn status_route(state: AppState) -> impl Filter<Extract = impl Reply, Error = warp::Rejection> + Clone {
  warp::path!("status" / String)
    .and(warp::get())
    .and(with_state(state))
    .and_then(handle_status)
}

pub fn download_route(state: AppState) -> impl Filter<Extract = impl Reply, Error = warp::Rejection> + Clone {
  warp::path!("download" / String)
    .and(warp::get())
    .and(with_state(state))
    .and_then(handle_download)
}

pub fn download_markdown_route(state: AppState) -> impl Filter<Extract = impl Reply, Error = warp::Rejection> + Clone {
  warp::path!("download-markdown" / String)
    .and(warp::get())
    .and(with_state(state))
    .and_then(handle_download_markdown)
}

pub fn health_route(state: AppState) -> impl Filter<Extract = impl Reply, Error = warp::Rejection> + Clone {
  warp::path("health")
    .and(warp::path::end())
    .and(warp::get())
    .and(with_state(state))
    .and_then(handle_health)
}

pub fn root_route() -> impl Filter<Extract = impl Reply, Error = warp::Rejection> + Clone {
  warp::path::end().and(warp::get()).map(|| {
    warp::reply::json(&json!({
      "message": "Document processing API with AI summarization",
      "status": "running",
      "features": [
        "PDF to Markdown conversion (local or Gemini)",
        "AI-powered summarization with chunked processing",
        "Async task queue with Redis Streams"
      ],
      "endpoints": {
        "upload": "/upload (POST) - Upload PDFs, returns task_id",
        "status": "/status/{task_id} (GET) - Check task progress",
        "download": "/download/{task_id} (GET) - Get summaries as JSON",
        "download_markdown": "/download-markdown/{task_id} (GET) - Download markdown files",
        "sse": "/sse?task_id={task_id} (GET) - Stream status updates",
        "health": "/health (GET) - Health check"
      }
    }))
  })
}

async fn read_part(part: Part) -> Result<Vec<u8>, warp::Error> {
  part
    .stream()
    .try_fold(Vec::new(), |mut acc, buf| async move {
      acc.extend_from_slice(buf.chunk());
      Ok(acc)
    })
    .await
}

async fn read_form(form: FormData) -> Result<(Vec<UploadedFile>, Option<String>), ServiceError> {
  let parts: Vec<Part> = form
    .try_collect()
    .await
    .map_err(|e| ServiceError::Validation(format!("Malformed multipart body: {}", e)))?;

  let mut files = Vec::new();
  let mut mode = None;
  for part in parts {
    let name = part.name().to_string();
    let filename = part.filename().map(str::to_string);
    let data = read_part(part)
      .await
      .map_err(|e| ServiceError::Validation(format!("Failed to read part `{}`: {}", name, e)))?;
    match name.as_str() {
      "mode" => mode = Some(String::from_utf8_lossy(&data).trim().to_string()),
      "files" | "file" => files.push(UploadedFile {
        filename: filename.unwrap_or_default(),
        content: data,
      }),
      _ => {}
    }
  }
  Ok((files, mode))
}

async fn handle_upload(form: FormData, state: AppState) -> Result<impl Reply, warp::Rejection> {
  let (files, mode) = read_form(form).await.map_err(warp::reject::custom)?;
  let mode = mode.ok_or_else(|| warp::reject::custom(ServiceError::Validation("Missing `mode` field".into())))?;
  info!(files = files.len(), mode = %mode, "Upload request received");

  let submission = state.submitter.submit(files, &mode).await.map_err(warp::reject::custom)?;
  let task_id = submission.task_id.to_string();
  let response = UploadResponse {
    message: format!("Processing {} file(s) in background", submission.filenames.len()),
    status: "queued".into(),
    files: submission.filenames,
    mode: submission.mode.to_string(),
    endpoints: json!({
      "status": format!("/status/{}", task_id),
      "download": format!("/download/{}", task_id),
    }),
    task_id,
  };
  Ok(warp::reply::json(&response))
}

/// Flat projection of a snapshot for pollers.
pub fn status_body(snapshot: &StatusSnapshot) -> Value {
  let state = snapshot.state();
  let mut body = json!({
    "task_id": snapshot.task_id(),
    "state": state,
    "status": state,
    "message": snapshot.message(),
  });
  let extra = match snapshot {
    StatusSnapshot::Pending { total, current, .. } => json!({"total": total, "current": current}),
    StatusSnapshot::Processing { total, current, processed, failed, .. } => json!({
      "total": total,
      "current": current,
      "processed": processed,
      "failed": failed,
    }),
    StatusSnapshot::Success { task_id, total, processed, failed, mode, .. } => json!({
      "total": total,
      "current": total,
      "processed": processed,
      "failed": failed,
      "mode": mode,
      "download_url": format!("/download/{}", task_id),
    }),
    StatusSnapshot::Failure { error, .. } => json!({"total": 0, "current": 0, "error": error}),
  };
  if let (Some(body), Value::Object(extra)) = (body.as_object_mut(), extra) {
    body.extend(extra);
  }
  body
}

async fn handle_status(task_id: String, state: AppState) -> Result<impl Reply, warp::Rejection> {
  let snapshot = state.results.get_status(&task_id).await.map_err(warp::reject::custom)?;
  Ok(warp::reply::json(&status_body(&snapshot)))
}

async fn handle_download(task_id: String, state: AppState) -> Result<impl Reply, warp::Rejection> {
  let artifacts = state.results.get_artifacts(&task_id).await.map_err(warp::reject::custom)?;
  Ok(warp::reply::json(&DownloadResponse {
    markdown_download_endpoint: format!("/download-markdown/{}", task_id),
    task_id,
    summaries: artifacts.summaries,
    files: artifacts.files,
  }))
}

async fn handle_download_markdown(task_id: String, state: AppState) -> Result<warp::reply::Response, warp::Rejection> {
  let mut documents = state
    .results
    .get_markdown_artifacts(&task_id)
    .await
    .map_err(warp::reject::custom)?;

  if documents.len() == 1
    && let Some((md_filename, text)) = documents.pop_first()
  {
    info!(task_id = %task_id, md_filename = %md_filename, "Returning single markdown file");
    return Response::builder()
      .header(CONTENT_TYPE, "text/markdown; charset=utf-8")
      .header(CONTENT_DISPOSITION, format!("attachment; filename=\"{}\"", md_filename.replace('"', "")))
      .body(text.into())
      .map_err(|e| {
        error!(error = %e, "Failed to build markdown response");
        warp::reject::custom(ServiceError::ArtifactsExpired(task_id))
      });
  }

  info!(task_id = %task_id, count = documents.len(), "Returning markdown files");
  Ok(warp::reply::json(&documents).into_response())
}

async fn handle_health(state: AppState) -> Result<impl Reply, warp::Rejection> {
  match state.status.ping().await {
    Ok(()) => Ok(warp::reply::with_status(
      warp::reply::json(&json!({"status": "healthy", "redis": "connected"})),
      StatusCode::OK,
    )),
    Err(e) => {
      error!(error = %e, "Health check failed");
      Err(warp::reject::custom(ServiceError::BrokerUnavailable(format!("Redis error: {}", e))))
    }
  }
}
