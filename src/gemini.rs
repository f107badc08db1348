//! Client for the Gemini `generateContent` endpoint.

use std::time::Instant;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::GeminiConfig;
use crate::errors::GenerationError;

/// A failable, non-deterministic text generation capability.
#[async_trait]
pub trait TextGenerator: Send + Sync {
  async fn generate(&self, prompt: &str) -> Result<String, GenerationError>;
}

#[derive(Debug, Serialize)]
struct GenerateRequest {
  contents: Vec<Content>,
}

#[derive(Debug, Serialize)]
struct Content {
  parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Part {
  Text { text: String },
  Inline { inline_data: InlineData },
}

#[derive(Debug, Serialize)]
struct InlineData {
  mime_type: String,
  data: String,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
  #[serde(default)]
  candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
  content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
  #[serde(default)]
  parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
  text: Option<String>,
}

impl GenerateResponse {
  fn text(self) -> Option<String> {
    let text: String = self
      .candidates
      .into_iter()
      .next()?
      .content?
      .parts
      .into_iter()
      .filter_map(|p| p.text)
      .collect();
    (!text.trim().is_empty()).then_some(text)
  }
}

pub struct GeminiClient {
  client: Client,
  config: GeminiConfig,
}

impl GeminiClient {
  pub fn new(config: GeminiConfig) -> Result<Self, GenerationError> {
    let client = Client::builder().timeout(config.timeout).build()?;
    Ok(Self { client, config })
  }

  /// Generate from a prompt plus one inline document (e.g. a PDF).
  pub async fn generate_with_document(
    &self,
    prompt: &str,
    data: &[u8],
    mime_type: &str,
  ) -> Result<String, GenerationError> {
    let parts = vec![
      Part::Text { text: prompt.to_string() },
      Part::Inline {
        inline_data: InlineData {
          mime_type: mime_type.to_string(),
          data: STANDARD.encode(data),
        },
      },
    ];
    self.generate_content(parts).await
  }

  async fn generate_content(&self, parts: Vec<Part>) -> Result<String, GenerationError> {
    if self.config.api_key.is_empty() {
      return Err(GenerationError::Unavailable("GOOGLE_API_KEY is not set".into()));
    }
    let start = Instant::now();
    let request = GenerateRequest {
      contents: vec![Content { parts }],
    };
    let response = self
      .client
      .post(format!("{}/models/{}:generateContent", self.config.base_url, self.config.model))
      .header("x-goog-api-key", &self.config.api_key)
      .json(&request)
      .send()
      .await?;

    if !response.status().is_success() {
      let status = response.status().as_u16();
      let body = response.text().await.unwrap_or_default();
      warn!(status, "Gemini request rejected");
      return Err(GenerationError::Status { status, body });
    }

    let text = response
      .json::<GenerateResponse>()
      .await?
      .text()
      .ok_or(GenerationError::Empty)?;
    debug!(
      model = %self.config.model,
      response_len = text.len(),
      duration_ms = start.elapsed().as_millis() as u64,
      "Generation complete"
    );
    Ok(text)
  }
}

#[async_trait]
impl TextGenerator for GeminiClient {
  async fn generate(&self, prompt: &str) -> Result<String, GenerationError> {
    self
      .generate_content(vec![Part::Text { text: prompt.to_string() }])
      .await
  }
}
