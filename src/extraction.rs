use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::errors::ProcessingError;
use crate::gemini::GeminiClient;
use crate::models::ExtractionMode;

pub const EMPTY_PAGE_PLACEHOLDER: &str = "[Could not extract text from this page due to PDF formatting issues]";

const PAGE_PROMPT: &str = "Analyze this PDF document page by page and extract all contents in markdown format.
Start every page with a `## Page N` header.

For text content:
- Extract all text preserving structure and formatting
- Use appropriate markdown headers, lists, tables, superscript, subscripts, chemical formulas, etc.

For figures, charts, or graphs:
- Provide a detailed summary describing what the visual represents
- Include key data points, trends, or insights visible in the visual
- Format as: **[Figure/Chart/Graph Summary]:** [your description]

Please be thorough and accurate in your extraction.";

/// Turns the raw bytes of one document into markdown text.
#[async_trait]
pub trait Extractor: Send + Sync {
  fn mode(&self) -> ExtractionMode;

  async fn extract(&self, data: &[u8], filename: &str) -> Result<String, ProcessingError>;
}

#[derive(Default, Clone)]
pub struct ExtractorRegistry {
  extractors: HashMap<ExtractionMode, Arc<dyn Extractor>>,
}

impl ExtractorRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Replaces any extractor already registered for the same mode.
  pub fn register(&mut self, extractor: Arc<dyn Extractor>) {
    self.extractors.insert(extractor.mode(), extractor);
  }

  pub fn has(&self, mode: ExtractionMode) -> bool {
    self.extractors.contains_key(&mode)
  }

  pub async fn extract(&self, mode: ExtractionMode, data: &[u8], filename: &str) -> Result<String, ProcessingError> {
    let extractor = self
      .extractors
      .get(&mode)
      .ok_or_else(|| ProcessingError::Extraction(format!("No extractor registered for mode: {}", mode)))?;
    extractor.extract(data, filename).await
  }
}

fn check_pdf_header(data: &[u8], filename: &str) -> Result<(), ProcessingError> {
  if data.is_empty() {
    return Err(ProcessingError::Extraction(format!("File '{}' is empty", filename)));
  }
  if !data.starts_with(b"%PDF") {
    return Err(ProcessingError::Extraction(format!(
      "File '{}' is not a valid PDF (missing %PDF header)",
      filename
    )));
  }
  Ok(())
}

/// `# filename` followed by one `## Page n` section per page.
pub fn render_markdown(filename: &str, pages: &[&str]) -> String {
  let mut markdown = format!("# {}\n\n", filename);
  for (idx, page) in pages.iter().enumerate() {
    let text = if page.trim().is_empty() {
      warn!(filename, page = idx + 1, "No text on page");
      EMPTY_PAGE_PLACEHOLDER
    } else {
      page.trim_end()
    };
    markdown.push_str(&format!("## Page {}\n\n{}\n\n", idx + 1, text));
  }
  markdown
}

/// pdftotext ends every page with a form feed.
pub fn split_pages(text: &str) -> Vec<&str> {
  let mut pages: Vec<&str> = text.split('\u{c}').collect();
  if pages.len() > 1 && pages.last().is_some_and(|p| p.trim().is_empty()) {
    pages.pop();
  }
  pages
}

/// Local text-layer extraction with `pdftotext` (poppler-utils).
pub struct PdfTextExtractor {
  timeout: Duration,
}

impl Default for PdfTextExtractor {
  fn default() -> Self {
    Self {
      timeout: Duration::from_secs(120),
    }
  }
}

impl PdfTextExtractor {
  pub fn with_timeout(timeout: Duration) -> Self {
    Self { timeout }
  }
}

#[async_trait]
impl Extractor for PdfTextExtractor {
  fn mode(&self) -> ExtractionMode {
    ExtractionMode::Local
  }

  async fn extract(&self, data: &[u8], filename: &str) -> Result<String, ProcessingError> {
    check_pdf_header(data, filename)?;
    info!(filename, "Starting local PDF extraction");

    let mut tmpfile = NamedTempFile::new()
      .map_err(|e| ProcessingError::Extraction(format!("Failed to create temp file: {}", e)))?;
    tmpfile
      .write_all(data)
      .map_err(|e| ProcessingError::Extraction(format!("Failed to write temp file: {}", e)))?;

    let output = tokio::time::timeout(
      self.timeout,
      Command::new("pdftotext")
        .arg("-enc")
        .arg("UTF-8")
        .arg(tmpfile.path())
        .arg("-")
        .output(),
    )
    .await
    .map_err(|_| ProcessingError::Extraction(format!("pdftotext timed out after {}s", self.timeout.as_secs())))?
    .map_err(|e| ProcessingError::Extraction(format!("Failed to run pdftotext: {}", e)))?;

    if !output.status.success() {
      let stderr = String::from_utf8_lossy(&output.stderr);
      return Err(ProcessingError::Extraction(format!(
        "pdftotext failed ({}): {}",
        output.status,
        stderr.trim()
      )));
    }

    let text = String::from_utf8_lossy(&output.stdout);
    let pages = split_pages(&text);
    debug!(filename, pages = pages.len(), "Extracted text layer");
    Ok(render_markdown(filename, &pages))
  }
}

/// Transcription of the whole PDF by Gemini.
pub struct GeminiExtractor {
  client: Arc<GeminiClient>,
}

impl GeminiExtractor {
  pub fn new(client: Arc<GeminiClient>) -> Self {
    Self { client }
  }
}

#[async_trait]
impl Extractor for GeminiExtractor {
  fn mode(&self) -> ExtractionMode {
    ExtractionMode::Gemini
  }

  async fn extract(&self, data: &[u8], filename: &str) -> Result<String, ProcessingError> {
    check_pdf_header(data, filename)?;
    info!(filename, "Starting Gemini extraction");
    let body = self
      .client
      .generate_with_document(PAGE_PROMPT, data, "application/pdf")
      .await?;
    Ok(format!("# {}\n\n{}\n", filename, body.trim()))
  }
}
