//! Map-reduce summarization of documents of any length.
//!
//! Text longer than `max_words` is cut into contiguous word chunks, each chunk
//! is summarized on its own, the partial summaries are joined as numbered
//! sections and one last call condenses them. The joined sections are not
//! re-chunked, so a document with very many chunks can still hand the final
//! call more than `max_words` words.

use std::sync::Arc;

use tracing::{error, info};

use crate::errors::GenerationError;
use crate::gemini::TextGenerator;

pub const SUMMARY_ERROR_PREFIX: &str = "Error generating summary";

pub fn count_words(text: &str) -> usize {
  text.split_whitespace().count()
}

/// Split on whitespace into chunks of exactly `chunk_size` words (the last
/// may be shorter), each re-joined with single spaces.
pub fn chunk_words(text: &str, chunk_size: usize) -> Vec<String> {
  let words: Vec<&str> = text.split_whitespace().collect();
  words.chunks(chunk_size.max(1)).map(|chunk| chunk.join(" ")).collect()
}

fn document_prompt(text: &str) -> String {
  format!(
    "Please provide a comprehensive summary of the following document.\n\n\
     Document content:\n{}\n\n\
     Provide a clear, concise summary that captures the main points, key findings, and important details.",
    text
  )
}

fn chunk_prompt(part: usize, parts: usize, chunk: &str) -> String {
  format!(
    "Please provide a concise summary of this section of a document (part {} of {}).\n\
     Focus on key points and important information.\n\n\
     Content:\n{}\n\n\
     Summary:",
    part, parts, chunk
  )
}

fn final_prompt(sections: &str) -> String {
  format!(
    "Based on the following section summaries from a document, create a comprehensive final summary.\n\
     Synthesize the information into a cohesive summary that captures the overall content, main themes, and key points.\n\n\
     Section Summaries:\n{}\n\n\
     Final Comprehensive Summary:",
    sections
  )
}

/// `Section 1: ...` blocks separated by blank lines.
pub fn combine_sections(partials: &[String]) -> String {
  partials
    .iter()
    .enumerate()
    .map(|(idx, summary)| format!("Section {}: {}", idx + 1, summary))
    .collect::<Vec<_>>()
    .join("\n\n")
}

pub struct ChunkedSummarizer {
  generator: Arc<dyn TextGenerator>,
  max_words: usize,
}

impl ChunkedSummarizer {
  pub fn new(generator: Arc<dyn TextGenerator>, max_words: usize) -> Self {
    Self {
      generator,
      max_words: max_words.max(1),
    }
  }

  pub fn max_words(&self) -> usize {
    self.max_words
  }

  /// Never fails: a generation error becomes the summary text.
  pub async fn summarize(&self, text: &str, filename: &str) -> String {
    match self.try_summarize(text, filename).await {
      Ok(summary) => summary,
      Err(e) => {
        error!(filename, error = %e, "Summarization failed");
        format!("{}: {}", SUMMARY_ERROR_PREFIX, e)
      }
    }
  }

  pub async fn try_summarize(&self, text: &str, filename: &str) -> Result<String, GenerationError> {
    let word_count = count_words(text);
    if word_count <= self.max_words {
      info!(filename, word_count, "Summarizing in a single pass");
      let summary = self.generator.generate(&document_prompt(text)).await?;
      return Ok(summary.trim().to_string());
    }

    let chunks = chunk_words(text, self.max_words);
    info!(filename, word_count, chunks = chunks.len(), "Summarizing in chunks");

    let mut partials = Vec::with_capacity(chunks.len());
    for (idx, chunk) in chunks.iter().enumerate() {
      info!(filename, "Summarizing chunk {}/{}", idx + 1, chunks.len());
      let partial = self.generator.generate(&chunk_prompt(idx + 1, chunks.len(), chunk)).await?;
      partials.push(partial.trim().to_string());
    }

    let combined = combine_sections(&partials);
    let summary = self.generator.generate(&final_prompt(&combined)).await?;
    info!(filename, "Summarization complete");
    Ok(summary.trim().to_string())
  }
}
