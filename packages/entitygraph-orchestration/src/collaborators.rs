//! External collaborators consumed by the pipeline
//!
//! - `ContentSource`: the corpus
//! - `EntityExtractor`: the AI extraction service
//! - `Materializer`: cached per-document representations

use async_trait::async_trait;
use entitygraph_storage::DocumentId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::PipelineError;

/// Content item as delivered by the corpus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    #[serde(default)]
    pub title: String,
    /// Raw body, possibly with markup
    #[serde(alias = "body")]
    pub raw_body: String,
    #[serde(default = "default_status")]
    pub status: String,
    #[serde(default = "default_content_type")]
    pub content_type: String,
}

fn default_status() -> String {
    "publish".to_string()
}

fn default_content_type() -> String {
    "post".to_string()
}

#[async_trait]
pub trait ContentSource: Send + Sync {
    /// Ids of documents eligible for extraction, ascending
    async fn list_eligible_documents(
        &self,
        content_type: Option<&str>,
        force: bool,
    ) -> anyhow::Result<Vec<DocumentId>>;

    async fn get_document(&self, id: DocumentId) -> anyhow::Result<Option<Document>>;
}

/// One raw entity candidate returned by the extractor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedCandidate {
    pub name: String,
    /// Free-form type label, mapped leniently onto an entity type
    #[serde(rename = "type", alias = "entity_type")]
    pub entity_type: String,
    pub confidence: f64,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub aliases: Vec<String>,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExtractionError {
    #[error("Rate limited: {0}")]
    RateLimit(String),

    #[error("Extraction failed: {0}")]
    Other(String),
}

impl From<ExtractionError> for PipelineError {
    fn from(err: ExtractionError) -> Self {
        match err {
            ExtractionError::RateLimit(msg) => PipelineError::RateLimited(msg),
            ExtractionError::Other(msg) => PipelineError::Item(msg),
        }
    }
}

#[async_trait]
pub trait EntityExtractor: Send + Sync {
    async fn extract(
        &self,
        text: &str,
        prompt_override: Option<&str>,
        model_override: Option<&str>,
    ) -> Result<Vec<ExtractedCandidate>, ExtractionError>;
}

#[async_trait]
pub trait Materializer: Send + Sync {
    /// Rebuild and cache the representation of `document_id`. Idempotent.
    async fn regenerate(&self, document_id: DocumentId) -> anyhow::Result<()>;

    /// Drop the cached representation of `document_id`
    async fn invalidate(&self, document_id: DocumentId) -> anyhow::Result<()>;

    async fn get_cached(&self, document_id: DocumentId) -> anyhow::Result<Option<String>>;
}
