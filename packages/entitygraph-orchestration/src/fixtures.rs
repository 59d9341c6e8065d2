//! In-process collaborators for replays, the CLI and tests
//!
//! - `StaticContentSource`: a fixed corpus
//! - `FixtureExtractor`: pre-recorded extraction results keyed by prepared text
//! - `CountingMaterializer`: records regenerations and invalidations

use async_trait::async_trait;
use dashmap::DashMap;
use entitygraph_storage::{
    DocumentId, InMemoryCanonicalStore, InMemoryKeyValueStore, MokaTtlCache,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::collaborators::{
    ContentSource, Document, EntityExtractor, ExtractedCandidate, ExtractionError, Materializer,
};
use crate::pipeline::PipelineServices;
use crate::text::prepare_content;

/// Documents with status `publish` are eligible
#[derive(Debug, Clone, Default)]
pub struct StaticContentSource {
    documents: BTreeMap<DocumentId, Document>,
}

impl StaticContentSource {
    pub fn new(documents: impl IntoIterator<Item = Document>) -> Self {
        Self {
            documents: documents.into_iter().map(|d| (d.id, d)).collect(),
        }
    }

    pub fn documents(&self) -> impl Iterator<Item = &Document> {
        self.documents.values()
    }
}

#[async_trait]
impl ContentSource for StaticContentSource {
    async fn list_eligible_documents(
        &self,
        content_type: Option<&str>,
        _force: bool,
    ) -> anyhow::Result<Vec<DocumentId>> {
        Ok(self
            .documents
            .values()
            .filter(|d| d.status == "publish")
            .filter(|d| content_type.map_or(true, |t| d.content_type == t))
            .map(|d| d.id)
            .collect())
    }

    async fn get_document(&self, id: DocumentId) -> anyhow::Result<Option<Document>> {
        Ok(self.documents.get(&id).cloned())
    }
}

/// Returns recorded candidates for known texts and nothing otherwise
#[derive(Debug, Default)]
pub struct FixtureExtractor {
    responses: DashMap<String, Vec<ExtractedCandidate>>,
}

impl FixtureExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Key each document's candidates by the text Preparation will produce
    pub fn for_corpus(
        source: &StaticContentSource,
        max_chars: usize,
        mut candidates: HashMap<DocumentId, Vec<ExtractedCandidate>>,
    ) -> Self {
        let extractor = Self::new();
        for doc in source.documents() {
            if let Some(found) = candidates.remove(&doc.id) {
                extractor.insert(prepare_content(&doc.title, &doc.raw_body, max_chars), found);
            }
        }
        extractor
    }

    pub fn insert(&self, text: impl Into<String>, candidates: Vec<ExtractedCandidate>) {
        self.responses.insert(text.into(), candidates);
    }
}

#[async_trait]
impl EntityExtractor for FixtureExtractor {
    async fn extract(
        &self,
        text: &str,
        _prompt_override: Option<&str>,
        _model_override: Option<&str>,
    ) -> Result<Vec<ExtractedCandidate>, ExtractionError> {
        Ok(self
            .responses
            .get(text)
            .map(|r| r.value().clone())
            .unwrap_or_default())
    }
}

#[derive(Debug, Default)]
pub struct CountingMaterializer {
    regenerations: DashMap<DocumentId, u32>,
    invalidations: DashMap<DocumentId, u32>,
    cache: DashMap<DocumentId, String>,
}

impl CountingMaterializer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn regenerations(&self, document_id: DocumentId) -> u32 {
        self.regenerations.get(&document_id).map(|c| *c).unwrap_or(0)
    }

    pub fn total_regenerations(&self) -> u64 {
        self.regenerations.iter().map(|c| *c.value() as u64).sum()
    }

    pub fn invalidations(&self, document_id: DocumentId) -> u32 {
        self.invalidations.get(&document_id).map(|c| *c).unwrap_or(0)
    }
}

#[async_trait]
impl Materializer for CountingMaterializer {
    async fn regenerate(&self, document_id: DocumentId) -> anyhow::Result<()> {
        let mut count = self.regenerations.entry(document_id).or_insert(0);
        *count += 1;
        self.cache
            .insert(document_id, format!("document:{}:v{}", document_id, *count));
        Ok(())
    }

    async fn invalidate(&self, document_id: DocumentId) -> anyhow::Result<()> {
        *self.invalidations.entry(document_id).or_insert(0) += 1;
        self.cache.remove(&document_id);
        Ok(())
    }

    async fn get_cached(&self, document_id: DocumentId) -> anyhow::Result<Option<String>> {
        Ok(self.cache.get(&document_id).map(|v| v.value().clone()))
    }
}

/// Services over the in-memory adapters and a [`CountingMaterializer`]
pub fn services_in_memory(
    content: StaticContentSource,
    extractor: FixtureExtractor,
) -> PipelineServices {
    PipelineServices::new(
        Arc::new(InMemoryCanonicalStore::new()),
        Arc::new(InMemoryKeyValueStore::new()),
        Arc::new(MokaTtlCache::default()),
        Arc::new(content),
        Arc::new(extractor),
        Arc::new(CountingMaterializer::new()),
    )
}
