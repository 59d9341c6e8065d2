use async_trait::async_trait;
use entitygraph_storage::{DocumentId, EntityId, NewMention};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

use crate::checkpoint::{accumulators, Cursor};
use crate::dedup::RawCandidate;
use crate::error::Result;
use crate::phase::{BatchReport, Phase};
use crate::phases::deduplication::GroupMapping;
use crate::phases::{escalate_persistence, window};
use crate::pipeline::{PhaseContext, PhaseHandler};

/// Phase 4: write one mention per (entity, document) of every resolved group
///
/// The primary entity of a document is the co-occurring entity with the
/// widest document breadth across the whole run, lowest id on ties.
pub struct LinkingPhase;

impl LinkingPhase {
    async fn primary_by_document(
        &self,
        ctx: &PhaseContext,
        keys: &[String],
    ) -> Result<BTreeMap<DocumentId, EntityId>> {
        let checkpoints = ctx.checkpoints();
        if let Some(primary) = checkpoints
            .load_accumulator(Phase::Linking, accumulators::PRIMARY_BY_DOCUMENT)
            .await?
        {
            return Ok(primary);
        }

        let mut breadth: BTreeMap<EntityId, BTreeSet<DocumentId>> = BTreeMap::new();
        for key in keys {
            let mapping: Option<GroupMapping> = checkpoints
                .load_accumulator(Phase::Deduplication, &accumulators::mapping(key))
                .await?;
            if let Some(mapping) = mapping {
                breadth
                    .entry(mapping.entity_id)
                    .or_default()
                    .extend(mapping.documents());
            }
        }

        let primary = primary_entities(&breadth);
        checkpoints
            .save_accumulator(Phase::Linking, accumulators::PRIMARY_BY_DOCUMENT, &primary)
            .await?;
        info!(
            "Linking: {} entities across {} documents",
            breadth.len(),
            primary.len()
        );
        Ok(primary)
    }
}

/// Per document, the entity with the most documents overall
pub(crate) fn primary_entities(
    breadth: &BTreeMap<EntityId, BTreeSet<DocumentId>>,
) -> BTreeMap<DocumentId, EntityId> {
    let mut primary: BTreeMap<DocumentId, (usize, EntityId)> = BTreeMap::new();
    // ascending entity id, so strict `>` keeps the lowest id on ties
    for (&entity_id, documents) in breadth {
        let width = documents.len();
        for &doc in documents {
            let slot = primary.entry(doc).or_insert((width, entity_id));
            if width > slot.0 {
                *slot = (width, entity_id);
            }
        }
    }
    primary.into_iter().map(|(doc, (_, id))| (doc, id)).collect()
}

/// Context of the most confident candidate whose snippet contains one of the
/// group's spellings (case-insensitive), else of the most confident
/// candidate with any snippet.
pub(crate) fn best_context(candidates: &[&RawCandidate], variants: &[String]) -> Option<String> {
    let lowered: Vec<String> = variants.iter().map(|v| v.to_lowercase()).collect();
    let by_confidence = |a: &&&RawCandidate, b: &&&RawCandidate| a.confidence.total_cmp(&b.confidence);

    let with_context = || candidates.iter().filter(|c| c.context.is_some());
    let matching = with_context()
        .filter(|c| {
            let snippet = c.context.as_deref().unwrap_or_default().to_lowercase();
            lowered.iter().any(|v| snippet.contains(v.as_str()))
        })
        .max_by(by_confidence);

    matching
        .or_else(|| with_context().max_by(by_confidence))
        .and_then(|c| c.context.clone())
}

#[async_trait]
impl PhaseHandler for LinkingPhase {
    fn phase(&self) -> Phase {
        Phase::Linking
    }

    async fn run_batch(&self, ctx: &PhaseContext) -> Result<BatchReport> {
        let checkpoints = ctx.checkpoints();
        let store = &ctx.services.store;

        let keys: Vec<String> = checkpoints
            .load_accumulator(Phase::Deduplication, accumulators::GROUP_KEYS)
            .await?
            .unwrap_or_default();
        let primary = self.primary_by_document(ctx, &keys).await?;
        let offset = checkpoints
            .load_checkpoint(Phase::Linking)
            .await?
            .map(|cp| cp.cursor.offset() as usize)
            .unwrap_or(0);
        let batch_size = ctx.run.batch_size;
        let batch = window(&keys, offset, batch_size);

        let mut report = BatchReport {
            total: keys.len() as u64,
            batch_size,
            ..Default::default()
        };

        for key in batch {
            let mapping: Option<GroupMapping> = checkpoints
                .load_accumulator(Phase::Deduplication, &accumulators::mapping(key))
                .await?;
            let Some(mapping) = mapping else {
                report.skipped += 1;
                continue;
            };
            let Some(entity_id) = store.canonical_id(mapping.entity_id).await? else {
                debug!("Linking: entity {} no longer exists", mapping.entity_id);
                report.skipped += 1;
                continue;
            };

            let mut by_document: BTreeMap<DocumentId, Vec<&RawCandidate>> = BTreeMap::new();
            for candidate in &mapping.candidates {
                by_document.entry(candidate.document_id).or_default().push(candidate);
            }

            let mut failed = false;
            for (document_id, candidates) in &by_document {
                let confidence = candidates
                    .iter()
                    .map(|c| c.confidence)
                    .fold(0.0, f64::max);
                let mut mention = NewMention::new(entity_id, *document_id, confidence)
                    .primary(primary.get(document_id) == Some(&mapping.entity_id));
                mention.context = best_context(candidates, &mapping.variants);

                if let Err(e) = escalate_persistence(store.link_mention(&mention).await)? {
                    warn!(
                        "Linking: entity {} document {} failed: {}",
                        entity_id, document_id, e
                    );
                    failed = true;
                }
            }

            if failed {
                report.failed += 1;
            } else {
                report.processed += 1;
            }
        }

        let next = offset + batch.len();
        if !batch.is_empty() {
            checkpoints
                .save_cursor(Phase::Linking, Cursor::Offset(next as u64))
                .await?;
        }
        report.exhausted = next >= keys.len();
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(doc: DocumentId, confidence: f64, context: Option<&str>) -> RawCandidate {
        RawCandidate {
            document_id: doc,
            name: "OpenAI".into(),
            entity_type: "ORG".into(),
            confidence,
            context: context.map(String::from),
            aliases: vec![],
        }
    }

    #[test]
    fn test_primary_is_global_breadth() {
        let breadth = BTreeMap::from([
            (1, BTreeSet::from([10, 11, 12])),
            (2, BTreeSet::from([10])),
            (3, BTreeSet::from([11, 13])),
        ]);
        let primary = primary_entities(&breadth);
        assert_eq!(primary[&10], 1);
        assert_eq!(primary[&11], 1);
        assert_eq!(primary[&13], 3);
    }

    #[test]
    fn test_primary_tie_takes_lowest_id() {
        let breadth = BTreeMap::from([(5, BTreeSet::from([1, 2])), (4, BTreeSet::from([2, 3]))]);
        assert_eq!(primary_entities(&breadth)[&2], 4);
    }

    #[test]
    fn test_best_context_prefers_matching_snippet() {
        let a = raw(1, 0.9, Some("the company announced"));
        let b = raw(1, 0.6, Some("openai released a model"));
        let variants = vec!["OpenAI".to_string()];
        assert_eq!(
            best_context(&[&a, &b], &variants).as_deref(),
            Some("openai released a model")
        );
    }

    #[test]
    fn test_best_context_falls_back_to_confidence() {
        let a = raw(1, 0.4, Some("low"));
        let b = raw(1, 0.8, Some("high"));
        let c = raw(1, 0.95, None);
        let variants = vec!["Anthropic".to_string()];
        assert_eq!(best_context(&[&a, &b, &c], &variants).as_deref(), Some("high"));
        assert_eq!(best_context(&[&c], &variants), None);
    }
}
