//! Candidate grouping and canonical-name selection
//!
//! Raw candidates are clustered by [`grouping_key`]. Inside a group each
//! distinct literal spelling is scored `0.1 * chars + 10 * confidence` on
//! first sight and earns `+5` on every recurrence; the best-scoring spelling
//! becomes the canonical name, ties going to the spelling seen first.

use entitygraph_storage::{clamp_confidence, grouping_key, DocumentId, EntityType};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};

use crate::collaborators::ExtractedCandidate;

const LENGTH_WEIGHT: f64 = 0.1;
const CONFIDENCE_WEIGHT: f64 = 10.0;
const RECURRENCE_BONUS: f64 = 5.0;

/// Extraction candidate tagged with its source document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawCandidate {
    pub document_id: DocumentId,
    pub name: String,
    pub entity_type: String,
    pub confidence: f64,
    pub context: Option<String>,
    pub aliases: Vec<String>,
}

impl RawCandidate {
    pub fn from_extracted(document_id: DocumentId, candidate: ExtractedCandidate) -> Self {
        Self {
            document_id,
            name: candidate.name.trim().to_string(),
            entity_type: candidate.entity_type,
            confidence: clamp_confidence(candidate.confidence),
            context: candidate.context,
            aliases: candidate.aliases,
        }
    }
}

/// Cluster candidates by grouping key. Candidates with an empty key are dropped.
pub fn group_candidates(candidates: Vec<RawCandidate>) -> BTreeMap<String, Vec<RawCandidate>> {
    let keyed: Vec<(String, RawCandidate)> = candidates
        .into_par_iter()
        .map(|c| (grouping_key(&c.name), c))
        .collect();

    let mut groups: BTreeMap<String, Vec<RawCandidate>> = BTreeMap::new();
    for (key, candidate) in keyed {
        if key.is_empty() {
            continue;
        }
        groups.entry(key).or_default().push(candidate);
    }
    groups
}

/// Outcome of canonical selection for one group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalChoice {
    pub name: String,
    pub entity_type: EntityType,
    pub confidence: f64,
    /// Distinct literal spellings, first-seen order
    pub variants: Vec<String>,
    /// Non-canonical spellings plus every candidate-supplied alias, deduplicated
    pub aliases: Vec<String>,
    pub documents: BTreeSet<DocumentId>,
}

struct Variant<'a> {
    representative: &'a RawCandidate,
    score: f64,
}

fn base_score(candidate: &RawCandidate) -> f64 {
    LENGTH_WEIGHT * candidate.name.chars().count() as f64 + CONFIDENCE_WEIGHT * candidate.confidence
}

/// Pick the canonical spelling of a group. `None` for an empty group.
pub fn select_canonical(group: &[RawCandidate]) -> Option<CanonicalChoice> {
    let mut variants: Vec<(&str, Variant<'_>)> = Vec::new();
    for candidate in group {
        match variants.iter_mut().find(|(name, _)| *name == candidate.name) {
            Some((_, variant)) => {
                variant.score += RECURRENCE_BONUS;
                if candidate.confidence > variant.representative.confidence {
                    variant.representative = candidate;
                }
            }
            None => variants.push((
                candidate.name.as_str(),
                Variant {
                    representative: candidate,
                    score: base_score(candidate),
                },
            )),
        }
    }

    let mut winner: Option<&Variant<'_>> = None;
    for (_, variant) in &variants {
        if winner.map_or(true, |best| variant.score > best.score) {
            winner = Some(variant);
        }
    }
    let winner = winner?.representative;

    let mut seen = HashSet::new();
    seen.insert(winner.name.clone());
    let mut aliases = Vec::new();
    let spellings = variants.iter().map(|(name, _)| name.to_string());
    let supplied = group.iter().flat_map(|c| c.aliases.iter().map(|a| a.trim().to_string()));
    for alias in spellings.chain(supplied) {
        if !alias.is_empty() && seen.insert(alias.clone()) {
            aliases.push(alias);
        }
    }

    Some(CanonicalChoice {
        name: winner.name.clone(),
        entity_type: EntityType::from_label(&winner.entity_type),
        confidence: winner.confidence,
        variants: variants.iter().map(|(name, _)| name.to_string()).collect(),
        aliases,
        documents: group.iter().map(|c| c.document_id).collect(),
    })
}
