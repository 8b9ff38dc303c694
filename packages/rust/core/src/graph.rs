//! Graph maintenance algorithms: missing-backlink detection and
//! common-neighbor link prediction.
//!
//! Both are pure functions over relation lists; the verification stage
//! fetches the relations and writes the results back.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use pedia_shared::EntityRelation;

/// The reverse of an existing relation that is not stored.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MissingBacklink {
    pub from_entity_id: String,
    pub to_entity_id: String,
    pub relation_type: String,
}

/// A predicted relation from a seed entity to `entity_id`.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkPrediction {
    pub entity_id: String,
    /// `|common neighbors| / |N(seed)|`.
    pub score: f64,
    pub common_neighbors: usize,
}

/// For every relation A→B of type T in `relations`, report B→A of type T if
/// it is not also in `relations`.
///
/// `relations` must contain every relation touching the entities under
/// examination; the reverse of such a relation touches the same entity, so
/// presence in the slice is a complete existence check.
pub fn find_missing_backlinks(relations: &[EntityRelation]) -> Vec<MissingBacklink> {
    let existing: HashSet<(&str, &str, &str)> = relations
        .iter()
        .map(|r| {
            (
                r.from_entity_id.as_str(),
                r.to_entity_id.as_str(),
                r.relation_type.as_str(),
            )
        })
        .collect();

    let mut reported = HashSet::new();
    let mut missing = Vec::new();

    for r in relations {
        if r.from_entity_id == r.to_entity_id {
            continue;
        }
        let reverse = (
            r.to_entity_id.as_str(),
            r.from_entity_id.as_str(),
            r.relation_type.as_str(),
        );
        if !existing.contains(&reverse) && reported.insert(reverse) {
            missing.push(MissingBacklink {
                from_entity_id: r.to_entity_id.clone(),
                to_entity_id: r.from_entity_id.clone(),
                relation_type: r.relation_type.clone(),
            });
        }
    }
    missing
}

/// Direct neighbors of `seed`, in either direction.
pub fn neighbors(seed: &str, relations: &[EntityRelation]) -> BTreeSet<String> {
    relations
        .iter()
        .filter_map(|r| {
            if r.from_entity_id == seed && r.to_entity_id != seed {
                Some(r.to_entity_id.clone())
            } else if r.to_entity_id == seed && r.from_entity_id != seed {
                Some(r.from_entity_id.clone())
            } else {
                None
            }
        })
        .collect()
}

/// Score candidates for new relations from `seed`.
///
/// `neighborhood` is every relation touching `N`, the seed's neighbor set.
/// Relations touching the seed are ignored. A relation with exactly one
/// endpoint in `N` makes its other endpoint a candidate with that endpoint as
/// a common neighbor. Candidates score `|common| / |N|` and the best `top_k`
/// are returned, highest first (ties by entity id).
pub fn predict_links(
    seed: &str,
    neighbor_set: &BTreeSet<String>,
    neighborhood: &[EntityRelation],
    top_k: usize,
) -> Vec<LinkPrediction> {
    if neighbor_set.is_empty() || top_k == 0 {
        return Vec::new();
    }

    let mut common: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for r in neighborhood {
        if r.touches(seed) {
            continue;
        }
        let from_in = neighbor_set.contains(&r.from_entity_id);
        let to_in = neighbor_set.contains(&r.to_entity_id);
        let (via, candidate) = match (from_in, to_in) {
            (true, false) => (r.from_entity_id.as_str(), r.to_entity_id.as_str()),
            (false, true) => (r.to_entity_id.as_str(), r.from_entity_id.as_str()),
            _ => continue,
        };
        common.entry(candidate).or_default().insert(via);
    }

    let n = neighbor_set.len() as f64;
    let mut predictions: Vec<LinkPrediction> = common
        .into_iter()
        .map(|(candidate, via)| LinkPrediction {
            entity_id: candidate.to_string(),
            score: via.len() as f64 / n,
            common_neighbors: via.len(),
        })
        .collect();

    predictions.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.entity_id.cmp(&b.entity_id))
    });
    predictions.truncate(top_k);
    predictions
}
