//! Task independence analysis
//!
//! Two work items are independent when their resolved footprints do not
//! intersect. An item with an empty footprint is low-confidence and is
//! treated as conflicting with every other item. An item whose footprint
//! cannot be resolved is excluded from the analysis altogether and never
//! scheduled as independent.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::{debug, warn};

use crate::footprint::FootprintResolver;
use crate::work_item::{WorkItem, WorkItemId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// Both footprints name at least one common path
    Overlap,
    /// At least one side declared nothing, so overlap cannot be ruled out
    UndeclaredFootprint,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConflictEdge {
    pub first: WorkItemId,
    pub second: WorkItemId,
    pub kind: ConflictKind,
    pub paths: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct AnalysisReport {
    /// Pairs in input order, `(items[i], items[j])` with `i < j`
    pub independent_pairs: Vec<(WorkItemId, WorkItemId)>,
    /// Conflicting pairs keyed in input order, with the sorted shared paths
    pub conflicts: BTreeMap<(WorkItemId, WorkItemId), Vec<String>>,
    pub footprint_map: BTreeMap<WorkItemId, Vec<String>>,
    pub low_confidence: BTreeSet<WorkItemId>,
    pub unanalyzable: BTreeMap<WorkItemId, String>,
    order: Vec<WorkItemId>,
}

impl AnalysisReport {
    pub fn conflicts_between(&self, a: &WorkItemId, b: &WorkItemId) -> Option<&Vec<String>> {
        self.conflicts
            .get(&(a.clone(), b.clone()))
            .or_else(|| self.conflicts.get(&(b.clone(), a.clone())))
    }

    pub fn is_independent(&self, a: &WorkItemId, b: &WorkItemId) -> bool {
        a != b
            && self.footprint_map.contains_key(a)
            && self.footprint_map.contains_key(b)
            && self.conflicts_between(a, b).is_none()
    }

    /// Every conflict touching `id`, as `(other, paths)`
    pub fn conflicts_of(&self, id: &WorkItemId) -> Vec<(WorkItemId, Vec<String>)> {
        self.conflicts
            .iter()
            .filter_map(|((a, b), paths)| {
                if a == id {
                    Some((b.clone(), paths.clone()))
                } else if b == id {
                    Some((a.clone(), paths.clone()))
                } else {
                    None
                }
            })
            .collect()
    }

    pub fn conflict_edges(&self) -> Vec<ConflictEdge> {
        self.conflicts
            .iter()
            .map(|((first, second), paths)| ConflictEdge {
                first: first.clone(),
                second: second.clone(),
                kind: if paths.is_empty() {
                    ConflictKind::UndeclaredFootprint
                } else {
                    ConflictKind::Overlap
                },
                paths: paths.clone(),
            })
            .collect()
    }

    /// Greedy maximal independent subset of `candidates`
    ///
    /// Candidates are visited by priority (highest first), ties broken by id,
    /// and an item is taken when it conflicts with nothing already taken.
    /// Unanalyzable items and items missing from the report are skipped.
    pub fn select_independent(&self, candidates: &[WorkItem], max: usize) -> Vec<WorkItemId> {
        self.select_alongside(candidates, &[], max)
    }

    /// Greedy selection that must also stay clear of `occupied`, the items
    /// already executing; at most `max` new items are returned
    pub fn select_alongside(
        &self,
        candidates: &[WorkItem],
        occupied: &[WorkItemId],
        max: usize,
    ) -> Vec<WorkItemId> {
        let mut ordered: Vec<&WorkItem> = candidates
            .iter()
            .filter(|item| self.footprint_map.contains_key(&item.id))
            .filter(|item| !occupied.contains(&item.id))
            .collect();
        ordered.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));

        let mut chosen: Vec<WorkItemId> = Vec::new();
        for item in ordered {
            if chosen.len() >= max {
                break;
            }
            if occupied
                .iter()
                .chain(chosen.iter())
                .all(|taken| self.conflicts_between(taken, &item.id).is_none())
            {
                chosen.push(item.id.clone());
            }
        }
        chosen
    }

    /// Items in the order they were analyzed
    pub fn analyzed_ids(&self) -> &[WorkItemId] {
        &self.order
    }
}

/// Pairwise footprint analysis, O(n²) in the number of items
pub fn analyze(items: &[WorkItem], resolver: &dyn FootprintResolver) -> AnalysisReport {
    let mut report = AnalysisReport::default();
    let mut seen = HashSet::new();
    let mut resolved: Vec<(WorkItemId, BTreeSet<String>)> = Vec::with_capacity(items.len());

    for item in items {
        if !seen.insert(item.id.clone()) {
            warn!(work_item_id = %item.id, "Duplicate work item in analysis input, ignoring");
            continue;
        }
        match resolver.resolve(item) {
            Ok(paths) => {
                if paths.is_empty() {
                    report.low_confidence.insert(item.id.clone());
                }
                report
                    .footprint_map
                    .insert(item.id.clone(), paths.iter().cloned().collect());
                report.order.push(item.id.clone());
                resolved.push((item.id.clone(), paths));
            }
            Err(e) => {
                warn!(work_item_id = %item.id, error = %e, "Footprint resolution failed");
                report.unanalyzable.insert(item.id.clone(), e.to_string());
            }
        }
    }

    for i in 0..resolved.len() {
        for j in (i + 1)..resolved.len() {
            let (a_id, a_paths) = &resolved[i];
            let (b_id, b_paths) = &resolved[j];
            let pair = (a_id.clone(), b_id.clone());

            if a_paths.is_empty() || b_paths.is_empty() {
                report.conflicts.insert(pair, Vec::new());
                continue;
            }

            let shared: Vec<String> = a_paths.intersection(b_paths).cloned().collect();
            if shared.is_empty() {
                report.independent_pairs.push(pair);
            } else {
                report.conflicts.insert(pair, shared);
            }
        }
    }

    debug!(
        analyzed = report.order.len(),
        independent_pairs = report.independent_pairs.len(),
        conflicts = report.conflicts.len(),
        unanalyzable = report.unanalyzable.len(),
        "Task independence analysis finished"
    );
    report
}
