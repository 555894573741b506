//! Merge & Hierarchy Engine
//!
//! Turns every candidate that concerns one photo into its final tag set:
//! 1. Existing-tag policy pre-filter (`replace` drops them)
//! 2. Exact dedup on the normalized string (max weight, provenance union)
//! 3. Synonym collapse into the better-ranked spelling
//! 4. Containment: only the most specific tags survive, general ones become
//!    ancestors (with optional reinforcement)
//! 5. Existing-tag policy post-filter (`ignore` strips them)
//! 6. Ranking and truncation
//!
//! The merge is a pure function of its input set: candidate order never
//! changes the result.

pub mod hierarchy;
pub mod normalize;

pub use hierarchy::{ContainmentStrategy, HierarchyStrategy};
pub use normalize::normalize_tag;

use crate::types::{
    FinalTag, FinalTagSet, MergePolicy, Provenance, SuppressedTag, SuppressionReason,
    TagCandidate, TagSource,
};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::debug;

/// Working entry while a photo's candidates are merged
#[derive(Debug, Clone)]
struct Entry {
    tag: String,
    provenance: Vec<Provenance>,
    aliases: Vec<String>,
    /// Absorbed spellings only the existing tags contributed
    existing_aliases: Vec<String>,
}

impl Entry {
    fn weight(&self) -> f32 {
        self.provenance
            .iter()
            .map(|p| p.weight)
            .fold(0.0, f32::max)
    }

    fn best_priority(&self) -> u8 {
        self.provenance
            .iter()
            .map(|p| p.source.priority())
            .max()
            .unwrap_or(0)
    }

    fn is_existing_only(&self) -> bool {
        self.provenance
            .iter()
            .all(|p| p.source == TagSource::Existing)
    }

    fn absorb(&mut self, other: Entry) {
        if other.is_existing_only() {
            self.existing_aliases.push(other.tag.clone());
        } else {
            self.aliases.push(other.tag.clone());
        }
        self.aliases.extend(other.aliases);
        self.existing_aliases.extend(other.existing_aliases);
        self.provenance.extend(other.provenance);
        canonicalize_provenance(&mut self.provenance);
        self.aliases.sort();
        self.aliases.dedup();
        self.existing_aliases.sort();
        self.existing_aliases.dedup();
    }

    /// Aliases shown on the final tag
    fn visible_aliases(&self, hides_existing: bool) -> Vec<String> {
        if hides_existing {
            return self.aliases.clone();
        }
        let mut all: Vec<String> = self
            .aliases
            .iter()
            .chain(&self.existing_aliases)
            .cloned()
            .collect();
        all.sort();
        all.dedup();
        all
    }
}

/// Sort provenance and keep one entry (the heaviest) per source/source_ref
fn canonicalize_provenance(provenance: &mut Vec<Provenance>) {
    provenance.sort_by(|a, b| {
        (a.source, &a.source_ref)
            .cmp(&(b.source, &b.source_ref))
            .then_with(|| b.weight.total_cmp(&a.weight))
    });
    provenance.dedup_by(|later, earlier| {
        later.source == earlier.source && later.source_ref == earlier.source_ref
    });
}

/// Rank order: weight desc, best source priority desc, tag asc
fn rank(
    a_weight: f32,
    a_priority: u8,
    a_tag: &str,
    b_weight: f32,
    b_priority: u8,
    b_tag: &str,
) -> Ordering {
    b_weight
        .total_cmp(&a_weight)
        .then_with(|| b_priority.cmp(&a_priority))
        .then_with(|| a_tag.cmp(b_tag))
}

/// Merge engine tunables
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MergeSettings {
    /// Share of the best ancestor weight added to a surviving tag (0 disables)
    pub ancestor_reinforcement: f32,
}

impl Default for MergeSettings {
    fn default() -> Self {
        Self {
            ancestor_reinforcement: 0.1,
        }
    }
}

/// Merge & Hierarchy Engine
pub struct MergeEngine {
    strategy: Arc<dyn HierarchyStrategy>,
    settings: MergeSettings,
}

impl MergeEngine {
    pub fn new(strategy: Arc<dyn HierarchyStrategy>, settings: MergeSettings) -> Self {
        Self { strategy, settings }
    }

    /// Merge all candidates concerning one photo into its final tag set
    ///
    /// # Arguments
    /// * `candidates` - Photo, cluster, EXIF, hint and existing candidates
    /// * `policy` - Existing-tag reconciliation rule
    /// * `max_tags` - Optional truncation limit
    ///
    /// # Returns
    /// Ordered tags (most to least confident) plus suppressed candidates
    pub fn merge(
        &self,
        candidates: &[TagCandidate],
        policy: MergePolicy,
        max_tags: Option<usize>,
    ) -> FinalTagSet {
        let mut suppressed = Vec::new();

        // Step 1: policy pre-filter + exact dedup
        let mut by_tag: BTreeMap<String, Entry> = BTreeMap::new();
        for candidate in candidates {
            if policy == MergePolicy::Replace && candidate.source == TagSource::Existing {
                continue;
            }
            let entry = by_tag.entry(candidate.tag.clone()).or_insert_with(|| Entry {
                tag: candidate.tag.clone(),
                provenance: Vec::new(),
                aliases: Vec::new(),
                existing_aliases: Vec::new(),
            });
            entry.provenance.push(candidate.provenance());
        }
        let mut entries: Vec<Entry> = by_tag
            .into_values()
            .map(|mut e| {
                canonicalize_provenance(&mut e.provenance);
                e
            })
            .collect();

        // Step 2: synonym collapse, best-ranked spelling wins
        entries.sort_by(|a, b| self.collapse_order(a, b, policy));
        let mut collapsed: Vec<Entry> = Vec::with_capacity(entries.len());
        for entry in entries {
            let target = collapsed
                .iter()
                .position(|kept| self.strategy.are_synonyms(&kept.tag, &entry.tag));
            match target {
                Some(index) => {
                    suppressed.push(SuppressedTag {
                        tag: entry.tag.clone(),
                        weight: entry.weight(),
                        provenance: entry.provenance.clone(),
                        reason: SuppressionReason::Synonym {
                            of: collapsed[index].tag.clone(),
                        },
                    });
                    collapsed[index].absorb(entry);
                }
                None => collapsed.push(entry),
            }
        }

        // Step 3: containment
        let n = collapsed.len();
        let mut more_specific: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (g, general) in collapsed.iter().enumerate() {
            for (s, specific) in collapsed.iter().enumerate() {
                if g != s && self.strategy.is_more_general(&general.tag, &specific.tag) {
                    more_specific[g].push(s);
                }
            }
        }
        let survivors = resolve_survivors(&collapsed, &more_specific);

        // Step 4: existing-tag post-filter
        let hides_existing = policy == MergePolicy::Ignore;
        let visible_weight = |entry: &Entry| -> Option<f32> {
            if hides_existing {
                let visible: Vec<f32> = entry
                    .provenance
                    .iter()
                    .filter(|p| p.source != TagSource::Existing)
                    .map(|p| p.weight)
                    .collect();
                if visible.is_empty() {
                    None
                } else {
                    Some(visible.into_iter().fold(0.0, f32::max))
                }
            } else {
                Some(entry.weight())
            }
        };

        let mut kept: Vec<FinalTag> = Vec::new();
        for (index, entry) in collapsed.iter().enumerate() {
            if !survivors[index] {
                let by = self.subsumed_by(index, &collapsed, &more_specific, &survivors);
                suppressed.push(SuppressedTag {
                    tag: entry.tag.clone(),
                    weight: entry.weight(),
                    provenance: entry.provenance.clone(),
                    reason: SuppressionReason::Subsumed { by },
                });
                continue;
            }

            let Some(base_weight) = visible_weight(entry) else {
                suppressed.push(SuppressedTag {
                    tag: entry.tag.clone(),
                    weight: entry.weight(),
                    provenance: entry.provenance.clone(),
                    reason: SuppressionReason::ExistingOnly,
                });
                continue;
            };

            // Ancestors: every general term this tag subsumes that is visible
            let mut ancestors = BTreeSet::new();
            let mut best_ancestor = 0.0f32;
            for (g, general) in collapsed.iter().enumerate() {
                if more_specific[g].contains(&index) && !survivors[g] {
                    if let Some(w) = visible_weight(general) {
                        ancestors.insert(general.tag.clone());
                        best_ancestor = best_ancestor.max(w);
                    }
                }
            }

            let weight = (base_weight + self.settings.ancestor_reinforcement * best_ancestor)
                .min(1.0);

            let provenance = if hides_existing {
                entry
                    .provenance
                    .iter()
                    .filter(|p| p.source != TagSource::Existing)
                    .cloned()
                    .collect()
            } else {
                entry.provenance.clone()
            };

            kept.push(FinalTag {
                tag: entry.tag.clone(),
                weight,
                provenance,
                ancestors: ancestors.into_iter().collect(),
                aliases: entry.visible_aliases(hides_existing),
            });
        }

        // Step 5: ranking + truncation
        kept.sort_by(|a, b| {
            rank(
                a.weight,
                a.best_priority(),
                &a.tag,
                b.weight,
                b.best_priority(),
                &b.tag,
            )
        });
        if let Some(limit) = max_tags {
            if kept.len() > limit {
                for tag in kept.split_off(limit) {
                    suppressed.push(SuppressedTag {
                        tag: tag.tag,
                        weight: tag.weight,
                        provenance: tag.provenance,
                        reason: SuppressionReason::Truncated,
                    });
                }
            }
        }

        suppressed.sort_by(|a, b| a.tag.cmp(&b.tag));

        debug!(
            candidates = candidates.len(),
            kept = kept.len(),
            suppressed = suppressed.len(),
            policy = %policy,
            "Merged photo tags"
        );

        FinalTagSet {
            tags: kept,
            suppressed,
        }
    }

    /// Synonym collapse order; context-only existing tags go last under
    /// `ignore` so they never become the visible spelling
    fn collapse_order(&self, a: &Entry, b: &Entry, policy: MergePolicy) -> Ordering {
        let context_last = |e: &Entry| policy == MergePolicy::Ignore && e.is_existing_only();
        context_last(a)
            .cmp(&context_last(b))
            .then_with(|| {
                rank(
                    a.weight(),
                    a.best_priority(),
                    &a.tag,
                    b.weight(),
                    b.best_priority(),
                    &b.tag,
                )
            })
    }

    /// Best-ranked specific tag responsible for suppressing `index`,
    /// preferring surviving tags
    fn subsumed_by(
        &self,
        index: usize,
        entries: &[Entry],
        more_specific: &[Vec<usize>],
        survivors: &[bool],
    ) -> String {
        let mut options: Vec<usize> = more_specific[index].clone();
        options.sort_by(|&a, &b| {
            survivors[b].cmp(&survivors[a]).then_with(|| {
                rank(
                    entries[a].weight(),
                    entries[a].best_priority(),
                    &entries[a].tag,
                    entries[b].weight(),
                    entries[b].best_priority(),
                    &entries[b].tag,
                )
            })
        });
        options
            .first()
            .map(|&i| entries[i].tag.clone())
            .unwrap_or_default()
    }
}

impl Default for MergeEngine {
    fn default() -> Self {
        Self::new(Arc::new(ContainmentStrategy::new()), MergeSettings::default())
    }
}

/// Keep every tag nothing is more specific than; then restore, in rank
/// order, any dominated tag from which no survivor is reachable (a cycle
/// in a custom strategy must keep at least one member)
fn resolve_survivors(entries: &[Entry], more_specific: &[Vec<usize>]) -> Vec<bool> {
    let n = entries.len();
    let mut survivors: Vec<bool> = (0..n).map(|i| more_specific[i].is_empty()).collect();

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| {
        rank(
            entries[a].weight(),
            entries[a].best_priority(),
            &entries[a].tag,
            entries[b].weight(),
            entries[b].best_priority(),
            &entries[b].tag,
        )
    });

    for &start in &order {
        if survivors[start] {
            continue;
        }
        let mut seen = vec![false; n];
        let mut stack = vec![start];
        let mut reaches_survivor = false;
        while let Some(node) = stack.pop() {
            if seen[node] {
                continue;
            }
            seen[node] = true;
            if survivors[node] {
                reaches_survivor = true;
                break;
            }
            stack.extend(more_specific[node].iter().copied());
        }
        if !reaches_survivor {
            survivors[start] = true;
        }
    }

    survivors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ClusterId, PhotoId, SourceRef};

    fn photo_ai(tag: &str, weight: f32) -> TagCandidate {
        TagCandidate::new(tag, TagSource::PhotoAi, SourceRef::Photo(PhotoId::new("p1")), weight)
            .unwrap()
    }

    fn group_ai(tag: &str, weight: f32) -> TagCandidate {
        TagCandidate::new(
            tag,
            TagSource::GroupAi,
            SourceRef::Cluster(ClusterId::numbered(1)),
            weight,
        )
        .unwrap()
    }

    fn existing(tag: &str, weight: f32) -> TagCandidate {
        TagCandidate::new(tag, TagSource::Existing, SourceRef::Photo(PhotoId::new("p1")), weight)
            .unwrap()
    }

    #[test]
    fn test_specific_tag_subsumes_general() {
        let engine = MergeEngine::default();
        let result = engine.merge(
            &[
                photo_ai("gothic architecture", 0.7),
                photo_ai("cathedral", 0.7),
                photo_ai("Rouen Cathedral", 0.7),
            ],
            MergePolicy::Merge,
            None,
        );

        assert_eq!(result.names(), vec!["rouen cathedral", "gothic architecture"]);
        let rouen = result.get("rouen cathedral").unwrap();
        assert_eq!(rouen.ancestors, vec!["cathedral".to_string()]);
        assert!((rouen.weight - 0.77).abs() < 1e-6);
        assert_eq!(result.get("gothic architecture").unwrap().weight, 0.7);
        assert_eq!(result.suppressed.len(), 1);
        assert_eq!(
            result.suppressed[0].reason,
            SuppressionReason::Subsumed {
                by: "rouen cathedral".to_string()
            }
        );
    }

    #[test]
    fn test_general_term_reports_best_specific_tag() {
        let engine = MergeEngine::default();
        let result = engine.merge(
            &[
                photo_ai("architecture", 0.5),
                photo_ai("gothic architecture", 0.6),
                group_ai("modern architecture", 0.8),
            ],
            MergePolicy::Merge,
            None,
        );

        assert_eq!(result.names(), vec!["modern architecture", "gothic architecture"]);
        assert_eq!(
            result.suppressed[0].reason,
            SuppressionReason::Subsumed {
                by: "modern architecture".to_string()
            }
        );
    }

    #[test]
    fn test_reinforcement_can_be_disabled() {
        let engine = MergeEngine::new(
            Arc::new(ContainmentStrategy::new()),
            MergeSettings {
                ancestor_reinforcement: 0.0,
            },
        );
        let result = engine.merge(
            &[photo_ai("cathedral", 0.9), photo_ai("rouen cathedral", 0.6)],
            MergePolicy::Merge,
            None,
        );
        assert_eq!(result.get("rouen cathedral").unwrap().weight, 0.6);
    }

    #[test]
    fn test_exact_duplicates_merge_provenance() {
        let engine = MergeEngine::default();
        let result = engine.merge(
            &[photo_ai("paris", 0.7), group_ai("Paris", 0.6)],
            MergePolicy::Merge,
            None,
        );

        assert_eq!(result.len(), 1);
        let paris = result.get("paris").unwrap();
        assert_eq!(paris.weight, 0.7);
        assert_eq!(paris.provenance.len(), 2);
        assert!(paris.has_source(TagSource::GroupAi));
        assert!(paris.has_source(TagSource::PhotoAi));
    }

    #[test]
    fn test_synonyms_collapse_into_better_ranked() {
        let engine = MergeEngine::default();
        let result = engine.merge(
            &[photo_ai("automobile", 0.6), group_ai("car", 0.8)],
            MergePolicy::Merge,
            None,
        );

        assert_eq!(result.names(), vec!["car"]);
        let car = result.get("car").unwrap();
        assert_eq!(car.aliases, vec!["automobile".to_string()]);
        assert_eq!(car.provenance.len(), 2);
        assert_eq!(
            result.suppressed[0].reason,
            SuppressionReason::Synonym {
                of: "car".to_string()
            }
        );
    }

    #[test]
    fn test_merge_policy_keeps_existing() {
        let engine = MergeEngine::default();
        let result = engine.merge(
            &[existing("paris", 0.7), photo_ai("eiffel tower", 0.7)],
            MergePolicy::Merge,
            None,
        );
        assert_eq!(result.names(), vec!["eiffel tower", "paris"]);
    }

    #[test]
    fn test_replace_policy_drops_existing() {
        let engine = MergeEngine::default();
        let result = engine.merge(
            &[existing("paris", 0.7), photo_ai("eiffel tower", 0.7)],
            MergePolicy::Replace,
            None,
        );
        assert_eq!(result.names(), vec!["eiffel tower"]);
        assert!(result.suppressed.is_empty());
    }

    #[test]
    fn test_ignore_policy_uses_existing_as_context_only() {
        let engine = MergeEngine::default();
        let result = engine.merge(
            &[
                existing("notre dame cathedral", 0.9),
                photo_ai("cathedral", 0.7),
                photo_ai("river", 0.6),
            ],
            MergePolicy::Ignore,
            None,
        );

        assert_eq!(result.names(), vec!["river"]);
        let reasons: Vec<_> = result.suppressed.iter().map(|s| &s.reason).collect();
        assert!(reasons.contains(&&SuppressionReason::ExistingOnly));
        assert!(reasons.contains(&&SuppressionReason::Subsumed {
            by: "notre dame cathedral".to_string()
        }));
    }

    #[test]
    fn test_ignore_strips_existing_provenance_from_shared_tags() {
        let engine = MergeEngine::default();
        let result = engine.merge(
            &[existing("paris", 0.95), photo_ai("paris", 0.7)],
            MergePolicy::Ignore,
            None,
        );

        let paris = result.get("paris").unwrap();
        assert_eq!(paris.weight, 0.7, "Existing weight must not leak");
        assert!(!paris.has_source(TagSource::Existing));
    }

    #[test]
    fn test_ignore_hides_existing_only_aliases() {
        let engine = MergeEngine::default();
        let candidates = [existing("automobile", 0.9), photo_ai("car", 0.7)];

        let ignored = engine.merge(&candidates, MergePolicy::Ignore, None);
        assert_eq!(ignored.names(), vec!["car"]);
        let car = ignored.get("car").unwrap();
        assert!(car.aliases.is_empty(), "Existing spelling leaked: {:?}", car.aliases);
        assert!(!car.has_source(TagSource::Existing));

        let merged = engine.merge(&candidates, MergePolicy::Merge, None);
        assert_eq!(merged.names(), vec!["automobile"]);
        assert_eq!(merged.get("automobile").unwrap().aliases, vec!["car".to_string()]);
    }

    #[test]
    fn test_truncation_is_recorded() {
        let engine = MergeEngine::default();
        let result = engine.merge(
            &[photo_ai("a", 0.9), photo_ai("b", 0.8), photo_ai("c", 0.7)],
            MergePolicy::Merge,
            Some(2),
        );
        assert_eq!(result.names(), vec!["a", "b"]);
        assert_eq!(result.suppressed[0].tag, "c");
        assert_eq!(result.suppressed[0].reason, SuppressionReason::Truncated);
    }

    #[test]
    fn test_ties_break_on_priority_then_name() {
        let engine = MergeEngine::default();
        let exif = TagCandidate::new("canon eos r5", TagSource::Exif, SourceRef::Photo(PhotoId::new("p1")), 0.7)
            .unwrap();
        let result = engine.merge(
            &[photo_ai("beach", 0.7), photo_ai("apple", 0.7), exif],
            MergePolicy::Merge,
            None,
        );
        assert_eq!(result.names(), vec!["canon eos r5", "apple", "beach"]);
    }

    #[test]
    fn test_order_independence() {
        let engine = MergeEngine::default();
        let mut candidates = vec![
            photo_ai("cathedral", 0.7),
            group_ai("rouen", 0.6),
            photo_ai("rouen cathedral", 0.7),
            existing("architecture", 0.7),
            photo_ai("gothic architecture", 0.65),
            group_ai("car", 0.6),
            photo_ai("automobile", 0.6),
        ];
        let expected = engine.merge(&candidates, MergePolicy::Merge, Some(4));

        candidates.reverse();
        assert_eq!(engine.merge(&candidates, MergePolicy::Merge, Some(4)), expected);

        candidates.rotate_left(3);
        assert_eq!(engine.merge(&candidates, MergePolicy::Merge, Some(4)), expected);
    }

    #[test]
    fn test_empty_input_gives_empty_set() {
        let engine = MergeEngine::default();
        let result = engine.merge(&[], MergePolicy::Merge, None);
        assert!(result.is_empty());
        assert!(result.suppressed.is_empty());
    }

    struct CyclicStrategy;

    impl HierarchyStrategy for CyclicStrategy {
        fn is_more_general(&self, general: &str, specific: &str) -> bool {
            matches!((general, specific), ("a", "b") | ("b", "a"))
        }

        fn are_synonyms(&self, a: &str, b: &str) -> bool {
            a == b
        }
    }

    #[test]
    fn test_cycle_never_removes_every_member() {
        let engine = MergeEngine::new(Arc::new(CyclicStrategy), MergeSettings::default());
        let result = engine.merge(
            &[photo_ai("a", 0.8), photo_ai("b", 0.6)],
            MergePolicy::Merge,
            None,
        );
        assert_eq!(result.names(), vec!["a"]);
    }
}
