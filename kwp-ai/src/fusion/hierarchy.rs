//! Tag hierarchy resolution
//!
//! A [`HierarchyStrategy`] decides whether one normalized tag is a more
//! general form of another, and whether two tags mean the same thing.
//! The default [`ContainmentStrategy`] uses word containment plus a synonym
//! table and simple singular/plural folding; an ontology-backed strategy can
//! be swapped in without touching the merge engine.

use super::normalize::{normalize_tag, words};
use once_cell::sync::Lazy;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Pluggable hierarchy relation between normalized tags
pub trait HierarchyStrategy: Send + Sync {
    /// True if `general` is a strictly more general term than `specific`
    fn is_more_general(&self, general: &str, specific: &str) -> bool;

    /// True if both tags have equal specificity and the same meaning
    fn are_synonyms(&self, a: &str, b: &str) -> bool;
}

/// Built-in synonym groups (first entry is the group's canonical term)
static DEFAULT_SYNONYMS: Lazy<Vec<Vec<&'static str>>> = Lazy::new(|| {
    vec![
        vec!["car", "automobile"],
        vec!["photo", "photograph", "picture"],
        vec!["child", "kid"],
        vec!["boat", "vessel"],
        vec!["ocean", "sea"],
        vec!["sunset", "dusk"],
        vec!["sunrise", "dawn"],
        vec!["street", "road"],
        vec!["people", "persons"],
        vec!["dog", "puppy"],
        vec!["cat", "kitten"],
        vec!["forest", "woods"],
    ]
});

/// Containment-based hierarchy with synonym and plural folding
pub struct ContainmentStrategy {
    /// Normalized term -> group index
    group_of: HashMap<String, usize>,
    groups: Vec<Vec<String>>,
}

impl ContainmentStrategy {
    /// Strategy using only the built-in synonym table
    pub fn new() -> Self {
        Self::with_synonyms(&BTreeMap::new())
    }

    /// Strategy using the built-in table extended by configured groups
    ///
    /// # Arguments
    /// * `extra` - Canonical term -> synonyms (from `[engine.synonyms]`)
    pub fn with_synonyms(extra: &BTreeMap<String, Vec<String>>) -> Self {
        let mut strategy = Self {
            group_of: HashMap::new(),
            groups: Vec::new(),
        };

        for group in DEFAULT_SYNONYMS.iter() {
            strategy.add_group(group.iter().copied());
        }
        for (canonical, synonyms) in extra {
            strategy.add_group(
                std::iter::once(canonical.as_str()).chain(synonyms.iter().map(String::as_str)),
            );
        }

        strategy
    }

    fn add_group<'a>(&mut self, terms: impl Iterator<Item = &'a str>) {
        let terms: Vec<String> = terms
            .map(normalize_tag)
            .filter(|t| !t.is_empty())
            .collect();
        if terms.len() < 2 {
            return;
        }

        // A term already in a group pulls the new terms into that group
        let existing = terms.iter().find_map(|t| self.group_of.get(t).copied());
        let index = match existing {
            Some(index) => index,
            None => {
                self.groups.push(Vec::new());
                self.groups.len() - 1
            }
        };

        for term in terms {
            if !self.group_of.contains_key(&term) {
                self.group_of.insert(term.clone(), index);
                self.groups[index].push(term);
            }
        }
    }

    /// Every surface form of `tag`: itself, its synonyms, and their plural
    /// variants
    fn forms(&self, tag: &str) -> BTreeSet<String> {
        let mut base = BTreeSet::new();
        base.insert(tag.to_string());
        for variant in number_variants(tag) {
            base.insert(variant);
        }

        let mut forms = base.clone();
        for term in &base {
            if let Some(&index) = self.group_of.get(term) {
                for synonym in &self.groups[index] {
                    forms.insert(synonym.clone());
                    forms.extend(number_variants(synonym));
                }
            }
        }
        forms
    }
}

impl Default for ContainmentStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl HierarchyStrategy for ContainmentStrategy {
    fn is_more_general(&self, general: &str, specific: &str) -> bool {
        let specific_words = words(specific);
        if specific_words.len() <= words(general).len() {
            return false;
        }

        self.forms(general)
            .iter()
            .any(|form| contains_word_run(&specific_words, &words(form)))
    }

    fn are_synonyms(&self, a: &str, b: &str) -> bool {
        if a == b {
            return true;
        }
        if words(a).len() != words(b).len() {
            return false;
        }
        self.forms(a).contains(b)
    }
}

/// True if `needle` occurs in `haystack` as a contiguous word sequence
fn contains_word_run(haystack: &[&str], needle: &[&str]) -> bool {
    if needle.is_empty() || needle.len() > haystack.len() {
        return false;
    }
    haystack.windows(needle.len()).any(|window| window == needle)
}

/// Singular/plural variants of the last word of `tag`
fn number_variants(tag: &str) -> Vec<String> {
    let (head, last) = match tag.rsplit_once(' ') {
        Some((head, last)) => (Some(head), last),
        None => (None, tag),
    };

    let mut variants = Vec::new();
    if last.chars().count() < 3 {
        return variants;
    }

    if let Some(stem) = last.strip_suffix("ies") {
        variants.push(format!("{}y", stem));
    } else if last.ends_with("ches")
        || last.ends_with("shes")
        || last.ends_with("xes")
        || last.ends_with("sses")
    {
        variants.push(last[..last.len() - 2].to_string());
    } else if last.ends_with('s') && !last.ends_with("ss") {
        variants.push(last[..last.len() - 1].to_string());
    } else if let Some(stem) = last.strip_suffix('y') {
        let vowel_before = stem.ends_with(['a', 'e', 'i', 'o', 'u']);
        if vowel_before {
            variants.push(format!("{}s", last));
        } else {
            variants.push(format!("{}ies", stem));
        }
    } else if last.ends_with("ch") || last.ends_with("sh") || last.ends_with('x') || last.ends_with("ss") {
        variants.push(format!("{}es", last));
    } else {
        variants.push(format!("{}s", last));
    }

    match head {
        Some(head) => variants
            .into_iter()
            .map(|v| format!("{} {}", head, v))
            .collect(),
        None => variants,
    }
}
