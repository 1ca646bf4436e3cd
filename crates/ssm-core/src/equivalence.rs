//! Equivalence Catalog: pure resolve/update/validate logic (spec Section 4.2).
//!
//! This module owns the in-memory index and decision logic only. Atomic YAML
//! persistence and reload-after-write live in the daemon crate, which holds
//! the only copy of this type behind a single mutex and swaps in a fresh
//! [`EquivalenceCatalog`] built from this module on every successful write.

use crate::normalize::{comparison_key, SceneTag};
use std::collections::HashMap;

/// One canonical group: its display title plus every alias that resolves
/// to it (the canonical title itself is always included as an alias).
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CanonicalGroup {
    pub canonical: String,
    pub aliases: Vec<String>,
}

/// The on-disk document shape (`manga_equivalents.yml`): a flat list of
/// groups.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct EquivalenceDocument {
    pub groups: Vec<CanonicalGroup>,
}

/// Outcome of [`EquivalenceCatalog::update`]'s in-memory decision. The
/// daemon-side writer maps `AppendedAlias`/`CreatedGroup` onto a disk write,
/// then reports `WriteFailed`/`ReloadFailed` if that write or the
/// subsequent re-read fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    AppendedAlias { canonical: String },
    CreatedGroup { canonical: String },
    NoChanges,
    Conflict { canonicals: Vec<String> },
    ValidationFailed { reason: String },
}

/// Result of [`EquivalenceCatalog::resolve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub canonical: String,
    pub group_key: String,
}

/// In-memory equivalence index: raw-alias→canonical and
/// comparison-key→canonical, built once from a document and scene-tag set.
#[derive(Debug, Clone, Default)]
pub struct EquivalenceCatalog {
    document: EquivalenceDocument,
    raw_to_canonical: HashMap<String, String>,
    key_to_canonical: HashMap<String, String>,
}

impl EquivalenceCatalog {
    /// Build a catalog from a document, validating it first. Returns the
    /// validation failure reason if the document is internally
    /// inconsistent (spec Section 4.2's Validation rule).
    pub fn build(document: EquivalenceDocument, scene_tags: &[SceneTag]) -> Result<Self, String> {
        validate(&document, scene_tags)?;

        let mut raw_to_canonical = HashMap::new();
        let mut key_to_canonical = HashMap::new();
        for group in &document.groups {
            let key = comparison_key(&group.canonical, scene_tags);
            key_to_canonical.insert(key, group.canonical.clone());
            for alias in &group.aliases {
                raw_to_canonical.insert(alias.clone(), group.canonical.clone());
            }
        }

        Ok(Self {
            document,
            raw_to_canonical,
            key_to_canonical,
        })
    }

    pub fn document(&self) -> &EquivalenceDocument {
        &self.document
    }

    /// `Resolve(title) → (canonical, groupKey) or not-found`.
    ///
    /// Tries an exact raw-alias match first (cheap, handles titles already
    /// seen verbatim), then falls back to the comparison-key index.
    pub fn resolve(&self, title: &str, scene_tags: &[SceneTag]) -> Option<Resolution> {
        if let Some(canonical) = self.raw_to_canonical.get(title) {
            let group_key = comparison_key(canonical, scene_tags);
            return Some(Resolution {
                canonical: canonical.clone(),
                group_key,
            });
        }

        let key = comparison_key(title, scene_tags);
        self.key_to_canonical.get(&key).map(|canonical| Resolution {
            canonical: canonical.clone(),
            group_key: key,
        })
    }

    /// `Update(canonicalCandidate, aliases) → Outcome`.
    ///
    /// Does not mutate `self`; the caller (daemon-side writer) applies the
    /// resulting document change, persists it, re-reads it, and only then
    /// constructs the next [`EquivalenceCatalog`] via [`Self::build`].
    pub fn plan_update(
        &self,
        canonical_candidate: &str,
        aliases: &[String],
        scene_tags: &[SceneTag],
    ) -> (UpdateOutcome, Option<EquivalenceDocument>) {
        let mut resolved_canonicals: Vec<String> = aliases
            .iter()
            .filter_map(|a| self.resolve(a, scene_tags))
            .map(|r| r.canonical)
            .collect();
        resolved_canonicals.sort();
        resolved_canonicals.dedup();

        match resolved_canonicals.len() {
            0 => {
                let new_group = CanonicalGroup {
                    canonical: canonical_candidate.to_string(),
                    aliases: {
                        let mut all = aliases.to_vec();
                        if !all.iter().any(|a| a == canonical_candidate) {
                            all.push(canonical_candidate.to_string());
                        }
                        all
                    },
                };
                let mut doc = self.document.clone();
                doc.groups.push(new_group);
                (
                    UpdateOutcome::CreatedGroup {
                        canonical: canonical_candidate.to_string(),
                    },
                    Some(doc),
                )
            }
            1 => {
                let canonical = resolved_canonicals.into_iter().next().unwrap();
                let mut doc = self.document.clone();
                let group = doc
                    .groups
                    .iter_mut()
                    .find(|g| g.canonical == canonical)
                    .expect("resolved canonical must exist in document");

                let missing: Vec<String> = aliases
                    .iter()
                    .filter(|a| !group.aliases.contains(a))
                    .cloned()
                    .collect();

                if missing.is_empty() {
                    (UpdateOutcome::NoChanges, None)
                } else {
                    group.aliases.extend(missing);
                    (UpdateOutcome::AppendedAlias { canonical }, Some(doc))
                }
            }
            _ => (UpdateOutcome::Conflict { canonicals: resolved_canonicals }, None),
        }
    }
}

/// A group is invalid if two different groups produce the same canonical
/// comparison key, or if any alias maps to two different canonicals.
fn validate(document: &EquivalenceDocument, scene_tags: &[SceneTag]) -> Result<(), String> {
    let mut seen_keys: HashMap<String, String> = HashMap::new();
    for group in &document.groups {
        let key = comparison_key(&group.canonical, scene_tags);
        if let Some(existing) = seen_keys.insert(key.clone(), group.canonical.clone()) {
            if existing != group.canonical {
                return Err(format!(
                    "groups '{existing}' and '{}' share comparison key '{key}'",
                    group.canonical
                ));
            }
        }
    }

    let mut alias_owner: HashMap<&str, &str> = HashMap::new();
    for group in &document.groups {
        for alias in &group.aliases {
            if let Some(owner) = alias_owner.insert(alias.as_str(), group.canonical.as_str()) {
                if owner != group.canonical {
                    return Err(format!(
                        "alias '{alias}' maps to both '{owner}' and '{}'",
                        group.canonical
                    ));
                }
            }
        }
    }

    Ok(())
}
