//! Pattern registry
//!
//! All patterns are data: the embedded YAML set is compiled once at engine
//! construction, optionally overlaid with a user-supplied YAML file, and is
//! immutable afterwards. The engine itself hardcodes no pattern.

use crate::engine::validators::ValidatorKind;
use crate::finding::{Category, Severity};
use aho_corasick::AhoCorasick;
use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

const EMBEDDED_PATTERNS: &str = include_str!("../../assets/patterns.yaml");

/// One pattern definition as written in YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PatternSpec {
    id: String,
    name: String,
    category: Category,
    severity: Severity,
    /// Patterns without a regex are marker patterns: they are never run by
    /// the buffer engine, only referenced by id when a phase synthesizes a
    /// finding (header checks, skip markers).
    #[serde(default)]
    regex: Option<String>,
    #[serde(default)]
    validator: Option<ValidatorKind>,
    #[serde(default)]
    min_length: Option<usize>,
    #[serde(default)]
    max_length: Option<usize>,
    confidence: f64,
    #[serde(default)]
    keywords: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct PatternsFile {
    patterns: Vec<PatternSpec>,
}

/// A compiled, immutable pattern.
#[derive(Debug)]
pub struct Pattern {
    pub id: String,
    pub name: String,
    pub category: Category,
    pub severity: Severity,
    pub regex: Option<Regex>,
    pub validator: Option<ValidatorKind>,
    pub min_length: Option<usize>,
    pub max_length: Option<usize>,
    pub base_confidence: f64,
    pub keywords: Vec<String>,
}

impl Pattern {
    fn compile(spec: PatternSpec) -> Result<Self> {
        let regex = match &spec.regex {
            Some(source) => Some(
                Regex::new(source)
                    .with_context(|| format!("invalid regex for pattern '{}'", spec.id))?,
            ),
            None => None,
        };
        Ok(Self {
            id: spec.id,
            name: spec.name,
            category: spec.category,
            severity: spec.severity,
            regex,
            validator: spec.validator,
            min_length: spec.min_length,
            max_length: spec.max_length,
            base_confidence: spec.confidence.clamp(0.0, 1.0),
            keywords: spec.keywords,
        })
    }
}

/// The process-wide pattern set with an Aho-Corasick keyword prefilter.
///
/// The prefilter skips patterns whose keywords are absent from a buffer
/// before any regex runs; patterns without keywords always run.
pub struct PatternRegistry {
    patterns: Vec<Pattern>,
    by_id: HashMap<String, usize>,
    prefilter: Option<AhoCorasick>,
    /// Pattern indices owning each prefilter keyword, parallel to the
    /// automaton's pattern ids.
    keyword_owners: Vec<usize>,
}

impl PatternRegistry {
    /// Compile the embedded pattern set.
    pub fn embedded() -> Result<Self> {
        let file: PatternsFile = serde_yml::from_str(EMBEDDED_PATTERNS)
            .context("failed to parse embedded patterns YAML")?;
        Self::from_specs(file.patterns)
    }

    /// Compile the embedded set plus a user overlay. Overlay entries with
    /// an id already present replace the embedded pattern; invalid overlay
    /// entries are skipped with a warning rather than failing registry
    /// construction.
    pub fn with_overlay(overlay_path: &Path) -> Result<Self> {
        let mut specs = serde_yml::from_str::<PatternsFile>(EMBEDDED_PATTERNS)
            .context("failed to parse embedded patterns YAML")?
            .patterns;

        match std::fs::read_to_string(overlay_path) {
            Ok(raw) => match serde_yml::from_str::<PatternsFile>(&raw) {
                Ok(overlay) => {
                    for spec in overlay.patterns {
                        if let Some(ref source) = spec.regex {
                            if let Err(e) = Regex::new(source) {
                                tracing::warn!(
                                    "skipping custom pattern '{}': invalid regex: {}",
                                    spec.id,
                                    e
                                );
                                continue;
                            }
                        }
                        if let Some(existing) = specs.iter_mut().find(|s| s.id == spec.id) {
                            *existing = spec;
                        } else {
                            specs.push(spec);
                        }
                    }
                }
                Err(e) => tracing::warn!(
                    "failed to parse pattern overlay {}: {} (using embedded set)",
                    overlay_path.display(),
                    e
                ),
            },
            Err(e) => tracing::warn!(
                "failed to read pattern overlay {}: {} (using embedded set)",
                overlay_path.display(),
                e
            ),
        }

        Self::from_specs(specs)
    }

    fn from_specs(specs: Vec<PatternSpec>) -> Result<Self> {
        let mut patterns = Vec::with_capacity(specs.len());
        let mut by_id = HashMap::new();
        for spec in specs {
            let pattern = Pattern::compile(spec)?;
            if by_id.insert(pattern.id.clone(), patterns.len()).is_some() {
                anyhow::bail!("duplicate pattern id '{}'", pattern.id);
            }
            patterns.push(pattern);
        }

        let mut keyword_strings = Vec::new();
        let mut keyword_owners = Vec::new();
        for (index, pattern) in patterns.iter().enumerate() {
            for keyword in &pattern.keywords {
                keyword_strings.push(keyword.to_ascii_lowercase());
                keyword_owners.push(index);
            }
        }
        let prefilter = if keyword_strings.is_empty() {
            None
        } else {
            Some(
                AhoCorasick::builder()
                    .ascii_case_insensitive(true)
                    .build(&keyword_strings)
                    .context("failed to build keyword prefilter")?,
            )
        };

        tracing::debug!(
            "compiled {} patterns ({} prefilter keywords)",
            patterns.len(),
            keyword_strings.len()
        );

        Ok(Self {
            patterns,
            by_id,
            prefilter,
            keyword_owners,
        })
    }

    pub fn patterns(&self) -> &[Pattern] {
        &self.patterns
    }

    pub fn get(&self, id: &str) -> Option<&Pattern> {
        self.by_id.get(id).map(|&index| &self.patterns[index])
    }

    pub fn pattern_at(&self, index: usize) -> &Pattern {
        &self.patterns[index]
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Synthesize a finding for a marker pattern (header checks, skip
    /// markers), taking name/severity/confidence from the registry entry.
    pub fn marker_finding(
        &self,
        id: &str,
        file: &str,
        value: impl Into<String>,
        metadata: serde_json::Value,
    ) -> crate::finding::Finding {
        match self.get(id) {
            Some(pattern) => crate::finding::Finding::marker(
                &pattern.id,
                &pattern.name,
                pattern.category,
                pattern.severity,
                pattern.base_confidence,
                file,
                value,
                metadata,
            ),
            None => {
                // An unknown id is a programming error, but a degraded
                // finding beats a panic in the scan path.
                tracing::error!("marker pattern '{}' missing from registry", id);
                crate::finding::Finding::marker(
                    id,
                    id,
                    Category::Files,
                    Severity::Info,
                    0.5,
                    file,
                    value,
                    metadata,
                )
            }
        }
    }

    /// Indices of patterns eligible for a buffer: every pattern whose
    /// keyword appears, plus every pattern with no keywords.
    pub fn eligible_for(&self, buffer: &str) -> Vec<usize> {
        let mut keyword_hits: HashSet<usize> = HashSet::new();
        if let Some(ref prefilter) = self.prefilter {
            for hit in prefilter.find_overlapping_iter(buffer) {
                keyword_hits.insert(self.keyword_owners[hit.pattern().as_usize()]);
            }
        }
        self.patterns
            .iter()
            .enumerate()
            .filter(|(index, pattern)| {
                pattern.regex.is_some()
                    && (pattern.keywords.is_empty() || keyword_hits.contains(index))
            })
            .map(|(index, _)| index)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_set_compiles() {
        let registry = PatternRegistry::embedded().unwrap();
        assert!(registry.len() >= 40, "expected a substantial pattern set");
        assert!(registry.get("aws-access-key-id").is_some());
        assert!(registry.get("github-token").is_some());
        assert!(registry.get("generic-api-key").is_some());
        assert!(registry.get("missing-hsts").is_some());
    }

    #[test]
    fn marker_patterns_have_no_regex() {
        let registry = PatternRegistry::embedded().unwrap();
        let marker = registry.get("large-file-skipped").unwrap();
        assert!(marker.regex.is_none());
        let header = registry.get("missing-hsts").unwrap();
        assert!(header.regex.is_none());
    }

    #[test]
    fn prefilter_limits_eligible_patterns() {
        let registry = PatternRegistry::embedded().unwrap();
        let with_keyword = registry.eligible_for("token = ghp_abcdef");
        let github = registry.by_id["github-token"];
        assert!(with_keyword.contains(&github));

        let without = registry.eligible_for("nothing interesting here");
        assert!(!without.contains(&github));
    }

    #[test]
    fn every_pattern_has_valid_confidence() {
        let registry = PatternRegistry::embedded().unwrap();
        for pattern in registry.patterns() {
            assert!(
                (0.0..=1.0).contains(&pattern.base_confidence),
                "pattern {} confidence out of range",
                pattern.id
            );
        }
    }
}
