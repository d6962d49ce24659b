//! Findings: the scored, localized unit of every report
//!
//! A finding is created from a raw pattern match, refined by the scorer,
//! and possibly merged with duplicates by the deduplication engine. It owns
//! its locations; it refers to its pattern only by id.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Severity ladder. Variant order is ascending so `Ord` ranks
/// `Critical` highest.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    /// One step down the ladder; `Info` stays `Info`.
    pub fn downgraded(&self) -> Severity {
        match self {
            Severity::Critical => Severity::High,
            Severity::High => Severity::Medium,
            Severity::Medium => Severity::Low,
            Severity::Low | Severity::Info => Severity::Info,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pattern category, which doubles as the report grouping key.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Secrets,
    Vulnerabilities,
    Configurations,
    Headers,
    Files,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Secrets => "secrets",
            Category::Vulnerabilities => "vulnerabilities",
            Category::Configurations => "configurations",
            Category::Headers => "headers",
            Category::Files => "files",
        }
    }

    /// Fixed report ordering for deterministic output.
    pub const ALL: [Category; 5] = [
        Category::Secrets,
        Category::Vulnerabilities,
        Category::Configurations,
        Category::Headers,
        Category::Files,
    ];
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single occurrence site of a finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    pub file: String,
    pub line: usize,
    pub column: usize,
    pub byte_offset: usize,
}

/// Bytes captured around the match, truncated at buffer edges.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Context {
    pub before: String,
    pub after: String,
}

/// A scored, localized pattern match.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Finding {
    pub id: Uuid,
    pub pattern_id: String,
    /// Display name of the matching pattern ("type" in the report).
    #[serde(rename = "type")]
    pub pattern_name: String,
    pub category: Category,
    pub severity: Severity,
    pub confidence: f64,
    pub value: String,
    pub file: String,
    pub line: usize,
    pub column: usize,
    pub byte_offset: usize,
    pub context: Context,
    /// Always equals `aggregated_locations.len()`.
    pub occurrence_count: usize,
    /// The primary location is always first and earliest by byte offset.
    pub aggregated_locations: Vec<Location>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
}

impl Finding {
    /// Primary location of this finding.
    pub fn location(&self) -> Location {
        Location {
            file: self.file.clone(),
            line: self.line,
            column: self.column,
            byte_offset: self.byte_offset,
        }
    }

    /// Synthesized informational finding (large-file-skipped,
    /// file-read-error, header findings and the like), located at the
    /// start of the named artifact.
    pub fn marker(
        pattern_id: &str,
        pattern_name: &str,
        category: Category,
        severity: Severity,
        confidence: f64,
        file: &str,
        value: impl Into<String>,
        metadata: serde_json::Value,
    ) -> Self {
        let file = file.to_string();
        Self {
            id: Uuid::new_v4(),
            pattern_id: pattern_id.to_string(),
            pattern_name: pattern_name.to_string(),
            category,
            severity,
            confidence,
            value: value.into(),
            file: file.clone(),
            line: 1,
            column: 1,
            byte_offset: 0,
            context: Context::default(),
            occurrence_count: 1,
            aggregated_locations: vec![Location {
                file,
                line: 1,
                column: 1,
                byte_offset: 0,
            }],
            metadata,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_orders_critical_highest() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Low);
        assert!(Severity::Low > Severity::Info);
        let most_severe = [Severity::Low, Severity::Critical, Severity::Medium]
            .into_iter()
            .max()
            .unwrap();
        assert_eq!(most_severe, Severity::Critical);
    }

    #[test]
    fn severity_downgrade_ladder() {
        assert_eq!(Severity::Critical.downgraded(), Severity::High);
        assert_eq!(Severity::Info.downgraded(), Severity::Info);
    }

    #[test]
    fn finding_serializes_camel_case() {
        let finding = Finding::marker(
            "large-file-skipped",
            "Large File Skipped",
            Category::Files,
            Severity::Info,
            1.0,
            "big.bin",
            "big.bin",
            serde_json::json!({ "sizeBytes": 1024 }),
        );
        let value = serde_json::to_value(&finding).unwrap();
        assert_eq!(value["patternId"], "large-file-skipped");
        assert_eq!(value["type"], "Large File Skipped");
        assert_eq!(value["occurrenceCount"], 1);
        assert_eq!(value["aggregatedLocations"][0]["byteOffset"], 0);
        assert_eq!(value["severity"], "info");
    }
}
