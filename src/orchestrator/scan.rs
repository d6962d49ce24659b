//! Scan records and phases
//!
//! The mutable state of one scan: its phase records, weighted progress,
//! findings, and status. Mutated only by the driving task; readers get
//! cloned snapshots.

use crate::dedup::DedupStats;
use crate::error::{ErrorCode, ScanError};
use crate::finding::Finding;
use crate::target::Target;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Phases run in this fixed order; unrequested ones are skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseKind {
    Headers,
    Url,
    Repository,
    Files,
}

impl PhaseKind {
    pub const ORDER: [PhaseKind; 4] = [
        PhaseKind::Headers,
        PhaseKind::Url,
        PhaseKind::Repository,
        PhaseKind::Files,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseKind::Headers => "headers",
            PhaseKind::Url => "url",
            PhaseKind::Repository => "repository",
            PhaseKind::Files => "files",
        }
    }

    /// Whether this phase can run against the given target at all.
    pub fn applies_to(&self, target: &Target) -> bool {
        match self {
            PhaseKind::Headers | PhaseKind::Url => matches!(target, Target::Url(_)),
            PhaseKind::Repository | PhaseKind::Files => matches!(target, Target::Repository(_)),
        }
    }

    pub fn parse(raw: &str) -> Option<PhaseKind> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "headers" => Some(PhaseKind::Headers),
            "url" => Some(PhaseKind::Url),
            "repository" => Some(PhaseKind::Repository),
            "files" => Some(PhaseKind::Files),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl PhaseStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PhaseStatus::Completed | PhaseStatus::Failed | PhaseStatus::Skipped
        )
    }
}

/// Bounded per-phase error list.
pub const MAX_PHASE_ERRORS: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "serde_json::Value::is_null", default)]
    pub details: serde_json::Value,
}

impl From<&ScanError> for PhaseError {
    fn from(error: &ScanError) -> Self {
        Self {
            code: error.code,
            message: error.message.clone(),
            details: error.details.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseRecord {
    pub kind: PhaseKind,
    pub status: PhaseStatus,
    /// 0-100 within the phase.
    pub progress: u8,
    /// This phase's share of overall progress; weights sum to 100.
    pub weight: u8,
    pub errors: Vec<PhaseError>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl PhaseRecord {
    fn new(kind: PhaseKind, weight: u8) -> Self {
        Self {
            kind,
            status: PhaseStatus::Pending,
            progress: 0,
            weight,
            errors: Vec::new(),
            started_at: None,
            ended_at: None,
        }
    }

    pub fn push_error(&mut self, error: PhaseError) {
        if self.errors.len() < MAX_PHASE_ERRORS {
            self.errors.push(error);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    Partial,
}

impl ScanStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ScanStatus::Completed | ScanStatus::Failed | ScanStatus::Cancelled | ScanStatus::Partial
        )
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanProgress {
    pub current: u32,
    pub total: u32,
}

/// Caller-supplied options for one scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ScanOptions {
    /// Requested phases; empty means every phase.
    pub phases: Vec<PhaseKind>,
    pub max_files: Option<usize>,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub confidence_threshold: Option<f64>,
    pub clone_depth: Option<u32>,
    pub timeout_secs: Option<u64>,
    /// Basic scan mode: only the `url` phase, deduplication disabled.
    pub basic: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            phases: Vec::new(),
            max_files: None,
            include: Vec::new(),
            exclude: Vec::new(),
            confidence_threshold: None,
            clone_depth: None,
            timeout_secs: None,
            basic: false,
        }
    }
}

impl ScanOptions {
    /// The effective requested phase set in canonical order.
    pub fn requested_phases(&self) -> Vec<PhaseKind> {
        if self.basic {
            return vec![PhaseKind::Url];
        }
        let requested: Vec<PhaseKind> = if self.phases.is_empty() {
            PhaseKind::ORDER.to_vec()
        } else {
            PhaseKind::ORDER
                .into_iter()
                .filter(|kind| self.phases.contains(kind))
                .collect()
        };
        requested
    }

    pub fn timeout(&self, default: Duration) -> Duration {
        self.timeout_secs.map(Duration::from_secs).unwrap_or(default)
    }
}

/// The full mutable state of a scan.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanRecord {
    pub id: Uuid,
    pub target: Target,
    #[serde(skip)]
    pub options: ScanOptions,
    pub status: ScanStatus,
    pub phases: Vec<PhaseRecord>,
    pub progress: ScanProgress,
    pub findings: Vec<Finding>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub dedup_stats: Option<DedupStats>,
    #[serde(skip)]
    pub terminal_since: Option<Instant>,
}

impl ScanRecord {
    /// Allocate a new record with phase weights summing to exactly 100.
    pub fn new(id: Uuid, target: Target, options: ScanOptions) -> Self {
        let requested = options.requested_phases();
        let count = requested.len().max(1) as u32;
        let base_weight = (100 / count) as u8;
        let remainder = (100 % count) as u8;

        let phases: Vec<PhaseRecord> = requested
            .iter()
            .enumerate()
            .map(|(index, &kind)| {
                // The last phase absorbs the rounding remainder.
                let weight = if index == requested.len() - 1 {
                    base_weight + remainder
                } else {
                    base_weight
                };
                PhaseRecord::new(kind, weight)
            })
            .collect();

        Self {
            id,
            target,
            options,
            status: ScanStatus::Queued,
            phases,
            progress: ScanProgress {
                current: 0,
                total: 100,
            },
            findings: Vec::new(),
            started_at: Utc::now(),
            ended_at: None,
            dedup_stats: None,
            terminal_since: None,
        }
    }

    pub fn phase_mut(&mut self, kind: PhaseKind) -> Option<&mut PhaseRecord> {
        self.phases.iter_mut().find(|phase| phase.kind == kind)
    }

    pub fn phase(&self, kind: PhaseKind) -> Option<&PhaseRecord> {
        self.phases.iter().find(|phase| phase.kind == kind)
    }

    /// Recompute cumulative weighted progress from the phase records.
    pub fn recompute_progress(&mut self) {
        if self.phases.iter().all(|phase| phase.status.is_terminal()) {
            self.progress.current = self.progress.total;
            return;
        }
        let current: u32 = self
            .phases
            .iter()
            .map(|phase| {
                let progress = if phase.status.is_terminal() {
                    100
                } else {
                    phase.progress as u32
                };
                phase.weight as u32 * progress / 100
            })
            .sum();
        self.progress.current = current.min(self.progress.total);
    }

    /// Final status from the phase records, per the sequencing rules.
    pub fn conclude(&mut self, cancelled: bool) {
        let status = if cancelled {
            ScanStatus::Cancelled
        } else {
            let completed = self
                .phases
                .iter()
                .filter(|phase| phase.status == PhaseStatus::Completed)
                .count();
            let failed = self
                .phases
                .iter()
                .filter(|phase| phase.status == PhaseStatus::Failed)
                .count();
            if failed == 0 {
                ScanStatus::Completed
            } else if completed > 0 {
                ScanStatus::Partial
            } else {
                ScanStatus::Failed
            }
        };
        // Any phase still pending at conclusion was never reached.
        for phase in &mut self.phases {
            if !phase.status.is_terminal() {
                phase.status = if cancelled {
                    PhaseStatus::Failed
                } else {
                    PhaseStatus::Skipped
                };
                if cancelled {
                    phase.push_error(PhaseError {
                        code: ErrorCode::Cancelled,
                        message: "scan cancelled".to_string(),
                        details: serde_json::Value::Null,
                    });
                }
                phase.ended_at = Some(Utc::now());
            }
        }
        self.status = status;
        self.ended_at = Some(Utc::now());
        self.terminal_since = Some(Instant::now());
        self.recompute_progress();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url_target() -> Target {
        Target::Url("https://example.com".to_string())
    }

    #[test]
    fn phase_weights_always_sum_to_100() {
        for count in 1..=4 {
            let options = ScanOptions {
                phases: PhaseKind::ORDER[..count].to_vec(),
                ..Default::default()
            };
            let record = ScanRecord::new(Uuid::new_v4(), url_target(), options);
            let total: u32 = record.phases.iter().map(|p| p.weight as u32).sum();
            assert_eq!(total, 100, "weights for {count} phases");
        }
    }

    #[test]
    fn requested_phases_keep_canonical_order() {
        let options = ScanOptions {
            phases: vec![PhaseKind::Files, PhaseKind::Headers],
            ..Default::default()
        };
        assert_eq!(
            options.requested_phases(),
            vec![PhaseKind::Headers, PhaseKind::Files]
        );
    }

    #[test]
    fn basic_mode_is_url_only() {
        let options = ScanOptions {
            basic: true,
            phases: vec![PhaseKind::Files],
            ..Default::default()
        };
        assert_eq!(options.requested_phases(), vec![PhaseKind::Url]);
    }

    #[test]
    fn progress_reaches_total_when_all_phases_terminal() {
        let mut record = ScanRecord::new(Uuid::new_v4(), url_target(), ScanOptions::default());
        for phase in &mut record.phases {
            phase.status = PhaseStatus::Completed;
            phase.progress = 100;
        }
        record.recompute_progress();
        assert_eq!(record.progress.current, record.progress.total);
    }

    #[test]
    fn partial_progress_is_weighted() {
        let options = ScanOptions {
            phases: vec![PhaseKind::Headers, PhaseKind::Url],
            ..Default::default()
        };
        let mut record = ScanRecord::new(Uuid::new_v4(), url_target(), options);
        record.phases[0].status = PhaseStatus::Completed;
        record.phases[1].status = PhaseStatus::Running;
        record.phases[1].progress = 50;
        record.recompute_progress();
        // 50 (completed headers) + 25 (half of url's 50).
        assert_eq!(record.progress.current, 75);
    }

    #[test]
    fn conclusion_rules() {
        let mut record = ScanRecord::new(Uuid::new_v4(), url_target(), ScanOptions::default());
        for phase in &mut record.phases {
            phase.status = PhaseStatus::Completed;
        }
        record.conclude(false);
        assert_eq!(record.status, ScanStatus::Completed);
        assert!(record.status.is_terminal());
        assert!(record.ended_at.is_some());

        let mut record = ScanRecord::new(Uuid::new_v4(), url_target(), ScanOptions::default());
        record.phases[0].status = PhaseStatus::Completed;
        record.phases[1].status = PhaseStatus::Failed;
        record.phases[2].status = PhaseStatus::Skipped;
        record.phases[3].status = PhaseStatus::Skipped;
        record.conclude(false);
        assert_eq!(record.status, ScanStatus::Partial);

        let mut record = ScanRecord::new(Uuid::new_v4(), url_target(), ScanOptions::default());
        for phase in &mut record.phases {
            phase.status = PhaseStatus::Failed;
        }
        record.conclude(false);
        assert_eq!(record.status, ScanStatus::Failed);
    }

    #[test]
    fn skipped_phases_still_complete_the_scan() {
        let mut record = ScanRecord::new(Uuid::new_v4(), url_target(), ScanOptions::default());
        record.phases[0].status = PhaseStatus::Completed;
        for phase in &mut record.phases[1..] {
            phase.status = PhaseStatus::Skipped;
        }
        record.conclude(false);
        assert_eq!(record.status, ScanStatus::Completed);
        assert_eq!(record.progress.current, record.progress.total);
    }

    #[test]
    fn cancellation_fails_unreached_phases() {
        let mut record = ScanRecord::new(Uuid::new_v4(), url_target(), ScanOptions::default());
        record.phases[0].status = PhaseStatus::Completed;
        record.conclude(true);
        assert_eq!(record.status, ScanStatus::Cancelled);
        assert!(record.phases[1..]
            .iter()
            .all(|phase| phase.status == PhaseStatus::Failed));
    }

    #[test]
    fn phase_errors_are_bounded() {
        let mut phase = PhaseRecord::new(PhaseKind::Files, 25);
        for n in 0..30 {
            phase.push_error(PhaseError {
                code: ErrorCode::FileReadError,
                message: format!("error {n}"),
                details: serde_json::Value::Null,
            });
        }
        assert_eq!(phase.errors.len(), MAX_PHASE_ERRORS);
    }
}
