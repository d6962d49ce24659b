//! Output report contract
//!
//! The canonical JSON-shaped view of a scan handed to callers: findings
//! grouped by category in a fixed order, severity counts, phase records,
//! and deduplication statistics. Ordering is deterministic so a fixed
//! corpus yields byte-identical reports modulo ids and timestamps.

use crate::dedup::DedupStats;
use crate::finding::{Category, Finding, Severity};
use crate::orchestrator::scan::{PhaseRecord, ScanProgress, ScanRecord, ScanStatus};
use crate::target::Target;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryReport {
    pub category: Category,
    pub findings: Vec<Finding>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportSummary {
    pub total_findings: usize,
    pub counts_by_severity: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanReport {
    pub scan_id: Uuid,
    pub target: Target,
    pub status: ScanStatus,
    /// True while the scan is still running: findings reflect only what
    /// is durable so far.
    pub partial: bool,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub progress: ScanProgress,
    pub phases: Vec<PhaseRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deduplication_stats: Option<DedupStats>,
    pub categories: Vec<CategoryReport>,
    pub summary: ReportSummary,
}

/// Build the report view of a scan record.
pub fn build_report(record: &ScanRecord) -> ScanReport {
    let mut by_category: BTreeMap<Category, Vec<Finding>> = BTreeMap::new();
    for finding in &record.findings {
        by_category
            .entry(finding.category)
            .or_default()
            .push(finding.clone());
    }

    let categories: Vec<CategoryReport> = Category::ALL
        .into_iter()
        .filter_map(|category| {
            by_category.remove(&category).map(|findings| CategoryReport {
                category,
                findings,
            })
        })
        .collect();

    let mut counts_by_severity: BTreeMap<String, usize> = BTreeMap::new();
    for finding in &record.findings {
        *counts_by_severity
            .entry(finding.severity.as_str().to_string())
            .or_default() += 1;
    }

    ScanReport {
        scan_id: record.id,
        target: record.target.clone(),
        status: record.status,
        partial: !record.status.is_terminal(),
        started_at: record.started_at,
        ended_at: record.ended_at,
        progress: record.progress,
        phases: record.phases.clone(),
        deduplication_stats: record.dedup_stats.clone(),
        categories,
        summary: ReportSummary {
            total_findings: record.findings.len(),
            counts_by_severity,
        },
    }
}

/// Count findings at or above a severity, for summaries and exit codes.
pub fn count_at_or_above(report: &ScanReport, severity: Severity) -> usize {
    report
        .categories
        .iter()
        .flat_map(|category| &category.findings)
        .filter(|finding| finding.severity >= severity)
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::scan::ScanOptions;

    fn record_with_findings() -> ScanRecord {
        let mut record = ScanRecord::new(
            Uuid::new_v4(),
            Target::Url("https://example.com".to_string()),
            ScanOptions::default(),
        );
        record.findings.push(Finding::marker(
            "missing-hsts",
            "Missing HSTS Header",
            Category::Headers,
            Severity::Medium,
            0.9,
            "https://example.com",
            "",
            serde_json::Value::Null,
        ));
        record.findings.push(Finding::marker(
            "large-file-skipped",
            "Large File Skipped",
            Category::Files,
            Severity::Info,
            1.0,
            "big.bin",
            "big.bin",
            serde_json::Value::Null,
        ));
        record.findings.push(Finding::marker(
            "cors-null-origin",
            "CORS Null Origin Allowed",
            Category::Headers,
            Severity::High,
            0.85,
            "https://example.com",
            "null",
            serde_json::Value::Null,
        ));
        record
    }

    #[test]
    fn categories_come_in_fixed_order() {
        let report = build_report(&record_with_findings());
        let order: Vec<Category> = report.categories.iter().map(|c| c.category).collect();
        assert_eq!(order, vec![Category::Headers, Category::Files]);
        assert_eq!(report.categories[0].findings.len(), 2);
    }

    #[test]
    fn summary_counts_by_severity() {
        let report = build_report(&record_with_findings());
        assert_eq!(report.summary.total_findings, 3);
        assert_eq!(report.summary.counts_by_severity["medium"], 1);
        assert_eq!(report.summary.counts_by_severity["high"], 1);
        assert_eq!(report.summary.counts_by_severity["info"], 1);
        assert_eq!(count_at_or_above(&report, Severity::Medium), 2);
    }

    #[test]
    fn non_terminal_reports_are_partial() {
        let record = record_with_findings();
        let report = build_report(&record);
        assert!(report.partial);

        let mut record = record_with_findings();
        record.conclude(false);
        let report = build_report(&record);
        assert!(!report.partial);
    }

    #[test]
    fn report_serializes_to_camel_case_json() {
        let report = build_report(&record_with_findings());
        let value = serde_json::to_value(&report).unwrap();
        assert!(value["scanId"].is_string());
        assert!(value["summary"]["totalFindings"].is_number());
        assert!(value["categories"].is_array());
        assert_eq!(value["target"]["kind"], "url");
    }
}
