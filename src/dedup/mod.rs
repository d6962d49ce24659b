//! Deduplication engine
//!
//! Findings with an identical fingerprint (SHA-256 over pattern-id,
//! verbatim value, and normalized path) are the same logical finding and are
//! collapsed, keeping the earliest occurrence as representative. Distinct
//! fingerprints are never merged. When the work would blow its time,
//! memory, or count budget the engine falls back to the raw set and says
//! so in the stats; repeated failures open a circuit breaker that forces
//! the fallback until a reset timeout passes.

use crate::config::DedupConfig;
use crate::finding::Finding;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Stable deduplication key.
pub fn fingerprint(pattern_id: &str, value: &str, file: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(pattern_id.as_bytes());
    hasher.update([0]);
    hasher.update(value.as_bytes());
    hasher.update([0]);
    hasher.update(normalize_path(file).as_bytes());
    hex::encode(hasher.finalize())
}

/// Lowercase, forward slashes, no leading/trailing separators. The value
/// itself is hashed verbatim.
fn normalize_path(path: &str) -> String {
    path.trim()
        .replace('\\', "/")
        .trim_matches('/')
        .to_lowercase()
}

/// Published after every scan-scope pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DedupStats {
    pub enabled: bool,
    pub before_count: usize,
    pub after_count: usize,
    pub duplicates_removed: usize,
    pub duration_ms: u64,
    pub memory_peak_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,
}

impl DedupStats {
    pub fn disabled(count: usize) -> Self {
        Self {
            enabled: false,
            before_count: count,
            after_count: count,
            duplicates_removed: 0,
            duration_ms: 0,
            memory_peak_bytes: 0,
            fallback_reason: Some("disabled".to_string()),
        }
    }

    fn fallback(count: usize, reason: &str, started: Instant) -> Self {
        Self {
            enabled: false,
            before_count: count,
            after_count: count,
            duplicates_removed: 0,
            duration_ms: started.elapsed().as_millis() as u64,
            memory_peak_bytes: 0,
            fallback_reason: Some(reason.to_string()),
        }
    }
}

#[derive(Debug)]
enum BreakerState {
    Closed { consecutive_failures: u32 },
    Open { until: Instant },
    HalfOpen,
}

#[derive(Debug)]
struct CircuitBreaker {
    state: BreakerState,
    failure_threshold: u32,
    reset_timeout: Duration,
}

impl CircuitBreaker {
    fn new(failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            state: BreakerState::Closed {
                consecutive_failures: 0,
            },
            failure_threshold,
            reset_timeout,
        }
    }

    /// Whether an attempt may proceed; flips open → half-open once the
    /// reset timeout has elapsed.
    fn try_acquire(&mut self, now: Instant) -> bool {
        match self.state {
            BreakerState::Closed { .. } | BreakerState::HalfOpen => true,
            BreakerState::Open { until } => {
                if now >= until {
                    self.state = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    fn record_success(&mut self) {
        self.state = BreakerState::Closed {
            consecutive_failures: 0,
        };
    }

    fn record_failure(&mut self, now: Instant) {
        match self.state {
            BreakerState::Closed {
                consecutive_failures,
            } => {
                let failures = consecutive_failures + 1;
                if failures >= self.failure_threshold {
                    tracing::warn!("deduplication circuit breaker opened");
                    self.state = BreakerState::Open {
                        until: now + self.reset_timeout,
                    };
                } else {
                    self.state = BreakerState::Closed {
                        consecutive_failures: failures,
                    };
                }
            }
            BreakerState::HalfOpen => {
                self.state = BreakerState::Open {
                    until: now + self.reset_timeout,
                };
            }
            BreakerState::Open { .. } => {}
        }
    }
}

/// The deduplication engine shared across scans.
pub struct Deduplicator {
    config: DedupConfig,
    breaker: Mutex<CircuitBreaker>,
}

impl Deduplicator {
    pub fn new(config: DedupConfig) -> Self {
        let breaker = CircuitBreaker::new(
            config.breaker_failure_threshold,
            config.breaker_reset_timeout(),
        );
        Self {
            config,
            breaker: Mutex::new(breaker),
        }
    }

    /// File-scope collapse, applied during worker output. Findings arrive
    /// in byte-offset order, so the first of each fingerprint is the
    /// earliest and becomes the primary location.
    pub fn collapse_file(&self, findings: Vec<Finding>) -> Vec<Finding> {
        collapse(findings)
    }

    /// Scan-scope collapse across files, with budgets and the breaker.
    pub fn collapse_scan(&self, findings: Vec<Finding>) -> (Vec<Finding>, DedupStats) {
        let started = Instant::now();
        let before = findings.len();

        if !self
            .breaker
            .lock()
            .expect("breaker lock poisoned")
            .try_acquire(started)
        {
            tracing::debug!("deduplication rejected by open circuit breaker");
            return (findings, DedupStats::fallback(before, "circuit_open", started));
        }

        if before > self.config.max_findings {
            tracing::warn!(
                "deduplication fallback: {} findings exceed the {} limit",
                before,
                self.config.max_findings
            );
            return (
                findings,
                DedupStats::fallback(before, "performance_limit", started),
            );
        }

        let time_budget = self.config.time_budget();
        let memory_budget = self.config.memory_budget;
        let mut memory_used: u64 = 0;
        let mut memory_peak: u64 = 0;

        // Fingerprint pass: budget-checked, leaves the input intact so a
        // fallback can hand back the raw set untouched.
        let mut keys: Vec<String> = Vec::with_capacity(before);
        for (position, finding) in findings.iter().enumerate() {
            if position % 256 == 0 && started.elapsed() >= time_budget {
                self.record_failure(started);
                return (
                    findings,
                    DedupStats::fallback(before, "time_budget_exceeded", started),
                );
            }
            memory_used += approximate_size(finding);
            memory_peak = memory_peak.max(memory_used);
            if memory_used > memory_budget {
                self.record_failure(started);
                return (
                    findings,
                    DedupStats::fallback(before, "memory_budget_exceeded", started),
                );
            }
            keys.push(fingerprint(&finding.pattern_id, &finding.value, &finding.file));
        }
        if started.elapsed() >= time_budget {
            self.record_failure(started);
            return (
                findings,
                DedupStats::fallback(before, "time_budget_exceeded", started),
            );
        }

        // Commit pass: cheap appends, no further fallback points.
        let mut order: Vec<Finding> = Vec::with_capacity(before);
        let mut index: HashMap<String, usize> = HashMap::with_capacity(before);
        for (finding, key) in findings.into_iter().zip(keys) {
            match index.get(&key) {
                Some(&slot) => merge_into(&mut order[slot], finding),
                None => {
                    index.insert(key, order.len());
                    order.push(finding);
                }
            }
        }

        self.breaker
            .lock()
            .expect("breaker lock poisoned")
            .record_success();

        let after = order.len();
        let stats = DedupStats {
            enabled: true,
            before_count: before,
            after_count: after,
            duplicates_removed: before - after,
            duration_ms: started.elapsed().as_millis() as u64,
            memory_peak_bytes: memory_peak,
            fallback_reason: None,
        };
        (order, stats)
    }

    fn record_failure(&self, now: Instant) {
        self.breaker
            .lock()
            .expect("breaker lock poisoned")
            .record_failure(now);
    }

    /// Whether the breaker currently rejects attempts.
    pub fn breaker_open(&self) -> bool {
        let mut breaker = self.breaker.lock().expect("breaker lock poisoned");
        !breaker.try_acquire(Instant::now())
    }
}

fn collapse(findings: Vec<Finding>) -> Vec<Finding> {
    let mut order: Vec<Finding> = Vec::with_capacity(findings.len());
    let mut index: HashMap<String, usize> = HashMap::new();
    for finding in findings {
        let key = fingerprint(&finding.pattern_id, &finding.value, &finding.file);
        match index.get(&key) {
            Some(&slot) => merge_into(&mut order[slot], finding),
            None => {
                index.insert(key, order.len());
                order.push(finding);
            }
        }
    }
    order
}

/// Fold a duplicate into its primary: locations aggregate, count tracks
/// the list length, confidence takes the max, severity the most severe.
fn merge_into(primary: &mut Finding, duplicate: Finding) {
    primary
        .aggregated_locations
        .extend(duplicate.aggregated_locations);
    primary.occurrence_count = primary.aggregated_locations.len();
    primary.confidence = primary.confidence.max(duplicate.confidence);
    primary.severity = primary.severity.max(duplicate.severity);
}

fn approximate_size(finding: &Finding) -> u64 {
    (std::mem::size_of::<Finding>()
        + finding.value.len()
        + finding.file.len()
        + finding.context.before.len()
        + finding.context.after.len()
        + finding.aggregated_locations.len() * (std::mem::size_of::<usize>() * 3 + 24))
        as u64
}
