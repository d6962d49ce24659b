//! Engine configuration
//!
//! Every tunable recognized by the engine lives here with its default.
//! Configuration is loaded from an optional TOML file; any missing section
//! or field falls back to the default, so a partial file (or none at all)
//! always yields a working engine.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const MIB: u64 = 1024 * 1024;

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub limits: LimitsConfig,
    pub clone: CloneConfig,
    pub streaming: StreamingConfig,
    pub workers: WorkerConfig,
    pub dedup: DedupConfig,
    pub limiter: LimiterConfig,
    pub monitor: MonitorConfig,
    pub http: HttpConfig,
    pub scoring: ScoringWeights,
    pub storage: StorageConfig,
}

impl EngineConfig {
    /// Load configuration from a TOML file, falling back to defaults when
    /// the path is `None` or the file does not exist.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        if !path.exists() {
            tracing::debug!("config file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: EngineConfig = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        Ok(config)
    }
}

/// Per-scan limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum number of files scanned per scan.
    pub max_files_per_scan: usize,
    /// Per-file size ceiling in bytes; larger files are skipped with an
    /// informational finding.
    pub max_file_size: u64,
    /// Overall wall-clock budget per scan, seconds.
    pub per_scan_timeout_secs: u64,
    /// Findings below this confidence are dropped from the report.
    pub confidence_threshold: f64,
    /// Maximum matches per pattern per buffer.
    pub max_matches_per_pattern: usize,
    /// Context window captured on each side of a match, bytes.
    pub context_bytes: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_files_per_scan: 1000,
            max_file_size: 10 * MIB,
            per_scan_timeout_secs: 600,
            confidence_threshold: 0.5,
            max_matches_per_pattern: 100,
            context_bytes: 100,
        }
    }
}

impl LimitsConfig {
    pub fn per_scan_timeout(&self) -> Duration {
        Duration::from_secs(self.per_scan_timeout_secs)
    }
}

/// Repository acquisition limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CloneConfig {
    pub clone_depth: u32,
    pub clone_timeout_secs: u64,
    /// Probe (accessibility check) timeout, seconds.
    pub probe_timeout_secs: u64,
    /// Per-repository working-tree budget, bytes.
    pub per_repo_size: u64,
    /// Global temp-directory budget across all clones, bytes.
    pub global_temp_budget: u64,
    pub max_concurrent_scans: usize,
    /// Terminal scans are retained this long before eviction, seconds.
    pub scan_retention_ttl_secs: u64,
    /// Clones older than this are force-evicted by the sweep, seconds.
    pub max_scan_age_secs: u64,
    /// Interval of the periodic temp-directory sweep, seconds.
    pub cleanup_sweep_interval_secs: u64,
}

impl Default for CloneConfig {
    fn default() -> Self {
        Self {
            clone_depth: 1,
            clone_timeout_secs: 300,
            probe_timeout_secs: 30,
            per_repo_size: 500 * MIB,
            global_temp_budget: 2048 * MIB,
            max_concurrent_scans: 5,
            scan_retention_ttl_secs: 7200,
            max_scan_age_secs: 7200,
            cleanup_sweep_interval_secs: 1800,
        }
    }
}

impl CloneConfig {
    pub fn clone_timeout(&self) -> Duration {
        Duration::from_secs(self.clone_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn scan_retention_ttl(&self) -> Duration {
        Duration::from_secs(self.scan_retention_ttl_secs)
    }

    pub fn max_scan_age(&self) -> Duration {
        Duration::from_secs(self.max_scan_age_secs)
    }

    pub fn cleanup_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_sweep_interval_secs)
    }
}

/// File streaming strategy thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Files at or above this size use the streaming strategy, bytes.
    pub streaming_threshold: u64,
    /// Files at or above this size (and below the streaming threshold) use
    /// the chunked strategy, bytes.
    pub large_file_threshold: u64,
    /// Overlap carried between chunks so boundary-spanning matches are not
    /// lost, bytes.
    pub chunk_overlap: usize,
    pub min_chunk_size: usize,
    pub max_chunk_size: usize,
    /// Memory pressure is polled every this many chunks in chunked mode.
    pub pressure_poll_chunks: usize,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            streaming_threshold: 100 * MIB,
            large_file_threshold: 50 * MIB,
            chunk_overlap: 1024,
            min_chunk_size: 16 * 1024,
            max_chunk_size: MIB as usize,
            pressure_poll_chunks: 8,
        }
    }
}

/// Worker pool shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Worker count; 0 means `min(available CPUs, 4)`.
    pub pool_size: usize,
    pub file_batch_size: usize,
    pub max_retries: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pool_size: 0,
            file_batch_size: 20,
            max_retries: 3,
        }
    }
}

impl WorkerConfig {
    pub fn effective_pool_size(&self) -> usize {
        if self.pool_size > 0 {
            self.pool_size
        } else {
            std::cmp::min(num_cpus::get(), 4).max(1)
        }
    }
}

/// Deduplication budgets and circuit-breaker tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub time_budget_ms: u64,
    pub memory_budget: u64,
    /// Hard finding-count limit; above it deduplication falls back.
    pub max_findings: usize,
    /// Consecutive failures that open the circuit breaker.
    pub breaker_failure_threshold: u32,
    /// How long the breaker stays open before half-open, milliseconds.
    pub breaker_reset_timeout_ms: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            time_budget_ms: 5000,
            memory_budget: 256 * MIB,
            max_findings: 10_000,
            breaker_failure_threshold: 3,
            breaker_reset_timeout_ms: 1000,
        }
    }
}

impl DedupConfig {
    pub fn time_budget(&self) -> Duration {
        Duration::from_millis(self.time_budget_ms)
    }

    pub fn breaker_reset_timeout(&self) -> Duration {
        Duration::from_millis(self.breaker_reset_timeout_ms)
    }
}

/// Backoff strategy for rate limiting and retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    Fixed,
    Linear,
    Exponential,
}

/// Per-bucket rate limiter defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimiterConfig {
    pub requests_per_second: f64,
    pub burst_limit: f64,
    pub backoff_strategy: BackoffStrategy,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub target_error_rate: f64,
    pub adaptive_adjustment_factor: f64,
    pub adaptive: bool,
    pub max_retries: u32,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 5.0,
            burst_limit: 10.0,
            backoff_strategy: BackoffStrategy::Exponential,
            base_backoff_ms: 1000,
            max_backoff_ms: 30_000,
            target_error_rate: 0.05,
            adaptive_adjustment_factor: 0.8,
            adaptive: true,
            max_retries: 3,
        }
    }
}

impl LimiterConfig {
    pub fn base_backoff(&self) -> Duration {
        Duration::from_millis(self.base_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

/// Resource monitor thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Memory sampling interval, seconds.
    pub monitoring_interval_secs: u64,
    /// Memory cap in bytes; 0 means use total system memory.
    pub memory_cap: u64,
    pub memory_warning_threshold: f64,
    pub memory_critical_threshold: f64,
    pub memory_emergency_threshold: f64,
    /// Emergency mode exits once usage drops below this fraction.
    pub memory_recovery_threshold: f64,
    pub recovery_check_secs: u64,
    pub max_concurrent_streams: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            monitoring_interval_secs: 5,
            memory_cap: 0,
            memory_warning_threshold: 0.8,
            memory_critical_threshold: 0.9,
            memory_emergency_threshold: 0.95,
            memory_recovery_threshold: 0.7,
            recovery_check_secs: 30,
            max_concurrent_streams: 5,
        }
    }
}

impl MonitorConfig {
    pub fn monitoring_interval(&self) -> Duration {
        Duration::from_secs(self.monitoring_interval_secs)
    }

    pub fn recovery_check_interval(&self) -> Duration {
        Duration::from_secs(self.recovery_check_secs)
    }
}

/// Outbound HTTP configuration for the headers and url phases.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub user_agent: String,
    pub max_redirects: usize,
    /// Timeout for header inspection requests, seconds.
    pub header_timeout_secs: u64,
    /// Timeout for page-body fetches in the url phase, seconds.
    pub fetch_timeout_secs: u64,
    /// Fallback-GET body cap for header inspection, bytes.
    pub head_fallback_body_limit: usize,
    /// Page-body cap for the url phase, bytes.
    pub body_limit: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("vigil-scanner/{}", env!("CARGO_PKG_VERSION")),
            max_redirects: 5,
            header_timeout_secs: 15,
            fetch_timeout_secs: 60,
            head_fallback_body_limit: 1024,
            body_limit: 512 * 1024,
        }
    }
}

impl HttpConfig {
    pub fn header_timeout(&self) -> Duration {
        Duration::from_secs(self.header_timeout_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

/// Confidence scoring coefficients.
///
/// These are defaults, not mandates; every weight can be tuned from the
/// config file without touching the scorer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringWeights {
    pub assignment_bonus: f64,
    pub env_accessor_bonus: f64,
    pub config_selector_bonus: f64,
    pub placeholder_penalty: f64,
    pub comment_penalty: f64,

    /// Entropy tier cutoffs in bits per character.
    pub entropy_low_cutoff: f64,
    pub entropy_mid_cutoff: f64,
    pub entropy_high_cutoff: f64,
    pub entropy_top_cutoff: f64,
    pub entropy_low_penalty: f64,
    pub entropy_mid_penalty: f64,
    pub entropy_high_bonus: f64,
    pub entropy_top_bonus: f64,

    pub validator_pass_bonus: f64,
    pub validator_fail_penalty: f64,
    pub validator_error_penalty: f64,

    pub format_shape_bonus: f64,
    pub format_shape_penalty: f64,

    pub length_in_bounds_bonus: f64,
    pub short_value_penalty: f64,
    pub short_value_cutoff: usize,

    pub known_false_positive_factor: f64,
    pub known_true_positive_factor: f64,
    pub feedback_false_positive_delta: f64,
    pub feedback_true_positive_delta: f64,

    /// Critical findings with a base confidence below this gate are halved.
    pub critical_gate: f64,
    pub critical_gate_factor: f64,
    /// Per-category confidence floors; below the floor severity drops a level.
    pub secrets_floor: f64,
    pub vulnerabilities_floor: f64,
    pub configurations_floor: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            assignment_bonus: 0.15,
            env_accessor_bonus: 0.20,
            config_selector_bonus: 0.10,
            placeholder_penalty: 0.30,
            comment_penalty: 0.20,

            entropy_low_cutoff: 2.0,
            entropy_mid_cutoff: 2.5,
            entropy_high_cutoff: 3.5,
            entropy_top_cutoff: 4.0,
            entropy_low_penalty: 0.20,
            entropy_mid_penalty: 0.10,
            entropy_high_bonus: 0.10,
            entropy_top_bonus: 0.15,

            validator_pass_bonus: 0.15,
            validator_fail_penalty: 0.15,
            validator_error_penalty: 0.075,

            format_shape_bonus: 0.05,
            format_shape_penalty: 0.10,

            length_in_bounds_bonus: 0.05,
            short_value_penalty: 0.10,
            short_value_cutoff: 8,

            known_false_positive_factor: 0.3,
            known_true_positive_factor: 1.2,
            feedback_false_positive_delta: 0.3,
            feedback_true_positive_delta: 0.2,

            critical_gate: 0.5,
            critical_gate_factor: 0.5,
            secrets_floor: 0.35,
            vulnerabilities_floor: 0.30,
            configurations_floor: 0.25,
        }
    }
}

/// On-disk locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Feedback database path (append-only JSONL).
    pub feedback_file: PathBuf,
    /// Temp root override; empty means a per-process directory under the
    /// system temp dir.
    pub temp_root: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            feedback_file: PathBuf::from(".vigil/feedback.jsonl"),
            temp_root: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let config = EngineConfig::default();
        assert_eq!(config.limits.max_files_per_scan, 1000);
        assert_eq!(config.limits.max_file_size, 10 * MIB);
        assert_eq!(config.clone.clone_depth, 1);
        assert_eq!(config.clone.per_repo_size, 500 * MIB);
        assert_eq!(config.clone.max_concurrent_scans, 5);
        assert_eq!(config.streaming.streaming_threshold, 100 * MIB);
        assert_eq!(config.streaming.chunk_overlap, 1024);
        assert_eq!(config.dedup.max_findings, 10_000);
        assert_eq!(config.limiter.target_error_rate, 0.05);
        assert_eq!(config.monitor.memory_warning_threshold, 0.8);
        assert_eq!(config.workers.file_batch_size, 20);
        assert!(config.workers.effective_pool_size() >= 1);
        assert!(config.workers.effective_pool_size() <= 4);
    }

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let parsed: EngineConfig = toml::from_str(
            r#"
            [limits]
            max_files_per_scan = 50

            [limiter]
            requests_per_second = 2.5
            backoff_strategy = "linear"
            "#,
        )
        .unwrap();
        assert_eq!(parsed.limits.max_files_per_scan, 50);
        assert_eq!(parsed.limits.max_file_size, 10 * MIB);
        assert_eq!(parsed.limiter.requests_per_second, 2.5);
        assert_eq!(parsed.limiter.backoff_strategy, BackoffStrategy::Linear);
        assert_eq!(parsed.clone.max_concurrent_scans, 5);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = EngineConfig::load(Some(Path::new("/nonexistent/vigil.toml"))).unwrap();
        assert_eq!(config.limits.max_files_per_scan, 1000);
    }
}
