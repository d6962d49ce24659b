//! Resource monitor
//!
//! Tracks process memory against a configured cap, enforces the
//! concurrent-stream cap with RAII permits, and keeps the ledger of
//! temp directories (clones) with their sizes and ages so budget
//! enforcement and sweeps always know what is on disk. Thresholds:
//! warning at 80% of the cap (GC hint, throttle new streams), critical at
//! 90% (deny admission, sweep), emergency at 95% (reject new scans until
//! usage recovers below 70%).

use crate::config::MonitorConfig;
use crate::error::{AdmissionReason, ErrorCode, ScanError};
use crate::events::{EngineEvent, EventBus};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Memory pressure bands, ascending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MemoryPressure {
    Normal,
    Warning,
    Critical,
    Emergency,
}

impl MemoryPressure {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => MemoryPressure::Normal,
            1 => MemoryPressure::Warning,
            2 => MemoryPressure::Critical,
            _ => MemoryPressure::Emergency,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            MemoryPressure::Normal => 0,
            MemoryPressure::Warning => 1,
            MemoryPressure::Critical => 2,
            MemoryPressure::Emergency => 3,
        }
    }
}

/// One memory reading.
#[derive(Debug, Clone, Copy)]
pub struct MemorySample {
    pub rss_bytes: u64,
    pub virtual_bytes: u64,
    pub cap_bytes: u64,
}

impl MemorySample {
    pub fn usage_fraction(&self) -> f64 {
        if self.cap_bytes == 0 {
            0.0
        } else {
            self.rss_bytes as f64 / self.cap_bytes as f64
        }
    }
}

/// A tracked temp directory (one clone).
#[derive(Debug, Clone)]
pub struct TempDirRecord {
    pub bytes: u64,
    pub created_at: Instant,
    pub scan_id: Option<Uuid>,
    /// Pinned while the owning scan is active; pinned dirs survive budget
    /// eviction but not the shutdown purge.
    pub pinned: bool,
}

struct MonitorState {
    system: System,
    pid: Pid,
    temp_dirs: HashMap<PathBuf, TempDirRecord>,
}

pub struct ResourceMonitor {
    config: MonitorConfig,
    temp_budget: u64,
    events: EventBus,
    state: Mutex<MonitorState>,
    cap_bytes: u64,
    pressure: AtomicU8,
    in_emergency: AtomicBool,
    active_streams: AtomicUsize,
    peak_rss: AtomicU64,
}

impl ResourceMonitor {
    pub fn new(config: MonitorConfig, temp_budget: u64, events: EventBus) -> anyhow::Result<Self> {
        let pid = sysinfo::get_current_pid()
            .map_err(|e| anyhow::anyhow!("failed to resolve current pid: {e}"))?;
        let mut system = System::new();
        let cap_bytes = if config.memory_cap > 0 {
            config.memory_cap
        } else {
            system.refresh_memory();
            system.total_memory()
        };
        Ok(Self {
            config,
            temp_budget,
            events,
            state: Mutex::new(MonitorState {
                system,
                pid,
                temp_dirs: HashMap::new(),
            }),
            cap_bytes,
            pressure: AtomicU8::new(0),
            in_emergency: AtomicBool::new(false),
            active_streams: AtomicUsize::new(0),
            peak_rss: AtomicU64::new(0),
        })
    }

    /// Take a memory sample and update the pressure state.
    pub fn sample(&self) -> MemorySample {
        let sample = {
            let mut state = self.state.lock().expect("monitor lock poisoned");
            let pid = state.pid;
            state
                .system
                .refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
            let (rss, virt) = state
                .system
                .process(pid)
                .map(|process| (process.memory(), process.virtual_memory()))
                .unwrap_or((0, 0));
            MemorySample {
                rss_bytes: rss,
                virtual_bytes: virt,
                cap_bytes: self.cap_bytes,
            }
        };
        self.peak_rss.fetch_max(sample.rss_bytes, Ordering::Relaxed);
        self.apply_usage(sample.usage_fraction(), sample.rss_bytes);
        sample
    }

    /// Pure threshold evaluation with emergency hysteresis.
    fn evaluate(&self, fraction: f64, was_emergency: bool) -> MemoryPressure {
        if fraction >= self.config.memory_emergency_threshold {
            MemoryPressure::Emergency
        } else if was_emergency && fraction >= self.config.memory_recovery_threshold {
            // Stay in emergency until usage recovers well below critical.
            MemoryPressure::Emergency
        } else if fraction >= self.config.memory_critical_threshold {
            MemoryPressure::Critical
        } else if fraction >= self.config.memory_warning_threshold {
            MemoryPressure::Warning
        } else {
            MemoryPressure::Normal
        }
    }

    fn apply_usage(&self, fraction: f64, used_bytes: u64) {
        let was_emergency = self.in_emergency.load(Ordering::Relaxed);
        let next = self.evaluate(fraction, was_emergency);
        let previous = MemoryPressure::from_u8(self.pressure.swap(next.as_u8(), Ordering::Relaxed));

        match next {
            MemoryPressure::Emergency => {
                if !was_emergency {
                    tracing::error!(
                        "memory emergency: {:.1}% of cap, rejecting new scans",
                        fraction * 100.0
                    );
                    self.in_emergency.store(true, Ordering::Relaxed);
                    self.events.publish(EngineEvent::EmergencyEntered);
                }
            }
            MemoryPressure::Critical => {
                if previous < MemoryPressure::Critical {
                    tracing::warn!("memory critical: {:.1}% of cap", fraction * 100.0);
                    self.events.publish(EngineEvent::MemoryCritical {
                        used_bytes,
                        cap_bytes: self.cap_bytes,
                    });
                }
                self.exit_emergency(was_emergency);
            }
            MemoryPressure::Warning => {
                if previous < MemoryPressure::Warning {
                    tracing::warn!("memory warning: {:.1}% of cap", fraction * 100.0);
                    self.events.publish(EngineEvent::MemoryWarning {
                        used_bytes,
                        cap_bytes: self.cap_bytes,
                    });
                }
                self.exit_emergency(was_emergency);
            }
            MemoryPressure::Normal => self.exit_emergency(was_emergency),
        }
    }

    fn exit_emergency(&self, was_emergency: bool) {
        if was_emergency {
            tracing::info!("memory recovered, exiting emergency mode");
            self.in_emergency.store(false, Ordering::Relaxed);
            self.events.publish(EngineEvent::EmergencyExited);
        }
    }

    pub fn pressure(&self) -> MemoryPressure {
        MemoryPressure::from_u8(self.pressure.load(Ordering::Relaxed))
    }

    pub fn in_emergency(&self) -> bool {
        self.in_emergency.load(Ordering::Relaxed)
    }

    pub fn peak_rss(&self) -> u64 {
        self.peak_rss.load(Ordering::Relaxed)
    }

    /// Admission gate for new scans: emergency mode, critical memory, and
    /// the global temp-disk budget all reject.
    pub fn admit_scan(&self) -> Result<(), ScanError> {
        if self.in_emergency() {
            return Err(ScanError::admission(
                AdmissionReason::EmergencyMode,
                "engine is in memory emergency mode",
            ));
        }
        if self.pressure() >= MemoryPressure::Critical {
            return Err(ScanError::admission(
                AdmissionReason::EmergencyMode,
                "memory usage is critical",
            ));
        }
        if self.temp_usage() >= self.temp_budget {
            return Err(ScanError::admission(
                AdmissionReason::DiskBudgetExhausted,
                "global temp-directory budget exhausted",
            ));
        }
        Ok(())
    }

    /// Acquire a streaming slot. The cap halves under memory warning.
    pub fn acquire_stream(self: &Arc<Self>) -> Result<StreamPermit, ScanError> {
        let cap = if self.pressure() >= MemoryPressure::Warning {
            (self.config.max_concurrent_streams / 2).max(1)
        } else {
            self.config.max_concurrent_streams
        };
        let mut current = self.active_streams.load(Ordering::Relaxed);
        loop {
            if current >= cap {
                return Err(ScanError::new(
                    ErrorCode::TooManyStreams,
                    format!("stream cap reached ({cap})"),
                ));
            }
            match self.active_streams.compare_exchange(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    return Ok(StreamPermit {
                        monitor: Arc::clone(self),
                    });
                }
                Err(actual) => current = actual,
            }
        }
    }

    pub fn active_streams(&self) -> usize {
        self.active_streams.load(Ordering::Relaxed)
    }

    /// System-wide available memory, used to size streaming chunks.
    pub fn available_memory(&self) -> u64 {
        let mut state = self.state.lock().expect("monitor lock poisoned");
        state.system.refresh_memory();
        state.system.available_memory()
    }

    /// Cooperative hint at a chunk boundary: log, let the allocator settle,
    /// and yield so other tasks can run.
    pub async fn gc_hint(&self) {
        tracing::trace!("gc hint at {:?} pressure", self.pressure());
        tokio::task::yield_now().await;
    }

    // --- temp-directory ledger -------------------------------------------

    pub fn register_temp_dir(&self, path: &Path, bytes: u64, scan_id: Option<Uuid>) {
        let mut state = self.state.lock().expect("monitor lock poisoned");
        state.temp_dirs.insert(
            path.to_path_buf(),
            TempDirRecord {
                bytes,
                created_at: Instant::now(),
                scan_id,
                pinned: true,
            },
        );
    }

    pub fn update_temp_dir_size(&self, path: &Path, bytes: u64) {
        let mut state = self.state.lock().expect("monitor lock poisoned");
        if let Some(record) = state.temp_dirs.get_mut(path) {
            record.bytes = bytes;
        }
    }

    /// Unpin once the owning scan is terminal; the dir stays on disk until
    /// retention or budget eviction claims it.
    pub fn unpin_temp_dir(&self, path: &Path) {
        let mut state = self.state.lock().expect("monitor lock poisoned");
        if let Some(record) = state.temp_dirs.get_mut(path) {
            record.pinned = false;
        }
    }

    /// Remove a temp dir from the ledger and from disk.
    pub fn release_temp_dir(&self, path: &Path) {
        {
            let mut state = self.state.lock().expect("monitor lock poisoned");
            state.temp_dirs.remove(path);
        }
        remove_dir_best_effort(path);
    }

    pub fn temp_usage(&self) -> u64 {
        let state = self.state.lock().expect("monitor lock poisoned");
        state.temp_dirs.values().map(|record| record.bytes).sum()
    }

    /// Evict oldest unpinned dirs until usage is under 80% of the budget.
    /// Returns the evicted paths.
    pub fn enforce_temp_budget(&self) -> Vec<PathBuf> {
        let threshold = (self.temp_budget as f64 * 0.8) as u64;
        let mut evicted = Vec::new();
        loop {
            let candidate = {
                let state = self.state.lock().expect("monitor lock poisoned");
                let usage: u64 = state.temp_dirs.values().map(|record| record.bytes).sum();
                if usage <= threshold {
                    break;
                }
                state
                    .temp_dirs
                    .iter()
                    .filter(|(_, record)| !record.pinned)
                    .min_by_key(|(_, record)| record.created_at)
                    .map(|(path, _)| path.clone())
            };
            match candidate {
                Some(path) => {
                    tracing::info!("evicting temp dir {} to meet disk budget", path.display());
                    self.release_temp_dir(&path);
                    self.events
                        .publish(EngineEvent::TempDirEvicted { path: path.clone() });
                    evicted.push(path);
                }
                None => break,
            }
        }
        evicted
    }

    /// Evict unpinned dirs older than `max_age`. Returns the evicted paths.
    pub fn sweep_aged(&self, max_age: std::time::Duration) -> Vec<PathBuf> {
        let now = Instant::now();
        let aged: Vec<PathBuf> = {
            let state = self.state.lock().expect("monitor lock poisoned");
            state
                .temp_dirs
                .iter()
                .filter(|(_, record)| {
                    !record.pinned && now.saturating_duration_since(record.created_at) > max_age
                })
                .map(|(path, _)| path.clone())
                .collect()
        };
        for path in &aged {
            tracing::info!("sweeping aged temp dir {}", path.display());
            self.release_temp_dir(path);
            self.events
                .publish(EngineEvent::TempDirEvicted { path: path.clone() });
        }
        aged
    }

    /// Shutdown path: purge every tracked dir, pinned or not.
    pub fn purge_all(&self) {
        let paths: Vec<PathBuf> = {
            let state = self.state.lock().expect("monitor lock poisoned");
            state.temp_dirs.keys().cloned().collect()
        };
        for path in paths {
            self.release_temp_dir(&path);
        }
    }

    /// Background sampling loop; recovery checks run on a tighter interval
    /// while in emergency mode.
    pub fn spawn_sampling(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let interval = if self.in_emergency() {
                    self.config.recovery_check_interval()
                } else {
                    self.config.monitoring_interval()
                };
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                let sample = self.sample();
                if self.pressure() >= MemoryPressure::Warning {
                    self.gc_hint().await;
                }
                if self.pressure() >= MemoryPressure::Critical {
                    self.enforce_temp_budget();
                }
                tracing::trace!(
                    "memory sample: {} MiB rss ({:.1}% of cap)",
                    sample.rss_bytes / (1024 * 1024),
                    sample.usage_fraction() * 100.0
                );
            }
        })
    }

    #[cfg(test)]
    pub(crate) fn force_usage(&self, fraction: f64) {
        self.apply_usage(fraction, (fraction * self.cap_bytes as f64) as u64);
    }
}

/// RAII streaming slot.
pub struct StreamPermit {
    monitor: Arc<ResourceMonitor>,
}

impl std::fmt::Debug for StreamPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamPermit").finish()
    }
}

impl Drop for StreamPermit {
    fn drop(&mut self) {
        self.monitor.active_streams.fetch_sub(1, Ordering::AcqRel);
    }
}

fn remove_dir_best_effort(path: &Path) {
    if path.exists() {
        if let Err(e) = std::fs::remove_dir_all(path) {
            tracing::warn!("failed to remove temp dir {}: {}", path.display(), e);
        }
    }
}
