//! Scan orchestrator
//!
//! Admits scans, drives their phases in the fixed order headers → url →
//! repository → files, surfaces progress, accepts cooperative
//! cancellation, and retains terminal scans until their TTL lapses.
//! Every scan is a record behind a lock plus a cancellation token; only
//! the driving task mutates the record, and never across a suspension
//! point.

pub mod scan;

pub use scan::{
    PhaseError, PhaseKind, PhaseRecord, PhaseStatus, ScanOptions, ScanProgress, ScanRecord,
    ScanStatus,
};

use crate::acquire::{ClonedRepo, RepoAcquirer};
use crate::analyze::{HeaderAnalyzer, UrlAnalyzer};
use crate::config::EngineConfig;
use crate::dedup::{DedupStats, Deduplicator};
use crate::engine::{EngineScanOptions, PatternEngine, PatternRegistry};
use crate::error::{AdmissionReason, ErrorCode, ScanError};
use crate::events::{EngineEvent, EventBus};
use crate::finding::Finding;
use crate::limiter::RateLimiter;
use crate::monitor::ResourceMonitor;
use crate::report::{build_report, ScanReport};
use crate::score::{FeedbackStore, Scorer};
use crate::target::Target;
use crate::walk::FileWalker;
use crate::workers::{ScanPipeline, WorkerPool};
use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Outcome of a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Accepted,
    AlreadyTerminal,
}

struct ScanSlot {
    record: RwLock<ScanRecord>,
    cancel: CancellationToken,
    /// Set only by an explicit cancel (user or shutdown), not by timeout.
    cancel_requested: AtomicBool,
}

impl ScanSlot {
    fn read(&self) -> std::sync::RwLockReadGuard<'_, ScanRecord> {
        self.record.read().expect("scan record lock poisoned")
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, ScanRecord> {
        self.record.write().expect("scan record lock poisoned")
    }
}

struct Inner {
    config: EngineConfig,
    registry: Arc<PatternRegistry>,
    engine: PatternEngine,
    dedup: Arc<Deduplicator>,
    limiter: Arc<RateLimiter>,
    monitor: Arc<ResourceMonitor>,
    feedback: Arc<FeedbackStore>,
    acquirer: Option<RepoAcquirer>,
    header_analyzer: HeaderAnalyzer,
    url_analyzer: UrlAnalyzer,
    events: EventBus,
    scans: RwLock<HashMap<Uuid, Arc<ScanSlot>>>,
    active_scans: AtomicUsize,
    shutdown: CancellationToken,
    temp_root_path: PathBuf,
    // Dropping the handle removes the per-process temp root.
    _temp_root: Option<tempfile::TempDir>,
}

/// The scan engine's public face.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub async fn new(config: EngineConfig) -> anyhow::Result<Self> {
        let events = EventBus::new();
        let registry = Arc::new(match std::env::var_os("VIGIL_PATTERNS") {
            Some(path) => PatternRegistry::with_overlay(std::path::Path::new(&path))?,
            None => PatternRegistry::embedded()?,
        });
        let engine = PatternEngine::new(Arc::clone(&registry));

        let temp_root = match &config.storage.temp_root {
            Some(parent) => {
                std::fs::create_dir_all(parent)?;
                tempfile::Builder::new().prefix("vigil-").tempdir_in(parent)?
            }
            None => tempfile::Builder::new().prefix("vigil-").tempdir()?,
        };
        let temp_root_path = temp_root.path().to_path_buf();

        let monitor = Arc::new(ResourceMonitor::new(
            config.monitor.clone(),
            config.clone.global_temp_budget,
            events.clone(),
        )?);
        let limiter = Arc::new(RateLimiter::new(config.limiter.clone(), events.clone()));
        let dedup = Arc::new(Deduplicator::new(config.dedup.clone()));
        let feedback = Arc::new(FeedbackStore::load(&config.storage.feedback_file)?);

        let acquirer = match RepoAcquirer::new(
            config.clone.clone(),
            config.limiter.clone(),
            Arc::clone(&limiter),
            Arc::clone(&monitor),
            temp_root_path.clone(),
        ) {
            Ok(acquirer) => Some(acquirer),
            Err(e) => {
                tracing::warn!("repository scanning unavailable: {e}");
                None
            }
        };

        let header_analyzer = HeaderAnalyzer::new(
            &config.http,
            config.limiter.clone(),
            Arc::clone(&registry),
            Arc::clone(&limiter),
        )?;
        let url_analyzer = UrlAnalyzer::new(
            &config.http,
            config.limiter.clone(),
            engine.clone(),
            Arc::clone(&limiter),
        )?;

        let shutdown = CancellationToken::new();
        let inner = Arc::new(Inner {
            config,
            registry,
            engine,
            dedup,
            limiter,
            monitor,
            feedback,
            acquirer,
            header_analyzer,
            url_analyzer,
            events,
            scans: RwLock::new(HashMap::new()),
            active_scans: AtomicUsize::new(0),
            shutdown,
            temp_root_path,
            _temp_root: Some(temp_root),
        });

        Arc::clone(&inner.monitor).spawn_sampling(inner.shutdown.child_token());
        tokio::spawn(retention_loop(Arc::clone(&inner)));

        Ok(Self { inner })
    }

    pub fn events(&self) -> EventBus {
        self.inner.events.clone()
    }

    pub fn registry(&self) -> &Arc<PatternRegistry> {
        &self.inner.registry
    }

    /// Admit and launch a scan, returning its id immediately.
    pub async fn start(
        &self,
        target: Target,
        options: ScanOptions,
    ) -> Result<Uuid, ScanError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(ScanError::admission(
                AdmissionReason::EmergencyMode,
                "engine is shutting down",
            ));
        }
        self.inner.monitor.admit_scan()?;
        let active = self.inner.active_scans.load(Ordering::Relaxed);
        if active >= self.inner.config.clone.max_concurrent_scans {
            return Err(ScanError::admission(
                AdmissionReason::ConcurrentScanCap,
                format!("{active} scans already running"),
            ));
        }

        let id = Uuid::new_v4();
        let record = ScanRecord::new(id, target, options);
        let slot = Arc::new(ScanSlot {
            record: RwLock::new(record),
            cancel: self.inner.shutdown.child_token(),
            cancel_requested: AtomicBool::new(false),
        });

        self.inner
            .scans
            .write()
            .expect("scan table lock poisoned")
            .insert(id, Arc::clone(&slot));
        self.inner.active_scans.fetch_add(1, Ordering::Relaxed);
        self.inner.events.publish(EngineEvent::ScanAdmitted { scan_id: id });
        tracing::info!("scan {} admitted", id);

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            drive(inner, slot).await;
        });
        Ok(id)
    }

    /// Immutable snapshot of a scan's state.
    pub fn status(&self, id: Uuid) -> Result<ScanRecord, ScanError> {
        let slot = self.slot(id)?;
        let record = slot.read().clone();
        Ok(record)
    }

    /// The report for a scan; non-terminal scans return a partial report.
    pub fn results(&self, id: Uuid) -> Result<ScanReport, ScanError> {
        let slot = self.slot(id)?;
        let record = slot.read();
        Ok(build_report(&record))
    }

    /// Cooperative cancellation; idempotent on terminal scans.
    pub fn cancel(&self, id: Uuid) -> Result<CancelOutcome, ScanError> {
        let slot = self.slot(id)?;
        if slot.read().status.is_terminal() {
            return Ok(CancelOutcome::AlreadyTerminal);
        }
        slot.cancel_requested.store(true, Ordering::Relaxed);
        slot.cancel.cancel();
        tracing::info!("scan {} cancellation requested", id);
        Ok(CancelOutcome::Accepted)
    }

    /// Record user feedback for a finding; affects only future scans.
    pub fn record_feedback(
        &self,
        scan_id: Uuid,
        finding_id: Uuid,
        is_false_positive: bool,
    ) -> Result<(), ScanError> {
        let slot = self.slot(scan_id)?;
        let key = {
            let record = slot.read();
            record
                .findings
                .iter()
                .find(|finding| finding.id == finding_id)
                .map(|finding| (finding.pattern_id.clone(), finding.value.clone()))
        };
        let Some((pattern_id, value)) = key else {
            return Err(ScanError::new(
                ErrorCode::NotFound,
                format!("unknown finding {finding_id} in scan {scan_id}"),
            ));
        };
        self.inner
            .feedback
            .record(&pattern_id, &value, is_false_positive)
            .map_err(|e| {
                ScanError::new(ErrorCode::FileReadError, "failed to persist feedback")
                    .with_source(e)
            })
    }

    /// Graceful shutdown: cancel every scan, wait for the drain, purge
    /// all temp state.
    pub async fn shutdown(&self, drain: Duration) {
        tracing::info!("engine shutdown requested");
        {
            let scans = self.inner.scans.read().expect("scan table lock poisoned");
            for slot in scans.values() {
                slot.cancel_requested.store(true, Ordering::Relaxed);
            }
        }
        self.inner.shutdown.cancel();

        let deadline = tokio::time::Instant::now() + drain;
        while self.inner.active_scans.load(Ordering::Relaxed) > 0
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        self.inner.monitor.purge_all();
    }

    fn slot(&self, id: Uuid) -> Result<Arc<ScanSlot>, ScanError> {
        self.inner
            .scans
            .read()
            .expect("scan table lock poisoned")
            .get(&id)
            .cloned()
            .ok_or_else(|| ScanError::not_found(id))
    }

    /// Run the retention eviction pass as if every terminal scan's TTL
    /// had already elapsed. Intended for tests and operational tooling.
    #[doc(hidden)]
    pub fn evict_expired_now(&self) {
        evict_expired(&self.inner, Duration::ZERO);
    }
}

/// Drive one scan to a terminal state.
async fn drive(inner: Arc<Inner>, slot: Arc<ScanSlot>) {
    let (id, target, options) = {
        let mut record = slot.write();
        record.status = ScanStatus::Running;
        (record.id, record.target.clone(), record.options.clone())
    };

    let budget = options.timeout(inner.config.limits.per_scan_timeout());
    let timed_out = tokio::time::timeout(budget, run_phases(&inner, &slot, &target, &options))
        .await
        .is_err();

    if timed_out {
        tracing::warn!("scan {} hit its {}s wall-clock budget", id, budget.as_secs());
        slot.cancel.cancel();
        let mut record = slot.write();
        for phase in &mut record.phases {
            if phase.status == PhaseStatus::Running {
                phase.status = PhaseStatus::Failed;
                phase.push_error(PhaseError {
                    code: ErrorCode::ScanTimeout,
                    message: format!("scan exceeded its {}s budget", budget.as_secs()),
                    details: serde_json::Value::Null,
                });
                phase.ended_at = Some(Utc::now());
            }
        }
    }

    finalize(&inner, &slot, timed_out).await;
    inner.active_scans.fetch_sub(1, Ordering::Relaxed);
    tracing::info!("scan {} reached {:?}", id, slot.read().status);
}

async fn run_phases(
    inner: &Arc<Inner>,
    slot: &Arc<ScanSlot>,
    target: &Target,
    options: &ScanOptions,
) {
    let scorer = Scorer::new(
        Arc::new(inner.config.scoring.clone()),
        inner.feedback.snapshot(),
    );
    let mut cloned: Option<ClonedRepo> = None;
    let kinds: Vec<PhaseKind> = slot.read().phases.iter().map(|phase| phase.kind).collect();

    for kind in kinds {
        if slot.cancel.is_cancelled() {
            break;
        }

        if !kind.applies_to(target) {
            let mut record = slot.write();
            if let Some(phase) = record.phase_mut(kind) {
                phase.status = PhaseStatus::Skipped;
                phase.ended_at = Some(Utc::now());
            }
            record.recompute_progress();
            continue;
        }

        {
            let mut record = slot.write();
            if let Some(phase) = record.phase_mut(kind) {
                phase.status = PhaseStatus::Running;
                phase.started_at = Some(Utc::now());
            }
        }
        tracing::debug!("scan {}: {} phase started", slot.read().id, kind.as_str());

        let result: Result<Vec<Finding>, ScanError> = match (kind, target) {
            (PhaseKind::Headers, Target::Url(url)) => {
                inner.header_analyzer.analyze(url, &slot.cancel).await
            }
            (PhaseKind::Url, Target::Url(url)) => {
                inner.url_analyzer.analyze(url, &scorer, &slot.cancel).await
            }
            (PhaseKind::Repository, Target::Repository(repo)) => {
                match run_repository(inner, slot, repo, options).await {
                    Ok(clone) => {
                        cloned = Some(clone);
                        Ok(Vec::new())
                    }
                    Err(error) => Err(error),
                }
            }
            (PhaseKind::Files, Target::Repository(repo)) => {
                run_files(inner, slot, repo, options, &scorer, &mut cloned).await
            }
            _ => unreachable!("applicability checked above"),
        };

        match result {
            Ok(findings) => {
                let mut record = slot.write();
                if let Some(phase) = record.phase_mut(kind) {
                    phase.status = PhaseStatus::Completed;
                    phase.progress = 100;
                    phase.ended_at = Some(Utc::now());
                }
                record.findings.extend(findings);
                record.recompute_progress();
            }
            Err(error) => {
                tracing::warn!(
                    "scan {}: {} phase failed: {}",
                    slot.read().id,
                    kind.as_str(),
                    error
                );
                let halts = error.code.halts_scan();
                let mut record = slot.write();
                if let Some(phase) = record.phase_mut(kind) {
                    phase.status = PhaseStatus::Failed;
                    phase.push_error(PhaseError::from(&error));
                    phase.ended_at = Some(Utc::now());
                }
                record.recompute_progress();
                drop(record);
                if halts {
                    break;
                }
            }
        }
    }
}

async fn run_repository(
    inner: &Arc<Inner>,
    slot: &Arc<ScanSlot>,
    repo: &crate::target::RepoUrl,
    options: &ScanOptions,
) -> Result<ClonedRepo, ScanError> {
    let acquirer = inner.acquirer.as_ref().ok_or_else(|| {
        ScanError::new(ErrorCode::CloneFailed, "git binary not available on this host")
    })?;
    let scan_id = slot.read().id;
    acquirer.probe(repo, &slot.cancel).await?;
    {
        let mut record = slot.write();
        if let Some(phase) = record.phase_mut(PhaseKind::Repository) {
            phase.progress = 50;
        }
        record.recompute_progress();
    }
    let depth = options
        .clone_depth
        .unwrap_or(inner.config.clone.clone_depth);
    acquirer.acquire(scan_id, repo, depth, &slot.cancel).await
}

async fn run_files(
    inner: &Arc<Inner>,
    slot: &Arc<ScanSlot>,
    repo: &crate::target::RepoUrl,
    options: &ScanOptions,
    scorer: &Scorer,
    cloned: &mut Option<ClonedRepo>,
) -> Result<Vec<Finding>, ScanError> {
    // Acquire on demand when the repository phase was not requested.
    let clone = match cloned {
        Some(clone) => clone.clone(),
        None => {
            let clone = run_repository(inner, slot, repo, options).await?;
            *cloned = Some(clone.clone());
            clone
        }
    };

    let mut limits = inner.config.limits.clone();
    if let Some(max_files) = options.max_files {
        limits.max_files_per_scan = max_files;
    }
    let walker = FileWalker::new(
        inner.engine.clone(),
        &limits,
        &options.include,
        &options.exclude,
    );
    let root = clone.path.clone();
    let outcome = tokio::task::spawn_blocking(move || walker.discover(&root))
        .await
        .map_err(|e| {
            ScanError::new(ErrorCode::FileReadError, "file walk panicked").with_source(e)
        })?;

    let mut findings = outcome.findings;
    tracing::debug!(
        "scan {}: walking selected {} files ({} findings from paths)",
        slot.read().id,
        outcome.files.len(),
        findings.len()
    );

    // Coalescing progress reader: the latest update per phase wins.
    let (progress_tx, mut progress_rx) = mpsc::channel::<u8>(32);
    let progress_slot = Arc::clone(slot);
    let progress_task = tokio::spawn(async move {
        while let Some(mut percent) = progress_rx.recv().await {
            while let Ok(newer) = progress_rx.try_recv() {
                percent = newer;
            }
            let mut record = progress_slot.write();
            if let Some(phase) = record.phase_mut(PhaseKind::Files) {
                phase.progress = percent.min(100);
            }
            record.recompute_progress();
        }
    });

    let pipeline = Arc::new(ScanPipeline {
        engine: inner.engine.clone(),
        scorer: scorer.clone(),
        dedup: Arc::clone(&inner.dedup),
        monitor: Arc::clone(&inner.monitor),
        streaming: inner.config.streaming.clone(),
        engine_opts: EngineScanOptions {
            categories: None,
            max_matches: limits.max_matches_per_pattern,
            context_bytes: limits.context_bytes,
        },
        retry: inner.config.limiter.clone(),
    });
    let pool = WorkerPool::new(inner.config.workers.clone());
    let files_outcome = pool
        .scan_files(
            outcome.files,
            pipeline,
            slot.cancel.clone(),
            Some(progress_tx),
        )
        .await;
    let _ = progress_task.await;

    if files_outcome.cancelled {
        return Err(ScanError::cancelled());
    }
    findings.extend(files_outcome.findings);
    tracing::info!(
        "scan {}: files phase scanned {} files ({} failed), {} findings",
        slot.read().id,
        files_outcome.files_scanned,
        files_outcome.files_failed,
        findings.len()
    );
    Ok(findings)
}

/// Scan-scope dedup, threshold filter, and terminal bookkeeping.
async fn finalize(inner: &Arc<Inner>, slot: &Arc<ScanSlot>, timed_out: bool) {
    let (id, findings, basic) = {
        let mut record = slot.write();
        let findings = std::mem::take(&mut record.findings);
        (record.id, findings, record.options.basic)
    };

    let (merged, stats) = if basic {
        let count = findings.len();
        (findings, DedupStats::disabled(count))
    } else {
        inner.dedup.collapse_scan(findings)
    };
    if let Some(reason) = &stats.fallback_reason {
        if reason != "disabled" {
            inner.events.publish(EngineEvent::DedupFallback {
                reason: reason.clone(),
            });
        }
    }

    let threshold = {
        let record = slot.read();
        record
            .options
            .confidence_threshold
            .unwrap_or(inner.config.limits.confidence_threshold)
    };
    let kept: Vec<Finding> = merged
        .into_iter()
        .filter(|finding| finding.confidence >= threshold)
        .collect();

    let cancelled = slot.cancel_requested.load(Ordering::Relaxed) && !timed_out;
    {
        let mut record = slot.write();
        record.findings = kept;
        record.dedup_stats = Some(stats);
        record.conclude(cancelled);
    }

    // The clone directory outlives the scan until retention claims it.
    if let Some(acquirer) = &inner.acquirer {
        inner.monitor.unpin_temp_dir(&acquirer.clone_dir(id));
    }
}

/// Periodic retention sweep: evict expired scans, aged clones, and
/// enforce the global temp budget.
async fn retention_loop(inner: Arc<Inner>) {
    let interval = inner.config.clone.cleanup_sweep_interval();
    let cancel = inner.shutdown.child_token();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        evict_expired(&inner, inner.config.clone.scan_retention_ttl());
        inner.monitor.sweep_aged(inner.config.clone.max_scan_age());
        inner.monitor.enforce_temp_budget();
    }
}

fn evict_expired(inner: &Arc<Inner>, ttl: Duration) {
    let expired: Vec<Uuid> = {
        let scans = inner.scans.read().expect("scan table lock poisoned");
        scans
            .iter()
            .filter(|(_, slot)| {
                slot.read()
                    .terminal_since
                    .is_some_and(|since| since.elapsed() >= ttl)
            })
            .map(|(&id, _)| id)
            .collect()
    };
    if expired.is_empty() {
        return;
    }
    let mut scans = inner.scans.write().expect("scan table lock poisoned");
    for id in expired {
        scans.remove(&id);
        if let Some(acquirer) = &inner.acquirer {
            inner.monitor.release_temp_dir(&acquirer.clone_dir(id));
        } else {
            inner
                .monitor
                .release_temp_dir(&inner.temp_root_path.join(format!("clone_{id}")));
        }
        inner.events.publish(EngineEvent::ScanEvicted { scan_id: id });
        tracing::debug!("scan {} evicted after retention ttl", id);
    }
}
