//! Repository acquisition
//!
//! Probes a repository for accessibility with a shallow clone, then
//! performs the bounded clone into an isolated `clone_<scan-id>` temp
//! directory: depth-limited, single-branch, no tags, wall-clock timeout,
//! working tree measured against the per-repo size budget, and every
//! clone registered in the resource monitor's temp ledger so sweeps and
//! shutdown can always clean up.

use crate::config::{CloneConfig, LimiterConfig};
use crate::error::{ErrorCode, ScanError};
use crate::limiter::{self, RateLimiter};
use crate::monitor::ResourceMonitor;
use crate::target::RepoUrl;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// A clone on disk, owned by its scan until released.
#[derive(Debug, Clone)]
pub struct ClonedRepo {
    pub path: PathBuf,
    pub size_bytes: u64,
}

pub struct RepoAcquirer {
    git: PathBuf,
    config: CloneConfig,
    retry: LimiterConfig,
    limiter: Arc<RateLimiter>,
    monitor: Arc<ResourceMonitor>,
    temp_root: PathBuf,
}

impl RepoAcquirer {
    pub fn new(
        config: CloneConfig,
        retry: LimiterConfig,
        limiter: Arc<RateLimiter>,
        monitor: Arc<ResourceMonitor>,
        temp_root: PathBuf,
    ) -> anyhow::Result<Self> {
        let git = which::which("git")
            .map_err(|e| anyhow::anyhow!("git binary not found on PATH: {e}"))?;
        Ok(Self {
            git,
            config,
            retry,
            limiter,
            monitor,
            temp_root,
        })
    }

    /// Accessibility check: a depth-1 probe clone into scratch space with
    /// a short timeout. Retryable failures (network, timeout) retry with
    /// backoff before giving up.
    pub async fn probe(&self, repo: &RepoUrl, cancel: &CancellationToken) -> Result<(), ScanError> {
        limiter::retry_with_backoff(&self.retry, cancel, "repository probe", |attempt| async move {
            if attempt > 0 {
                tracing::debug!("probe retry {} for {}", attempt, repo.clone_url);
            }
            self.limiter.acquire(repo.limiter_key(), cancel).await?;
            let scratch = tempfile::tempdir_in(&self.temp_root).map_err(|e| {
                ScanError::new(ErrorCode::RepositoryAccessError, "failed to create scratch dir")
                    .with_source(e)
            })?;
            let dest = scratch.path().join("probe");
            let result = self
                .run_git(
                    &[
                        "clone",
                        "--depth",
                        "1",
                        "--single-branch",
                        "--no-tags",
                        &repo.clone_url,
                        &dest.to_string_lossy(),
                    ],
                    self.config.probe_timeout(),
                    cancel,
                )
                .await;
            match &result {
                Ok(()) => self.limiter.record_success(repo.limiter_key()),
                Err(error) if error.code != ErrorCode::Cancelled => {
                    self.limiter.record_failure(repo.limiter_key(), None)
                }
                Err(_) => {}
            }
            result
        })
        .await
    }

    /// Full bounded clone for a scan. The returned directory is
    /// registered (pinned) in the monitor's temp ledger.
    pub async fn acquire(
        &self,
        scan_id: Uuid,
        repo: &RepoUrl,
        depth: u32,
        cancel: &CancellationToken,
    ) -> Result<ClonedRepo, ScanError> {
        let dest = self.clone_dir(scan_id);
        if dest.exists() {
            let _ = std::fs::remove_dir_all(&dest);
        }

        self.limiter.acquire(repo.limiter_key(), cancel).await?;

        let depth_arg = depth.max(1).to_string();
        let clone_result = self
            .run_git(
                &[
                    "clone",
                    "--depth",
                    &depth_arg,
                    "--single-branch",
                    "--no-tags",
                    &repo.clone_url,
                    &dest.to_string_lossy(),
                ],
                self.config.clone_timeout(),
                cancel,
            )
            .await;

        if let Err(error) = clone_result {
            if error.code != ErrorCode::Cancelled {
                self.limiter.record_failure(repo.limiter_key(), None);
            }
            let _ = std::fs::remove_dir_all(&dest);
            return Err(error);
        }
        self.limiter.record_success(repo.limiter_key());

        let measured = {
            let dest = dest.clone();
            tokio::task::spawn_blocking(move || measure_tree_size(&dest))
                .await
                .unwrap_or(0)
        };

        if measured > self.config.per_repo_size {
            tracing::warn!(
                "repository {} is {} bytes, over the {} byte budget; discarding clone",
                repo.clone_url,
                measured,
                self.config.per_repo_size
            );
            let _ = std::fs::remove_dir_all(&dest);
            return Err(ScanError::new(
                ErrorCode::RepositoryTooLarge,
                format!("repository exceeds the {} byte budget", self.config.per_repo_size),
            )
            .with_details(serde_json::json!({
                "sizeBytes": measured,
                "limitBytes": self.config.per_repo_size,
            })));
        }

        self.monitor
            .register_temp_dir(&dest, measured, Some(scan_id));
        tracing::info!(
            "cloned {} into {} ({} bytes)",
            repo.clone_url,
            dest.display(),
            measured
        );
        Ok(ClonedRepo {
            path: dest,
            size_bytes: measured,
        })
    }

    pub fn clone_dir(&self, scan_id: Uuid) -> PathBuf {
        self.temp_root.join(format!("clone_{scan_id}"))
    }

    async fn run_git(
        &self,
        args: &[&str],
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), ScanError> {
        if cancel.is_cancelled() {
            return Err(ScanError::cancelled());
        }
        let mut child = Command::new(&self.git)
            .args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ScanError::new(ErrorCode::CloneFailed, "failed to spawn git").with_source(e)
            })?;

        let stderr = child.stderr.take();
        let wait = async {
            let output = match stderr {
                Some(mut pipe) => {
                    use tokio::io::AsyncReadExt;
                    let mut buffer = String::new();
                    let _ = pipe.read_to_string(&mut buffer).await;
                    let status = child.wait().await;
                    status.map(|status| (status, buffer))
                }
                None => child.wait().await.map(|status| (status, String::new())),
            };
            output.map_err(|e| {
                ScanError::new(ErrorCode::CloneFailed, "failed to wait for git").with_source(e)
            })
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(ScanError::cancelled()),
            result = tokio::time::timeout(timeout, wait) => match result {
                Err(_) => Err(ScanError::new(
                    ErrorCode::RepositoryTimeout,
                    format!("git did not finish within {timeout:?}"),
                )),
                Ok(Err(error)) => Err(error),
                Ok(Ok((status, stderr))) => {
                    if status.success() {
                        Ok(())
                    } else {
                        Err(map_git_error(&stderr))
                    }
                }
            },
        }
    }
}

/// Map git's stderr to the acquisition error taxonomy by substring.
fn map_git_error(stderr: &str) -> ScanError {
    let lowered = stderr.to_lowercase();
    let code = if lowered.contains("not found")
        || lowered.contains("404")
        || lowered.contains("does not exist")
        || lowered.contains("repository") && lowered.contains("disabled")
    {
        ErrorCode::RepositoryNotFound
    } else if lowered.contains("permission denied")
        || lowered.contains("403")
        || lowered.contains("authentication failed")
        || lowered.contains("access denied")
    {
        ErrorCode::RepositoryAccessDenied
    } else if lowered.contains("timed out") || lowered.contains("timeout") {
        ErrorCode::RepositoryTimeout
    } else if lowered.contains("could not resolve")
        || lowered.contains("unable to access")
        || lowered.contains("connection")
        || lowered.contains("network")
        || lowered.contains("unreachable")
    {
        ErrorCode::NetworkError
    } else {
        ErrorCode::RepositoryAccessError
    };

    // Keep the first stderr line for diagnostics; it never contains
    // scanned content.
    let first_line = stderr.lines().next().unwrap_or("").trim().to_string();
    ScanError::new(code, format!("git clone failed: {first_line}"))
}

/// Total size of a working tree in bytes.
pub fn measure_tree_size(root: &Path) -> u64 {
    walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|metadata| metadata.len())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MonitorConfig;
    use crate::events::EventBus;
    use tempfile::TempDir;

    fn acquirer(temp_root: &Path) -> Option<RepoAcquirer> {
        let events = EventBus::new();
        let monitor = Arc::new(
            ResourceMonitor::new(MonitorConfig::default(), u64::MAX, events.clone()).unwrap(),
        );
        let limiter = Arc::new(RateLimiter::new(
            LimiterConfig {
                requests_per_second: 1000.0,
                burst_limit: 1000.0,
                ..Default::default()
            },
            events,
        ));
        RepoAcquirer::new(
            CloneConfig::default(),
            LimiterConfig {
                base_backoff_ms: 1,
                max_backoff_ms: 2,
                max_retries: 0,
                ..Default::default()
            },
            limiter,
            monitor,
            temp_root.to_path_buf(),
        )
        .ok()
    }

    #[test]
    fn git_error_mapping() {
        assert_eq!(
            map_git_error("fatal: repository 'x' not found").code,
            ErrorCode::RepositoryNotFound
        );
        assert_eq!(
            map_git_error("remote: HTTP Basic: Access denied").code,
            ErrorCode::RepositoryAccessDenied
        );
        assert_eq!(
            map_git_error("fatal: unable to access 'x': Connection refused").code,
            ErrorCode::NetworkError
        );
        assert_eq!(
            map_git_error("fatal: could not resolve host: github.com").code,
            ErrorCode::NetworkError
        );
        assert_eq!(
            map_git_error("ssh: connect to host github.com: Operation timed out").code,
            ErrorCode::RepositoryTimeout
        );
        assert_eq!(
            map_git_error("fatal: something inexplicable").code,
            ErrorCode::RepositoryAccessError
        );
    }

    #[test]
    fn tree_size_measures_files_recursively() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("a.txt"), vec![0u8; 100]).unwrap();
        std::fs::write(dir.path().join("sub/b.txt"), vec![0u8; 50]).unwrap();
        assert_eq!(measure_tree_size(dir.path()), 150);
    }

    #[test]
    fn clone_dir_is_named_after_the_scan() {
        let dir = TempDir::new().unwrap();
        let Some(acquirer) = acquirer(dir.path()) else {
            return; // git not installed
        };
        let scan_id = Uuid::new_v4();
        let path = acquirer.clone_dir(scan_id);
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("clone_"));
        assert!(path.to_string_lossy().contains(&scan_id.to_string()));
    }

    #[tokio::test]
    async fn run_git_surfaces_failures_from_local_operations() {
        let dir = TempDir::new().unwrap();
        let Some(acquirer) = acquirer(dir.path()) else {
            return; // git not installed
        };
        // Cloning a nonexistent local path fails fast with a mapped error.
        let missing = dir.path().join("no-such-repo");
        let dest = dir.path().join("dest");
        let err = acquirer
            .run_git(
                &[
                    "clone",
                    &missing.to_string_lossy(),
                    &dest.to_string_lossy(),
                ],
                Duration::from_secs(30),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_ne!(err.code, ErrorCode::Cancelled);
    }

    #[tokio::test]
    async fn run_git_clones_a_local_repository() {
        let dir = TempDir::new().unwrap();
        let Some(acquirer) = acquirer(dir.path()) else {
            return; // git not installed
        };

        // Build a tiny source repository.
        let source = dir.path().join("source");
        std::fs::create_dir_all(&source).unwrap();
        let git = |args: &[&str], cwd: &Path| {
            std::process::Command::new("git")
                .args(args)
                .current_dir(cwd)
                .env("GIT_AUTHOR_NAME", "t")
                .env("GIT_AUTHOR_EMAIL", "t@t")
                .env("GIT_COMMITTER_NAME", "t")
                .env("GIT_COMMITTER_EMAIL", "t@t")
                .output()
                .unwrap()
        };
        assert!(git(&["init", "--initial-branch=main"], &source).status.success());
        std::fs::write(source.join("file.txt"), "hello").unwrap();
        git(&["add", "."], &source);
        assert!(git(&["commit", "-m", "init"], &source).status.success());

        let dest = dir.path().join("dest");
        acquirer
            .run_git(
                &[
                    "clone",
                    "--depth",
                    "1",
                    &source.to_string_lossy(),
                    &dest.to_string_lossy(),
                ],
                Duration::from_secs(30),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(dest.join("file.txt").exists());
    }

    #[tokio::test]
    async fn cancellation_wins_over_clone() {
        let dir = TempDir::new().unwrap();
        let Some(acquirer) = acquirer(dir.path()) else {
            return; // git not installed
        };
        let cancel = CancellationToken::new();
        cancel.cancel();
        let repo = RepoUrl::parse("https://github.com/owner/repo").unwrap();
        let err = acquirer.probe(&repo, &cancel).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::Cancelled);
    }
}
