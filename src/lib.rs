//! # Vigil - Security Scanning Engine
//!
//! An asynchronous security scanner for live URLs and public Git
//! repositories. Vigil drives phased scans (security headers, URL
//! analysis, repository acquisition, file scanning) through a pattern
//! engine with confidence scoring, deduplication, rate limiting, and
//! resource-governed parallel workers.
//!
//! ## Quick Start
//!
//! ```bash
//! # Install vigil
//! cargo install vigil
//!
//! # Scan a repository
//! vigil scan https://github.com/owner/repo
//!
//! # Scan a live URL's security posture
//! vigil scan https://example.com
//! ```

pub mod acquire;
pub mod analyze;
pub mod cli;
pub mod config;
pub mod dedup;
pub mod engine;
pub mod error;
pub mod events;
pub mod finding;
pub mod limiter;
pub mod monitor;
pub mod orchestrator;
pub mod report;
pub mod score;
pub mod target;
pub mod walk;
pub mod workers;

pub use config::EngineConfig;
pub use error::{ErrorCode, ScanError};
pub use finding::{Category, Finding, Severity};
pub use orchestrator::{CancelOutcome, Orchestrator, ScanOptions, ScanStatus};
pub use report::ScanReport;
pub use target::{Platform, RepoUrl, Target};

/// Result type alias for engine operations at the application edge.
pub type Result<T> = anyhow::Result<T>;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
pub const PKG_DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
