//! Command-line interface for Vigil
//!
//! A thin skin over the scan engine: `vigil scan` runs one scan end to
//! end (start, poll, print the report), `vigil patterns` lists the
//! registered pattern set.

use crate::config::EngineConfig;
use crate::orchestrator::{Orchestrator, PhaseKind, ScanOptions};
use crate::report;
use crate::target::Target;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

/// Vigil - security scanning for URLs and public Git repositories
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Subcommands
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand)]
pub enum Commands {
    /// Scan a URL or repository and print the report
    Scan {
        /// Target: an HTTP(S) URL or a github.com/gitlab.com repository
        target: String,

        /// Phases to run (headers, url, repository, files); default all
        #[arg(long = "phase", value_name = "PHASE")]
        phases: Vec<String>,

        /// Maximum number of files to scan
        #[arg(long)]
        max_files: Option<usize>,

        /// Only scan paths matching these globs
        #[arg(long = "include", value_name = "GLOB")]
        include: Vec<String>,

        /// Skip paths matching these globs (wins over --include)
        #[arg(long = "exclude", value_name = "GLOB")]
        exclude: Vec<String>,

        /// Drop findings below this confidence
        #[arg(long)]
        threshold: Option<f64>,

        /// Shallow clone depth
        #[arg(long)]
        depth: Option<u32>,

        /// Overall scan timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Basic mode: url phase only, deduplication disabled
        #[arg(long)]
        basic: bool,

        /// Output format: json or summary
        #[arg(long, default_value = "json")]
        output: String,
    },
    /// List the registered pattern set
    Patterns,
}

impl Cli {
    /// Execute the CLI command
    pub async fn run(self) -> Result<()> {
        let config = EngineConfig::load(self.config.as_deref())?;
        match self.command {
            Commands::Scan {
                target,
                phases,
                max_files,
                include,
                exclude,
                threshold,
                depth,
                timeout,
                basic,
                output,
            } => {
                let options = build_options(
                    &phases, max_files, include, exclude, threshold, depth, timeout, basic,
                )?;
                run_scan(config, &target, options, &output).await
            }
            Commands::Patterns => {
                list_patterns(config).await;
                Ok(())
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn build_options(
    phases: &[String],
    max_files: Option<usize>,
    include: Vec<String>,
    exclude: Vec<String>,
    threshold: Option<f64>,
    depth: Option<u32>,
    timeout: Option<u64>,
    basic: bool,
) -> Result<ScanOptions> {
    let mut parsed_phases = Vec::new();
    for raw in phases {
        let kind = PhaseKind::parse(raw)
            .with_context(|| format!("unknown phase '{raw}' (headers, url, repository, files)"))?;
        parsed_phases.push(kind);
    }
    Ok(ScanOptions {
        phases: parsed_phases,
        max_files,
        include,
        exclude,
        confidence_threshold: threshold,
        clone_depth: depth,
        timeout_secs: timeout,
        basic,
    })
}

async fn run_scan(
    config: EngineConfig,
    target: &str,
    options: ScanOptions,
    output: &str,
) -> Result<()> {
    let target = Target::infer(target).map_err(|e| anyhow::anyhow!("{e}"))?;
    tracing::info!("scanning {}", target.describe());

    let engine = Orchestrator::new(config).await?;
    let scan_id = engine
        .start(target, options)
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    // Poll until terminal, reporting coarse progress on stderr.
    let mut last_progress = 0;
    loop {
        tokio::time::sleep(Duration::from_millis(250)).await;
        let snapshot = engine.status(scan_id).map_err(|e| anyhow::anyhow!("{e}"))?;
        if snapshot.progress.current != last_progress {
            last_progress = snapshot.progress.current;
            tracing::info!(
                "progress: {}/{}",
                snapshot.progress.current,
                snapshot.progress.total
            );
        }
        if snapshot.status.is_terminal() {
            break;
        }
    }

    let scan_report = engine.results(scan_id).map_err(|e| anyhow::anyhow!("{e}"))?;
    engine.shutdown(Duration::from_secs(5)).await;

    match output {
        "summary" => print_summary(&scan_report),
        _ => println!("{}", serde_json::to_string_pretty(&scan_report)?),
    }

    // A scan that surfaced high or critical findings exits nonzero so CI
    // pipelines can gate on it.
    if report::count_at_or_above(&scan_report, crate::finding::Severity::High) > 0 {
        std::process::exit(2);
    }
    Ok(())
}

fn print_summary(scan_report: &crate::report::ScanReport) {
    println!(
        "scan {} {:?}: {} findings",
        scan_report.scan_id, scan_report.status, scan_report.summary.total_findings
    );
    for (severity, count) in &scan_report.summary.counts_by_severity {
        println!("  {severity}: {count}");
    }
    for category in &scan_report.categories {
        println!("{}:", category.category);
        for finding in &category.findings {
            println!(
                "  [{}] {} at {}:{}:{} (confidence {:.2})",
                finding.severity, finding.pattern_name, finding.file, finding.line, finding.column,
                finding.confidence
            );
        }
    }
}

async fn list_patterns(config: EngineConfig) {
    let _ = config;
    match crate::engine::PatternRegistry::embedded() {
        Ok(registry) => {
            println!("{:<32} {:<16} {:<10} {:>10}", "ID", "CATEGORY", "SEVERITY", "CONFIDENCE");
            for pattern in registry.patterns() {
                println!(
                    "{:<32} {:<16} {:<10} {:>10.2}",
                    pattern.id,
                    pattern.category.to_string(),
                    pattern.severity.to_string(),
                    pattern.base_confidence
                );
            }
        }
        Err(e) => eprintln!("failed to load pattern registry: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_arguments_parse() {
        let options = build_options(
            &["headers".to_string(), "FILES".to_string()],
            None,
            vec![],
            vec![],
            None,
            None,
            None,
            false,
        )
        .unwrap();
        assert_eq!(options.phases, vec![PhaseKind::Headers, PhaseKind::Files]);
    }

    #[test]
    fn unknown_phase_is_an_error() {
        let result = build_options(
            &["bogus".to_string()],
            None,
            vec![],
            vec![],
            None,
            None,
            None,
            false,
        );
        assert!(result.is_err());
    }
}
