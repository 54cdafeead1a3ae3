//! Runs the selected checks on a device and records what happened.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info};

use crate::algorithm::AlgorithmIdentity;
use crate::algorithms;
use crate::backend::{ComputeBackend, DeviceDescription};
use crate::error::{CheckError, CheckResult};
use crate::kernels::KernelSourceProvider;
use crate::scheduler::StopWaitScheduler;
use crate::signature::VersionSignature;
use crate::ui;
use crate::validation::{AlgoTest, CheckKind, CheckReport, HarnessOptions};
use crate::vectors::TestVectorSet;

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub checks: Vec<CheckKind>,
    pub batch: usize,
    pub step_items: usize,
    pub harness: HarnessOptions,
    pub report_dir: Option<PathBuf>,
    pub verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Passed,
    Failed,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckOutcome {
    pub check: CheckKind,
    pub algorithm: AlgorithmIdentity,
    pub signature: Option<VersionSignature>,
    pub device: String,
    pub status: CheckStatus,
    pub tested: usize,
    pub errors: Vec<String>,
    pub report: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub outcomes: Vec<CheckOutcome>,
    pub interrupted: bool,
}

impl RunSummary {
    pub fn passed(&self) -> bool {
        !self.interrupted
            && self
                .outcomes
                .iter()
                .all(|outcome| outcome.status == CheckStatus::Passed)
    }

    pub fn count(&self, status: CheckStatus) -> usize {
        self.outcomes
            .iter()
            .filter(|outcome| outcome.status == status)
            .count()
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("failed to serialize run summary")?;
        fs::write(path, json)
            .with_context(|| format!("failed to write run summary {}", path.display()))
    }
}

pub struct Runner<'a> {
    config: &'a RunConfig,
    sources: &'a dyn KernelSourceProvider,
    vectors: &'a TestVectorSet,
    shutdown: &'a AtomicBool,
}

impl<'a> Runner<'a> {
    pub fn new(
        config: &'a RunConfig,
        sources: &'a dyn KernelSourceProvider,
        vectors: &'a TestVectorSet,
        shutdown: &'a AtomicBool,
    ) -> Self {
        Self {
            config,
            sources,
            vectors,
            shutdown,
        }
    }

    /// Runs every selected check on one device. Check failures are recorded
    /// in `summary`; only report-file I/O errors are returned.
    pub fn run_device<B: ComputeBackend>(&self, backend: Arc<B>, summary: &mut RunSummary) -> Result<()> {
        let device = backend.describe();
        info!(device = %device, "checking device");
        let batch = self.config.batch;
        let harness = &self.config.harness;

        for &check in &self.config.checks {
            match check {
                CheckKind::Head => {
                    for stage in algorithms::head_stages() {
                        if self.stopped(summary) {
                            return Ok(());
                        }
                        let identity = (stage.table)(batch).identity;
                        let result = stage.run(Arc::clone(&backend), self.sources, batch, harness);
                        self.record(summary, check, identity, &device, result)?;
                    }
                }
                CheckKind::Step => {
                    let items = self.config.step_items;
                    for stage in algorithms::step_stages() {
                        if self.stopped(summary) {
                            return Ok(());
                        }
                        let identity = (stage.table)(items).identity;
                        let result = stage.run(Arc::clone(&backend), self.sources, items, harness);
                        self.record(summary, check, identity, &device, result)?;
                    }
                }
                CheckKind::Tail => {
                    for stage in algorithms::tail_stages() {
                        if self.stopped(summary) {
                            return Ok(());
                        }
                        let identity = (stage.table)(batch).identity;
                        let result = stage.run(Arc::clone(&backend), self.sources, batch, harness);
                        self.record(summary, check, identity, &device, result)?;
                    }
                }
                CheckKind::Algo => {
                    for table in algorithms::search_tables() {
                        if self.stopped(summary) {
                            return Ok(());
                        }
                        let identity = table(batch).identity;
                        let result = self.run_algo(Arc::clone(&backend), table, &device);
                        self.record(summary, check, identity, &device, result)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn stopped(&self, summary: &mut RunSummary) -> bool {
        if self.shutdown.load(Ordering::Relaxed) {
            summary.interrupted = true;
        }
        summary.interrupted
    }

    fn run_algo<B: ComputeBackend>(
        &self,
        backend: Arc<B>,
        table: algorithms::SearchTable,
        device: &DeviceDescription,
    ) -> CheckResult<CheckReport> {
        let batch = self.config.batch;
        let table = table(batch);
        let test = AlgoTest::new(self.vectors, self.config.harness.max_detailed);
        if !test.can_run(batch) {
            return Err(CheckError::Protocol(format!(
                "batch of {batch} hashes does not divide the {}-hash blocks of {}",
                self.vectors.nominal_hash_count, self.vectors.name
            )));
        }
        let mut scheduler = StopWaitScheduler::new(backend, &table, self.sources, batch)?;
        let blocks = self.vectors.blocks.len();
        let verbose = self.config.verbose;
        let outcome = test.run(&mut scheduler, self.shutdown, |block| {
            debug!(algorithm = %table.identity, block, "test block finished");
            if verbose {
                ui::note("algo", format!("{} block {}/{blocks}", table.identity, block + 1));
            }
        })?;

        Ok(CheckReport {
            check: CheckKind::Algo,
            identity: table.identity.clone(),
            signature: scheduler.algorithm().signature(),
            device: device.clone(),
            tested: outcome.blocks_run,
            failures: outcome.messages,
        })
    }

    fn record(
        &self,
        summary: &mut RunSummary,
        check: CheckKind,
        identity: AlgorithmIdentity,
        device: &DeviceDescription,
        result: CheckResult<CheckReport>,
    ) -> Result<()> {
        let mut outcome = match result {
            Ok(report) => CheckOutcome {
                check,
                algorithm: report.identity,
                signature: Some(report.signature),
                device: device.to_string(),
                status: if report.failures.is_empty() {
                    CheckStatus::Passed
                } else {
                    CheckStatus::Failed
                },
                tested: report.tested,
                errors: report.failures,
                report: None,
            },
            Err(err) => CheckOutcome {
                check,
                algorithm: identity,
                signature: None,
                device: device.to_string(),
                status: CheckStatus::Error,
                tested: 0,
                errors: vec![err.to_string()],
                report: None,
            },
        };

        ui::check_finished(&outcome, self.config.verbose);

        if outcome.status != CheckStatus::Passed {
            if let Some(dir) = &self.config.report_dir {
                let path = write_report(dir, &outcome, device)?;
                ui::note("report", format!("wrote {}", path.display()));
                outcome.report = Some(path);
            }
        }
        summary.outcomes.push(outcome);
        Ok(())
    }
}

pub fn report_file_name(identity: &AlgorithmIdentity, signature: Option<VersionSignature>, device: &DeviceDescription) -> String {
    let signature = signature.map_or_else(|| "unsigned".to_string(), |signature| signature.to_hex());
    format!(
        "{}_{}_{}_{}.txt",
        identity.algorithm,
        identity.implementation,
        signature,
        device.slug()
    )
}

/// Writes the failure report of one algorithm/device pairing.
pub fn write_report(dir: &Path, outcome: &CheckOutcome, device: &DeviceDescription) -> Result<PathBuf> {
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create report directory {}", dir.display()))?;
    let path = dir.join(report_file_name(&outcome.algorithm, outcome.signature, device));

    let mut text = String::new();
    let _ = writeln!(text, "Algorithm: {}", outcome.algorithm.algorithm);
    let _ = writeln!(text, "Implementation: {}", outcome.algorithm.implementation);
    let _ = writeln!(text, "Version: {}", outcome.algorithm.version);
    let _ = writeln!(
        text,
        "Signature: {}",
        outcome
            .signature
            .map_or_else(|| "unavailable".to_string(), |signature| signature.to_hex())
    );
    let _ = writeln!(text, "Device: {}", device.device);
    let _ = writeln!(text, "Platform: {} ({})", device.platform, device.backend);
    let _ = writeln!(text, "Check: {}", outcome.check);
    for error in &outcome.errors {
        let _ = write!(text, "\n{}\n", error.trim_end());
    }

    fs::write(&path, text).with_context(|| format!("failed to write report {}", path.display()))?;
    Ok(path)
}
