use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Parser, ValueEnum};

use crate::runner::RunConfig;
use crate::validation::{CheckKind, HarnessOptions, DEFAULT_MAX_DETAILED, DEFAULT_SEED};

/// Work items per group in every shipped kernel; launches must be whole groups.
const GROUP_ITEMS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendKind {
    /// Host threads running the reference kernels.
    Emulated,
    /// Every OpenCL GPU (needs the `opencl` feature).
    Opencl,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CheckSelection {
    Head,
    Step,
    Tail,
    Algo,
    All,
}

#[derive(Parser, Debug)]
#[command(name = "clkvc", version, about = "Validates GPU mining hash kernels against CPU references")]
struct Cli {
    #[arg(long, value_enum, default_value = "emulated")]
    backend: BackendKind,

    /// Load kernel sources from this directory instead of the built-in copies.
    #[arg(long)]
    kernel_dir: Option<PathBuf>,

    /// Hashes per dispatch for the scheduler-driven checks.
    #[arg(long, default_value_t = 4096)]
    batch: usize,

    /// Items hashed by each step check.
    #[arg(long, default_value_t = 65536)]
    step_items: usize,

    #[arg(long = "check", value_enum)]
    checks: Vec<CheckSelection>,

    /// JSON test vectors for the algorithm check.
    #[arg(long)]
    vectors: Option<PathBuf>,

    #[arg(long, default_value = ".")]
    report_dir: PathBuf,

    /// Write the run summary as JSON.
    #[arg(long)]
    summary: Option<PathBuf>,

    #[arg(long, default_value_t = DEFAULT_MAX_DETAILED)]
    max_mismatches: usize,

    #[arg(long, default_value_t = DEFAULT_SEED)]
    seed: u64,

    #[arg(long)]
    verbose: bool,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub backend: BackendKind,
    pub kernel_dir: Option<PathBuf>,
    pub vectors: Option<PathBuf>,
    pub summary: Option<PathBuf>,
    pub run: RunConfig,
}

impl Config {
    pub fn parse() -> Result<Self> {
        Self::from_cli(Cli::parse())
    }

    pub fn parse_from<I, T>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        Self::from_cli(Cli::try_parse_from(args)?)
    }

    fn from_cli(cli: Cli) -> Result<Self> {
        if cli.batch == 0 || cli.batch % GROUP_ITEMS != 0 {
            bail!("--batch must be a positive multiple of {GROUP_ITEMS}, got {}", cli.batch);
        }
        if cli.step_items == 0 || cli.step_items % GROUP_ITEMS != 0 {
            bail!(
                "--step-items must be a positive multiple of {GROUP_ITEMS}, got {}",
                cli.step_items
            );
        }
        if cli.max_mismatches == 0 {
            bail!("--max-mismatches must be at least 1");
        }

        Ok(Self {
            backend: cli.backend,
            kernel_dir: cli.kernel_dir,
            vectors: cli.vectors,
            summary: cli.summary,
            run: RunConfig {
                checks: selected_checks(&cli.checks),
                batch: cli.batch,
                step_items: cli.step_items,
                harness: HarnessOptions {
                    seed: cli.seed,
                    max_detailed: cli.max_mismatches,
                },
                report_dir: Some(cli.report_dir),
                verbose: cli.verbose,
            },
        })
    }
}

/// Checks in their canonical order, each once; nothing selected means all.
fn selected_checks(selection: &[CheckSelection]) -> Vec<CheckKind> {
    if selection.is_empty() || selection.contains(&CheckSelection::All) {
        return CheckKind::ALL.to_vec();
    }
    CheckKind::ALL
        .into_iter()
        .filter(|kind| {
            let wanted = match kind {
                CheckKind::Head => CheckSelection::Head,
                CheckKind::Step => CheckSelection::Step,
                CheckKind::Tail => CheckSelection::Tail,
                CheckKind::Algo => CheckSelection::Algo,
            };
            selection.contains(&wanted)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_run_every_check_on_the_emulated_device() {
        let config = Config::parse_from(["clkvc"]).expect("defaults should parse");
        assert_eq!(config.backend, BackendKind::Emulated);
        assert_eq!(config.run.checks, CheckKind::ALL.to_vec());
        assert_eq!(config.run.batch, 4096);
        assert_eq!(config.run.step_items, 65536);
        assert_eq!(config.run.harness.max_detailed, DEFAULT_MAX_DETAILED);
        assert_eq!(config.run.report_dir, Some(PathBuf::from(".")));
        assert!(config.summary.is_none());
    }

    #[test]
    fn repeated_checks_keep_canonical_order() {
        let config = Config::parse_from([
            "clkvc", "--check", "algo", "--check", "head", "--check", "algo",
        ])
        .expect("check list should parse");
        assert_eq!(config.run.checks, vec![CheckKind::Head, CheckKind::Algo]);

        let config = Config::parse_from(["clkvc", "--check", "tail", "--check", "all"])
            .expect("check list should parse");
        assert_eq!(config.run.checks.len(), 4);
    }

    #[test]
    fn batch_must_be_whole_work_groups() {
        for bad in ["0", "100"] {
            let err = Config::parse_from(["clkvc", "--batch", bad]).expect_err("batch should be rejected");
            assert!(err.to_string().contains("--batch"));
        }
        let err = Config::parse_from(["clkvc", "--step-items", "65"]).expect_err("step items should be rejected");
        assert!(err.to_string().contains("--step-items"));
        let err = Config::parse_from(["clkvc", "--max-mismatches", "0"]).expect_err("zero should be rejected");
        assert!(err.to_string().contains("--max-mismatches"));
    }

    #[test]
    fn paths_and_backend_are_passed_through() {
        let config = Config::parse_from([
            "clkvc",
            "--backend",
            "opencl",
            "--kernel-dir",
            "kernels",
            "--vectors",
            "set.json",
            "--summary",
            "out.json",
            "--report-dir",
            "reports",
            "--seed",
            "7",
            "--verbose",
        ])
        .expect("arguments should parse");
        assert_eq!(config.backend, BackendKind::Opencl);
        assert_eq!(config.kernel_dir, Some(PathBuf::from("kernels")));
        assert_eq!(config.vectors, Some(PathBuf::from("set.json")));
        assert_eq!(config.summary, Some(PathBuf::from("out.json")));
        assert_eq!(config.run.report_dir, Some(PathBuf::from("reports")));
        assert_eq!(config.run.harness.seed, 7);
        assert!(config.run.verbose);
    }
}
