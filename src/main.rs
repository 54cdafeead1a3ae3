use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use tracing_subscriber::EnvFilter;

use clkvc::backend::emulated::EmulatedDevice;
use clkvc::config::{BackendKind, Config};
use clkvc::kernels::{DirectorySources, EmbeddedSources, KernelSourceProvider};
use clkvc::runner::{CheckStatus, RunSummary, Runner};
use clkvc::ui;
use clkvc::vectors::TestVectorSet;

const EMULATED_DEVICE_NAME: &str = "host reference";

fn main() {
    if let Err(err) = run() {
        eprintln!("fatal: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cfg = Config::parse()?;
    init_logging(cfg.run.verbose);

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        ctrlc::set_handler(move || {
            shutdown.store(true, Ordering::SeqCst);
        })?;
    }

    let vectors = match &cfg.vectors {
        Some(path) => TestVectorSet::load_json(path)?,
        None => TestVectorSet::sha256d_reference()?,
    };
    let sources: Box<dyn KernelSourceProvider> = match &cfg.kernel_dir {
        Some(dir) => Box::new(DirectorySources::new(dir.clone())),
        None => Box::new(EmbeddedSources),
    };

    let checks: Vec<&str> = cfg.run.checks.iter().map(|check| check.as_str()).collect();
    ui::run_header(
        "clkvc: GPU hash kernels against CPU references",
        &[
            ("Backend", format!("{:?}", cfg.backend).to_lowercase()),
            ("Checks", checks.join(", ")),
            ("Batch", cfg.run.batch.to_string()),
            ("Step items", cfg.run.step_items.to_string()),
            ("Vectors", format!("{} ({} blocks)", vectors.name, vectors.blocks.len())),
            (
                "Kernels",
                cfg.kernel_dir
                    .as_ref()
                    .map(|dir| dir.display().to_string())
                    .unwrap_or_else(|| "built-in".to_string()),
            ),
        ],
    );

    let runner = Runner::new(&cfg.run, sources.as_ref(), &vectors, &shutdown);
    let mut summary = RunSummary::default();
    match cfg.backend {
        BackendKind::Emulated => {
            runner.run_device(Arc::new(EmulatedDevice::new(EMULATED_DEVICE_NAME)), &mut summary)?;
        }
        BackendKind::Opencl => run_opencl(&runner, &shutdown, &mut summary)?,
    }

    ui::run_finished(&summary);
    if let Some(path) = &cfg.summary {
        summary.write_json(path)?;
        ui::note("summary", format!("wrote {}", path.display()));
    }

    if summary.interrupted {
        bail!("run interrupted after {} check(s)", summary.outcomes.len());
    }
    if !summary.passed() {
        bail!(
            "{} check(s) failed and {} could not run",
            summary.count(CheckStatus::Failed),
            summary.count(CheckStatus::Error)
        );
    }
    Ok(())
}

fn init_logging(verbose: bool) {
    let fallback = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[cfg(feature = "opencl")]
fn run_opencl(runner: &Runner<'_>, shutdown: &AtomicBool, summary: &mut RunSummary) -> Result<()> {
    use anyhow::Context;
    use clkvc::backend::opencl::enumerate_gpus;

    let devices = enumerate_gpus().context("failed to enumerate OpenCL devices")?;
    if devices.is_empty() {
        bail!("no OpenCL GPU found");
    }
    for device in devices {
        if shutdown.load(Ordering::Relaxed) {
            summary.interrupted = true;
            break;
        }
        runner.run_device(Arc::new(device), summary)?;
    }
    Ok(())
}

#[cfg(not(feature = "opencl"))]
fn run_opencl(_runner: &Runner<'_>, _shutdown: &AtomicBool, _summary: &mut RunSummary) -> Result<()> {
    bail!("this build has no OpenCL support; rebuild with `--features opencl`")
}
