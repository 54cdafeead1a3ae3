//! Final-stage check: threshold filtering of precomputed intermediate data.

use std::sync::Arc;

use tracing::debug;

use super::report::NonceSetDiff;
use super::{random_blob, CheckKind, CheckReport, HarnessOptions};
use crate::algorithm::AlgorithmTable;
use crate::backend::ComputeBackend;
use crate::error::{CheckError, CheckResult};
use crate::kernels::KernelSourceProvider;
use crate::scheduler::{StopWaitScheduler, TickOutcome};

#[derive(Clone, Copy)]
pub struct TailStage {
    pub table: fn(usize) -> AlgorithmTable,
    /// Buffer filled with random intermediate data before the kernels run.
    pub input: &'static str,
    pub item_bytes: usize,
    /// Candidates a batch should produce on average; sets the target.
    pub expected_hits: u64,
    pub magic: fn(&[u8]) -> u64,
}

impl TailStage {
    pub fn target(&self, batch: usize) -> u64 {
        (u64::MAX / batch.max(1) as u64).saturating_mul(self.expected_hits)
    }

    pub fn run<B: ComputeBackend>(
        &self,
        backend: Arc<B>,
        sources: &dyn KernelSourceProvider,
        batch: usize,
        options: &HarnessOptions,
    ) -> CheckResult<CheckReport> {
        let device = backend.describe();
        let input = random_blob(&mut options.rng(), batch * self.item_bytes);
        let mut table = (self.table)(batch);
        if !table.set_initial(self.input, input.clone()) {
            return Err(CheckError::Protocol(format!(
                "{} declares no buffer named {}",
                table.identity, self.input
            )));
        }

        let target = self.target(batch);
        let mut scheduler = StopWaitScheduler::new(backend, &table, sources, batch)?;
        scheduler.set_target(target);
        match scheduler.tick(&[])? {
            TickOutcome::Dispatched { .. } => {}
            other => {
                return Err(CheckError::Protocol(format!(
                    "tail batch was not dispatched: {other:?}"
                )))
            }
        }
        let triggered = scheduler.wait_pending()?;
        scheduler.tick(&triggered)?;
        let mined = scheduler.collect_results()?;

        let expected: Vec<u32> = input
            .chunks_exact(self.item_bytes)
            .enumerate()
            .filter(|(_, item)| (self.magic)(item) <= target)
            .map(|(index, _)| index as u32)
            .collect();
        let diff = NonceSetDiff::compare(&mined.nonces, &expected);
        let mut failures = Vec::new();
        if mined.overflowed() {
            failures.push(format!(
                "{} candidates reported, only {} fit the candidate buffer",
                mined.reported,
                mined.nonces.len()
            ));
        }
        if !diff.is_empty() {
            failures.push(diff.describe());
        }
        debug!(
            algorithm = %table.identity,
            expected = expected.len(),
            found = mined.nonces.len(),
            "tail check finished"
        );

        Ok(CheckReport {
            check: CheckKind::Tail,
            identity: table.identity.clone(),
            signature: scheduler.algorithm().signature(),
            device,
            tested: batch,
            failures,
        })
    }
}
