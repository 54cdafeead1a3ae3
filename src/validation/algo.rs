//! Whole-pipeline check against a deterministic test vector set.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, warn};

use super::report::{MismatchReport, NonceMismatch};
use crate::backend::ComputeBackend;
use crate::error::{CheckError, CheckResult};
use crate::scheduler::{StopWaitScheduler, TickOutcome};
use crate::vectors::TestVectorSet;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AlgoOutcome {
    pub blocks_run: usize,
    pub messages: Vec<String>,
    pub interrupted: bool,
}

pub struct AlgoTest<'a> {
    vectors: &'a TestVectorSet,
    max_detailed: usize,
}

impl<'a> AlgoTest<'a> {
    pub fn new(vectors: &'a TestVectorSet, max_detailed: usize) -> Self {
        Self {
            vectors,
            max_detailed,
        }
    }

    pub fn can_run(&self, batch: usize) -> bool {
        self.vectors.can_run(batch)
    }

    /// Mines every block and compares what the device produced with the
    /// block's slice of the expected nonces. `on_block` receives the index of
    /// each finished block; `shutdown` is checked between blocks.
    pub fn run<B: ComputeBackend>(
        &self,
        scheduler: &mut StopWaitScheduler<B>,
        shutdown: &AtomicBool,
        mut on_block: impl FnMut(usize),
    ) -> CheckResult<AlgoOutcome> {
        let batch = scheduler.batch();
        if !self.can_run(batch) {
            return Err(CheckError::Protocol(format!(
                "batch of {batch} hashes does not divide the blocks of {}",
                self.vectors.name
            )));
        }

        let mut outcome = AlgoOutcome::default();
        let mut unexpected = MismatchReport::new(self.max_detailed);
        let mut produced_total = 0usize;
        let mut cursor = 0usize;
        for (index, block) in self.vectors.blocks.iter().enumerate() {
            if shutdown.load(Ordering::Relaxed) {
                outcome.interrupted = true;
                break;
            }
            scheduler.set_header(block.header);
            scheduler.set_target(block.target);

            let batches = self.vectors.block_hashes(block) / batch as u64;
            let mut produced = Vec::new();
            let mut reported = 0u64;
            let mut exhausted = false;
            for _ in 0..batches {
                match scheduler.tick(&[])? {
                    TickOutcome::Dispatched { .. } => {}
                    TickOutcome::Exhausted => {
                        exhausted = true;
                        break;
                    }
                    other => {
                        return Err(CheckError::Protocol(format!(
                            "block [{index}] could not dispatch: {other:?}"
                        )))
                    }
                }
                let triggered = scheduler.wait_pending()?;
                scheduler.tick(&triggered)?;
                let mined = scheduler.collect_results()?;
                reported += u64::from(mined.reported);
                produced.extend(mined.nonces);
            }
            if exhausted {
                outcome
                    .messages
                    .push(format!("test block [{index}]: nonce space exhausted, test data inconsistent"));
                break;
            }

            let count = block.expected_results as usize;
            let expected = self
                .vectors
                .expected_nonces
                .get(cursor..cursor + count)
                .ok_or_else(|| {
                    CheckError::Protocol(format!("expected nonces run out at block [{index}]"))
                })?;
            cursor += count;
            outcome.blocks_run += 1;
            produced_total += produced.len();
            on_block(index);

            if reported > produced.len() as u64 {
                outcome.messages.push(format!(
                    "CANDIDATE OVERFLOW for test block [{index}]: {reported} candidates reported, only {} fit the candidate buffer",
                    produced.len()
                ));
                continue;
            }
            if produced.len() != count {
                outcome.messages.push(format!(
                    "BAD RESULT COUNT for test block [{index}]: {count} expected, got {}",
                    produced.len()
                ));
                continue;
            }
            let mut unique = produced.clone();
            unique.sort_unstable();
            unique.dedup();
            if unique.len() != produced.len() {
                outcome.messages.push(format!(
                    "BAD RESULTS for test block [{index}]: nonces are not unique"
                ));
                continue;
            }
            let mut mismatched = 0;
            for &nonce in &unique {
                if !expected.contains(&nonce) {
                    mismatched += 1;
                    unexpected.record(index, || NonceMismatch { block: index, nonce });
                }
            }
            if mismatched > 0 {
                outcome.messages.push(format!(
                    "BAD RESULTS for test block [{index}]: {mismatched} nonce values not matched"
                ));
            }
        }

        if !unexpected.is_clean() {
            outcome.messages.push(unexpected.describe(produced_total));
        }
        if outcome.interrupted {
            warn!(blocks = outcome.blocks_run, "algorithm check interrupted");
        }
        debug!(
            vectors = %self.vectors.name,
            blocks = outcome.blocks_run,
            errors = outcome.messages.len(),
            "algorithm check finished"
        );
        Ok(outcome)
    }
}
