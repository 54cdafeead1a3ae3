//! First-stage check: hash a random header straight into an output array.

use std::sync::Arc;

use clkvc_oracle::Header;
use tracing::debug;

use super::report::{DigestMismatch, MismatchReport};
use super::{random_header, CheckKind, CheckReport, HarnessOptions};
use crate::algorithm::AlgorithmTable;
use crate::backend::ComputeBackend;
use crate::error::{CheckError, CheckResult};
use crate::kernels::KernelSourceProvider;
use crate::scheduler::{StopWaitScheduler, TickOutcome};

#[derive(Clone, Copy)]
pub struct HeadStage {
    pub table: fn(usize) -> AlgorithmTable,
    /// Buffer holding one digest per nonce after the batch.
    pub output: &'static str,
    pub digest_bytes: usize,
    pub reference: fn(&Header, u32) -> Vec<u8>,
}

impl HeadStage {
    pub fn run<B: ComputeBackend>(
        &self,
        backend: Arc<B>,
        sources: &dyn KernelSourceProvider,
        batch: usize,
        options: &HarnessOptions,
    ) -> CheckResult<CheckReport> {
        let device = backend.describe();
        let table = (self.table)(batch);
        let mut scheduler = StopWaitScheduler::new(backend, &table, sources, batch)?;
        let header = random_header(&mut options.rng());
        scheduler.set_header(header);
        scheduler.set_target(0);

        match scheduler.tick(&[])? {
            TickOutcome::Dispatched { .. } => {}
            other => {
                return Err(CheckError::Protocol(format!(
                    "head batch was not dispatched: {other:?}"
                )))
            }
        }
        let triggered = scheduler.wait_pending()?;
        scheduler.tick(&triggered)?;
        scheduler.collect_results()?;

        let algorithm = scheduler.algorithm();
        let output = algorithm.read_resource(scheduler.queue(), self.output)?;
        let mut mismatches = MismatchReport::new(options.max_detailed);
        for index in 0..batch {
            let expected = (self.reference)(&header, index as u32);
            let at = index * self.digest_bytes;
            let got = output.get(at..at + self.digest_bytes).unwrap_or_default();
            if got != expected.as_slice() {
                mismatches.record(index, || DigestMismatch {
                    index,
                    got: got.to_vec(),
                    expected,
                });
            }
        }
        debug!(
            algorithm = %table.identity,
            mismatches = mismatches.count(),
            "head check finished"
        );

        Ok(CheckReport {
            check: CheckKind::Head,
            identity: table.identity.clone(),
            signature: algorithm.signature(),
            device,
            tested: batch,
            failures: if mismatches.is_clean() {
                Vec::new()
            } else {
                vec![mismatches.describe(batch)]
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithms;
    use crate::backend::emulated::EmulatedDevice;
    use crate::kernels::EmbeddedSources;
    use crate::validation::testing::corrupting_device;

    #[test]
    fn emulated_head_matches_the_reference() {
        let report = algorithms::head_stages()[0]
            .run(
                Arc::new(EmulatedDevice::new("test")),
                &EmbeddedSources,
                4096,
                &HarnessOptions::default(),
            )
            .expect("head check should run");
        assert!(report.passed(), "{:?}", report.failures);
        assert_eq!(report.tested, 4096);
        assert_eq!(report.identity.presentation(), "sha256.head");
    }

    #[test]
    fn corrupted_slot_is_reported() {
        let device = corrupting_device("sha256_head", 2, 1, 32 * 7 + 3);
        let report = algorithms::head_stages()[0]
            .run(device, &EmbeddedSources, 256, &HarnessOptions::default())
            .expect("head check should run");
        assert_eq!(report.failures.len(), 1);
        let text = &report.failures[0];
        assert!(text.contains("\n[7] is "), "{text}");
        assert!(text.contains("1 errors total"), "{text}");
    }
}
