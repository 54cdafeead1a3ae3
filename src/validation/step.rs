//! Intermediate-stage check: raw buffers in and out, chained through
//! late-bound input and output slots.

use std::sync::Arc;

use tracing::debug;

use super::report::{DigestMismatch, MismatchReport};
use super::{random_blob, CheckKind, CheckReport, HarnessOptions};
use crate::algorithm::{AlgorithmInstance, AlgorithmTable};
use crate::backend::ComputeBackend;
use crate::error::{AllocationFailure, CheckError, CheckResult};
use crate::kernels::KernelSourceProvider;
use crate::special::StageSlots;

#[derive(Clone, Copy)]
pub struct StepStage {
    pub table: fn(usize) -> AlgorithmTable,
    pub input: &'static str,
    pub output: &'static str,
    pub item_bytes: usize,
    /// Times the stage is applied, swapping input and output in between.
    pub rounds: usize,
    pub reference: fn(&[u8]) -> Vec<u8>,
}

impl StepStage {
    pub fn run<B: ComputeBackend>(
        &self,
        backend: Arc<B>,
        sources: &dyn KernelSourceProvider,
        items: usize,
        options: &HarnessOptions,
    ) -> CheckResult<CheckReport> {
        let device = backend.describe();
        let table = (self.table)(items);
        let queue = backend.create_queue().map_err(|err| CheckError::Allocation {
            name: "command queue".to_string(),
            failure: AllocationFailure::Backend(err),
        })?;
        let mut algorithm = AlgorithmInstance::build(backend, &table, sources, &StageSlots)?;

        let input = random_blob(&mut options.rng(), items * self.item_bytes);
        algorithm.write_resource(&queue, self.input, 0, &input)?;

        let lookup = |name: &str| {
            algorithm.catalog().memory(name).ok_or_else(|| {
                CheckError::Protocol(format!("{} declares no buffer named {name}", table.identity))
            })
        };
        let (first, second) = (lookup(self.input)?, lookup(self.output)?);
        for round in 0..self.rounds {
            let slots = if round % 2 == 0 { [first, second] } else { [second, first] };
            algorithm.run_iteration(&queue, 0, items, &slots)?;
        }
        let last = if self.rounds % 2 == 1 { self.output } else { self.input };
        let output = algorithm.read_resource(&queue, last)?;

        let mut mismatches = MismatchReport::new(options.max_detailed);
        for index in 0..items {
            let at = index * self.item_bytes;
            let item = &input[at..at + self.item_bytes];
            let expected = (0..self.rounds).fold(item.to_vec(), |data, _| (self.reference)(&data));
            let got = output.get(at..at + expected.len()).unwrap_or_default();
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
            items,
            rounds = self.rounds,
            mismatches = mismatches.count(),
            "step check finished"
        );

        Ok(CheckReport {
            check: CheckKind::Step,
            identity: table.identity.clone(),
            signature: algorithm.signature(),
            device,
            tested: items,
            failures: if mismatches.is_clean() {
                Vec::new()
            } else {
                vec![mismatches.describe(items)]
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
    fn chained_stage_matches_the_reference_over_65536_items() {
        let report = algorithms::step_stages()[0]
            .run(
                Arc::new(EmulatedDevice::new("test")),
                &EmbeddedSources,
                65_536,
                &HarnessOptions::default(),
            )
            .expect("step check should run");
        assert!(report.passed(), "{:?}", report.failures);
        assert_eq!(report.tested, 65_536);
    }

    #[test]
    fn corrupted_stage_output_is_reported() {
        let device = corrupting_device("blake2b_stage", 3, 1, 64 * 3);
        let report = algorithms::step_stages()[0]
            .run(device, &EmbeddedSources, 256, &HarnessOptions::default())
            .expect("step check should run");
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].contains("\n[3] is "), "{}", report.failures[0]);
    }

    fn chain_stage() -> StepStage {
        algorithms::step_stages()
            .into_iter()
            .find(|stage| (stage.table)(64).kernels.len() == 3)
            .expect("the three-kernel chain should be shipped")
    }

    #[test]
    fn three_different_kernels_chain_through_intermediate_buffers() {
        let report = chain_stage()
            .run(Arc::new(EmulatedDevice::new("test")), &EmbeddedSources, 4096, &HarnessOptions::default())
            .expect("step check should run");
        assert!(report.passed(), "{:?}", report.failures);
        assert_eq!(report.identity.presentation(), "hashchain.sha512-blake2b-sha512");
        assert_eq!(report.tested, 4096);
    }

    #[test]
    fn fault_in_the_middle_of_the_chain_reaches_the_output() {
        let device = corrupting_device("blake2b_stage", 3, 1, 64 * 5 + 17);
        let report = chain_stage()
            .run(device, &EmbeddedSources, 256, &HarnessOptions::default())
            .expect("step check should run");
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].contains("\n[5] is "), "{}", report.failures[0]);
        assert!(!report.failures[0].contains("\n[4] is "), "{}", report.failures[0]);
    }
}
