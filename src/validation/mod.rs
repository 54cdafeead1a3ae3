//! Checks that compare device kernels against the CPU reference.

use std::fmt;

use clkvc_oracle::{Header, HEADER_LEN};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use serde::Serialize;

use crate::algorithm::AlgorithmIdentity;
use crate::backend::DeviceDescription;
use crate::signature::VersionSignature;

pub mod algo;
pub mod head;
pub mod report;
pub mod step;
pub mod tail;

pub use algo::{AlgoOutcome, AlgoTest};
pub use head::HeadStage;
pub use report::{DigestMismatch, MismatchReport, NonceMismatch, NonceSetDiff};
pub use step::StepStage;
pub use tail::TailStage;

pub const DEFAULT_MAX_DETAILED: usize = 128;
pub const DEFAULT_SEED: u64 = 0x6f63_6c63_6b76_636b;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckKind {
    Head,
    Step,
    Tail,
    Algo,
}

impl CheckKind {
    pub const ALL: [CheckKind; 4] = [Self::Head, Self::Step, Self::Tail, Self::Algo];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Head => "head",
            Self::Step => "step",
            Self::Tail => "tail",
            Self::Algo => "algo",
        }
    }
}

impl fmt::Display for CheckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HarnessOptions {
    pub seed: u64,
    pub max_detailed: usize,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            seed: DEFAULT_SEED,
            max_detailed: DEFAULT_MAX_DETAILED,
        }
    }
}

impl HarnessOptions {
    pub(crate) fn rng(&self) -> StdRng {
        StdRng::seed_from_u64(self.seed)
    }
}

/// Result of one check of one algorithm on one device.
#[derive(Debug, Clone)]
pub struct CheckReport {
    pub check: CheckKind,
    pub identity: AlgorithmIdentity,
    pub signature: VersionSignature,
    pub device: DeviceDescription,
    /// Items compared: slots for stage checks, test blocks for algo checks.
    pub tested: usize,
    pub failures: Vec<String>,
}

impl CheckReport {
    pub fn passed(&self) -> bool {
        self.failures.is_empty()
    }
}

pub(crate) fn random_header(rng: &mut StdRng) -> Header {
    let mut header = [0u8; HEADER_LEN];
    rng.fill_bytes(&mut header);
    header
}

pub(crate) fn random_blob(rng: &mut StdRng, bytes: usize) -> Vec<u8> {
    let mut blob = vec![0u8; bytes];
    rng.fill_bytes(&mut blob);
    blob
}
