use std::collections::BTreeSet;
use std::fmt::{self, Display, Write as _};

/// Indices per line in the overflow list.
const INDICES_PER_LINE: usize = 65;

/// Bounded mismatch log: the first `max` mismatches keep their details, the
/// next `3 * max` only their index, everything after that is just counted.
#[derive(Debug, Clone)]
pub struct MismatchReport<D> {
    max: usize,
    detailed: Vec<D>,
    overflow: Vec<usize>,
    count: usize,
}

impl<D: Display> MismatchReport<D> {
    pub fn new(max: usize) -> Self {
        Self {
            max,
            detailed: Vec::new(),
            overflow: Vec::new(),
            count: 0,
        }
    }

    pub fn record(&mut self, index: usize, detail: impl FnOnce() -> D) {
        if self.count < self.max {
            self.detailed.push(detail());
        } else if self.count < 4 * self.max {
            self.overflow.push(index);
        }
        self.count += 1;
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn is_clean(&self) -> bool {
        self.count == 0
    }

    pub fn detailed(&self) -> &[D] {
        &self.detailed
    }

    pub fn overflow(&self) -> &[usize] {
        &self.overflow
    }

    /// Human readable summary; `total` is how many items were compared.
    pub fn describe(&self, total: usize) -> String {
        let mut out = String::from("Results differ\n");
        for detail in &self.detailed {
            let _ = writeln!(out, "{detail}");
        }
        if !self.overflow.is_empty() {
            let _ = write!(out, "\n{} other wrong hashes:\n", self.overflow.len());
            for (position, index) in self.overflow.iter().enumerate() {
                if position > 0 {
                    out.push_str(", ");
                    if position % INDICES_PER_LINE == 0 {
                        out.push('\n');
                    }
                }
                let _ = write!(out, "{index}");
            }
        }
        if self.count > self.detailed.len() + self.overflow.len() {
            out.push_str("...");
        }
        let percent = if total == 0 {
            0
        } else {
            (self.count as u128 * 100 / total as u128) as u64
        };
        let _ = write!(out, "\n\n{} errors total ({percent}%)\n", self.count);
        out
    }
}

/// One output slot whose bytes differ from the reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestMismatch {
    pub index: usize,
    pub got: Vec<u8>,
    pub expected: Vec<u8>,
}

impl Display for DigestMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] is {}, should be {}",
            self.index,
            hex::encode(&self.got),
            hex::encode(&self.expected)
        )
    }
}

/// A produced nonce missing from its block's expected table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NonceMismatch {
    pub block: usize,
    pub nonce: u32,
}

impl Display for NonceMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "block [{}]: nonce {:#010x} is not expected", self.block, self.nonce)
    }
}

/// Order-insensitive comparison of a produced nonce set with the expected one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NonceSetDiff {
    pub unexpected: Vec<u32>,
    pub missing: Vec<u32>,
}

impl NonceSetDiff {
    pub fn compare(found: &[u32], expected: &[u32]) -> Self {
        let found: BTreeSet<u32> = found.iter().copied().collect();
        let expected: BTreeSet<u32> = expected.iter().copied().collect();
        Self {
            unexpected: found.difference(&expected).copied().collect(),
            missing: expected.difference(&found).copied().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.unexpected.is_empty() && self.missing.is_empty()
    }

    pub fn describe(&self) -> String {
        let mut out = String::from("Results differ");
        if !self.missing.is_empty() {
            let _ = write!(out, "\nExpected, but not found: {}", join(&self.missing));
        }
        if !self.unexpected.is_empty() {
            let _ = write!(out, "\nFound but not supposed to be there: {}", join(&self.unexpected));
        }
        out
    }
}

fn join(nonces: &[u32]) -> String {
    nonces
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
