//! Deterministic test blocks for whole-pipeline checks.

use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use clkvc_oracle::{Header, HEADER_LEN};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use serde::{Deserialize, Serialize};

pub const REFERENCE_BLOCKS: usize = 21;
pub const REFERENCE_HASHES_PER_BLOCK: u64 = 8192;
pub const REFERENCE_TARGET: u64 = u64::MAX >> 11;

/// The built-in SHA-256d blocks. The expected nonces were computed outside
/// this crate, so they judge the oracle as well as the kernels.
const SHA256D_REFERENCE_JSON: &str = include_str!("../vectors/sha256d_reference.json");

/// Nonces in `start..start + count` meeting `target` for `header`.
pub type ScanFn = fn(&Header, u64, u32, u32) -> Vec<u32>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestBlock {
    #[serde(with = "hex_header")]
    pub header: Header,
    pub target: u64,
    /// Multiples of the set's nominal hash count to scan for this block.
    pub iterations: u32,
    pub expected_results: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestVectorSet {
    pub name: String,
    pub nominal_hash_count: u64,
    pub blocks: Vec<TestBlock>,
    /// Expected nonces of every block, concatenated in block order.
    pub expected_nonces: Vec<u32>,
}

impl TestVectorSet {
    pub fn generate(
        name: impl Into<String>,
        seed: u64,
        blocks: usize,
        nominal_hash_count: u64,
        target: u64,
        scan: ScanFn,
    ) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut set = Self {
            name: name.into(),
            nominal_hash_count,
            blocks: Vec::with_capacity(blocks),
            expected_nonces: Vec::new(),
        };
        for _ in 0..blocks {
            let mut header = [0u8; HEADER_LEN];
            rng.fill_bytes(&mut header);
            let found = scan(&header, target, 0, nominal_hash_count as u32);
            set.blocks.push(TestBlock {
                header,
                target,
                iterations: 1,
                expected_results: found.len() as u32,
            });
            set.expected_nonces.extend(found);
        }
        set
    }

    /// The built-in SHA-256d set: 21 blocks, some spanning several
    /// nominal hash counts.
    pub fn sha256d_reference() -> Result<Self> {
        Self::from_json(SHA256D_REFERENCE_JSON).context("built-in sha256d vectors are broken")
    }

    pub fn block_hashes(&self, block: &TestBlock) -> u64 {
        u64::from(block.iterations) * self.nominal_hash_count
    }

    pub fn total_hashes(&self) -> u64 {
        self.blocks.iter().map(|block| self.block_hashes(block)).sum()
    }

    /// Batches must split every block exactly, or nonces land in the wrong block.
    pub fn can_run(&self, batch: usize) -> bool {
        batch > 0
            && self
                .blocks
                .iter()
                .all(|block| self.block_hashes(block) % batch as u64 == 0)
    }

    pub fn validate(&self) -> Result<()> {
        let declared: u64 = self
            .blocks
            .iter()
            .map(|block| u64::from(block.expected_results))
            .sum();
        if declared != self.expected_nonces.len() as u64 {
            bail!(
                "blocks declare {declared} results but {} expected nonces are listed",
                self.expected_nonces.len()
            );
        }
        if self.nominal_hash_count == 0 {
            bail!("nominal hash count must not be zero");
        }
        Ok(())
    }

    pub fn load_json(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read test vectors {}", path.display()))?;
        Self::from_json(&text).with_context(|| format!("bad test vectors in {}", path.display()))
    }

    fn from_json(text: &str) -> Result<Self> {
        let set: Self = serde_json::from_str(text).context("failed to parse test vectors")?;
        set.validate().context("inconsistent test vectors")?;
        Ok(set)
    }

    pub fn save_json(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self).context("failed to encode test vectors")?;
        fs::write(path, text)
            .with_context(|| format!("failed to write test vectors {}", path.display()))
    }
}

mod hex_header {
    use clkvc_oracle::{Header, HEADER_LEN};
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(header: &Header, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(header))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Header, D::Error> {
        let text = String::deserialize(deserializer)?;
        let bytes = hex::decode(text.trim()).map_err(D::Error::custom)?;
        let len = bytes.len();
        bytes
            .try_into()
            .map_err(|_| D::Error::custom(format!("header is {len} bytes, expected {HEADER_LEN}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_set() -> TestVectorSet {
        TestVectorSet::generate("tiny", 9, 3, 1024, u64::MAX >> 6, clkvc_oracle::sha256d_scan)
    }

    #[test]
    fn generated_blocks_match_the_oracle() {
        let set = small_set();
        set.validate().expect("generated set should be consistent");
        let mut cursor = 0;
        for block in &set.blocks {
            let count = block.expected_results as usize;
            let expected = clkvc_oracle::sha256d_scan(&block.header, block.target, 0, 1024);
            assert_eq!(&set.expected_nonces[cursor..cursor + count], expected.as_slice());
            cursor += count;
        }
        assert_eq!(set, small_set());
    }

    #[test]
    fn reference_set_matches_its_recorded_shape() {
        let set = TestVectorSet::sha256d_reference().expect("built-in vectors should parse");
        assert_eq!(set.name, "sha256d");
        assert_eq!(set.blocks.len(), REFERENCE_BLOCKS);
        assert_eq!(set.nominal_hash_count, REFERENCE_HASHES_PER_BLOCK);
        assert!(set.blocks.iter().all(|block| block.target == REFERENCE_TARGET));
        let iterations: Vec<u32> = set.blocks.iter().map(|block| block.iterations).collect();
        assert_eq!(&iterations[..5], &[1, 1, 1, 1, 2]);
        assert_eq!((iterations[9], iterations[15], iterations[20]), (3, 2, 3));
        assert_eq!(set.expected_nonces.len(), 92);
        assert_eq!(&set.expected_nonces[..2], &[539, 946]);
        assert_eq!(
            hex::encode(&set.blocks[0].header[..8]),
            "ecf452ccc0732475"
        );
    }

    #[test]
    fn oracle_reproduces_the_recorded_reference_nonces() {
        let set = TestVectorSet::sha256d_reference().expect("built-in vectors should parse");
        let mut cursor = 0;
        for (index, block) in set.blocks.iter().enumerate() {
            let count = block.expected_results as usize;
            let hashes = set.block_hashes(block) as u32;
            let rescanned = clkvc_oracle::sha256d_scan(&block.header, block.target, 0, hashes);
            assert_eq!(
                rescanned.as_slice(),
                &set.expected_nonces[cursor..cursor + count],
                "block [{index}]"
            );
            cursor += count;
        }
        assert_eq!(cursor, set.expected_nonces.len());
    }

    #[test]
    fn batch_must_divide_every_block() {
        let set = small_set();
        assert!(set.can_run(1024));
        assert!(set.can_run(256));
        assert!(!set.can_run(768));
        assert!(!set.can_run(2048));
        assert!(!set.can_run(0));
        assert_eq!(set.total_hashes(), 3 * 1024);
    }

    #[test]
    fn json_round_trip_keeps_hex_headers() {
        let dir = tempfile::tempdir().expect("temp dir should be created");
        let path = dir.path().join("tiny.json");
        let set = small_set();
        set.save_json(&path).expect("vectors should save");

        let text = fs::read_to_string(&path).expect("vectors should be readable");
        assert!(text.contains(&hex::encode(set.blocks[0].header)));
        assert_eq!(TestVectorSet::load_json(&path).expect("vectors should load"), set);
    }

    #[test]
    fn inconsistent_files_are_rejected() {
        let dir = tempfile::tempdir().expect("temp dir should be created");
        let path = dir.path().join("broken.json");
        let mut set = small_set();
        set.expected_nonces.push(1);
        set.save_json(&path).expect("vectors should save");
        let err = TestVectorSet::load_json(&path).expect_err("extra nonce should be rejected");
        assert!(format!("{err:#}").contains("expected nonces are listed"));

        fs::write(&path, r#"{"name":"x","nominal_hash_count":1,"blocks":[{"header":"00ff","target":0,"iterations":1,"expected_results":0}],"expected_nonces":[]}"#)
            .expect("vectors should write");
        let err = TestVectorSet::load_json(&path).expect_err("short header should be rejected");
        assert!(format!("{err:#}").contains("header is 2 bytes"));
    }
}
