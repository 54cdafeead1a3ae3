use std::fmt;

use serde::{Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::algorithm::AlgorithmIdentity;
use crate::kernels::KernelDescriptor;

/// 64-bit fingerprint of an algorithm's identity and every kernel source,
/// entry point and compile option it was built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VersionSignature(u64);

impl VersionSignature {
    pub fn canonical_text<'a>(
        identity: &AlgorithmIdentity,
        kernels: impl IntoIterator<Item = (&'a KernelDescriptor, &'a str)>,
    ) -> String {
        let mut text = format!("{identity}\n");
        for (descriptor, source) in kernels {
            text.push_str(&format!(
                ">>>>{}:{}({})\n{}<<<<\n",
                descriptor.source, descriptor.entry_point, descriptor.compile_flags, source
            ));
        }
        text
    }

    pub fn compute<'a>(
        identity: &AlgorithmIdentity,
        kernels: impl IntoIterator<Item = (&'a KernelDescriptor, &'a str)>,
    ) -> Self {
        let digest = Sha256::digest(Self::canonical_text(identity, kernels).as_bytes());
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&digest);
        Self::from_digest(&bytes)
    }

    /// XOR of the digest's four 64-bit lanes.
    pub fn from_digest(digest: &[u8; 32]) -> Self {
        let folded = digest.chunks_exact(8).fold(0u64, |acc, lane| {
            let mut word = [0u8; 8];
            word.copy_from_slice(lane);
            acc ^ u64::from_ne_bytes(word)
        });
        Self(folded)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0.to_ne_bytes())
    }
}

impl fmt::Display for VersionSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for VersionSignature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::WorkGroupShape;

    fn descriptor(flags: &str) -> KernelDescriptor {
        KernelDescriptor::new("sha256.cl", "sha256_head", flags, WorkGroupShape::linear(64), "$wuData, io0")
    }

    #[test]
    fn canonical_text_lists_identity_then_each_kernel() {
        let identity = AlgorithmIdentity::new("sha256d", "two-stage", "v2");
        let head = descriptor("-D HEADER_WORDS_SWAPPED");
        let text = VersionSignature::canonical_text(&identity, [(&head, "SRC\n")]);
        assert_eq!(
            text,
            "sha256d.two-stage.v2\n>>>>sha256.cl:sha256_head(-D HEADER_WORDS_SWAPPED)\nSRC\n<<<<\n"
        );
    }

    #[test]
    fn folding_xors_the_four_lanes() {
        let mut digest = [0u8; 32];
        digest[..8].copy_from_slice(&0x0f0f_0000_0000_00ffu64.to_ne_bytes());
        digest[8..16].copy_from_slice(&0x0000_0000_0000_00f0u64.to_ne_bytes());
        digest[24..].copy_from_slice(&0x0f0f_0000_0000_0000u64.to_ne_bytes());
        assert_eq!(VersionSignature::from_digest(&digest).value(), 0x0f);
    }

    #[test]
    fn any_input_change_moves_the_signature() {
        let identity = AlgorithmIdentity::new("sha256d", "two-stage", "v2");
        let plain = descriptor("");
        let swapped = descriptor("-D HEADER_WORDS_SWAPPED");
        let base = VersionSignature::compute(&identity, [(&plain, "a")]);
        assert_eq!(base, VersionSignature::compute(&identity, [(&plain, "a")]));
        assert_ne!(base, VersionSignature::compute(&identity, [(&plain, "b")]));
        assert_ne!(base, VersionSignature::compute(&identity, [(&swapped, "a")]));
        let bumped = AlgorithmIdentity::new("sha256d", "two-stage", "v3");
        assert_ne!(base, VersionSignature::compute(&bumped, [(&plain, "a")]));
        assert_eq!(base.to_hex().len(), 16);
    }
}
