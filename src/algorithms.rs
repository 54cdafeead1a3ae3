//! Declaration tables of the shipped kernels and the checks that use them.

use clkvc_oracle::{Header, DIGEST256_LEN, DIGEST512_LEN};

use crate::algorithm::{AlgorithmIdentity, AlgorithmTable, HeaderByteOrder};
use crate::backend::MemFlags;
use crate::kernels::{KernelDescriptor, WorkGroupShape};
use crate::resources::ResourceDescriptor;
use crate::validation::{HeadStage, StepStage, TailStage};

const SHA256_SOURCE: &str = "sha256.cl";
const BLAKE2B_SOURCE: &str = "blake2b.cl";
const SHA512_SOURCE: &str = "sha512.cl";
const SWAPPED_HEADER: &str = "-D HEADER_WORDS_SWAPPED";
const TEAM: WorkGroupShape = WorkGroupShape::linear(64);

/// Search algorithms driven by the stop-and-wait scheduler.
pub type SearchTable = fn(usize) -> AlgorithmTable;

/// One kernel doing both SHA-256 passes and the target test.
pub fn sha256d_monolithic(_batch: usize) -> AlgorithmTable {
    AlgorithmTable {
        identity: AlgorithmIdentity::new("sha256d", "monolithic", "v1"),
        byte_order: HeaderByteOrder::AsIs,
        resources: Vec::new(),
        kernels: vec![KernelDescriptor::new(
            SHA256_SOURCE,
            "sha256d_search",
            "",
            TEAM,
            "$candidates, $wuData, $dispatchData",
        )],
    }
}

/// Head and tail kernels with the first-pass digests parked in `io0`.
pub fn sha256d_two_stage(batch: usize) -> AlgorithmTable {
    AlgorithmTable {
        identity: AlgorithmIdentity::new("sha256d", "two-stage", "v1"),
        byte_order: HeaderByteOrder::SwapWords,
        resources: vec![ResourceDescriptor::buffer("io0", batch * DIGEST256_LEN, MemFlags::READ_WRITE)
            .with_presentation("first pass digests")],
        kernels: vec![
            KernelDescriptor::new(SHA256_SOURCE, "sha256_head", SWAPPED_HEADER, TEAM, "$wuData, io0"),
            KernelDescriptor::new(SHA256_SOURCE, "sha256_tail", "", TEAM, "io0, $candidates, $dispatchData"),
        ],
    }
}

pub fn sha256_head(batch: usize) -> AlgorithmTable {
    AlgorithmTable {
        identity: AlgorithmIdentity::new("sha256", "head", "v1"),
        byte_order: HeaderByteOrder::SwapWords,
        resources: vec![ResourceDescriptor::buffer("io0", batch * DIGEST256_LEN, MemFlags::WRITE_ONLY)],
        kernels: vec![KernelDescriptor::new(
            SHA256_SOURCE,
            "sha256_head",
            SWAPPED_HEADER,
            TEAM,
            "$wuData, io0",
        )],
    }
}

pub fn sha256_tail(batch: usize) -> AlgorithmTable {
    AlgorithmTable {
        identity: AlgorithmIdentity::new("sha256", "tail", "v1"),
        byte_order: HeaderByteOrder::AsIs,
        resources: vec![ResourceDescriptor::buffer("io0", batch * DIGEST256_LEN, MemFlags::READ_ONLY)],
        kernels: vec![KernelDescriptor::new(
            SHA256_SOURCE,
            "sha256_tail",
            "",
            TEAM,
            "io0, $candidates, $dispatchData",
        )],
    }
}

pub fn blake2b_step(items: usize) -> AlgorithmTable {
    AlgorithmTable {
        identity: AlgorithmIdentity::new("blake2b", "1-way", "v1"),
        byte_order: HeaderByteOrder::AsIs,
        resources: vec![
            ResourceDescriptor::buffer("io0", items * DIGEST512_LEN, MemFlags::READ_WRITE),
            ResourceDescriptor::buffer("io1", items * DIGEST512_LEN, MemFlags::READ_WRITE),
            ResourceDescriptor::immediate_u32("itemWords", (DIGEST512_LEN / 8) as u32),
        ],
        kernels: vec![KernelDescriptor::new(
            BLAKE2B_SOURCE,
            "blake2b_stage",
            "",
            TEAM,
            "$stageIn, $stageOut, itemWords",
        )],
    }
}

/// Three different stages in one table, handing 64-byte items along through
/// `mid0` and `mid1`. Only the chain's ends are late bound.
pub fn sha512_blake2b_chain(items: usize) -> AlgorithmTable {
    let buffer = |name: &str| ResourceDescriptor::buffer(name, items * DIGEST512_LEN, MemFlags::READ_WRITE);
    AlgorithmTable {
        identity: AlgorithmIdentity::new("hashchain", "sha512-blake2b-sha512", "v1"),
        byte_order: HeaderByteOrder::AsIs,
        resources: vec![
            buffer("io0"),
            buffer("mid0").with_presentation("after sha512"),
            buffer("mid1").with_presentation("after blake2b"),
            buffer("io1"),
            ResourceDescriptor::immediate_u32("itemWords", (DIGEST512_LEN / 8) as u32),
        ],
        kernels: vec![
            KernelDescriptor::new(SHA512_SOURCE, "sha512_stage", "", TEAM, "$stageIn, mid0, itemWords"),
            KernelDescriptor::new(BLAKE2B_SOURCE, "blake2b_stage", "", TEAM, "mid0, mid1, itemWords"),
            KernelDescriptor::new(SHA512_SOURCE, "sha512_stage", "", TEAM, "mid1, $stageOut, itemWords"),
        ],
    }
}

pub fn search_tables() -> Vec<SearchTable> {
    vec![sha256d_monolithic, sha256d_two_stage]
}

fn sha256_head_reference(header: &Header, nonce: u32) -> Vec<u8> {
    clkvc_oracle::sha256_head(header, nonce).to_vec()
}

fn blake2b_reference(item: &[u8]) -> Vec<u8> {
    clkvc_oracle::blake2b512(item).to_vec()
}

fn chain_reference(item: &[u8]) -> Vec<u8> {
    clkvc_oracle::sha512(&clkvc_oracle::blake2b512(&clkvc_oracle::sha512(item))).to_vec()
}

fn sha256_tail_magic(item: &[u8]) -> u64 {
    let mut digest = [0u8; DIGEST256_LEN];
    digest.copy_from_slice(&item[..DIGEST256_LEN]);
    clkvc_oracle::sha256_tail_magic(&digest)
}

pub fn head_stages() -> Vec<HeadStage> {
    vec![HeadStage {
        table: sha256_head,
        output: "io0",
        digest_bytes: DIGEST256_LEN,
        reference: sha256_head_reference,
    }]
}

pub fn step_stages() -> Vec<StepStage> {
    vec![
        StepStage {
            table: blake2b_step,
            input: "io0",
            output: "io1",
            item_bytes: DIGEST512_LEN,
            rounds: 2,
            reference: blake2b_reference,
        },
        StepStage {
            table: sha512_blake2b_chain,
            input: "io0",
            output: "io1",
            item_bytes: DIGEST512_LEN,
            rounds: 1,
            reference: chain_reference,
        },
    ]
}

pub fn tail_stages() -> Vec<TailStage> {
    vec![TailStage {
        table: sha256_tail,
        input: "io0",
        item_bytes: DIGEST256_LEN,
        expected_hits: 8,
        magic: sha256_tail_magic,
    }]
}
