//! CPU reference hashes used to judge GPU kernel output.
//!
//! Every function here is the slow, obviously-correct counterpart of a device
//! kernel stage. Digests are returned as raw bytes in the order the hash
//! standard defines; the 64-bit "magic" value compared against a share target
//! is the most significant quarter of a digest read as a little-endian 256-bit
//! integer.

use blake2::{Blake2b512, Digest as _};
use sha2::{Sha256, Sha512};

pub const HEADER_LEN: usize = 80;
pub const NONCE_OFFSET: usize = 76;
pub const DIGEST256_LEN: usize = 32;
pub const DIGEST512_LEN: usize = 64;

pub type Header = [u8; HEADER_LEN];

/// Copy of `header` with `nonce` stored little-endian in the last four bytes.
pub fn header_with_nonce(header: &Header, nonce: u32) -> Header {
    let mut out = *header;
    out[NONCE_OFFSET..].copy_from_slice(&nonce.to_le_bytes());
    out
}

pub fn sha256(data: &[u8]) -> [u8; DIGEST256_LEN] {
    Sha256::digest(data).into()
}

pub fn sha256d(data: &[u8]) -> [u8; DIGEST256_LEN] {
    sha256(&sha256(data))
}

pub fn blake2b512(data: &[u8]) -> [u8; DIGEST512_LEN] {
    Blake2b512::digest(data).into()
}

pub fn sha512(data: &[u8]) -> [u8; DIGEST512_LEN] {
    Sha512::digest(data).into()
}

/// Top 64 bits of a 256-bit digest interpreted as a little-endian number.
pub fn magic(digest: &[u8; DIGEST256_LEN]) -> u64 {
    let mut top = [0u8; 8];
    top.copy_from_slice(&digest[24..]);
    u64::from_le_bytes(top)
}

pub fn meets_target(digest: &[u8; DIGEST256_LEN], target: u64) -> bool {
    magic(digest) <= target
}

/// First SHA-256 pass over a header carrying `nonce`.
pub fn sha256_head(header: &Header, nonce: u32) -> [u8; DIGEST256_LEN] {
    sha256(&header_with_nonce(header, nonce))
}

/// Second SHA-256 pass applied to a first-pass digest, reduced to its magic value.
pub fn sha256_tail_magic(first_pass: &[u8; DIGEST256_LEN]) -> u64 {
    magic(&sha256(first_pass))
}

pub fn sha256d_magic(header: &Header, nonce: u32) -> u64 {
    magic(&sha256d(&header_with_nonce(header, nonce)))
}

/// Nonces in `start..start + count` whose SHA-256d magic value is within `target`.
pub fn sha256d_scan(header: &Header, target: u64, start: u32, count: u32) -> Vec<u32> {
    (0..count)
        .filter_map(|offset| start.checked_add(offset))
        .filter(|&nonce| sha256d_magic(header, nonce) <= target)
        .collect()
}
