use std::collections::HashMap;
use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use clkvc_oracle::{Header, DIGEST256_LEN, DIGEST512_LEN, HEADER_LEN};

use super::{Defines, EmulatedMemory, KernelArg};
use crate::backend::{BackendError, LaunchGeometry};

pub type KernelFn = Arc<dyn Fn(&LaunchContext<'_>) -> Result<(), BackendError> + Send + Sync>;

/// Host implementation of one `__kernel` function.
#[derive(Clone)]
pub struct EntryPoint {
    pub name: String,
    pub arity: u32,
    pub run: KernelFn,
}

impl fmt::Debug for EntryPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryPoint")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .finish()
    }
}

#[derive(Clone, Default)]
pub struct KernelRegistry {
    entries: HashMap<String, EntryPoint>,
}

impl KernelRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Host implementations of the kernels shipped in `kernels/`.
    pub fn standard() -> Self {
        Self::empty()
            .with("sha256d_search", 3, sha256d_search)
            .with("sha256_head", 2, sha256_head)
            .with("sha256_tail", 3, sha256_tail)
            .with("blake2b_stage", 3, blake2b_stage)
            .with("sha512_stage", 3, sha512_stage)
    }

    pub fn register<F>(&mut self, name: &str, arity: u32, run: F)
    where
        F: Fn(&LaunchContext<'_>) -> Result<(), BackendError> + Send + Sync + 'static,
    {
        self.entries.insert(
            name.to_string(),
            EntryPoint {
                name: name.to_string(),
                arity,
                run: Arc::new(run),
            },
        );
    }

    pub fn with<F>(mut self, name: &str, arity: u32, run: F) -> Self
    where
        F: Fn(&LaunchContext<'_>) -> Result<(), BackendError> + Send + Sync + 'static,
    {
        self.register(name, arity, run);
        self
    }

    pub fn get(&self, name: &str) -> Option<&EntryPoint> {
        self.entries.get(name)
    }
}

/// What a host kernel sees of its launch: arguments in declaration order,
/// the program's macro definitions and the launch geometry.
pub struct LaunchContext<'a> {
    entry_point: &'a str,
    args: &'a [KernelArg],
    defines: &'a Defines,
    geometry: &'a LaunchGeometry,
}

impl<'a> LaunchContext<'a> {
    pub(super) fn new(
        entry_point: &'a str,
        args: &'a [KernelArg],
        defines: &'a Defines,
        geometry: &'a LaunchGeometry,
    ) -> Self {
        Self {
            entry_point,
            args,
            defines,
            geometry,
        }
    }

    pub fn geometry(&self) -> &LaunchGeometry {
        self.geometry
    }

    /// Global ids along the hash dimension.
    pub fn global_ids(&self) -> Range<u64> {
        let first = self.geometry.first_item() as u64;
        first..first + self.geometry.items() as u64
    }

    pub fn is_defined(&self, name: &str) -> bool {
        self.defines.contains_key(name)
    }

    pub fn define(&self, name: &str) -> Option<&str> {
        self.defines.get(name).map(String::as_str)
    }

    pub fn read(&self, index: usize) -> Result<Vec<u8>, BackendError> {
        let memory = self.memory(index)?;
        memory.snapshot(memory.len())
    }

    pub fn write(&self, index: usize, offset: usize, data: &[u8]) -> Result<(), BackendError> {
        self.memory(index)?.write_at(offset, data)
    }

    pub fn update<R>(
        &self,
        index: usize,
        apply: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R, BackendError> {
        self.memory(index)?.update(apply)
    }

    pub fn bytes(&self, index: usize) -> Result<&[u8], BackendError> {
        match self.args.get(index) {
            Some(KernelArg::Bytes(bytes)) => Ok(bytes),
            Some(KernelArg::Memory(_)) => Err(self.fault(format!("argument {index} is a memory object"))),
            None => Err(BackendError::InvalidArgIndex(index as u32)),
        }
    }

    pub fn fault(&self, message: impl fmt::Display) -> BackendError {
        BackendError::Device(format!("{}: {message}", self.entry_point))
    }

    fn memory(&self, index: usize) -> Result<&EmulatedMemory, BackendError> {
        match self.args.get(index) {
            Some(KernelArg::Memory(memory)) => Ok(memory),
            Some(KernelArg::Bytes(_)) => Err(self.fault(format!("argument {index} is not a memory object"))),
            None => Err(BackendError::InvalidArgIndex(index as u32)),
        }
    }
}

struct DispatchWords {
    target: u64,
    capacity: u32,
}

impl DispatchWords {
    fn read(context: &LaunchContext<'_>, index: usize) -> Result<Self, BackendError> {
        let bytes = context.read(index)?;
        if bytes.len() < 16 {
            return Err(context.fault(format!("dispatch data holds {} bytes", bytes.len())));
        }
        let word = |i: usize| u32::from_le_bytes([bytes[4 * i], bytes[4 * i + 1], bytes[4 * i + 2], bytes[4 * i + 3]]);
        Ok(Self {
            target: (u64::from(word(1)) << 32) | u64::from(word(2)),
            capacity: word(3),
        })
    }
}

fn work_header(context: &LaunchContext<'_>, index: usize) -> Result<Header, BackendError> {
    let bytes = context.read(index)?;
    let mut header = [0u8; HEADER_LEN];
    let uploaded = bytes
        .get(..HEADER_LEN)
        .ok_or_else(|| context.fault(format!("work data holds {} bytes", bytes.len())))?;
    header.copy_from_slice(uploaded);
    if context.is_defined("HEADER_WORDS_SWAPPED") {
        for word in header.chunks_exact_mut(4) {
            word.reverse();
        }
    }
    Ok(header)
}

/// Mirrors `atomic_inc` on the counter word: the count keeps growing past the
/// capacity, only the stores are dropped.
fn append_candidates(buffer: &mut [u8], capacity: u32, nonces: &[u32]) -> Result<(), BackendError> {
    if buffer.len() < 4 {
        return Err(BackendError::Device("candidate buffer has no counter".to_string()));
    }
    let slots = capacity.min(((buffer.len() - 4) / 4) as u32);
    let mut count = u32::from_le_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]);
    for &nonce in nonces {
        if count < slots {
            let at = 4 + 4 * count as usize;
            buffer[at..at + 4].copy_from_slice(&nonce.to_le_bytes());
        }
        count = count.wrapping_add(1);
    }
    buffer[..4].copy_from_slice(&count.to_le_bytes());
    Ok(())
}

fn emit_candidates(
    context: &LaunchContext<'_>,
    index: usize,
    capacity: u32,
    nonces: &[u32],
) -> Result<(), BackendError> {
    if nonces.is_empty() {
        return Ok(());
    }
    context.update(index, |buffer| append_candidates(buffer, capacity, nonces))?
}

fn slot<'b>(
    context: &LaunchContext<'_>,
    bytes: &'b [u8],
    index: usize,
    width: usize,
) -> Result<&'b [u8], BackendError> {
    bytes
        .get(index * width..(index + 1) * width)
        .ok_or_else(|| context.fault(format!("slot {index} is outside the {}-byte input", bytes.len())))
}

fn sha256d_search(context: &LaunchContext<'_>) -> Result<(), BackendError> {
    let header = work_header(context, 1)?;
    let dispatch = DispatchWords::read(context, 2)?;
    let found: Vec<u32> = context
        .global_ids()
        .map(|gid| gid as u32)
        .filter(|&nonce| clkvc_oracle::sha256d_magic(&header, nonce) <= dispatch.target)
        .collect();
    emit_candidates(context, 0, dispatch.capacity, &found)
}

fn sha256_head(context: &LaunchContext<'_>) -> Result<(), BackendError> {
    let header = work_header(context, 0)?;
    let mut digests = Vec::with_capacity(context.geometry().items() * DIGEST256_LEN);
    for gid in context.global_ids() {
        digests.extend_from_slice(&clkvc_oracle::sha256_head(&header, gid as u32));
    }
    context.write(1, 0, &digests)
}

fn sha256_tail(context: &LaunchContext<'_>) -> Result<(), BackendError> {
    let digests = context.read(0)?;
    let dispatch = DispatchWords::read(context, 2)?;
    let mut found = Vec::new();
    for (index, gid) in context.global_ids().enumerate() {
        let mut digest = [0u8; DIGEST256_LEN];
        digest.copy_from_slice(slot(context, &digests, index, DIGEST256_LEN)?);
        if clkvc_oracle::sha256_tail_magic(&digest) <= dispatch.target {
            found.push(gid as u32);
        }
    }
    emit_candidates(context, 1, dispatch.capacity, &found)
}

fn blake2b_stage(context: &LaunchContext<'_>) -> Result<(), BackendError> {
    digest_stage(context, clkvc_oracle::blake2b512)
}

fn sha512_stage(context: &LaunchContext<'_>) -> Result<(), BackendError> {
    digest_stage(context, clkvc_oracle::sha512)
}

/// `(input, output, itemWords)`: each slot hashes the first 64 bytes of its
/// item into the first 64 bytes of the matching output item.
fn digest_stage(
    context: &LaunchContext<'_>,
    hash: fn(&[u8]) -> [u8; DIGEST512_LEN],
) -> Result<(), BackendError> {
    let stride = match context.bytes(2)? {
        [a, b, c, d] => u32::from_le_bytes([*a, *b, *c, *d]) as usize * 8,
        other => return Err(context.fault(format!("itemWords is {} bytes wide", other.len()))),
    };
    if stride < DIGEST512_LEN {
        return Err(context.fault(format!("items of {stride} bytes cannot hold a digest")));
    }
    let input = context.read(0)?;
    let mut output = context.read(1)?;
    for index in 0..context.geometry().items() {
        let item = slot(context, &input, index, stride)?;
        let digest = hash(&item[..DIGEST512_LEN]);
        let at = index * stride;
        output
            .get_mut(at..at + DIGEST512_LEN)
            .ok_or_else(|| context.fault(format!("slot {index} is outside the output")))?
            .copy_from_slice(&digest);
    }
    context.write(1, 0, &output)
}
