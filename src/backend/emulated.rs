//! Host-side device that runs kernel entry points as Rust functions.
//!
//! Programs are "built" by scanning the OpenCL C source for `__kernel void`
//! entry points and validating the option string; each entry point then needs
//! a host implementation in the [`KernelRegistry`]. Commands run in order on a
//! per-queue worker thread, so reads complete asynchronously exactly like a
//! real device queue.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_channel::{Receiver, TryRecvError};
use tracing::debug;

use super::{
    AllocationKind, AllocationRequest, BackendError, BuildFailure, ComputeBackend,
    DeviceDescription, LaunchGeometry, SignalId,
};

mod kernels;
mod queue;

pub use kernels::{EntryPoint, KernelFn, KernelRegistry, LaunchContext};
pub use queue::EmulatedQueue;

use queue::{Command, Launch};

const DEFAULT_MAX_ALLOCATION: usize = 256 * 1024 * 1024;
const BACKEND_NAME: &str = "emulated";

pub type Defines = BTreeMap<String, String>;

pub struct EmulatedDevice {
    name: String,
    max_allocation: usize,
    registry: KernelRegistry,
    next_memory: AtomicU64,
    next_signal: AtomicU64,
}

impl EmulatedDevice {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_allocation: DEFAULT_MAX_ALLOCATION,
            registry: KernelRegistry::standard(),
            next_memory: AtomicU64::new(1),
            next_signal: AtomicU64::new(1),
        }
    }

    pub fn with_max_allocation(mut self, bytes: usize) -> Self {
        self.max_allocation = bytes;
        self
    }

    pub fn with_registry(mut self, registry: KernelRegistry) -> Self {
        self.registry = registry;
        self
    }

    fn check_host_data(request: &AllocationRequest<'_>, len: usize) -> Result<(), BackendError> {
        match (request.flags.takes_host_data(), request.initial) {
            (true, Some(data)) if data.len() == len => Ok(()),
            (false, None) => Ok(()),
            _ => Err(BackendError::InvalidHostData),
        }
    }
}

#[derive(Clone)]
pub struct EmulatedMemory {
    inner: Arc<MemoryObject>,
}

struct MemoryObject {
    id: u64,
    name: String,
    kind: AllocationKind,
    bytes: Mutex<Vec<u8>>,
}

impl EmulatedMemory {
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn len(&self) -> usize {
        self.inner.kind.byte_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_image(&self) -> bool {
        matches!(self.inner.kind, AllocationKind::Image(_))
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<(), BackendError> {
        let size = self.len();
        match offset.checked_add(len) {
            Some(end) if end <= size => Ok(()),
            _ => Err(BackendError::OutOfBounds { offset, len, size }),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<u8>>, BackendError> {
        self.inner
            .bytes
            .lock()
            .map_err(|_| BackendError::Device(format!("memory \"{}\" lock poisoned", self.inner.name)))
    }

    pub(crate) fn snapshot(&self, len: usize) -> Result<Vec<u8>, BackendError> {
        self.check_range(0, len)?;
        Ok(self.lock()?[..len].to_vec())
    }

    pub(crate) fn write_at(&self, offset: usize, data: &[u8]) -> Result<(), BackendError> {
        self.check_range(offset, data.len())?;
        self.lock()?[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    pub(crate) fn update<R>(&self, apply: impl FnOnce(&mut [u8]) -> R) -> Result<R, BackendError> {
        let mut bytes = self.lock()?;
        Ok(apply(bytes.as_mut_slice()))
    }
}

impl fmt::Debug for EmulatedMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmulatedMemory")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("kind", &self.inner.kind)
            .finish()
    }
}

#[derive(Debug)]
pub struct EmulatedProgram {
    entry_points: Vec<String>,
    defines: Arc<Defines>,
}

impl EmulatedProgram {
    pub fn entry_points(&self) -> &[String] {
        &self.entry_points
    }

    pub fn defines(&self) -> &Defines {
        &self.defines
    }
}

#[derive(Debug, Clone)]
pub enum KernelArg {
    Memory(EmulatedMemory),
    Bytes(Vec<u8>),
}

/// Argument slots live behind a lock: like `clSetKernelArg`, binding does not
/// need exclusive access to the kernel object.
pub struct EmulatedKernel {
    entry: EntryPoint,
    defines: Arc<Defines>,
    args: Mutex<Vec<Option<KernelArg>>>,
}

impl EmulatedKernel {
    pub fn entry_point(&self) -> &str {
        &self.entry.name
    }

    /// Id of the memory object currently bound at `index`, if any.
    pub fn memory_arg(&self, index: u32) -> Option<u64> {
        let args = self.args.lock().ok()?;
        match args.get(index as usize) {
            Some(Some(KernelArg::Memory(memory))) => Some(memory.id()),
            _ => None,
        }
    }

    fn set_arg(&self, index: u32, arg: KernelArg) -> Result<(), BackendError> {
        let mut args = self.args.lock().map_err(|_| {
            BackendError::Device(format!("kernel {} argument lock poisoned", self.entry.name))
        })?;
        let slot = args
            .get_mut(index as usize)
            .ok_or(BackendError::InvalidArgIndex(index))?;
        *slot = Some(arg);
        Ok(())
    }

    fn launch_args(&self) -> Result<Vec<KernelArg>, BackendError> {
        let args = self.args.lock().map_err(|_| {
            BackendError::Device(format!("kernel {} argument lock poisoned", self.entry.name))
        })?;
        let missing: Vec<String> = args
            .iter()
            .enumerate()
            .filter(|(_, arg)| arg.is_none())
            .map(|(index, _)| index.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(BackendError::ArgumentsNotSet(missing.join(", ")));
        }
        Ok(args.iter().flatten().cloned().collect())
    }
}

impl fmt::Debug for EmulatedKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmulatedKernel")
            .field("entry", &self.entry.name)
            .field("defines", &self.defines)
            .field("args", &self.args)
            .finish()
    }
}

pub struct EmulatedSignal {
    id: SignalId,
    reply: Receiver<Result<Vec<u8>, BackendError>>,
    outcome: Mutex<Option<Result<Vec<u8>, BackendError>>>,
}

impl EmulatedSignal {
    fn poll(&self, block: bool) -> Result<bool, BackendError> {
        let mut outcome = self
            .outcome
            .lock()
            .map_err(|_| BackendError::Device(format!("signal {} lock poisoned", self.id)))?;
        if outcome.is_some() {
            return Ok(true);
        }
        let received = if block {
            self.reply.recv().map_err(|_| TryRecvError::Disconnected)
        } else {
            self.reply.try_recv()
        };
        match received {
            Ok(result) => {
                *outcome = Some(result);
                Ok(true)
            }
            Err(TryRecvError::Empty) => Ok(false),
            Err(TryRecvError::Disconnected) => Err(BackendError::Device(format!(
                "queue worker exited before completing signal {}",
                self.id
            ))),
        }
    }
}

impl fmt::Debug for EmulatedSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmulatedSignal").field("id", &self.id).finish()
    }
}

impl ComputeBackend for EmulatedDevice {
    type Memory = EmulatedMemory;
    type Program = EmulatedProgram;
    type Kernel = EmulatedKernel;
    type Queue = EmulatedQueue;
    type Signal = EmulatedSignal;

    fn describe(&self) -> DeviceDescription {
        DeviceDescription {
            backend: BACKEND_NAME,
            platform: "host".to_string(),
            device: self.name.clone(),
        }
    }

    fn allocate(&self, request: &AllocationRequest<'_>) -> Result<EmulatedMemory, BackendError> {
        if !request.flags.is_valid() {
            return Err(BackendError::InvalidFlags(request.flags.bits()));
        }
        if let AllocationKind::Image(shape) = request.kind {
            if shape.width == 0 || (shape.depth > 0 && shape.height == 0) {
                return Err(BackendError::InvalidImageDescriptor);
            }
        }
        let len = request.kind.byte_len();
        if len == 0 {
            return Err(BackendError::ZeroSize);
        }
        if len > self.max_allocation {
            return Err(BackendError::TooLarge {
                requested: len,
                limit: self.max_allocation,
            });
        }
        Self::check_host_data(request, len)?;

        let bytes = match request.initial {
            Some(data) => data.to_vec(),
            None => vec![0u8; len],
        };
        let id = self.next_memory.fetch_add(1, Ordering::Relaxed);
        debug!(device = %self.name, name = request.name, id, len, "allocated memory object");
        Ok(EmulatedMemory {
            inner: Arc::new(MemoryObject {
                id,
                name: request.name.to_string(),
                kind: request.kind,
                bytes: Mutex::new(bytes),
            }),
        })
    }

    fn build_program(&self, source: &str, options: &str) -> Result<EmulatedProgram, BuildFailure> {
        let defines = parse_build_options(options).map_err(|log| BuildFailure {
            error: BackendError::InvalidBuildOptions,
            log,
        })?;
        let entry_points = parse_entry_points(source);
        if entry_points.is_empty() {
            return Err(BuildFailure {
                error: BackendError::BuildFailed,
                log: "error: program source declares no kernel entry points".to_string(),
            });
        }
        debug!(device = %self.name, ?entry_points, options, "built program");
        Ok(EmulatedProgram {
            entry_points,
            defines: Arc::new(defines),
        })
    }

    fn create_kernel(
        &self,
        program: &EmulatedProgram,
        entry_point: &str,
    ) -> Result<EmulatedKernel, BackendError> {
        if !program.entry_points.iter().any(|name| name == entry_point) {
            return Err(BackendError::UnknownEntryPoint(entry_point.to_string()));
        }
        let entry = self.registry.get(entry_point).cloned().ok_or_else(|| {
            BackendError::Device(format!("no host implementation for kernel {entry_point}"))
        })?;
        let args = vec![None; entry.arity as usize];
        Ok(EmulatedKernel {
            entry,
            defines: Arc::clone(&program.defines),
            args: Mutex::new(args),
        })
    }

    fn set_memory_arg(
        &self,
        kernel: &EmulatedKernel,
        index: u32,
        memory: &EmulatedMemory,
    ) -> Result<(), BackendError> {
        kernel.set_arg(index, KernelArg::Memory(memory.clone()))
    }

    fn set_bytes_arg(
        &self,
        kernel: &EmulatedKernel,
        index: u32,
        bytes: &[u8],
    ) -> Result<(), BackendError> {
        if !matches!(bytes.len(), 1 | 2 | 4 | 8) {
            return Err(BackendError::InvalidArgSize(bytes.len()));
        }
        kernel.set_arg(index, KernelArg::Bytes(bytes.to_vec()))
    }

    fn create_queue(&self) -> Result<EmulatedQueue, BackendError> {
        EmulatedQueue::spawn(&self.name)
    }

    fn write_blocking(
        &self,
        queue: &EmulatedQueue,
        memory: &mut EmulatedMemory,
        offset: usize,
        data: &[u8],
    ) -> Result<(), BackendError> {
        if memory.is_image() {
            return Err(BackendError::Unsupported("buffer write"));
        }
        memory.check_range(offset, data.len())?;
        let (done, reply) = crossbeam_channel::bounded(1);
        queue.submit(Command::Write {
            memory: memory.clone(),
            offset,
            data: data.to_vec(),
            done,
        })?;
        reply
            .recv()
            .map_err(|_| BackendError::Device("queue worker exited during write".to_string()))?
    }

    fn read_blocking(
        &self,
        queue: &EmulatedQueue,
        memory: &EmulatedMemory,
        len: usize,
    ) -> Result<Vec<u8>, BackendError> {
        let signal = self.enqueue_read(queue, memory, len)?;
        self.take_read(signal)
    }

    fn enqueue_kernel(
        &self,
        queue: &EmulatedQueue,
        kernel: &EmulatedKernel,
        geometry: &LaunchGeometry,
    ) -> Result<(), BackendError> {
        geometry.validate()?;
        let args = kernel.launch_args()?;
        queue.submit(Command::Launch(Launch {
            entry: kernel.entry.clone(),
            defines: Arc::clone(&kernel.defines),
            args,
            geometry: *geometry,
        }))
    }

    fn enqueue_read(
        &self,
        queue: &EmulatedQueue,
        memory: &EmulatedMemory,
        len: usize,
    ) -> Result<EmulatedSignal, BackendError> {
        if memory.is_image() {
            return Err(BackendError::Unsupported("buffer read"));
        }
        memory.check_range(0, len)?;
        let (done, reply) = crossbeam_channel::bounded(1);
        queue.submit(Command::Read {
            memory: memory.clone(),
            len,
            done,
        })?;
        Ok(EmulatedSignal {
            id: SignalId(self.next_signal.fetch_add(1, Ordering::Relaxed)),
            reply,
            outcome: Mutex::new(None),
        })
    }

    fn signal_id(&self, signal: &EmulatedSignal) -> SignalId {
        signal.id
    }

    fn is_complete(&self, signal: &EmulatedSignal) -> Result<bool, BackendError> {
        signal.poll(false)
    }

    fn wait(&self, signals: &[&EmulatedSignal]) -> Result<(), BackendError> {
        for signal in signals {
            signal.poll(true)?;
        }
        Ok(())
    }

    fn take_read(&self, signal: EmulatedSignal) -> Result<Vec<u8>, BackendError> {
        signal.poll(true)?;
        let outcome = signal
            .outcome
            .into_inner()
            .map_err(|_| BackendError::Device(format!("signal {} lock poisoned", signal.id)))?;
        outcome.unwrap_or_else(|| {
            Err(BackendError::Device(format!(
                "signal {} completed without a result",
                signal.id
            )))
        })
    }
}

/// Accepts the option subset real drivers agree on: macro definitions,
/// include paths, `-cl-*` switches and warning control.
fn parse_build_options(options: &str) -> Result<Defines, String> {
    let mut defines = Defines::new();
    let mut tokens = options.split_whitespace();
    while let Some(token) = tokens.next() {
        match token {
            "-D" => {
                let spec = tokens
                    .next()
                    .ok_or_else(|| "error: option '-D' is missing its argument".to_string())?;
                insert_define(&mut defines, spec)?;
            }
            "-I" => {
                tokens
                    .next()
                    .ok_or_else(|| "error: option '-I' is missing its argument".to_string())?;
            }
            "-w" | "-Werror" => {}
            _ if token.starts_with("-cl-") || token.starts_with("-I") => {}
            _ => match token.strip_prefix("-D") {
                Some(spec) => insert_define(&mut defines, spec)?,
                None => return Err(format!("error: unrecognized build option '{token}'")),
            },
        }
    }
    Ok(defines)
}

fn insert_define(defines: &mut Defines, spec: &str) -> Result<(), String> {
    let (name, value) = spec.split_once('=').unwrap_or((spec, "1"));
    let valid = name
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        return Err(format!("error: invalid macro name in '-D{spec}'"));
    }
    defines.insert(name.to_string(), value.to_string());
    Ok(())
}

fn parse_entry_points(source: &str) -> Vec<String> {
    let stripped = strip_comments(source);
    let tokens: Vec<&str> = stripped
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .filter(|token| !token.is_empty())
        .collect();
    tokens
        .windows(3)
        .filter(|window| matches!(window[0], "__kernel" | "kernel") && window[1] == "void")
        .map(|window| window[2].to_string())
        .collect()
}

fn strip_comments(source: &str) -> String {
    let mut out = String::with_capacity(source.len());
    let mut rest = source;
    while !rest.is_empty() {
        if let Some(after) = rest.strip_prefix("/*") {
            rest = after.find("*/").map_or("", |end| &after[end + 2..]);
            out.push(' ');
        } else if let Some(after) = rest.strip_prefix("//") {
            rest = after.find('\n').map_or("", |end| &after[end..]);
        } else {
            let mut chars = rest.chars();
            if let Some(c) = chars.next() {
                out.push(c);
            }
            rest = chars.as_str();
        }
    }
    out
}
