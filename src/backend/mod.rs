use std::fmt;
use std::ops::BitOr;

use thiserror::Error;

pub mod emulated;
#[cfg(feature = "opencl")]
pub mod opencl;

/// Access flags of a device allocation. Bit values follow `cl_mem_flags` so the
/// OpenCL backend can pass them through untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemFlags(u64);

impl MemFlags {
    pub const READ_WRITE: Self = Self(1 << 0);
    pub const WRITE_ONLY: Self = Self(1 << 1);
    pub const READ_ONLY: Self = Self(1 << 2);
    pub const USE_HOST_PTR: Self = Self(1 << 3);
    pub const ALLOC_HOST_PTR: Self = Self(1 << 4);
    pub const COPY_HOST_PTR: Self = Self(1 << 5);
    pub const HOST_WRITE_ONLY: Self = Self(1 << 7);
    pub const HOST_READ_ONLY: Self = Self(1 << 8);
    pub const HOST_NO_ACCESS: Self = Self(1 << 9);

    const DEVICE_ACCESS: u64 = (1 << 0) | (1 << 1) | (1 << 2);
    const HOST_ACCESS: u64 = (1 << 7) | (1 << 8) | (1 << 9);
    const KNOWN: u64 = Self::DEVICE_ACCESS | Self::HOST_ACCESS | (1 << 3) | (1 << 4) | (1 << 5);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Mutually exclusive access bits and unknown bits make a flag set invalid.
    pub fn is_valid(self) -> bool {
        if self.0 & !Self::KNOWN != 0 {
            return false;
        }
        if (self.0 & Self::DEVICE_ACCESS).count_ones() > 1 {
            return false;
        }
        if (self.0 & Self::HOST_ACCESS).count_ones() > 1 {
            return false;
        }
        !(self.contains(Self::USE_HOST_PTR)
            && (self.contains(Self::ALLOC_HOST_PTR) || self.contains(Self::COPY_HOST_PTR)))
    }

    /// Whether the allocation expects host data at creation time.
    pub fn takes_host_data(self) -> bool {
        self.contains(Self::COPY_HOST_PTR) || self.contains(Self::USE_HOST_PTR)
    }
}

impl BitOr for MemFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOrder {
    R,
    Rg,
    Rgba,
}

impl ChannelOrder {
    pub fn channels(self) -> usize {
        match self {
            Self::R => 1,
            Self::Rg => 2,
            Self::Rgba => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelType {
    UnsignedInt8,
    UnsignedInt32,
    Float,
}

impl ChannelType {
    pub fn bytes(self) -> usize {
        match self {
            Self::UnsignedInt8 => 1,
            Self::UnsignedInt32 | Self::Float => 4,
        }
    }
}

/// Extent and texel format of an image resource. A height or depth of 0 means
/// the image has fewer dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageShape {
    pub width: usize,
    pub height: usize,
    pub depth: usize,
    pub order: ChannelOrder,
    pub channel_type: ChannelType,
}

impl ImageShape {
    pub fn dimensions(&self) -> usize {
        if self.depth > 0 {
            3
        } else if self.height > 0 {
            2
        } else {
            1
        }
    }

    pub fn texel_bytes(&self) -> usize {
        self.order.channels() * self.channel_type.bytes()
    }

    pub fn byte_len(&self) -> usize {
        self.width * self.height.max(1) * self.depth.max(1) * self.texel_bytes()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationKind {
    Buffer { bytes: usize },
    Image(ImageShape),
}

impl AllocationKind {
    pub fn byte_len(&self) -> usize {
        match self {
            Self::Buffer { bytes } => *bytes,
            Self::Image(shape) => shape.byte_len(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AllocationRequest<'a> {
    pub name: &'a str,
    pub flags: MemFlags,
    pub kind: AllocationKind,
    pub initial: Option<&'a [u8]>,
}

/// Global offsets, global extents and local extents of one kernel launch.
/// Only the first `dims` entries are meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchGeometry {
    pub dims: usize,
    pub offset: [usize; 3],
    pub global: [usize; 3],
    pub local: [usize; 3],
}

impl LaunchGeometry {
    pub fn validate(&self) -> Result<(), BackendError> {
        if self.dims == 0 || self.dims > 3 {
            return Err(BackendError::InvalidGeometry(format!(
                "{} dimensions",
                self.dims
            )));
        }
        for dim in 0..self.dims {
            let (global, local) = (self.global[dim], self.local[dim]);
            if global == 0 || local == 0 {
                return Err(BackendError::InvalidGeometry(format!(
                    "dimension {dim} has zero extent"
                )));
            }
            if global % local != 0 {
                return Err(BackendError::InvalidGeometry(format!(
                    "global extent {global} is not a multiple of local extent {local} in dimension {dim}"
                )));
            }
        }
        Ok(())
    }

    /// Number of work items along the last dimension, one per hash.
    pub fn items(&self) -> usize {
        self.global[self.dims.saturating_sub(1)]
    }

    pub fn first_item(&self) -> usize {
        self.offset[self.dims.saturating_sub(1)]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SignalId(pub u64);

impl fmt::Display for SignalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescription {
    pub backend: &'static str,
    pub platform: String,
    pub device: String,
}

impl DeviceDescription {
    /// Short form used in report file names.
    pub fn slug(&self) -> String {
        self.device
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect()
    }
}

impl fmt::Display for DeviceDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {} ({})", self.device, self.platform, self.backend)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("invalid memory flags {0:#x}")]
    InvalidFlags(u64),
    #[error("zero-sized allocation")]
    ZeroSize,
    #[error("allocation of {requested} bytes exceeds the device limit of {limit} bytes")]
    TooLarge { requested: usize, limit: usize },
    #[error("invalid host data")]
    InvalidHostData,
    #[error("invalid image format")]
    InvalidImageFormat,
    #[error("invalid image descriptor")]
    InvalidImageDescriptor,
    #[error("image format not supported")]
    ImageFormatNotSupported,
    #[error("invalid build options")]
    InvalidBuildOptions,
    #[error("program build failed")]
    BuildFailed,
    #[error("no kernel named {0} in program")]
    UnknownEntryPoint(String),
    #[error("invalid argument index {0}")]
    InvalidArgIndex(u32),
    #[error("immediate of {0} bytes is not 1, 2, 4 or 8 bytes wide")]
    InvalidArgSize(usize),
    #[error("kernel arguments not set: {0}")]
    ArgumentsNotSet(String),
    #[error("invalid launch geometry: {0}")]
    InvalidGeometry(String),
    #[error("access of {len} bytes at offset {offset} exceeds memory of {size} bytes")]
    OutOfBounds {
        offset: usize,
        len: usize,
        size: usize,
    },
    #[error("{0} is not supported on this memory object")]
    Unsupported(&'static str),
    #[error("{api} failed with error code {code}")]
    Api { api: &'static str, code: i32 },
    #[error("device failure: {0}")]
    Device(String),
}

/// A failed program build together with whatever log the compiler produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildFailure {
    pub error: BackendError,
    pub log: String,
}

/// Device abstraction the checks run against: one context plus device.
///
/// Memory objects are released on drop. Queues execute commands in order;
/// `enqueue_read` is the only operation that completes asynchronously, and its
/// signal is how the host learns a batch finished.
pub trait ComputeBackend {
    type Memory;
    type Program;
    type Kernel;
    type Queue;
    type Signal;

    fn describe(&self) -> DeviceDescription;

    fn allocate(&self, request: &AllocationRequest<'_>) -> Result<Self::Memory, BackendError>;

    fn build_program(&self, source: &str, options: &str) -> Result<Self::Program, BuildFailure>;

    fn create_kernel(
        &self,
        program: &Self::Program,
        entry_point: &str,
    ) -> Result<Self::Kernel, BackendError>;

    fn set_memory_arg(
        &self,
        kernel: &Self::Kernel,
        index: u32,
        memory: &Self::Memory,
    ) -> Result<(), BackendError>;

    fn set_bytes_arg(
        &self,
        kernel: &Self::Kernel,
        index: u32,
        bytes: &[u8],
    ) -> Result<(), BackendError>;

    fn create_queue(&self) -> Result<Self::Queue, BackendError>;

    fn write_blocking(
        &self,
        queue: &Self::Queue,
        memory: &mut Self::Memory,
        offset: usize,
        data: &[u8],
    ) -> Result<(), BackendError>;

    fn read_blocking(
        &self,
        queue: &Self::Queue,
        memory: &Self::Memory,
        len: usize,
    ) -> Result<Vec<u8>, BackendError>;

    fn enqueue_kernel(
        &self,
        queue: &Self::Queue,
        kernel: &Self::Kernel,
        geometry: &LaunchGeometry,
    ) -> Result<(), BackendError>;

    fn enqueue_read(
        &self,
        queue: &Self::Queue,
        memory: &Self::Memory,
        len: usize,
    ) -> Result<Self::Signal, BackendError>;

    fn signal_id(&self, signal: &Self::Signal) -> SignalId;

    fn is_complete(&self, signal: &Self::Signal) -> Result<bool, BackendError>;

    fn wait(&self, signals: &[&Self::Signal]) -> Result<(), BackendError>;

    /// Blocks until the read behind `signal` finished and hands over its bytes.
    fn take_read(&self, signal: Self::Signal) -> Result<Vec<u8>, BackendError>;
}
