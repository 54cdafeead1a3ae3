use thiserror::Error;

use crate::backend::BackendError;

pub type CheckResult<T> = Result<T, CheckError>;

/// Everything that can stop an algorithm/device pairing. None of these are
/// retried; the runner records them as a failure of that pairing.
#[derive(Debug, Error)]
pub enum CheckError {
    #[error("could not allocate resource \"{name}\": {failure}")]
    Allocation {
        name: String,
        failure: AllocationFailure,
    },
    #[error("could not build kernel {kernel}: {failure}")]
    Compile {
        kernel: String,
        failure: CompileFailure,
    },
    #[error("could not bind kernel {kernel}: {failure}")]
    Binding {
        kernel: String,
        failure: BindingFailure,
    },
    #[error("{failure} returned by kernel launch {algorithm}[{kernel_index}]")]
    Dispatch {
        algorithm: String,
        kernel_index: usize,
        failure: DispatchFailure,
    },
    #[error("transfer of {what} for {algorithm} failed: {source}")]
    Transfer {
        algorithm: String,
        what: &'static str,
        #[source]
        source: BackendError,
    },
    #[error("protocol violation: {0}")]
    Protocol(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocationFailure {
    #[error("name already declared")]
    DuplicateName,
    #[error("resource names must not be empty")]
    EmptyName,
    #[error("names starting with '$' are reserved")]
    ReservedName,
    #[error("invalid memory flags")]
    InvalidFlags,
    #[error("zero-sized resource")]
    ZeroSize,
    #[error("{requested} bytes exceed the device limit of {limit} bytes")]
    Oversized { requested: usize, limit: usize },
    #[error("initial data does not match the resource")]
    InvalidHostData,
    #[error("invalid image format")]
    InvalidImageFormat,
    #[error("invalid image descriptor")]
    InvalidImageDescriptor,
    #[error("image format not supported by the device")]
    ImageFormatNotSupported,
    #[error("immediate values hold at most 8 bytes, got {0}")]
    ImmediateTooWide(usize),
    #[error("{0}")]
    Backend(BackendError),
}

impl From<BackendError> for AllocationFailure {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::InvalidFlags(_) => Self::InvalidFlags,
            BackendError::ZeroSize => Self::ZeroSize,
            BackendError::TooLarge { requested, limit } => Self::Oversized { requested, limit },
            BackendError::InvalidHostData => Self::InvalidHostData,
            BackendError::InvalidImageFormat => Self::InvalidImageFormat,
            BackendError::InvalidImageDescriptor => Self::InvalidImageDescriptor,
            BackendError::ImageFormatNotSupported => Self::ImageFormatNotSupported,
            other => Self::Backend(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileFailure {
    #[error("could not load source: {0}")]
    SourceLoad(String),
    #[error("source is {bytes} bytes, the limit is {limit} bytes")]
    SourceTooLarge { bytes: usize, limit: usize },
    #[error("Bad build options; log: {log}")]
    BadBuildOptions { log: String },
    #[error("{error}; log: {log}")]
    Build { error: BackendError, log: String },
    #[error("kernel creation failed: {0}")]
    KernelCreation(BackendError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BindingFailure {
    #[error("Kernel binding has empty name")]
    EmptyName,
    #[error("Could not find parameter \"{0}\"")]
    Unresolved(String),
    #[error("argument {index} (\"{parameter}\"): {error}")]
    Backend {
        index: u32,
        parameter: String,
        error: BackendError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchFailure {
    #[error("backend error \"{0}\"")]
    Backend(BackendError),
    #[error("late-bound slot {slot} is not populated")]
    MissingLateSlot { slot: usize },
}
