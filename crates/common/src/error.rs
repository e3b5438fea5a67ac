//! Central error types for the driver core (thiserror-based).
//!
//! Every layer owns one enum and converts upward with `#[from]`:
//! `MosError`/`HalError` come from collaborators, `ScalabilityError` and
//! `ContextError` from the multi-pipe stack, `CmError` from the CM device.

use thiserror::Error;

use crate::types::{MediaFunction, ResourceHandle};

/// Errors reported by the OS / command-submission layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MosError {
    #[error("Null resource handle")]
    NullResource,

    #[error("Not enough space: requested {requested} bytes, available {available} bytes")]
    NoSpace { requested: u32, available: u32 },

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("GPU context creation failed: {0}")]
    GpuContextCreation(String),

    #[error("Unknown GPU context handle {0}")]
    InvalidGpuContext(u32),

    #[error("Resource allocation failed: {0}")]
    Allocation(String),

    #[error("Unknown resource {0:?}")]
    UnknownResource(ResourceHandle),

    #[error("Command buffer submission failed: {0}")]
    Submission(String),

    #[error("Command buffer {index} was not acquired")]
    BufferNotAcquired { index: u32 },
}

/// Errors reported by the CM HAL state tables.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HalError {
    #[error("{table} table full ({capacity} entries)")]
    TableFull { table: &'static str, capacity: u32 },

    #[error("{table} index {index} is not registered")]
    NotRegistered { table: &'static str, index: u32 },

    #[error("Invalid HAL parameter: {0}")]
    InvalidParameter(String),

    #[error("Operation not supported by this platform: {0}")]
    NotSupported(&'static str),

    #[error("Task {0} is unknown to the HAL")]
    UnknownTask(u64),
}

/// Errors from scalability option selection and pipe orchestration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScalabilityError {
    #[error("OS layer error: {0}")]
    Mos(#[from] MosError),

    #[error("Pipe {pipe} out of range (pipe count {pipe_num})")]
    PipeOutOfRange { pipe: u8, pipe_num: u8 },

    #[error("Pass {pass} out of range (max passes {max_passes})")]
    PassOutOfRange { pass: u8, max_passes: u8 },

    #[error("Semaphore id {id} out of range (max {max})")]
    SemaphoreOutOfRange { id: u32, max: u32 },

    #[error("Requested {requested} pipes but the platform supports {max}")]
    TooManyPipes { requested: u8, max: u8 },

    #[error("Scalability state used before initialize")]
    NotInitialized,

    #[error("Command buffer space still insufficient after {attempts} attempts")]
    NoSpace { attempts: u32 },

    #[error("Invalid scalability parameter: {0}")]
    InvalidParameter(String),
}

/// Errors from the GPU context cache.
#[derive(Error, Debug)]
pub enum ContextError {
    #[error("Scalability error: {0}")]
    Scalability(#[from] ScalabilityError),

    #[error("OS layer error: {0}")]
    Mos(#[from] MosError),

    #[error("No GPU node available for {0:?}")]
    InvalidNode(MediaFunction),

    #[error("Context cache full ({capacity} entries, all in use)")]
    CacheFull { capacity: usize },

    #[error("Media context already destroyed")]
    Destroyed,
}

/// Coarse error classes shared by every CM status code.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    NullPointer,
    InvalidArgument,
    ResourceExhausted,
    HardwareRegistration,
    InconsistentHandle,
    Unimplemented,
    GenericFailure,
}

/// CM device errors. Each variant corresponds to one CM return code.
#[derive(Error, Debug)]
pub enum CmError {
    #[error("Generic failure: {0}")]
    Failure(String),

    #[error("Not implemented: {0}")]
    NotImplemented(&'static str),

    #[error("Out of host memory")]
    OutOfHostMemory,

    #[error("Surface format not supported: {0}")]
    SurfaceFormatNotSupported(String),

    #[error("Exceeded surface amount ({max})")]
    ExceedSurfaceAmount { max: u32 },

    #[error("Exceeded kernel argument amount ({max})")]
    ExceedKernelArgAmount { max: u32 },

    #[error("Kernel argument size {size} exceeds {max} bytes")]
    ExceedKernelArgSize { size: u32, max: u32 },

    #[error("Invalid argument value: {0}")]
    InvalidArgValue(String),

    #[error("Invalid width {0}")]
    InvalidWidth(u32),

    #[error("Invalid height {0}")]
    InvalidHeight(u32),

    #[error("Invalid depth {0}")]
    InvalidDepth(u32),

    #[error("Invalid common ISA")]
    InvalidCommonIsa,

    #[error("Exceeded sampler amount")]
    ExceedSamplerAmount,

    #[error("Exceeded max kernels per task ({max})")]
    ExceedMaxKernelPerEnqueue { max: u32 },

    #[error("Kernel binary of {size} bytes exceeds {max} bytes")]
    ExceedMaxKernelSize { size: usize, max: usize },

    #[error("Invalid thread space {width}x{height}")]
    InvalidThreadSpace { width: u32, height: u32 },

    #[error("Failed to load JIT library: {0}")]
    JitLibraryLoad(String),

    #[error("Invalid thread group space: {0}")]
    InvalidThreadGroupSpace(String),

    #[error("Invalid hardware thread number {0}")]
    InvalidHardwareThreadNumber(u32),

    #[error("Invalid L3 configuration")]
    InvalidL3Configuration,

    #[error("Invalid MOS resource handle")]
    InvalidMosResourceHandle,

    #[error("Surface {0} is still in use")]
    SurfaceInUse(u32),

    #[error("System memory is not 4K page aligned")]
    SystemMemoryNot4kAligned,

    #[error("Null pointer: {0}")]
    NullPointer(&'static str),

    #[error("Invalid parameter size: expected at least {expected}, got {got}")]
    InvalidParamSize { expected: usize, got: usize },

    #[error("Invalid capability name")]
    InvalidCapName,

    #[error("Stale or foreign {kind} handle (slot {index})")]
    InconsistentHandle { kind: &'static str, index: u32 },

    #[error("HAL error: {0}")]
    Hal(#[from] HalError),

    #[error("OS layer error: {0}")]
    Mos(#[from] MosError),
}

impl CmError {
    /// Numeric CM return code for this error.
    pub fn code(&self) -> i32 {
        match self {
            Self::Failure(_) => -1,
            Self::NotImplemented(_) => -2,
            Self::OutOfHostMemory => -4,
            Self::SurfaceFormatNotSupported(_) => -5,
            Self::ExceedSurfaceAmount { .. } => -6,
            Self::ExceedKernelArgAmount { .. } => -7,
            Self::ExceedKernelArgSize { .. } => -8,
            Self::InvalidArgValue(_) => -10,
            Self::InvalidWidth(_) => -13,
            Self::InvalidHeight(_) => -14,
            Self::InvalidDepth(_) => -15,
            Self::InvalidCommonIsa => -16,
            Self::ExceedSamplerAmount => -20,
            Self::ExceedMaxKernelPerEnqueue { .. } => -21,
            Self::ExceedMaxKernelSize { .. } => -22,
            Self::InvalidThreadSpace { .. } => -25,
            Self::JitLibraryLoad(_) => -27,
            Self::InvalidThreadGroupSpace(_) => -30,
            Self::InvalidHardwareThreadNumber(_) => -36,
            Self::InvalidL3Configuration => -38,
            Self::InvalidMosResourceHandle => -73,
            Self::SurfaceInUse(_) => -75,
            Self::SystemMemoryNot4kAligned => -85,
            Self::NullPointer(_) => -90,
            Self::InvalidParamSize { .. } => -92,
            Self::InvalidCapName => -101,
            Self::InconsistentHandle { .. } => -1,
            Self::Hal(_) => -1,
            Self::Mos(_) => -20_000,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::NullPointer(_) => ErrorCategory::NullPointer,
            Self::InvalidArgValue(_)
            | Self::InvalidWidth(_)
            | Self::InvalidHeight(_)
            | Self::InvalidDepth(_)
            | Self::InvalidCommonIsa
            | Self::SurfaceFormatNotSupported(_)
            | Self::ExceedKernelArgSize { .. }
            | Self::InvalidThreadSpace { .. }
            | Self::InvalidThreadGroupSpace(_)
            | Self::InvalidHardwareThreadNumber(_)
            | Self::InvalidL3Configuration
            | Self::InvalidMosResourceHandle
            | Self::SystemMemoryNot4kAligned
            | Self::InvalidParamSize { .. }
            | Self::InvalidCapName => ErrorCategory::InvalidArgument,
            Self::OutOfHostMemory
            | Self::ExceedSurfaceAmount { .. }
            | Self::ExceedKernelArgAmount { .. }
            | Self::ExceedSamplerAmount
            | Self::ExceedMaxKernelPerEnqueue { .. }
            | Self::ExceedMaxKernelSize { .. } => ErrorCategory::ResourceExhausted,
            Self::Hal(_) => ErrorCategory::HardwareRegistration,
            Self::InconsistentHandle { .. } => ErrorCategory::InconsistentHandle,
            Self::NotImplemented(_) => ErrorCategory::Unimplemented,
            Self::Failure(_) | Self::JitLibraryLoad(_) | Self::SurfaceInUse(_) | Self::Mos(_) => {
                ErrorCategory::GenericFailure
            }
        }
    }
}

/// Config file loading errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid config value: {0}")]
    Invalid(String),
}

pub type MosResult<T> = Result<T, MosError>;
pub type HalResult<T> = Result<T, HalError>;
pub type ScalabilityResult<T> = Result<T, ScalabilityError>;
pub type ContextResult<T> = Result<T, ContextError>;
pub type CmResult<T> = Result<T, CmError>;
