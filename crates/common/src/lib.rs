//! `md-common` — Shared types, traits, and errors for the media driver core.
//!
//! This crate is the foundation every other driver crate depends on:
//!
//! - **Types**: `ResourceHandle`, `GpuContextHandle`, `MediaFunction`, `GpuNode`
//! - **Command buffers**: `CommandBuffer`, `MiCommand`, `SubmissionType`
//! - **Collaborator traits**: `MosInterface` (OS submission), `CmHal` (CM HAL state)
//! - **Errors**: `MosError`, `ScalabilityError`, `ContextError`, `CmError` (thiserror-based)
//! - **Config**: `DriverConfig` (serde, JSON-loadable)

pub mod cm_hal;
pub mod command;
pub mod config;
pub mod error;
pub mod os;
pub mod types;

// Re-export commonly used items at crate root
pub use cm_hal::{
    CmHal, CmQueueType, HalMaxValues, HalTaskId, HalTaskStatus, L3Config, PlatformInfo,
    Sampler8x8Descriptor, SamplerState, TaskSubmission,
};
pub use command::{
    AtomicOp, CmdBufferAttributes, CommandBuffer, CompareOp, MiCommand, PostSyncWrite,
    SubmissionType, VeHintParams,
};
pub use config::{CmConfig, ContextConfig, DriverConfig, ScalabilityConfig};
pub use error::{
    CmError, CmResult, ConfigError, ContextError, ContextResult, ErrorCategory, HalError,
    HalResult, MosError, MosResult, ScalabilityError, ScalabilityResult,
};
pub use os::{GpuContextCreateOptions, MosInterface, ResourceDesc};
pub use types::{
    ComponentType, GpuContextHandle, GpuNode, MediaFunction, Resolution, ResourceHandle,
    SurfaceFormat,
};
