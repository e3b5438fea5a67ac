//! `md-gpu-hal` — GPU command emission and synchronization primitives.
//!
//! - [`mi`]: helpers appending memory-interface commands to a command buffer
//! - [`sync`]: GPU semaphores (one dword of GPU memory) and the per-instance
//!   semaphore set used by multi-pipe synchronization
//! - [`software`]: in-process `MosInterface` / `CmHal` backends that record
//!   every call and can execute recorded command streams

pub mod mi;
pub mod software;
pub mod sync;

pub use software::{
    HalCall, OsCall, ResizePolicy, SoftwareCmHal, SoftwareCmHalConfig, SoftwareOs, SoftwareOsConfig,
    Submission,
};
pub use sync::{GpuSemaphore, SemaphoreSet};
