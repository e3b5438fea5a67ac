//! `md-scalability` — Splitting media work across engine instances.
//!
//! A pipeline describes its workload with [`ScalabilityParams`]; the
//! [`ScalabilityOption`] decides how many pipes to use; the factory builds a
//! [`MediaScalability`] implementation that owns the per-frame command
//! buffers and cross-pipe semaphores for that many pipes.
//!
//! ```text
//! ScalabilityParams ──▶ ScalabilityOption ──▶ create_scalability()
//!                                                  │
//!                          ┌───────────────────────┴──────────────┐
//!                          ▼                                      ▼
//!             MediaScalabilitySinglePipe             MediaScalabilityMultiPipe
//!             (one buffer, no sync)                  (primary + N secondaries,
//!                                                     SemaphoreSet)
//! ```

pub mod factory;
pub mod multi_pipe;
pub mod option;
pub mod scalability;
pub mod single_pipe;

pub use md_common::{ScalabilityError, ScalabilityResult};

pub use factory::{create_scalability, create_scalability_for};
pub use multi_pipe::MediaScalabilityMultiPipe;
pub use option::{ScalabilityOption, ScalabilityParams};
pub use scalability::{
    gpu_ctx_options_matched, MediaScalability, ScalabilityState, StateParams, SyncType,
};
pub use single_pipe::MediaScalabilitySinglePipe;
