//! `md-cm` — C for Media device resource tables.
//!
//! A [`CmDevice`] owns every object an application creates through the CM
//! runtime: buffers and surfaces, programs and kernels, samplers, tasks,
//! thread spaces, veboxes and queues. Each class lives in its own
//! generational slot table behind its own lock:
//!
//! ```text
//!              CmDevice
//!   ┌────────────┼──────────────────────────┐
//!   │ Queue < Task < ThreadSpace < ... < Surface   (lock ranks)
//!   │
//!   ├─ queues ──── in-flight tasks ──► surfaces kept busy
//!   ├─ programs ◄── kernels (acquisition counted)
//!   ├─ samplers ── HAL registration (rolled back on failure)
//!   └─ surfaces ── owned / borrowed / host backing
//! ```
//!
//! Handles carry a generation, so a handle to a destroyed object never
//! resolves to whatever reuses its slot.

pub mod caps;
pub mod device;
pub mod jit;
pub mod lock_order;
pub mod notifier;
pub mod predefined;
pub mod print;
pub mod program;
pub mod queue;
pub mod sampler;
pub mod slot;
pub mod surface;
pub mod task;
pub mod thread_space;
pub mod vebox;

pub use caps::{CapName, SetCap};
pub use device::CmDevice;
pub use notifier::{DeviceEvent, DeviceNotifier};
pub use program::{KernelArg, KernelId, ProgramId};
pub use queue::{CmEvent, QueueCreateOption, QueueId};
pub use sampler::{Sampler8x8Id, SamplerId};
pub use slot::Handle;
pub use surface::{DestroyKind, DestroyOutcome, SurfaceId, SurfaceKind};
pub use task::TaskId;
pub use thread_space::{DependencyPattern, ThreadGroupSpaceId, ThreadSpaceId};
pub use vebox::{VeboxId, VeboxState};
