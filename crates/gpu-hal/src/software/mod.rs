//! Software backends for the OS layer and the CM HAL.
//!
//! Used wherever no kernel-mode driver is available: unit and integration
//! tests, and host-side tools that want to inspect the command streams the
//! scalability code produces.

pub mod cm_hal;
pub mod executor;
pub mod os;

pub use cm_hal::{HalCall, SoftwareCmHal, SoftwareCmHalConfig};
pub use executor::{execute_streams, ExecError, ExecutionReport, GpuMemory};
pub use os::{OsCall, ResizePolicy, SoftwareOs, SoftwareOsConfig, Submission};
