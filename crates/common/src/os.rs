//! OS / command-submission layer abstraction.
//!
//! The scalability and context code program against [`MosInterface`], never
//! against a concrete kernel-mode driver binding. `md-gpu-hal` ships an
//! in-process implementation (`SoftwareOs`) used by tests and tools.

use serde::{Deserialize, Serialize};

use crate::command::{CommandBuffer, VeHintParams};
use crate::error::MosError;
use crate::types::{ComponentType, GpuContextHandle, GpuNode, ResourceHandle};

/// Options used when creating a GPU context.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuContextCreateOptions {
    /// Logical ring context count (one per engine instance used).
    pub lrca_count: u32,
    pub using_sfc: bool,
    /// Physical engine instances the context may be scheduled on.
    pub engine_instances: Vec<u8>,
}

impl GpuContextCreateOptions {
    pub fn single() -> Self {
        Self {
            lrca_count: 1,
            using_sfc: false,
            engine_instances: vec![0],
        }
    }
}

/// Description of a linear GPU buffer allocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceDesc {
    pub name: String,
    pub size: u32,
}

impl ResourceDesc {
    pub fn linear(name: impl Into<String>, size: u32) -> Self {
        Self {
            name: name.into(),
            size,
        }
    }
}

/// Client view of the OS command-submission layer.
///
/// # Thread safety
///
/// Implementations must be `Send + Sync`; callers share one instance through
/// an `Arc` across every pipeline and context.
pub trait MosInterface: Send + Sync {
    // -- GPU contexts --

    fn create_gpu_context(
        &self,
        node: GpuNode,
        options: &GpuContextCreateOptions,
    ) -> Result<GpuContextHandle, MosError>;

    fn destroy_gpu_context(&self, handle: GpuContextHandle) -> Result<(), MosError>;

    /// Make `handle` the current context for subsequent buffer calls.
    fn set_gpu_context(&self, handle: GpuContextHandle) -> Result<(), MosError>;

    fn current_gpu_context(&self) -> Option<GpuContextHandle>;

    // -- Command buffers --

    /// Check out command buffer `index` of the current context.
    fn get_command_buffer(&self, index: u32) -> Result<CommandBuffer, MosError>;

    /// Hand a checked-out buffer back, keeping its recorded commands.
    fn return_command_buffer(&self, buffer: CommandBuffer) -> Result<(), MosError>;

    /// Submit `primary` (which chains to every returned secondary buffer).
    fn submit_command_buffer(
        &self,
        primary: &CommandBuffer,
        null_rendering: bool,
    ) -> Result<(), MosError>;

    fn verify_command_buffer_size(&self, requested_size: u32, index: u32) -> bool;

    fn verify_patch_list_size(&self, requested_size: u32) -> bool;

    /// Grow the command buffer at `index` and/or the patch list. A size of 0
    /// leaves that dimension untouched.
    fn resize_command_buffer_and_patch_list(
        &self,
        requested_cmd_size: u32,
        requested_patch_size: u32,
        index: u32,
    ) -> Result<(), MosError>;

    // -- Resources --

    fn allocate_resource(&self, desc: &ResourceDesc) -> Result<ResourceHandle, MosError>;

    fn free_resource(&self, handle: ResourceHandle) -> Result<(), MosError>;

    /// CPU write of one dword (lock, write, unlock).
    fn write_resource_u32(
        &self,
        handle: ResourceHandle,
        offset: u32,
        value: u32,
    ) -> Result<(), MosError>;

    // -- Virtual engine --

    fn virtual_engine_supported(&self) -> bool;

    fn set_hint_params(&self, params: &VeHintParams) -> Result<(), MosError>;

    /// Copy the last hint set with [`MosInterface::set_hint_params`] onto
    /// `primary`.
    fn populate_hint_params(&self, primary: &mut CommandBuffer) -> Result<(), MosError>;

    fn set_multi_engine_enabled(&self, component: ComponentType, enabled: bool);

    /// Number of engine instances available for a node class.
    fn engine_count(&self, node: GpuNode) -> u8;
}
