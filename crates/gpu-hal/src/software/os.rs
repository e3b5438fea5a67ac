//! In-process OS layer.
//!
//! [`SoftwareOs`] implements `MosInterface` entirely on the host: GPU
//! contexts and resources are bookkeeping records, command buffers are kept
//! per context and index until submission, and submitted streams can be run
//! through the lockstep executor. Every call is recorded as an [`OsCall`] so
//! tests can assert on exact interaction sequences.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use md_common::{
    CommandBuffer, ComponentType, GpuContextCreateOptions, GpuContextHandle, GpuNode, MosError,
    MosInterface, ResourceDesc, ResourceHandle, VeHintParams,
};
use parking_lot::Mutex;
use tracing::{debug, info};

use super::executor::{execute_streams, ExecError, ExecutionReport, GpuMemory};

/// How `resize_command_buffer_and_patch_list` behaves.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ResizePolicy {
    /// Grow to the requested size.
    #[default]
    Grow,
    /// Report success without growing anything.
    Ignore,
    /// Fail every resize.
    Fail,
}

/// Tunables and failure injection for [`SoftwareOs`].
#[derive(Clone, Debug)]
pub struct SoftwareOsConfig {
    pub command_buffer_size: u32,
    pub patch_list_size: u32,
    pub resize_policy: ResizePolicy,
    pub virtual_engine: bool,
    pub vdbox_count: u8,
    pub vebox_count: u8,
    pub compute_count: u8,
    pub fail_context_creation: bool,
    /// Cap on live resources; allocation beyond it fails.
    pub max_resources: Option<usize>,
}

impl Default for SoftwareOsConfig {
    fn default() -> Self {
        Self {
            command_buffer_size: 64 * 1024,
            patch_list_size: 4096,
            resize_policy: ResizePolicy::Grow,
            virtual_engine: true,
            vdbox_count: 2,
            vebox_count: 2,
            compute_count: 1,
            fail_context_creation: false,
            max_resources: None,
        }
    }
}

/// One recorded interaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OsCall {
    CreateGpuContext { node: GpuNode, lrca_count: u32 },
    DestroyGpuContext(GpuContextHandle),
    SetGpuContext(GpuContextHandle),
    GetCommandBuffer { index: u32 },
    ReturnCommandBuffer { index: u32 },
    Submit { primary: ResourceHandle },
    VerifyCommandBufferSize { index: u32, size: u32 },
    VerifyPatchListSize { size: u32 },
    Resize { cmd_size: u32, patch_size: u32, index: u32 },
    AllocateResource(ResourceHandle),
    FreeResource(ResourceHandle),
    SetHintParams { pipe_num: u8 },
    PopulateHintParams,
    SetMultiEngine { component: ComponentType, enabled: bool },
}

/// A submitted primary buffer plus the secondaries it chained.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Submission {
    pub context: GpuContextHandle,
    pub primary: CommandBuffer,
    pub secondaries: Vec<CommandBuffer>,
}

#[derive(Debug)]
struct ContextState {
    node: GpuNode,
    options: GpuContextCreateOptions,
    /// Buffers handed back this frame, keyed by index.
    buffers: BTreeMap<u32, CommandBuffer>,
    checked_out: HashSet<u32>,
    capacities: HashMap<u32, u32>,
    patch_capacity: u32,
}

#[derive(Debug, Default)]
struct State {
    next_resource: u64,
    next_context: u32,
    contexts: HashMap<GpuContextHandle, ContextState>,
    current: Option<GpuContextHandle>,
    memory: GpuMemory,
    submissions: Vec<Submission>,
    calls: Vec<OsCall>,
    hint: Option<VeHintParams>,
    multi_engine: HashMap<ComponentType, bool>,
}

impl State {
    /// Handle for a command buffer; buffers have no interpretable memory.
    fn new_handle(&mut self) -> ResourceHandle {
        self.next_resource += 1;
        ResourceHandle(self.next_resource)
    }

    fn new_resource(&mut self, words: usize) -> ResourceHandle {
        let handle = self.new_handle();
        self.memory.insert(handle, vec![0; words.max(1)]);
        handle
    }

    fn current_context(&mut self) -> Result<(GpuContextHandle, &mut ContextState), MosError> {
        let handle = self
            .current
            .ok_or_else(|| MosError::InvalidParameter("no current GPU context".into()))?;
        let ctx = self
            .contexts
            .get_mut(&handle)
            .ok_or(MosError::InvalidGpuContext(handle.0))?;
        Ok((handle, ctx))
    }
}

/// Host-only `MosInterface` implementation.
///
/// # Thread safety
///
/// All state sits behind one `parking_lot::Mutex`, so the type is
/// `Send + Sync` and can be shared through an `Arc`.
pub struct SoftwareOs {
    config: SoftwareOsConfig,
    fail_context_creation: AtomicBool,
    state: Mutex<State>,
}

impl SoftwareOs {
    pub fn new(config: SoftwareOsConfig) -> Self {
        Self {
            fail_context_creation: AtomicBool::new(config.fail_context_creation),
            config,
            state: Mutex::new(State::default()),
        }
    }

    /// Make later `create_gpu_context` calls fail, or succeed again.
    pub fn set_fail_context_creation(&self, fail: bool) {
        self.fail_context_creation.store(fail, Ordering::Relaxed);
    }

    pub fn config(&self) -> &SoftwareOsConfig {
        &self.config
    }

    /// Every call recorded so far.
    pub fn calls(&self) -> Vec<OsCall> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    pub fn count_calls(&self, pred: impl Fn(&OsCall) -> bool) -> usize {
        self.state.lock().calls.iter().filter(|c| pred(c)).count()
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.state.lock().submissions.clone()
    }

    pub fn live_context_count(&self) -> usize {
        self.state.lock().contexts.len()
    }

    pub fn context_node(&self, handle: GpuContextHandle) -> Option<GpuNode> {
        self.state.lock().contexts.get(&handle).map(|c| c.node)
    }

    pub fn context_options(&self, handle: GpuContextHandle) -> Option<GpuContextCreateOptions> {
        self.state
            .lock()
            .contexts
            .get(&handle)
            .map(|c| c.options.clone())
    }

    pub fn live_resource_count(&self) -> usize {
        self.state.lock().memory.len()
    }

    pub fn read_resource_u32(&self, handle: ResourceHandle, offset: u32) -> Option<u32> {
        self.state
            .lock()
            .memory
            .get(&handle)
            .and_then(|w| w.get((offset / 4) as usize).copied())
    }

    pub fn multi_engine_enabled(&self, component: ComponentType) -> bool {
        self.state
            .lock()
            .multi_engine
            .get(&component)
            .copied()
            .unwrap_or(false)
    }

    /// Run the secondaries of submission `n` (or its primary when it has
    /// none) against resource memory.
    pub fn execute_submission(&self, n: usize) -> Result<ExecutionReport, ExecError> {
        let mut state = self.state.lock();
        let State {
            submissions,
            memory,
            ..
        } = &mut *state;
        let Some(sub) = submissions.get(n) else {
            return Ok(ExecutionReport::default());
        };
        let streams: Vec<&[md_common::MiCommand]> = if sub.secondaries.is_empty() {
            vec![sub.primary.commands()]
        } else {
            sub.secondaries.iter().map(|b| b.commands()).collect()
        };
        execute_streams(memory, &streams)
    }
}

impl std::fmt::Debug for SoftwareOs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SoftwareOs")
            .field("contexts", &state.contexts.len())
            .field("resources", &state.memory.len())
            .field("submissions", &state.submissions.len())
            .finish()
    }
}

impl MosInterface for SoftwareOs {
    fn create_gpu_context(
        &self,
        node: GpuNode,
        options: &GpuContextCreateOptions,
    ) -> Result<GpuContextHandle, MosError> {
        let mut state = self.state.lock();
        state.calls.push(OsCall::CreateGpuContext {
            node,
            lrca_count: options.lrca_count,
        });
        if self.fail_context_creation.load(Ordering::Relaxed) {
            return Err(MosError::GpuContextCreation(format!(
                "context creation disabled for {node}"
            )));
        }
        if options.lrca_count == 0 || options.lrca_count > u32::from(self.engine_count(node)).max(1) + 1 {
            return Err(MosError::GpuContextCreation(format!(
                "{node} cannot host {} logical ring contexts",
                options.lrca_count
            )));
        }
        let handle = GpuContextHandle(state.next_context);
        state.next_context += 1;
        state.contexts.insert(
            handle,
            ContextState {
                node,
                options: options.clone(),
                buffers: BTreeMap::new(),
                checked_out: HashSet::new(),
                capacities: HashMap::new(),
                patch_capacity: self.config.patch_list_size,
            },
        );
        info!(ctx = %handle, node = %node, lrca = options.lrca_count, "Created GPU context");
        Ok(handle)
    }

    fn destroy_gpu_context(&self, handle: GpuContextHandle) -> Result<(), MosError> {
        let mut state = self.state.lock();
        state.calls.push(OsCall::DestroyGpuContext(handle));
        state
            .contexts
            .remove(&handle)
            .ok_or(MosError::InvalidGpuContext(handle.0))?;
        if state.current == Some(handle) {
            state.current = None;
        }
        debug!(ctx = %handle, "Destroyed GPU context");
        Ok(())
    }

    fn set_gpu_context(&self, handle: GpuContextHandle) -> Result<(), MosError> {
        let mut state = self.state.lock();
        state.calls.push(OsCall::SetGpuContext(handle));
        if !state.contexts.contains_key(&handle) {
            return Err(MosError::InvalidGpuContext(handle.0));
        }
        state.current = Some(handle);
        Ok(())
    }

    fn current_gpu_context(&self) -> Option<GpuContextHandle> {
        self.state.lock().current
    }

    fn get_command_buffer(&self, index: u32) -> Result<CommandBuffer, MosError> {
        let mut state = self.state.lock();
        state.calls.push(OsCall::GetCommandBuffer { index });
        let default_size = self.config.command_buffer_size;
        let existing = {
            let (_, ctx) = state.current_context()?;
            ctx.checked_out.insert(index);
            ctx.buffers.get(&index).cloned()
        };
        if let Some(buf) = existing {
            return Ok(buf);
        }
        let resource = state.new_handle();
        let (_, ctx) = state.current_context()?;
        let capacity = *ctx.capacities.entry(index).or_insert(default_size);
        let buf = CommandBuffer::new(index, resource, capacity);
        ctx.buffers.insert(index, buf.clone());
        Ok(buf)
    }

    fn return_command_buffer(&self, buffer: CommandBuffer) -> Result<(), MosError> {
        let mut state = self.state.lock();
        let index = buffer.index;
        state.calls.push(OsCall::ReturnCommandBuffer { index });
        let (_, ctx) = state.current_context()?;
        if !ctx.checked_out.remove(&index) {
            return Err(MosError::BufferNotAcquired { index });
        }
        ctx.buffers.insert(index, buffer);
        Ok(())
    }

    fn submit_command_buffer(
        &self,
        primary: &CommandBuffer,
        _null_rendering: bool,
    ) -> Result<(), MosError> {
        let mut state = self.state.lock();
        state.calls.push(OsCall::Submit {
            primary: primary.resource,
        });
        if !primary.is_acquired() {
            return Err(MosError::NullResource);
        }
        let (handle, ctx) = state.current_context()?;
        if let Some(index) = ctx.checked_out.iter().min().copied() {
            return Err(MosError::Submission(format!(
                "command buffer {index} still checked out"
            )));
        }
        let buffers = std::mem::take(&mut ctx.buffers);
        let secondaries: Vec<CommandBuffer> = buffers
            .into_values()
            .filter(|b| b.index != 0)
            .collect();
        debug!(
            ctx = %handle,
            secondaries = secondaries.len(),
            bytes = primary.used_bytes(),
            "Submitted command buffer"
        );
        state.submissions.push(Submission {
            context: handle,
            primary: primary.clone(),
            secondaries,
        });
        Ok(())
    }

    fn verify_command_buffer_size(&self, requested_size: u32, index: u32) -> bool {
        let mut state = self.state.lock();
        state.calls.push(OsCall::VerifyCommandBufferSize {
            index,
            size: requested_size,
        });
        let default_size = self.config.command_buffer_size;
        match state.current_context() {
            Ok((_, ctx)) => {
                let used = ctx.buffers.get(&index).map_or(0, |b| b.used_bytes());
                let capacity = ctx.capacities.get(&index).copied().unwrap_or(default_size);
                capacity.saturating_sub(used) >= requested_size
            }
            Err(_) => false,
        }
    }

    fn verify_patch_list_size(&self, requested_size: u32) -> bool {
        let mut state = self.state.lock();
        state.calls.push(OsCall::VerifyPatchListSize {
            size: requested_size,
        });
        match state.current_context() {
            Ok((_, ctx)) => ctx.patch_capacity >= requested_size,
            Err(_) => false,
        }
    }

    fn resize_command_buffer_and_patch_list(
        &self,
        requested_cmd_size: u32,
        requested_patch_size: u32,
        index: u32,
    ) -> Result<(), MosError> {
        let mut state = self.state.lock();
        state.calls.push(OsCall::Resize {
            cmd_size: requested_cmd_size,
            patch_size: requested_patch_size,
            index,
        });
        let default_size = self.config.command_buffer_size;
        match self.config.resize_policy {
            ResizePolicy::Fail => Err(MosError::Allocation(format!(
                "resize of command buffer {index} refused"
            ))),
            ResizePolicy::Ignore => Ok(()),
            ResizePolicy::Grow => {
                let (_, ctx) = state.current_context()?;
                if requested_cmd_size > 0 {
                    let used = ctx.buffers.get(&index).map_or(0, |b| b.used_bytes());
                    let capacity = ctx.capacities.entry(index).or_insert(default_size);
                    *capacity = (*capacity).max(used + requested_cmd_size);
                    let new_capacity = *capacity;
                    if let Some(buf) = ctx.buffers.get_mut(&index) {
                        buf.grow_to(new_capacity);
                    }
                }
                if requested_patch_size > 0 {
                    ctx.patch_capacity = ctx.patch_capacity.max(requested_patch_size);
                }
                Ok(())
            }
        }
    }

    fn allocate_resource(&self, desc: &ResourceDesc) -> Result<ResourceHandle, MosError> {
        let mut state = self.state.lock();
        if let Some(max) = self.config.max_resources {
            if state.memory.len() >= max {
                return Err(MosError::Allocation(format!(
                    "{}: resource limit {max} reached",
                    desc.name
                )));
            }
        }
        let handle = state.new_resource(desc.size.div_ceil(4) as usize);
        state.calls.push(OsCall::AllocateResource(handle));
        Ok(handle)
    }

    fn free_resource(&self, handle: ResourceHandle) -> Result<(), MosError> {
        let mut state = self.state.lock();
        state.calls.push(OsCall::FreeResource(handle));
        state
            .memory
            .remove(&handle)
            .map(|_| ())
            .ok_or(MosError::UnknownResource(handle))
    }

    fn write_resource_u32(
        &self,
        handle: ResourceHandle,
        offset: u32,
        value: u32,
    ) -> Result<(), MosError> {
        let mut state = self.state.lock();
        let words = state
            .memory
            .get_mut(&handle)
            .ok_or(MosError::UnknownResource(handle))?;
        let word = words
            .get_mut((offset / 4) as usize)
            .ok_or_else(|| MosError::InvalidParameter(format!("offset {offset} out of range")))?;
        *word = value;
        Ok(())
    }

    fn virtual_engine_supported(&self) -> bool {
        self.config.virtual_engine
    }

    fn set_hint_params(&self, params: &VeHintParams) -> Result<(), MosError> {
        let mut state = self.state.lock();
        state.calls.push(OsCall::SetHintParams {
            pipe_num: params.scalable_pipe_num,
        });
        if !self.config.virtual_engine {
            return Err(MosError::InvalidParameter(
                "virtual engine not supported".into(),
            ));
        }
        state.hint = Some(params.clone());
        Ok(())
    }

    fn populate_hint_params(&self, primary: &mut CommandBuffer) -> Result<(), MosError> {
        let mut state = self.state.lock();
        state.calls.push(OsCall::PopulateHintParams);
        primary.attributes.ve_hint = state.hint.clone();
        Ok(())
    }

    fn set_multi_engine_enabled(&self, component: ComponentType, enabled: bool) {
        let mut state = self.state.lock();
        state
            .calls
            .push(OsCall::SetMultiEngine { component, enabled });
        state.multi_engine.insert(component, enabled);
    }

    fn engine_count(&self, node: GpuNode) -> u8 {
        match node {
            GpuNode::Video | GpuNode::Video2 => self.config.vdbox_count,
            GpuNode::VideoEnhance => self.config.vebox_count,
            GpuNode::Compute => self.config.compute_count,
            GpuNode::Render3D => 1,
        }
    }
}
