//! The `MediaScalability` trait and the state shared by both variants.
//!
//! # Frame state machine
//!
//! ```text
//! Uninitialized ──initialize──▶ Ready ──get_cmd_buffer──▶ BufferAcquired
//!                                 ▲                          │  ▲
//!                                 │                 sync_pipe│  │return_cmd_buffer
//!                                 │                          ▼  │
//!                                 └──────submit_cmd_buffer── (all returned)
//!
//! any state ──destroy──▶ Destroyed
//! ```

use std::sync::Arc;

use md_common::{
    CmdBufferAttributes, CommandBuffer, GpuContextCreateOptions, GpuContextHandle, GpuNode,
    MosInterface, ResourceDesc, ResourceHandle, ScalabilityConfig,
};
use tracing::{debug, warn};

use crate::option::ScalabilityOption;
use crate::{ScalabilityError, ScalabilityResult};

/// Cross-pipe synchronization flavours.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum SyncType {
    /// Barrier: every pipe waits until all pipes arrive.
    AllPipes,
    /// Each pipe publishes completion; the first pipe waits for the rest.
    OnePipeWaitOthers,
    /// Pipe 0 releases one other pipe.
    OnePipeForAnother,
    /// Pipe 0 releases every other pipe.
    OtherPipesForOne,
}

/// Per-call pipeline state pushed down before buffer operations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StateParams {
    pub current_pipe: u8,
    pub current_pass: u8,
    /// Submission happens once `current_pipe == pipe_index_for_submit - 1`.
    pub pipe_index_for_submit: u8,
    pub single_task_phase_supported: bool,
    pub current_row: u32,
    pub current_sub_pass: u32,
}

impl StateParams {
    pub fn for_pipe(current_pipe: u8, pipe_index_for_submit: u8) -> Self {
        Self {
            current_pipe,
            current_pass: 0,
            pipe_index_for_submit,
            single_task_phase_supported: false,
            current_row: 0,
            current_sub_pass: 0,
        }
    }
}

/// Where a scalability instance is in its lifecycle.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ScalabilityState {
    Uninitialized,
    Ready,
    BufferAcquired,
    Destroyed,
}

/// Command buffer orchestration for one GPU context.
///
/// Implementations own the per-frame command buffers of every pipe, the
/// semaphores used to order the pipes against each other, and the
/// context-creation options the cache uses to find a compatible GPU context.
///
/// # Thread safety
///
/// Instances are `Send` but not `Sync`; the context cache hands them out
/// behind a `parking_lot::Mutex`.
pub trait MediaScalability: Send + std::fmt::Debug {
    /// Size every per-pipe structure for `option` and build the GPU
    /// context creation options.
    fn initialize(&mut self, option: &ScalabilityOption) -> ScalabilityResult<()>;

    fn option(&self) -> &ScalabilityOption;

    fn state(&self) -> ScalabilityState;

    fn pipe_num(&self) -> u8;

    fn current_pipe(&self) -> u8;

    fn current_pass(&self) -> u8;

    fn update_state(&mut self, params: &StateParams) -> ScalabilityResult<()>;

    /// Make sure the current buffer can take `requested_size` bytes of
    /// commands and `requested_patch_size` patch entries, resizing a bounded
    /// number of times. Returns whether single-task-phase recording is
    /// supported.
    fn verify_cmd_buffer(
        &mut self,
        requested_size: u32,
        requested_patch_size: u32,
    ) -> ScalabilityResult<bool>;

    /// Check out the command buffer for the current pipe.
    fn get_cmd_buffer(&mut self, frame_tracking_requested: bool) -> ScalabilityResult<CommandBuffer>;

    /// Hand a buffer obtained from [`MediaScalability::get_cmd_buffer`] back.
    fn return_cmd_buffer(&mut self, buffer: CommandBuffer) -> ScalabilityResult<()>;

    /// Terminate and submit the frame. Returns `false` when submission is
    /// held back until a later pipe.
    fn submit_cmd_buffer(&mut self) -> ScalabilityResult<bool>;

    fn sync_pipe(
        &mut self,
        sync: SyncType,
        semaphore_id: u32,
        cmd: &mut CommandBuffer,
    ) -> ScalabilityResult<()>;

    fn reset_semaphore(
        &mut self,
        sync: SyncType,
        semaphore_id: u32,
        cmd: &mut CommandBuffer,
    ) -> ScalabilityResult<()>;

    fn gpu_ctx_create_option(&self) -> &GpuContextCreateOptions;

    fn is_gpu_ctx_create_option_matched(&self, other: &GpuContextCreateOptions) -> bool {
        gpu_ctx_options_matched(self.gpu_ctx_create_option(), other)
    }

    fn bind_gpu_context(&mut self, handle: GpuContextHandle, node: GpuNode);

    fn gpu_context(&self) -> Option<GpuContextHandle>;

    /// Engine node the bound GPU context runs on.
    fn gpu_node(&self) -> Option<GpuNode>;

    /// Primary buffer of the frame in flight; unacquired between frames.
    fn primary_cmd_buffer(&self) -> &CommandBuffer;

    /// Per-pipe secondary buffers; empty for the single-pipe variant.
    fn secondary_cmd_buffers(&self) -> &[CommandBuffer];

    /// Frames submitted so far.
    fn submitted_frames(&self) -> u32;

    /// Release semaphores and per-pipe state. Idempotent.
    fn destroy(&mut self) -> ScalabilityResult<()>;

    fn is_first_pipe(&self) -> bool {
        self.current_pipe() == 0
    }

    fn is_last_pipe(&self) -> bool {
        self.current_pipe() + 1 == self.pipe_num()
    }
}

/// Two GPU context option sets are compatible when their logical ring
/// context counts agree.
pub fn gpu_ctx_options_matched(a: &GpuContextCreateOptions, b: &GpuContextCreateOptions) -> bool {
    a.lrca_count == b.lrca_count
}

/// State common to the single- and multi-pipe variants.
pub(crate) struct ScalabilityBase {
    pub os: Arc<dyn MosInterface>,
    pub config: ScalabilityConfig,
    pub option: ScalabilityOption,
    pub state: ScalabilityState,
    pub ctx_option: GpuContextCreateOptions,
    pub gpu_context: Option<GpuContextHandle>,
    pub node: Option<GpuNode>,
    pub current_pipe: u8,
    pub current_pass: u8,
    pub single_task_phase_supported: bool,
    /// Frame-tracking attributes already stamped on this frame's primary.
    pub attr_ready: bool,
    pub submitted_frames: u32,
    /// Frame tracking dword the submission layer bumps per frame.
    pub frame_tracking: Option<ResourceHandle>,
}

impl ScalabilityBase {
    pub fn new(os: Arc<dyn MosInterface>, config: ScalabilityConfig, option: ScalabilityOption) -> Self {
        Self {
            os,
            config,
            option,
            state: ScalabilityState::Uninitialized,
            ctx_option: GpuContextCreateOptions::single(),
            gpu_context: None,
            node: None,
            current_pipe: 0,
            current_pass: 0,
            single_task_phase_supported: false,
            attr_ready: false,
            submitted_frames: 0,
            frame_tracking: None,
        }
    }

    pub fn ensure_live(&self) -> ScalabilityResult<()> {
        match self.state {
            ScalabilityState::Ready | ScalabilityState::BufferAcquired => Ok(()),
            ScalabilityState::Uninitialized | ScalabilityState::Destroyed => {
                Err(ScalabilityError::NotInitialized)
            }
        }
    }

    /// Pipe and pass bounds every buffer operation relies on.
    pub fn check_pipe_and_pass(&self, pipe_num: u8) -> ScalabilityResult<()> {
        self.ensure_live()?;
        if self.current_pipe >= pipe_num {
            return Err(ScalabilityError::PipeOutOfRange {
                pipe: self.current_pipe,
                pipe_num,
            });
        }
        if self.current_pass >= self.config.max_passes {
            return Err(ScalabilityError::PassOutOfRange {
                pass: self.current_pass,
                max_passes: self.config.max_passes,
            });
        }
        Ok(())
    }

    /// Validate and store the pipe/pass part of `params`.
    pub fn apply_state(&mut self, params: &StateParams, pipe_num: u8) -> ScalabilityResult<()> {
        self.ensure_live()?;
        if params.current_pipe >= pipe_num {
            return Err(ScalabilityError::PipeOutOfRange {
                pipe: params.current_pipe,
                pipe_num,
            });
        }
        if params.current_pass >= self.config.max_passes {
            return Err(ScalabilityError::PassOutOfRange {
                pass: params.current_pass,
                max_passes: self.config.max_passes,
            });
        }
        self.current_pipe = params.current_pipe;
        self.current_pass = params.current_pass;
        self.single_task_phase_supported = params.single_task_phase_supported;
        Ok(())
    }

    /// Bounded verify/resize loop for the buffer at `index`.
    ///
    /// Each attempt re-verifies both dimensions and asks the OS layer to
    /// grow only the deficient one. Resize failures are logged and the loop
    /// continues; the attempt cap guarantees termination. When single-task
    /// phase recording is enabled the command space for both phases is
    /// requested.
    pub fn verify_space(
        &mut self,
        index: u32,
        requested_size: u32,
        requested_patch_size: u32,
    ) -> ScalabilityResult<bool> {
        self.ensure_live()?;
        let cmd_size = if self.single_task_phase_supported {
            requested_size.saturating_mul(2)
        } else {
            requested_size
        };
        self.verify_loop(index, cmd_size, requested_patch_size)?;
        Ok(self.single_task_phase_supported)
    }

    /// Command space only, for a secondary buffer. Patch entries are
    /// accounted against the primary.
    pub fn verify_secondary_space(&mut self, index: u32, requested_size: u32) -> ScalabilityResult<()> {
        self.ensure_live()?;
        self.verify_loop(index, requested_size, 0)
    }

    fn verify_loop(&mut self, index: u32, cmd_size: u32, patch_size: u32) -> ScalabilityResult<()> {
        let attempts = self.config.verify_attempts;
        for attempt in 1..=attempts {
            let cmd_ok = self.os.verify_command_buffer_size(cmd_size, index);
            let patch_ok = patch_size == 0 || self.os.verify_patch_list_size(patch_size);
            if cmd_ok && patch_ok {
                debug!(index, attempt, size = cmd_size, "Command buffer space verified");
                return Ok(());
            }

            let grow_cmd = if cmd_ok { 0 } else { cmd_size };
            let grow_patch = if patch_ok { 0 } else { patch_size };
            warn!(
                index,
                attempt,
                cmd = grow_cmd,
                patch = grow_patch,
                "Command buffer space insufficient, resizing"
            );
            if let Err(e) = self
                .os
                .resize_command_buffer_and_patch_list(grow_cmd, grow_patch, index)
            {
                warn!(index, attempt, error = %e, "Resize failed");
            }
        }
        Err(ScalabilityError::NoSpace { attempts })
    }

    /// Stamp the frame-level attributes onto `primary` once per frame.
    pub fn stamp_attributes(&mut self, primary: &mut CommandBuffer, frame_tracking_requested: bool) {
        if self.attr_ready {
            return;
        }
        let tracking = frame_tracking_requested && self.config.enable_frame_tracking;
        let tracking_resource = if tracking {
            self.frame_tracking_resource()
        } else {
            None
        };
        primary.attributes = CmdBufferAttributes {
            frame_tracking_enabled: tracking_resource.is_some(),
            frame_tracking_tag: if tracking_resource.is_some() {
                self.submitted_frames.wrapping_add(1)
            } else {
                0
            },
            frame_tracking_resource: tracking_resource.unwrap_or(ResourceHandle::NULL),
            turbo_mode: primary.attributes.turbo_mode,
            frequency_boost: primary.attributes.frequency_boost,
            ve_hint: None,
        };
        self.attr_ready = true;
    }

    /// Lazily allocated; tracking is skipped for the frame when allocation fails.
    fn frame_tracking_resource(&mut self) -> Option<ResourceHandle> {
        if let Some(res) = self.frame_tracking {
            return Some(res);
        }
        match self
            .os
            .allocate_resource(&ResourceDesc::linear("frame_tracking", 4))
        {
            Ok(res) => {
                self.frame_tracking = Some(res);
                Some(res)
            }
            Err(e) => {
                warn!(error = %e, "Frame tracking buffer allocation failed");
                None
            }
        }
    }

    /// Free the frame tracking buffer, logging instead of failing.
    pub fn release_frame_tracking(&mut self) {
        if let Some(res) = self.frame_tracking.take() {
            if let Err(e) = self.os.free_resource(res) {
                warn!(resource = %res, error = %e, "Failed to free frame tracking buffer");
            }
        }
    }

    /// Make this instance's GPU context current, if one is bound.
    pub fn activate_context(&self) -> ScalabilityResult<()> {
        if let Some(ctx) = self.gpu_context {
            if self.os.current_gpu_context() != Some(ctx) {
                self.os.set_gpu_context(ctx)?;
            }
        }
        Ok(())
    }

    pub fn virtual_engine_active(&self) -> bool {
        self.config.enable_virtual_engine && self.os.virtual_engine_supported()
    }
}

impl std::fmt::Debug for ScalabilityBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScalabilityBase")
            .field("option", &self.option)
            .field("state", &self.state)
            .field("gpu_context", &self.gpu_context)
            .field("current_pipe", &self.current_pipe)
            .field("current_pass", &self.current_pass)
            .field("submitted_frames", &self.submitted_frames)
            .finish()
    }
}
