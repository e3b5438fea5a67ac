//! Single-pipe scalability: one command buffer, no cross-pipe sync.

use std::sync::Arc;

use md_common::{
    CommandBuffer, ComponentType, GpuContextCreateOptions, GpuContextHandle, GpuNode, MosError,
    MosInterface, ScalabilityConfig, SubmissionType, VeHintParams,
};
use md_gpu_hal::mi;
use tracing::{debug, info, warn};

use crate::option::ScalabilityOption;
use crate::scalability::{
    MediaScalability, ScalabilityBase, ScalabilityState, StateParams, SyncType,
};
use crate::{ScalabilityError, ScalabilityResult};

/// Scalability state for workloads that run on one engine instance.
#[derive(Debug)]
pub struct MediaScalabilitySinglePipe {
    base: ScalabilityBase,
    primary: CommandBuffer,
    checked_out: bool,
}

impl MediaScalabilitySinglePipe {
    pub fn new(os: Arc<dyn MosInterface>, config: ScalabilityConfig, component: ComponentType) -> Self {
        Self {
            base: ScalabilityBase::new(os, config, ScalabilityOption::single_pipe(component)),
            primary: CommandBuffer::unacquired(0),
            checked_out: false,
        }
    }
}

impl MediaScalability for MediaScalabilitySinglePipe {
    fn initialize(&mut self, option: &ScalabilityOption) -> ScalabilityResult<()> {
        if self.base.state != ScalabilityState::Uninitialized {
            return Err(ScalabilityError::InvalidParameter(
                "scalability state already initialized".into(),
            ));
        }
        if option.num_pipe() != 1 {
            return Err(ScalabilityError::InvalidParameter(format!(
                "single-pipe state cannot drive {} pipes",
                option.num_pipe()
            )));
        }
        self.base.option = option.clone();
        self.base.ctx_option = option.gpu_ctx_create_option();
        self.base.state = ScalabilityState::Ready;
        debug!(component = ?option.component(), "Single-pipe scalability initialized");
        Ok(())
    }

    fn option(&self) -> &ScalabilityOption {
        &self.base.option
    }

    fn state(&self) -> ScalabilityState {
        self.base.state
    }

    fn pipe_num(&self) -> u8 {
        1
    }

    fn current_pipe(&self) -> u8 {
        self.base.current_pipe
    }

    fn current_pass(&self) -> u8 {
        self.base.current_pass
    }

    fn update_state(&mut self, params: &StateParams) -> ScalabilityResult<()> {
        self.base.apply_state(params, 1)
    }

    fn verify_cmd_buffer(
        &mut self,
        requested_size: u32,
        requested_patch_size: u32,
    ) -> ScalabilityResult<bool> {
        self.base.activate_context()?;
        self.base.verify_space(0, requested_size, requested_patch_size)
    }

    fn get_cmd_buffer(&mut self, frame_tracking_requested: bool) -> ScalabilityResult<CommandBuffer> {
        self.base.check_pipe_and_pass(1)?;
        if self.checked_out {
            return Err(ScalabilityError::InvalidParameter(
                "command buffer already checked out".into(),
            ));
        }
        self.base.activate_context()?;

        let mut buffer = self.base.os.get_command_buffer(0)?;
        self.base.stamp_attributes(&mut buffer, frame_tracking_requested);
        buffer.submission_type = SubmissionType::SINGLE_PIPE;

        self.primary = buffer.clone();
        self.checked_out = true;
        self.base.state = ScalabilityState::BufferAcquired;
        Ok(buffer)
    }

    fn return_cmd_buffer(&mut self, buffer: CommandBuffer) -> ScalabilityResult<()> {
        self.base.ensure_live()?;
        if !self.checked_out || buffer.index != 0 {
            return Err(MosError::BufferNotAcquired {
                index: buffer.index,
            }
            .into());
        }
        self.primary = buffer.clone();
        self.base.os.return_command_buffer(buffer)?;
        self.checked_out = false;
        Ok(())
    }

    fn submit_cmd_buffer(&mut self) -> ScalabilityResult<bool> {
        self.base.ensure_live()?;
        if self.checked_out {
            return Err(ScalabilityError::InvalidParameter(
                "command buffer still checked out at submission".into(),
            ));
        }
        if !self.primary.is_acquired() {
            return Err(MosError::NullResource.into());
        }
        self.base.activate_context()?;

        let os = Arc::clone(&self.base.os);
        let mut buffer = os.get_command_buffer(0)?;
        let ended = if buffer.ends_with_batch_buffer_end() {
            Ok(())
        } else {
            mi::add_batch_buffer_end(&mut buffer)
        };
        os.return_command_buffer(buffer.clone())?;
        ended?;

        if self.base.virtual_engine_active() {
            os.set_hint_params(&VeHintParams {
                scalable_pipe_num: 1,
                scalable_mode: false,
                engine_instances: vec![0],
            })?;
            os.populate_hint_params(&mut buffer)?;
        }

        self.base.attr_ready = false;
        os.submit_command_buffer(&buffer, false)?;

        self.base.submitted_frames = self.base.submitted_frames.wrapping_add(1);
        self.primary = CommandBuffer::unacquired(0);
        self.base.state = ScalabilityState::Ready;
        debug!(frame = self.base.submitted_frames, "Submitted single-pipe frame");
        Ok(true)
    }

    fn sync_pipe(
        &mut self,
        _sync: SyncType,
        _semaphore_id: u32,
        _cmd: &mut CommandBuffer,
    ) -> ScalabilityResult<()> {
        self.base.ensure_live()
    }

    fn reset_semaphore(
        &mut self,
        _sync: SyncType,
        _semaphore_id: u32,
        _cmd: &mut CommandBuffer,
    ) -> ScalabilityResult<()> {
        self.base.ensure_live()
    }

    fn gpu_ctx_create_option(&self) -> &GpuContextCreateOptions {
        &self.base.ctx_option
    }

    fn bind_gpu_context(&mut self, handle: GpuContextHandle, node: GpuNode) {
        self.base.gpu_context = Some(handle);
        self.base.node = Some(node);
    }

    fn gpu_context(&self) -> Option<GpuContextHandle> {
        self.base.gpu_context
    }

    fn gpu_node(&self) -> Option<GpuNode> {
        self.base.node
    }

    fn primary_cmd_buffer(&self) -> &CommandBuffer {
        &self.primary
    }

    fn secondary_cmd_buffers(&self) -> &[CommandBuffer] {
        &[]
    }

    fn submitted_frames(&self) -> u32 {
        self.base.submitted_frames
    }

    fn destroy(&mut self) -> ScalabilityResult<()> {
        if self.base.state == ScalabilityState::Destroyed {
            return Ok(());
        }
        if self.checked_out {
            warn!("Destroying single-pipe state with a checked-out command buffer");
        }
        self.base.release_frame_tracking();
        self.primary = CommandBuffer::unacquired(0);
        self.checked_out = false;
        self.base.state = ScalabilityState::Destroyed;
        info!(frames = self.base.submitted_frames, "Single-pipe scalability destroyed");
        Ok(())
    }
}

impl Drop for MediaScalabilitySinglePipe {
    fn drop(&mut self) {
        if let Err(e) = self.destroy() {
            warn!(error = %e, "Single-pipe teardown failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use md_common::MiCommand;
    use md_gpu_hal::{OsCall, SoftwareOs, SoftwareOsConfig};

    fn setup() -> (Arc<SoftwareOs>, MediaScalabilitySinglePipe) {
        let os = Arc::new(SoftwareOs::new(SoftwareOsConfig::default()));
        let mut scal = MediaScalabilitySinglePipe::new(
            os.clone(),
            ScalabilityConfig::default(),
            ComponentType::Vp,
        );
        scal.initialize(&ScalabilityOption::single_pipe(ComponentType::Vp))
            .unwrap();
        let ctx = os
            .create_gpu_context(GpuNode::VideoEnhance, scal.gpu_ctx_create_option())
            .unwrap();
        scal.bind_gpu_context(ctx, GpuNode::VideoEnhance);
        (os, scal)
    }

    // ── Lifecycle ────────────────────────────────────────────────

    #[test]
    fn rejects_multi_pipe_option() {
        let os = Arc::new(SoftwareOs::new(SoftwareOsConfig::default()));
        let mut scal =
            MediaScalabilitySinglePipe::new(os, ScalabilityConfig::default(), ComponentType::Encode);
        let option = ScalabilityOption::with_pipes(ComponentType::Encode, 2, 2);
        assert!(scal.initialize(&option).is_err());
        assert_eq!(scal.state(), ScalabilityState::Uninitialized);
    }

    #[test]
    fn get_before_initialize_fails() {
        let os = Arc::new(SoftwareOs::new(SoftwareOsConfig::default()));
        let mut scal =
            MediaScalabilitySinglePipe::new(os, ScalabilityConfig::default(), ComponentType::Vp);
        assert!(matches!(
            scal.get_cmd_buffer(false),
            Err(ScalabilityError::NotInitialized)
        ));
    }

    // ── Frames ───────────────────────────────────────────────────

    #[test]
    fn frame_round_trip_ends_buffer_and_resets() {
        let (os, mut scal) = setup();
        let mut buf = scal.get_cmd_buffer(true).unwrap();
        assert_eq!(buf.submission_type, SubmissionType::SINGLE_PIPE);
        assert!(buf.attributes.frame_tracking_enabled);
        assert_eq!(buf.attributes.frame_tracking_tag, 1);
        buf.push(MiCommand::Raw { dwords: 16 }).unwrap();
        scal.return_cmd_buffer(buf).unwrap();

        assert!(scal.submit_cmd_buffer().unwrap());
        assert!(!scal.primary_cmd_buffer().is_acquired());
        assert_eq!(scal.state(), ScalabilityState::Ready);

        let subs = os.submissions();
        assert_eq!(subs.len(), 1);
        assert!(subs[0].primary.ends_with_batch_buffer_end());
        assert_eq!(subs[0].primary.commands().len(), 2);
        let hint = subs[0].primary.attributes.ve_hint.clone().unwrap();
        assert_eq!(hint.scalable_pipe_num, 1);
        assert!(!hint.scalable_mode);
    }

    #[test]
    fn frame_tracking_tag_advances_per_frame() {
        let (_os, mut scal) = setup();
        for frame in 1..=3u32 {
            let buf = scal.get_cmd_buffer(true).unwrap();
            assert_eq!(buf.attributes.frame_tracking_tag, frame);
            scal.return_cmd_buffer(buf).unwrap();
            scal.submit_cmd_buffer().unwrap();
        }
        assert_eq!(scal.submitted_frames(), 3);
    }

    #[test]
    fn submit_with_buffer_out_fails() {
        let (_os, mut scal) = setup();
        let _buf = scal.get_cmd_buffer(false).unwrap();
        assert!(scal.submit_cmd_buffer().is_err());
    }

    #[test]
    fn submit_without_frame_is_null_resource() {
        let (_os, mut scal) = setup();
        assert!(matches!(
            scal.submit_cmd_buffer(),
            Err(ScalabilityError::Mos(MosError::NullResource))
        ));
    }

    #[test]
    fn sync_is_noop() {
        let (os, mut scal) = setup();
        let mut buf = scal.get_cmd_buffer(false).unwrap();
        scal.sync_pipe(SyncType::AllPipes, 0, &mut buf).unwrap();
        assert!(buf.commands().is_empty());
        scal.return_cmd_buffer(buf).unwrap();
        assert_eq!(os.count_calls(|c| matches!(c, OsCall::AllocateResource(_))), 0);
    }

    // ── Verify ───────────────────────────────────────────────────

    #[test]
    fn verify_with_room_does_not_resize() {
        let (os, mut scal) = setup();
        os.clear_calls();
        assert!(!scal.verify_cmd_buffer(1024, 16).unwrap());
        assert_eq!(os.count_calls(|c| matches!(c, OsCall::Resize { .. })), 0);
    }

    #[test]
    fn single_task_phase_doubles_request() {
        let (os, mut scal) = setup();
        let mut params = StateParams::for_pipe(0, 1);
        params.single_task_phase_supported = true;
        scal.update_state(&params).unwrap();
        os.clear_calls();
        assert!(scal.verify_cmd_buffer(1024, 0).unwrap());
        assert!(os
            .calls()
            .contains(&OsCall::VerifyCommandBufferSize { index: 0, size: 2048 }));
    }
}
