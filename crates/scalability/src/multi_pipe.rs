//! Multi-pipe scalability.
//!
//! One frame is split across `pipe_num` engine instances. Each pipe records
//! into its own secondary command buffer (index `pipe + 1`); the primary
//! buffer (index 0) carries the frame attributes and chains to the
//! secondaries at submission. Pipes run concurrently and are ordered only by
//! the semaphore commands emitted through [`MediaScalability::sync_pipe`].

use std::sync::Arc;

use md_common::{
    CommandBuffer, CompareOp, ComponentType, GpuContextCreateOptions, GpuContextHandle, GpuNode,
    MosError, MosInterface, ScalabilityConfig, SubmissionType, VeHintParams,
};
use md_gpu_hal::sync::DELAY_MARKER;
use md_gpu_hal::{mi, GpuSemaphore, SemaphoreSet};
use tracing::{debug, info, warn};

use crate::option::ScalabilityOption;
use crate::scalability::{
    MediaScalability, ScalabilityBase, ScalabilityState, StateParams, SyncType,
};
use crate::{ScalabilityError, ScalabilityResult};

/// Scalability state for workloads split across several engine instances.
#[derive(Debug)]
pub struct MediaScalabilityMultiPipe {
    base: ScalabilityBase,
    pipe_num: u8,
    primary: CommandBuffer,
    primary_checked_out: bool,
    secondaries: Vec<CommandBuffer>,
    secondary_checked_out: Vec<bool>,
    semaphores: Option<SemaphoreSet>,
    pipe_index_for_submit: u8,
}

impl MediaScalabilityMultiPipe {
    pub fn new(os: Arc<dyn MosInterface>, config: ScalabilityConfig, component: ComponentType) -> Self {
        Self {
            base: ScalabilityBase::new(os, config, ScalabilityOption::single_pipe(component)),
            pipe_num: 0,
            primary: CommandBuffer::unacquired(0),
            primary_checked_out: false,
            secondaries: Vec::new(),
            secondary_checked_out: Vec::new(),
            semaphores: None,
            pipe_index_for_submit: 0,
        }
    }

    /// Semaphores allocated for this instance, once initialized.
    pub fn semaphores(&self) -> Option<&SemaphoreSet> {
        self.semaphores.as_ref()
    }

    pub fn pipe_index_for_submit(&self) -> u8 {
        self.pipe_index_for_submit
    }

    /// Value the current pass publishes in a one-pipe-wait sync.
    ///
    /// Grows monotonically across frames and passes so a stale value from
    /// an earlier frame never satisfies a later wait. Never 0, the reset
    /// value.
    pub fn epoch_value(&self) -> u32 {
        let value = self
            .base
            .submitted_frames
            .wrapping_mul(u32::from(self.base.config.max_passes))
            .wrapping_add(u32::from(self.base.current_pass))
            .wrapping_add(1);
        value.max(1)
    }

    fn semaphore_set(&self) -> ScalabilityResult<&SemaphoreSet> {
        self.semaphores.as_ref().ok_or(ScalabilityError::NotInitialized)
    }

    fn barrier_semaphore(&self, id: u32) -> ScalabilityResult<&GpuSemaphore> {
        let set = self.semaphore_set()?;
        set.all_pipes
            .get(id as usize)
            .ok_or(ScalabilityError::SemaphoreOutOfRange {
                id,
                max: set.all_pipes.len() as u32,
            })
    }

    fn sync_all_pipes(&self, semaphore_id: u32, cmd: &mut CommandBuffer) -> ScalabilityResult<()> {
        let sem = self.barrier_semaphore(semaphore_id)?;
        let delay = &self.semaphore_set()?.delay;
        sem.signal_inc(cmd)?;
        sem.wait(cmd, u32::from(self.pipe_num), CompareOp::Equal)?;
        // Placeholder stores cover the hazard between the wait and the
        // decrement on the fastest pipe.
        for _ in 0..self.base.config.sync_delay_count {
            delay.store(cmd, DELAY_MARKER)?;
        }
        sem.signal_dec(cmd)?;
        Ok(())
    }

    fn sync_one_pipe_wait_others(&self, cmd: &mut CommandBuffer) -> ScalabilityResult<()> {
        let set = self.semaphore_set()?;
        let value = self.epoch_value();
        let pipe = self.base.current_pipe as usize;
        if let Some(own) = set.one_pipe_wait.get(pipe) {
            own.flush_write(cmd, value)?;
        }
        if pipe == 0 {
            for other in set.one_pipe_wait.iter().skip(1) {
                other.wait(cmd, value, CompareOp::Equal)?;
            }
        }
        Ok(())
    }

    fn sync_one_pipe_for_another(&self, cmd: &mut CommandBuffer) -> ScalabilityResult<()> {
        let sem = &self.semaphore_set()?.one_pipe_for_another;
        if self.base.current_pipe == 0 {
            sem.signal_inc(cmd)?;
        } else {
            sem.wait(cmd, 1, CompareOp::Equal)?;
            sem.signal_dec(cmd)?;
        }
        Ok(())
    }

    fn sync_other_pipes_for_one(&self, cmd: &mut CommandBuffer) -> ScalabilityResult<()> {
        let sem = &self.semaphore_set()?.other_pipes_for_one;
        if self.base.current_pipe == 0 {
            sem.signal_add(cmd, u32::from(self.pipe_num) - 1)?;
        } else {
            sem.wait(cmd, 0, CompareOp::NotEqual)?;
            sem.signal_dec(cmd)?;
        }
        Ok(())
    }

    /// Terminate every pipe's secondary buffer.
    fn end_secondaries(&mut self) -> ScalabilityResult<()> {
        let os = Arc::clone(&self.base.os);
        for pipe in 0..self.pipe_num {
            let index = u32::from(pipe) + 1;
            let mut buffer = os.get_command_buffer(index)?;
            if buffer.submission_type.is_empty() {
                buffer.submission_type = SubmissionType::for_pipe(pipe, self.pipe_num);
            }
            let ended = if buffer.ends_with_batch_buffer_end() {
                Ok(())
            } else {
                mi::add_batch_buffer_end(&mut buffer)
            };
            self.secondaries[pipe as usize] = buffer.clone();
            os.return_command_buffer(buffer)?;
            ended?;
        }
        Ok(())
    }

    fn reset_buffers(&mut self) {
        self.primary = CommandBuffer::unacquired(0);
        self.primary_checked_out = false;
        for (pipe, buffer) in self.secondaries.iter_mut().enumerate() {
            *buffer = CommandBuffer::unacquired(pipe as u32 + 1);
        }
        self.secondary_checked_out.iter_mut().for_each(|out| *out = false);
    }
}

impl MediaScalability for MediaScalabilityMultiPipe {
    fn initialize(&mut self, option: &ScalabilityOption) -> ScalabilityResult<()> {
        if self.base.state != ScalabilityState::Uninitialized {
            return Err(ScalabilityError::InvalidParameter(
                "scalability state already initialized".into(),
            ));
        }
        let pipe_num = option.num_pipe();
        if pipe_num > option.max_pipes() {
            return Err(ScalabilityError::TooManyPipes {
                requested: pipe_num,
                max: option.max_pipes(),
            });
        }
        if !self.base.virtual_engine_active() {
            return Err(ScalabilityError::InvalidParameter(
                "multi-pipe mode requires virtual engine support".into(),
            ));
        }

        let set = SemaphoreSet::allocate(
            self.base.os.as_ref(),
            pipe_num,
            self.base.config.max_semaphores,
        )?;

        self.base.option = option.clone();
        self.base.ctx_option = option.gpu_ctx_create_option();
        self.pipe_num = pipe_num;
        self.semaphores = Some(set);
        self.secondaries = (0..pipe_num)
            .map(|pipe| CommandBuffer::unacquired(u32::from(pipe) + 1))
            .collect();
        self.secondary_checked_out = vec![false; pipe_num as usize];
        self.pipe_index_for_submit = pipe_num;
        self.base
            .os
            .set_multi_engine_enabled(option.component(), true);
        self.base.state = ScalabilityState::Ready;

        info!(
            component = ?option.component(),
            pipes = pipe_num,
            lrca = self.base.ctx_option.lrca_count,
            "Multi-pipe scalability initialized"
        );
        Ok(())
    }

    fn option(&self) -> &ScalabilityOption {
        &self.base.option
    }

    fn state(&self) -> ScalabilityState {
        self.base.state
    }

    fn pipe_num(&self) -> u8 {
        self.pipe_num
    }

    fn current_pipe(&self) -> u8 {
        self.base.current_pipe
    }

    fn current_pass(&self) -> u8 {
        self.base.current_pass
    }

    fn update_state(&mut self, params: &StateParams) -> ScalabilityResult<()> {
        self.base.apply_state(params, self.pipe_num)?;
        self.pipe_index_for_submit = params.pipe_index_for_submit;
        Ok(())
    }

    fn verify_cmd_buffer(
        &mut self,
        requested_size: u32,
        requested_patch_size: u32,
    ) -> ScalabilityResult<bool> {
        self.base.check_pipe_and_pass(self.pipe_num)?;
        self.base.activate_context()?;
        let single_task_phase = self
            .base
            .verify_space(0, requested_size, requested_patch_size)?;
        for pipe in 0..self.pipe_num {
            self.base
                .verify_secondary_space(u32::from(pipe) + 1, requested_size)?;
        }
        Ok(single_task_phase)
    }

    fn get_cmd_buffer(&mut self, frame_tracking_requested: bool) -> ScalabilityResult<CommandBuffer> {
        self.base.check_pipe_and_pass(self.pipe_num)?;
        let pipe = self.base.current_pipe;
        if self.secondary_checked_out[pipe as usize] {
            return Err(ScalabilityError::InvalidParameter(format!(
                "pipe {pipe} command buffer already checked out"
            )));
        }
        self.base.activate_context()?;

        // The primary is fetched once per frame and held until submission.
        if !self.primary.is_acquired() {
            self.primary = self.base.os.get_command_buffer(0)?;
            self.primary_checked_out = true;
            debug!(resource = %self.primary.resource, "Acquired primary command buffer");
        }
        self.base
            .stamp_attributes(&mut self.primary, frame_tracking_requested);

        let index = u32::from(pipe) + 1;
        let mut secondary = self.base.os.get_command_buffer(index)?;
        secondary.submission_type = SubmissionType::for_pipe(pipe, self.pipe_num);

        self.secondaries[pipe as usize] = secondary.clone();
        self.secondary_checked_out[pipe as usize] = true;
        self.base.state = ScalabilityState::BufferAcquired;
        debug!(pipe, index, resource = %secondary.resource, "Acquired secondary command buffer");
        Ok(secondary)
    }

    fn return_cmd_buffer(&mut self, buffer: CommandBuffer) -> ScalabilityResult<()> {
        self.base.ensure_live()?;
        let index = buffer.index;
        let pipe = match index.checked_sub(1) {
            Some(pipe) if pipe < u32::from(self.pipe_num) => pipe as usize,
            _ => {
                return Err(ScalabilityError::InvalidParameter(format!(
                    "buffer index {index} is not a secondary of this instance"
                )))
            }
        };
        if !self.secondary_checked_out[pipe] {
            return Err(MosError::BufferNotAcquired { index }.into());
        }

        self.primary.attributes.frequency_boost |= buffer.attributes.frequency_boost;
        self.secondaries[pipe] = buffer.clone();
        self.base.os.return_command_buffer(buffer)?;
        self.secondary_checked_out[pipe] = false;
        Ok(())
    }

    fn submit_cmd_buffer(&mut self) -> ScalabilityResult<bool> {
        self.base.ensure_live()?;
        if self.base.current_pipe + 1 < self.pipe_index_for_submit {
            debug!(
                pipe = self.base.current_pipe,
                submit_at = self.pipe_index_for_submit,
                "Submission held for a later pipe"
            );
            return Ok(false);
        }
        if let Some(pipe) = self.secondary_checked_out.iter().position(|out| *out) {
            return Err(ScalabilityError::InvalidParameter(format!(
                "pipe {pipe} command buffer still checked out at submission"
            )));
        }
        if !self.primary.is_acquired() {
            return Err(MosError::NullResource.into());
        }
        self.base.activate_context()?;

        self.end_secondaries()?;
        self.base.attr_ready = false;

        let os = Arc::clone(&self.base.os);
        if self.base.virtual_engine_active() {
            os.set_hint_params(&VeHintParams {
                scalable_pipe_num: self.pipe_num,
                scalable_mode: true,
                engine_instances: self.base.ctx_option.engine_instances.clone(),
            })?;
            os.populate_hint_params(&mut self.primary)?;
        }

        if self.primary_checked_out {
            os.return_command_buffer(self.primary.clone())?;
            self.primary_checked_out = false;
        }
        os.submit_command_buffer(&self.primary, false)?;

        self.base.submitted_frames = self.base.submitted_frames.wrapping_add(1);
        self.reset_buffers();
        self.base.state = ScalabilityState::Ready;
        debug!(
            frame = self.base.submitted_frames,
            pipes = self.pipe_num,
            "Submitted multi-pipe frame"
        );
        Ok(true)
    }

    fn sync_pipe(
        &mut self,
        sync: SyncType,
        semaphore_id: u32,
        cmd: &mut CommandBuffer,
    ) -> ScalabilityResult<()> {
        self.base.check_pipe_and_pass(self.pipe_num)?;
        match sync {
            SyncType::AllPipes => self.sync_all_pipes(semaphore_id, cmd),
            SyncType::OnePipeWaitOthers => self.sync_one_pipe_wait_others(cmd),
            SyncType::OnePipeForAnother => self.sync_one_pipe_for_another(cmd),
            SyncType::OtherPipesForOne => self.sync_other_pipes_for_one(cmd),
        }
    }

    fn reset_semaphore(
        &mut self,
        sync: SyncType,
        semaphore_id: u32,
        cmd: &mut CommandBuffer,
    ) -> ScalabilityResult<()> {
        self.base.ensure_live()?;
        let set = self.semaphore_set()?;
        let sem = match sync {
            SyncType::AllPipes => self.barrier_semaphore(semaphore_id)?,
            SyncType::OnePipeWaitOthers => set.one_pipe_wait.get(semaphore_id as usize).ok_or(
                ScalabilityError::SemaphoreOutOfRange {
                    id: semaphore_id,
                    max: set.one_pipe_wait.len() as u32,
                },
            )?,
            SyncType::OnePipeForAnother => &set.one_pipe_for_another,
            SyncType::OtherPipesForOne => &set.other_pipes_for_one,
        };
        sem.reset(cmd)?;
        Ok(())
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
        &self.secondaries
    }

    fn submitted_frames(&self) -> u32 {
        self.base.submitted_frames
    }

    fn destroy(&mut self) -> ScalabilityResult<()> {
        if self.base.state == ScalabilityState::Destroyed {
            return Ok(());
        }
        let was_initialized = self.base.state != ScalabilityState::Uninitialized;
        if self.primary_checked_out || self.secondary_checked_out.iter().any(|out| *out) {
            warn!("Destroying multi-pipe state with checked-out command buffers");
        }

        let freed = match self.semaphores.take() {
            Some(set) => set.free(self.base.os.as_ref()),
            None => Ok(()),
        };
        self.base.release_frame_tracking();
        if was_initialized {
            self.base
                .os
                .set_multi_engine_enabled(self.base.option.component(), false);
        }
        self.reset_buffers();
        self.base.state = ScalabilityState::Destroyed;
        info!(
            pipes = self.pipe_num,
            frames = self.base.submitted_frames,
            "Multi-pipe scalability destroyed"
        );
        freed.map_err(ScalabilityError::from)
    }
}

impl Drop for MediaScalabilityMultiPipe {
    fn drop(&mut self) {
        if let Err(e) = self.destroy() {
            warn!(error = %e, "Multi-pipe teardown failed");
        }
    }
}
