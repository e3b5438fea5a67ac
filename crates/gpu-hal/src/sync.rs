//! GPU-side synchronization primitives.
//!
//! A [`GpuSemaphore`] is one dword of GPU memory, zeroed on allocation.
//! Pipes signal it with memory atomics or post-sync writes and wait on it
//! with semaphore-wait commands; nothing here blocks the host.
//!
//! # Architecture
//!
//! ```text
//! SemaphoreSet (one per multi-pipe instance)
//!   ├── all_pipes[max_semaphores]     barrier counters
//!   ├── one_pipe_wait[pipe_num]       per-pipe completion values
//!   ├── delay                         scratch target for delay stores
//!   ├── one_pipe_for_another          pipe 0 releases one waiter
//!   └── other_pipes_for_one           pipe 0 releases every other pipe
//! ```

use md_common::{
    AtomicOp, CommandBuffer, CompareOp, MosError, MosInterface, PostSyncWrite, ResourceDesc,
    ResourceHandle,
};
use tracing::{debug, warn};

use crate::mi;

/// Value written into the delay scratch buffer.
pub const DELAY_MARKER: u32 = 0xDE1A;

/// One dword of GPU memory used for cross-pipe signalling.
#[derive(Debug, PartialEq, Eq)]
pub struct GpuSemaphore {
    resource: ResourceHandle,
    name: String,
}

impl GpuSemaphore {
    /// Allocate and zero-initialize a semaphore.
    pub fn allocate(os: &dyn MosInterface, name: &str) -> Result<Self, MosError> {
        let resource = os.allocate_resource(&ResourceDesc::linear(name, 4))?;
        if let Err(e) = os.write_resource_u32(resource, 0, 0) {
            if let Err(free_err) = os.free_resource(resource) {
                warn!(semaphore = %name, error = %free_err, "Failed to free semaphore after init failure");
            }
            return Err(e);
        }
        Ok(Self {
            resource,
            name: name.to_owned(),
        })
    }

    pub fn resource(&self) -> ResourceHandle {
        self.resource
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn signal_inc(&self, cmd: &mut CommandBuffer) -> Result<(), MosError> {
        mi::add_atomic(cmd, self.resource, 0, AtomicOp::Increment)
    }

    pub fn signal_add(&self, cmd: &mut CommandBuffer, value: u32) -> Result<(), MosError> {
        mi::add_atomic(cmd, self.resource, 0, AtomicOp::Add(value))
    }

    pub fn signal_dec(&self, cmd: &mut CommandBuffer) -> Result<(), MosError> {
        mi::add_atomic(cmd, self.resource, 0, AtomicOp::Decrement)
    }

    pub fn wait(
        &self,
        cmd: &mut CommandBuffer,
        value: u32,
        compare: CompareOp,
    ) -> Result<(), MosError> {
        mi::add_semaphore_wait(cmd, self.resource, 0, value, compare)
    }

    pub fn store(&self, cmd: &mut CommandBuffer, value: u32) -> Result<(), MosError> {
        mi::add_store_data_imm(cmd, self.resource, 0, value)
    }

    pub fn reset(&self, cmd: &mut CommandBuffer) -> Result<(), MosError> {
        self.store(cmd, 0)
    }

    /// Flush the pipe, then write `value` once prior work has landed.
    pub fn flush_write(&self, cmd: &mut CommandBuffer, value: u32) -> Result<(), MosError> {
        mi::add_flush_dw(
            cmd,
            Some(PostSyncWrite {
                resource: self.resource,
                offset: 0,
                value,
            }),
        )
    }

    pub fn free(self, os: &dyn MosInterface) -> Result<(), MosError> {
        os.free_resource(self.resource)
    }
}

/// Every semaphore a multi-pipe instance needs.
#[derive(Debug)]
pub struct SemaphoreSet {
    pub all_pipes: Vec<GpuSemaphore>,
    pub one_pipe_wait: Vec<GpuSemaphore>,
    pub delay: GpuSemaphore,
    pub one_pipe_for_another: GpuSemaphore,
    pub other_pipes_for_one: GpuSemaphore,
}

impl SemaphoreSet {
    /// Allocate the set. On failure everything already allocated is freed.
    pub fn allocate(
        os: &dyn MosInterface,
        pipe_num: u8,
        max_semaphores: u32,
    ) -> Result<Self, MosError> {
        let mut allocated: Vec<GpuSemaphore> = Vec::new();
        let result = Self::allocate_into(os, pipe_num, max_semaphores, &mut allocated);
        match result {
            Ok(()) => {
                let mut iter = allocated.into_iter();
                let all_pipes: Vec<_> = iter.by_ref().take(max_semaphores as usize).collect();
                let one_pipe_wait: Vec<_> = iter.by_ref().take(pipe_num as usize).collect();
                let mut rest = iter;
                match (rest.next(), rest.next(), rest.next()) {
                    (Some(delay), Some(one_pipe_for_another), Some(other_pipes_for_one)) => {
                        debug!(
                            pipes = pipe_num,
                            barriers = max_semaphores,
                            "Allocated semaphore set"
                        );
                        Ok(Self {
                            all_pipes,
                            one_pipe_wait,
                            delay,
                            one_pipe_for_another,
                            other_pipes_for_one,
                        })
                    }
                    _ => Err(MosError::Allocation("semaphore set incomplete".into())),
                }
            }
            Err(e) => {
                for sem in allocated {
                    let name = sem.name.clone();
                    if let Err(free_err) = sem.free(os) {
                        warn!(semaphore = %name, error = %free_err, "Failed to free semaphore during rollback");
                    }
                }
                Err(e)
            }
        }
    }

    fn allocate_into(
        os: &dyn MosInterface,
        pipe_num: u8,
        max_semaphores: u32,
        out: &mut Vec<GpuSemaphore>,
    ) -> Result<(), MosError> {
        for id in 0..max_semaphores {
            out.push(GpuSemaphore::allocate(os, &format!("all_pipes_sem{id}"))?);
        }
        for pipe in 0..pipe_num {
            out.push(GpuSemaphore::allocate(os, &format!("one_pipe_wait_sem{pipe}"))?);
        }
        out.push(GpuSemaphore::allocate(os, "delay_sem")?);
        out.push(GpuSemaphore::allocate(os, "one_pipe_for_another_sem")?);
        out.push(GpuSemaphore::allocate(os, "other_pipes_for_one_sem")?);
        Ok(())
    }

    /// Number of semaphores held.
    pub fn count(&self) -> usize {
        self.all_pipes.len() + self.one_pipe_wait.len() + 3
    }

    /// Free every semaphore, returning the first error seen.
    pub fn free(self, os: &dyn MosInterface) -> Result<(), MosError> {
        let mut first_err = None;
        let all = self
            .all_pipes
            .into_iter()
            .chain(self.one_pipe_wait)
            .chain([
                self.delay,
                self.one_pipe_for_another,
                self.other_pipes_for_one,
            ]);
        for sem in all {
            if let Err(e) = sem.free(os) {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
