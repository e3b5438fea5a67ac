//! Memory-interface (MI) command emission.
//!
//! Thin helpers over [`CommandBuffer::push`]; every helper fails with
//! `MosError::NoSpace` instead of overrunning the buffer.

use md_common::{
    AtomicOp, CommandBuffer, CompareOp, MiCommand, MosError, PostSyncWrite, ResourceHandle,
};

/// Terminate a batch buffer.
pub fn add_batch_buffer_end(cmd: &mut CommandBuffer) -> Result<(), MosError> {
    cmd.push(MiCommand::BatchBufferEnd)
}

pub fn add_store_data_imm(
    cmd: &mut CommandBuffer,
    resource: ResourceHandle,
    offset: u32,
    value: u32,
) -> Result<(), MosError> {
    if resource.is_null() {
        return Err(MosError::NullResource);
    }
    cmd.push(MiCommand::StoreDataImm {
        resource,
        offset,
        value,
    })
}

/// Flush with an optional post-sync dword write.
pub fn add_flush_dw(
    cmd: &mut CommandBuffer,
    post_sync: Option<PostSyncWrite>,
) -> Result<(), MosError> {
    if matches!(post_sync, Some(write) if write.resource.is_null()) {
        return Err(MosError::NullResource);
    }
    cmd.push(MiCommand::FlushDw { post_sync })
}

pub fn add_atomic(
    cmd: &mut CommandBuffer,
    resource: ResourceHandle,
    offset: u32,
    op: AtomicOp,
) -> Result<(), MosError> {
    if resource.is_null() {
        return Err(MosError::NullResource);
    }
    cmd.push(MiCommand::Atomic {
        resource,
        offset,
        op,
    })
}

/// Stall the command streamer until `memory <compare> value` holds.
pub fn add_semaphore_wait(
    cmd: &mut CommandBuffer,
    resource: ResourceHandle,
    offset: u32,
    value: u32,
    compare: CompareOp,
) -> Result<(), MosError> {
    if resource.is_null() {
        return Err(MosError::NullResource);
    }
    cmd.push(MiCommand::SemaphoreWait {
        resource,
        offset,
        value,
        compare,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_resource_rejected_without_writing() {
        let mut cmd = CommandBuffer::new(1, ResourceHandle(9), 64);
        let err = add_store_data_imm(&mut cmd, ResourceHandle::NULL, 0, 1).unwrap_err();
        assert_eq!(err, MosError::NullResource);
        assert!(cmd.commands().is_empty());
        assert_eq!(cmd.used_bytes(), 0);
    }

    #[test]
    fn emits_in_program_order() {
        let sem = ResourceHandle(3);
        let mut cmd = CommandBuffer::new(1, ResourceHandle(9), 256);
        add_atomic(&mut cmd, sem, 0, AtomicOp::Increment).unwrap();
        add_semaphore_wait(&mut cmd, sem, 0, 2, CompareOp::Equal).unwrap();
        add_batch_buffer_end(&mut cmd).unwrap();
        assert_eq!(cmd.commands().len(), 3);
        assert!(cmd.ends_with_batch_buffer_end());
        assert_eq!(cmd.used_bytes(), (3 + 4 + 1) * 4);
    }

    #[test]
    fn flush_without_post_sync() {
        let mut cmd = CommandBuffer::new(0, ResourceHandle(1), 64);
        add_flush_dw(&mut cmd, None).unwrap();
        assert_eq!(cmd.commands(), &[MiCommand::FlushDw { post_sync: None }]);
    }
}
