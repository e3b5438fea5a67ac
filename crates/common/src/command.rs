//! Command buffer model shared by the OS layer and the scalability code.
//!
//! A [`CommandBuffer`] is checked out from the OS layer by index (0 is the
//! primary buffer, `pipe + 1` the secondary buffer of a pipe), filled with
//! [`MiCommand`]s and handed back. Only the command *kinds* and their
//! dword footprint are modelled; the hardware encoding lives below this layer.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::MosError;
use crate::types::ResourceHandle;

bitflags! {
    /// How the submission layer should treat a command buffer.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
    pub struct SubmissionType: u32 {
        const SINGLE_PIPE = 1 << 0;
        const ALONE = 1 << 8;
        const MASTER = 1 << 9;
        const SLAVE = 1 << 10;
        const LAST_PIPE = 1 << 24;
    }
}

impl SubmissionType {
    /// Tag for a secondary buffer of `pipe` out of `pipe_num` pipes.
    pub fn for_pipe(pipe: u8, pipe_num: u8) -> Self {
        let mut ty = if pipe == 0 { Self::MASTER } else { Self::SLAVE };
        if pipe + 1 == pipe_num {
            ty |= Self::LAST_PIPE;
        }
        ty
    }
}

/// Comparison used by a semaphore wait.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompareOp {
    Equal,
    NotEqual,
    GreaterOrEqual,
}

impl CompareOp {
    pub fn evaluate(self, memory: u32, expected: u32) -> bool {
        match self {
            Self::Equal => memory == expected,
            Self::NotEqual => memory != expected,
            Self::GreaterOrEqual => memory >= expected,
        }
    }
}

/// Memory atomic operation.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AtomicOp {
    Increment,
    Decrement,
    Add(u32),
}

impl AtomicOp {
    pub fn apply(self, value: u32) -> u32 {
        match self {
            Self::Increment => value.wrapping_add(1),
            Self::Decrement => value.wrapping_sub(1),
            Self::Add(n) => value.wrapping_add(n),
        }
    }
}

/// Post-sync write performed by a flush.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PostSyncWrite {
    pub resource: ResourceHandle,
    pub offset: u32,
    pub value: u32,
}

/// A memory-interface command recorded into a command buffer.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MiCommand {
    BatchBufferEnd,
    StoreDataImm {
        resource: ResourceHandle,
        offset: u32,
        value: u32,
    },
    FlushDw {
        post_sync: Option<PostSyncWrite>,
    },
    Atomic {
        resource: ResourceHandle,
        offset: u32,
        op: AtomicOp,
    },
    SemaphoreWait {
        resource: ResourceHandle,
        offset: u32,
        value: u32,
        compare: CompareOp,
    },
    /// Opaque engine-specific payload emitted by a pipeline.
    Raw { dwords: u32 },
}

impl MiCommand {
    pub fn size_dwords(&self) -> u32 {
        match self {
            Self::BatchBufferEnd => 1,
            Self::StoreDataImm { .. } => 4,
            Self::FlushDw { .. } => 5,
            Self::Atomic { op, .. } => match op {
                AtomicOp::Add(_) => 4,
                _ => 3,
            },
            Self::SemaphoreWait { .. } => 4,
            Self::Raw { dwords } => *dwords,
        }
    }

    pub fn size_bytes(&self) -> u32 {
        self.size_dwords() * 4
    }
}

/// Virtual engine hint attached to a primary command buffer.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VeHintParams {
    pub scalable_pipe_num: u8,
    pub scalable_mode: bool,
    /// Physical engine instance per pipe.
    pub engine_instances: Vec<u8>,
}

/// Per-buffer attributes consumed by the submission layer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CmdBufferAttributes {
    pub frame_tracking_enabled: bool,
    pub frame_tracking_tag: u32,
    pub frame_tracking_resource: ResourceHandle,
    pub frequency_boost: bool,
    pub turbo_mode: bool,
    pub ve_hint: Option<VeHintParams>,
}

/// A host-built command buffer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandBuffer {
    /// 0 for the primary buffer, `pipe + 1` for secondaries.
    pub index: u32,
    /// Backing GPU resource. `ResourceHandle::NULL` when unacquired.
    pub resource: ResourceHandle,
    pub submission_type: SubmissionType,
    pub attributes: CmdBufferAttributes,
    capacity: u32,
    used: u32,
    commands: Vec<MiCommand>,
}

impl CommandBuffer {
    pub fn new(index: u32, resource: ResourceHandle, capacity: u32) -> Self {
        Self {
            index,
            resource,
            submission_type: SubmissionType::empty(),
            attributes: CmdBufferAttributes::default(),
            capacity,
            used: 0,
            commands: Vec::new(),
        }
    }

    /// Placeholder for a buffer slot that has not been fetched this frame.
    pub fn unacquired(index: u32) -> Self {
        Self::new(index, ResourceHandle::NULL, 0)
    }

    pub fn is_acquired(&self) -> bool {
        !self.resource.is_null()
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn used_bytes(&self) -> u32 {
        self.used
    }

    pub fn remaining(&self) -> u32 {
        self.capacity.saturating_sub(self.used)
    }

    pub fn commands(&self) -> &[MiCommand] {
        &self.commands
    }

    /// Grow the buffer to at least `capacity` bytes.
    pub fn grow_to(&mut self, capacity: u32) {
        self.capacity = self.capacity.max(capacity);
    }

    /// Append a command, failing when it does not fit.
    pub fn push(&mut self, cmd: MiCommand) -> Result<(), MosError> {
        let size = cmd.size_bytes();
        if size > self.remaining() {
            return Err(MosError::NoSpace {
                requested: size,
                available: self.remaining(),
            });
        }
        self.used += size;
        self.commands.push(cmd);
        Ok(())
    }

    pub fn ends_with_batch_buffer_end(&self) -> bool {
        matches!(self.commands.last(), Some(MiCommand::BatchBufferEnd))
    }

    /// Drop the recorded commands, keeping the allocation.
    pub fn reset(&mut self) {
        self.used = 0;
        self.commands.clear();
        self.submission_type = SubmissionType::empty();
        self.attributes = CmdBufferAttributes::default();
    }
}
