//! Lockstep interpreter for recorded MI command streams.
//!
//! Each stream models one command streamer. Every round each unfinished
//! stream retires at most one command; a stream stalled on an unsatisfied
//! semaphore wait retries next round. A round in which no stream makes
//! progress is a deadlock.

use std::collections::HashMap;

use md_common::{MiCommand, ResourceHandle};
use thiserror::Error;

/// GPU memory as seen by the interpreter: dword arrays per resource.
pub type GpuMemory = HashMap<ResourceHandle, Vec<u32>>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecError {
    #[error("Deadlock: streams {stalled:?} stalled on semaphore waits")]
    Deadlock { stalled: Vec<usize> },

    #[error("Stream {stream} touched unknown resource {resource}")]
    UnknownResource {
        stream: usize,
        resource: ResourceHandle,
    },

    #[error("Stream {stream} accessed offset {offset} past the end of {resource}")]
    OutOfBounds {
        stream: usize,
        resource: ResourceHandle,
        offset: u32,
    },
}

/// Outcome of a successful run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecutionReport {
    /// Commands retired per stream.
    pub retired: Vec<usize>,
    pub rounds: usize,
}

/// Run `streams` to completion against `memory`.
pub fn execute_streams(
    memory: &mut GpuMemory,
    streams: &[&[MiCommand]],
) -> Result<ExecutionReport, ExecError> {
    let mut pcs = vec![0usize; streams.len()];
    let mut done = vec![false; streams.len()];
    let mut rounds = 0;

    loop {
        for (i, stream) in streams.iter().enumerate() {
            if pcs[i] >= stream.len() {
                done[i] = true;
            }
        }
        if done.iter().all(|d| *d) {
            return Ok(ExecutionReport {
                retired: pcs,
                rounds,
            });
        }

        rounds += 1;
        let mut progressed = false;
        for (i, stream) in streams.iter().enumerate() {
            if done[i] {
                continue;
            }
            match step(memory, i, &stream[pcs[i]])? {
                Step::Retired => {
                    pcs[i] += 1;
                    progressed = true;
                }
                Step::End => {
                    pcs[i] += 1;
                    done[i] = true;
                    progressed = true;
                }
                Step::Stalled => {}
            }
        }

        if !progressed {
            let stalled = (0..streams.len()).filter(|i| !done[*i]).collect();
            return Err(ExecError::Deadlock { stalled });
        }
    }
}

enum Step {
    Retired,
    Stalled,
    End,
}

fn word<'a>(
    memory: &'a mut GpuMemory,
    stream: usize,
    resource: ResourceHandle,
    offset: u32,
) -> Result<&'a mut u32, ExecError> {
    let words = memory
        .get_mut(&resource)
        .ok_or(ExecError::UnknownResource { stream, resource })?;
    words
        .get_mut((offset / 4) as usize)
        .ok_or(ExecError::OutOfBounds {
            stream,
            resource,
            offset,
        })
}

fn step(memory: &mut GpuMemory, stream: usize, cmd: &MiCommand) -> Result<Step, ExecError> {
    match cmd {
        MiCommand::BatchBufferEnd => return Ok(Step::End),
        MiCommand::StoreDataImm {
            resource,
            offset,
            value,
        } => *word(memory, stream, *resource, *offset)? = *value,
        MiCommand::FlushDw { post_sync } => {
            if let Some(write) = post_sync {
                *word(memory, stream, write.resource, write.offset)? = write.value;
            }
        }
        MiCommand::Atomic {
            resource,
            offset,
            op,
        } => {
            let w = word(memory, stream, *resource, *offset)?;
            *w = op.apply(*w);
        }
        MiCommand::SemaphoreWait {
            resource,
            offset,
            value,
            compare,
        } => {
            let current = *word(memory, stream, *resource, *offset)?;
            if !compare.evaluate(current, *value) {
                return Ok(Step::Stalled);
            }
        }
        MiCommand::Raw { .. } => {}
    }
    Ok(Step::Retired)
}
