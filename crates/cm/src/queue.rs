//! Queues and events.
//!
//! A queue records every task it has handed to the HAL together with the
//! surfaces that task's kernels reference. Those surfaces stay busy until
//! the queue sees the task finish, either by polling or by draining.

use std::sync::Arc;

use md_common::{CmHal, CmQueueType, CmResult, HalTaskId, HalTaskStatus};
use tracing::debug;

use crate::surface::SurfaceId;

/// Index of a queue in the device's queue list.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct QueueId(pub(crate) u32);

impl QueueId {
    pub fn index(self) -> u32 {
        self.0
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct QueueCreateOption {
    pub queue_type: CmQueueType,
    pub gpu_context: u32,
}

impl Default for QueueCreateOption {
    fn default() -> Self {
        Self {
            queue_type: CmQueueType::Render,
            gpu_context: 0,
        }
    }
}

#[derive(Debug)]
struct InFlightTask {
    id: HalTaskId,
    surfaces: Vec<SurfaceId>,
}

#[derive(Debug)]
pub struct CmQueue {
    option: QueueCreateOption,
    in_flight: Vec<InFlightTask>,
    enqueued: u64,
}

impl CmQueue {
    pub fn new(option: QueueCreateOption) -> Self {
        Self {
            option,
            in_flight: Vec::new(),
            enqueued: 0,
        }
    }

    pub fn option(&self) -> QueueCreateOption {
        self.option
    }

    /// Tasks submitted and not yet seen finished.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn enqueued(&self) -> u64 {
        self.enqueued
    }

    pub(crate) fn track(&mut self, id: HalTaskId, surfaces: Vec<SurfaceId>) {
        self.enqueued += 1;
        self.in_flight.push(InFlightTask { id, surfaces });
    }

    /// Drop finished tasks; returns the surfaces they referenced. Every
    /// status is read before the list changes, so a failed query leaves
    /// all tasks tracked.
    pub(crate) fn retire_finished(&mut self, hal: &dyn CmHal) -> CmResult<Vec<SurfaceId>> {
        let finished = self
            .in_flight
            .iter()
            .map(|task| Ok(hal.query_task(task.id)? == HalTaskStatus::Finished))
            .collect::<CmResult<Vec<bool>>>()?;
        let mut released = Vec::new();
        let mut still_running = Vec::with_capacity(self.in_flight.len());
        for (task, done) in self.in_flight.drain(..).zip(finished) {
            if done {
                released.extend(task.surfaces);
            } else {
                still_running.push(task);
            }
        }
        self.in_flight = still_running;
        Ok(released)
    }

    /// Block on the oldest in-flight task only.
    pub(crate) fn wait_oldest(&mut self, hal: &dyn CmHal) -> CmResult<Vec<SurfaceId>> {
        let Some(task) = self.in_flight.first() else {
            return Ok(Vec::new());
        };
        hal.wait_task(task.id)?;
        Ok(self.in_flight.remove(0).surfaces)
    }

    /// Wait for every task; returns all surfaces they referenced.
    pub(crate) fn drain(&mut self, hal: &dyn CmHal) -> CmResult<Vec<SurfaceId>> {
        let mut released = Vec::new();
        while let Some(task) = self.in_flight.first() {
            hal.wait_task(task.id)?;
            let task = self.in_flight.remove(0);
            released.extend(task.surfaces);
        }
        if !released.is_empty() {
            debug!(queue = ?self.option.queue_type, "Queue drained");
        }
        Ok(released)
    }
}

/// Completion handle for one enqueued task.
#[derive(Clone)]
pub struct CmEvent {
    queue: QueueId,
    task: HalTaskId,
    hal: Arc<dyn CmHal>,
}

impl CmEvent {
    pub(crate) fn new(queue: QueueId, task: HalTaskId, hal: Arc<dyn CmHal>) -> Self {
        Self { queue, task, hal }
    }

    pub fn queue(&self) -> QueueId {
        self.queue
    }

    pub fn task_id(&self) -> HalTaskId {
        self.task
    }

    pub fn status(&self) -> CmResult<HalTaskStatus> {
        Ok(self.hal.query_task(self.task)?)
    }

    /// Block until the task finished on the GPU.
    pub fn wait(&self) -> CmResult<()> {
        Ok(self.hal.wait_task(self.task)?)
    }
}

impl std::fmt::Debug for CmEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CmEvent")
            .field("queue", &self.queue)
            .field("task", &self.task)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::surface::{SurfaceKind, SurfaceLimits, SurfaceManager, SurfaceResource};
    use md_common::TaskSubmission;
    use md_gpu_hal::{SoftwareCmHal, SoftwareCmHalConfig};

    fn submit(hal: &SoftwareCmHal) -> HalTaskId {
        hal.submit_task(&TaskSubmission {
            queue_type: CmQueueType::Render,
            gpu_context: 0,
            kernel_count: 1,
            thread_count: 1,
        })
        .unwrap()
    }

    #[test]
    fn retire_only_finished() {
        let hal = SoftwareCmHal::new(SoftwareCmHalConfig::default());
        let mut queue = CmQueue::new(QueueCreateOption::default());
        let first = submit(&hal);
        let second = submit(&hal);
        let mut surfaces = SurfaceManager::new(SurfaceLimits {
            max_buffers: 4,
            max_2d: 4,
            max_2d_up: 4,
            max_3d: 4,
            max_total: 4,
        });
        let host = SurfaceKind::BufferUp {
            size: 4,
            host_addr: 0x1000,
        };
        let s0 = surfaces.insert(host.clone(), SurfaceResource::Host).unwrap();
        let s1 = surfaces.insert(host, SurfaceResource::Host).unwrap();
        queue.track(first, vec![s0]);
        queue.track(second, vec![s1]);

        assert!(queue.retire_finished(&hal).unwrap().is_empty());
        hal.wait_task(first).unwrap();
        assert_eq!(queue.retire_finished(&hal).unwrap(), vec![s0]);
        assert_eq!(queue.in_flight(), 1);

        assert_eq!(queue.drain(&hal).unwrap(), vec![s1]);
        assert_eq!(queue.in_flight(), 0);
        assert_eq!(queue.enqueued(), 2);
    }

    #[test]
    fn failed_status_query_keeps_tasks_tracked() {
        let hal = SoftwareCmHal::new(SoftwareCmHalConfig::default());
        let mut queue = CmQueue::new(QueueCreateOption::default());
        let mut surfaces = SurfaceManager::new(SurfaceLimits {
            max_buffers: 4,
            max_2d: 4,
            max_2d_up: 4,
            max_3d: 4,
            max_total: 4,
        });
        let host = SurfaceKind::BufferUp {
            size: 4,
            host_addr: 0x1000,
        };
        let s0 = surfaces.insert(host.clone(), SurfaceResource::Host).unwrap();
        let s1 = surfaces.insert(host, SurfaceResource::Host).unwrap();
        let first = submit(&hal);
        queue.track(first, vec![s0]);
        queue.track(submit(&hal), vec![s1]);
        hal.wait_task(first).unwrap();

        hal.set_fail_queries(true);
        assert!(queue.retire_finished(&hal).is_err());
        assert_eq!(queue.in_flight(), 2);

        hal.set_fail_queries(false);
        assert_eq!(queue.retire_finished(&hal).unwrap(), vec![s0]);
        assert_eq!(queue.drain(&hal).unwrap(), vec![s1]);
    }
}
