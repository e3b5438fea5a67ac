//! In-process CM HAL: sampler tables, limits and a task tracker.

use std::collections::BTreeMap;

use md_common::{
    CmHal, HalError, HalMaxValues, HalTaskId, HalTaskStatus, L3Config, PlatformInfo,
    Sampler8x8Descriptor, SamplerState, TaskSubmission,
};
use parking_lot::Mutex;
use tracing::debug;

/// Tunables and failure injection for [`SoftwareCmHal`].
#[derive(Clone, Debug)]
pub struct SoftwareCmHalConfig {
    /// Limits reported to the device.
    pub max_values: HalMaxValues,
    pub platform: PlatformInfo,
    /// Physical sampler table size (may differ from `max_values.max_samplers`).
    pub sampler_capacity: u32,
    pub sampler8x8_capacity: u32,
    /// Report submitted tasks as finished immediately.
    pub complete_tasks_immediately: bool,
    /// L3 configurations accepted by `set_l3_config`.
    pub supported_l3_configs: Vec<L3Config>,
}

impl Default for SoftwareCmHalConfig {
    fn default() -> Self {
        let max_values = HalMaxValues::default();
        Self {
            sampler_capacity: max_values.max_samplers,
            sampler8x8_capacity: max_values.max_sampler8x8,
            max_values,
            platform: PlatformInfo::default(),
            complete_tasks_immediately: false,
            supported_l3_configs: vec![L3Config::default()],
        }
    }
}

/// One recorded HAL interaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HalCall {
    RegisterSampler(u32),
    UnregisterSampler(u32),
    RegisterSampler8x8(u32),
    UnregisterSampler8x8(u32),
    SetHwThreadCount(u32),
    SetL3Config,
    SubmitTask(HalTaskId),
    WaitTask(HalTaskId),
}

#[derive(Debug, Default)]
struct State {
    samplers: Vec<Option<SamplerState>>,
    sampler8x8: Vec<Option<Sampler8x8Descriptor>>,
    hw_threads: Option<u32>,
    l3: L3Config,
    next_task: u64,
    tasks: BTreeMap<HalTaskId, HalTaskStatus>,
    fail_queries: bool,
    calls: Vec<HalCall>,
}

/// Host-only `CmHal` implementation.
pub struct SoftwareCmHal {
    config: SoftwareCmHalConfig,
    state: Mutex<State>,
}

impl SoftwareCmHal {
    pub fn new(config: SoftwareCmHalConfig) -> Self {
        let state = State {
            samplers: vec![None; config.sampler_capacity as usize],
            sampler8x8: vec![None; config.sampler8x8_capacity as usize],
            ..State::default()
        };
        Self {
            config,
            state: Mutex::new(state),
        }
    }

    pub fn calls(&self) -> Vec<HalCall> {
        self.state.lock().calls.clone()
    }

    pub fn registered_samplers(&self) -> usize {
        self.state.lock().samplers.iter().filter(|s| s.is_some()).count()
    }

    pub fn registered_sampler8x8(&self) -> usize {
        self.state
            .lock()
            .sampler8x8
            .iter()
            .filter(|s| s.is_some())
            .count()
    }

    pub fn hw_thread_count(&self) -> Option<u32> {
        self.state.lock().hw_threads
    }

    /// Tasks not yet finished.
    pub fn pending_tasks(&self) -> usize {
        self.state
            .lock()
            .tasks
            .values()
            .filter(|s| **s != HalTaskStatus::Finished)
            .count()
    }

    /// Make `query_task` fail until switched off again.
    pub fn set_fail_queries(&self, fail: bool) {
        self.state.lock().fail_queries = fail;
    }

    /// Mark every submitted task finished, as if the GPU caught up.
    pub fn complete_all_tasks(&self) {
        for status in self.state.lock().tasks.values_mut() {
            *status = HalTaskStatus::Finished;
        }
    }

    fn register<T>(table: &mut [Option<T>], value: T, name: &'static str) -> Result<u32, HalError> {
        let capacity = table.len() as u32;
        let slot = table
            .iter()
            .position(|s| s.is_none())
            .ok_or(HalError::TableFull {
                table: name,
                capacity,
            })?;
        table[slot] = Some(value);
        Ok(slot as u32)
    }

    fn unregister<T>(table: &mut [Option<T>], index: u32, name: &'static str) -> Result<(), HalError> {
        match table.get_mut(index as usize) {
            Some(slot) if slot.is_some() => {
                *slot = None;
                Ok(())
            }
            _ => Err(HalError::NotRegistered { table: name, index }),
        }
    }
}

impl std::fmt::Debug for SoftwareCmHal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftwareCmHal")
            .field("samplers", &self.registered_samplers())
            .field("sampler8x8", &self.registered_sampler8x8())
            .field("pending_tasks", &self.pending_tasks())
            .finish()
    }
}

impl CmHal for SoftwareCmHal {
    fn max_values(&self) -> HalMaxValues {
        self.config.max_values.clone()
    }

    fn platform_info(&self) -> PlatformInfo {
        self.config.platform.clone()
    }

    fn register_sampler(&self, state: &SamplerState) -> Result<u32, HalError> {
        let mut guard = self.state.lock();
        let index = Self::register(&mut guard.samplers, *state, "sampler")?;
        guard.calls.push(HalCall::RegisterSampler(index));
        debug!(index, "Registered sampler state");
        Ok(index)
    }

    fn unregister_sampler(&self, index: u32) -> Result<(), HalError> {
        let mut guard = self.state.lock();
        guard.calls.push(HalCall::UnregisterSampler(index));
        Self::unregister(&mut guard.samplers, index, "sampler")
    }

    fn register_sampler8x8(&self, desc: &Sampler8x8Descriptor) -> Result<u32, HalError> {
        desc.validate().map_err(HalError::InvalidParameter)?;
        let mut guard = self.state.lock();
        let index = Self::register(&mut guard.sampler8x8, desc.clone(), "sampler8x8")?;
        guard.calls.push(HalCall::RegisterSampler8x8(index));
        Ok(index)
    }

    fn unregister_sampler8x8(&self, index: u32) -> Result<(), HalError> {
        let mut guard = self.state.lock();
        guard.calls.push(HalCall::UnregisterSampler8x8(index));
        Self::unregister(&mut guard.sampler8x8, index, "sampler8x8")
    }

    fn set_hw_thread_count(&self, count: u32) -> Result<(), HalError> {
        let mut guard = self.state.lock();
        guard.calls.push(HalCall::SetHwThreadCount(count));
        if count == 0 || count > self.config.max_values.max_hw_threads {
            return Err(HalError::InvalidParameter(format!(
                "hardware thread count {count}"
            )));
        }
        guard.hw_threads = Some(count);
        Ok(())
    }

    fn set_l3_config(&self, config: &L3Config) -> Result<(), HalError> {
        let mut guard = self.state.lock();
        guard.calls.push(HalCall::SetL3Config);
        if !self.config.supported_l3_configs.contains(config) {
            return Err(HalError::NotSupported("L3 configuration"));
        }
        guard.l3 = *config;
        Ok(())
    }

    fn l3_config(&self) -> L3Config {
        self.state.lock().l3
    }

    fn submit_task(&self, task: &TaskSubmission) -> Result<HalTaskId, HalError> {
        if task.kernel_count == 0 || task.kernel_count > self.config.max_values.max_kernels_per_task {
            return Err(HalError::InvalidParameter(format!(
                "kernel count {}",
                task.kernel_count
            )));
        }
        let mut guard = self.state.lock();
        guard.next_task += 1;
        let id = HalTaskId(guard.next_task);
        let status = if self.config.complete_tasks_immediately {
            HalTaskStatus::Finished
        } else {
            HalTaskStatus::Queued
        };
        guard.tasks.insert(id, status);
        guard.calls.push(HalCall::SubmitTask(id));
        debug!(task = id.0, kernels = task.kernel_count, queue = ?task.queue_type, "Submitted task");
        Ok(id)
    }

    fn query_task(&self, id: HalTaskId) -> Result<HalTaskStatus, HalError> {
        let guard = self.state.lock();
        if guard.fail_queries {
            return Err(HalError::InvalidParameter(format!("status of task {} unavailable", id.0)));
        }
        guard.tasks.get(&id).copied().ok_or(HalError::UnknownTask(id.0))
    }

    fn wait_task(&self, id: HalTaskId) -> Result<(), HalError> {
        let mut guard = self.state.lock();
        guard.calls.push(HalCall::WaitTask(id));
        let status = guard.tasks.get_mut(&id).ok_or(HalError::UnknownTask(id.0))?;
        *status = HalTaskStatus::Finished;
        Ok(())
    }
}
