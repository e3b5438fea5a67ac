//! The CM device: owner of every resource table.
//!
//! Each resource class sits behind its own [`RankedMutex`], so unrelated
//! classes can be created concurrently. Operations that touch several
//! tables always lock in ascending [`LockRank`] order.
//!
//! # Teardown
//!
//! Destroying the device runs in a fixed order. Predefined programs and
//! the print buffer go first. Every queue is then drained, so nothing on
//! the GPU still references a surface, before kernels, programs, samplers,
//! thread spaces, tasks and veboxes are freed. The surface manager follows,
//! then the queues, then listeners are told, and the JIT library is
//! unloaded last.

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam::channel::Receiver;
use md_common::{
    CmConfig, CmError, CmHal, CmQueueType, CmResult, HalMaxValues, MosInterface, PlatformInfo,
    ResourceHandle, Sampler8x8Descriptor, SamplerState, SurfaceFormat, TaskSubmission,
};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::caps::{query_cap, CapName, CapsSnapshot, SetCap};
use crate::jit::JitLibrary;
use crate::lock_order::{LockRank, RankedMutex};
use crate::notifier::{DeviceEvent, DeviceNotifier};
use crate::predefined::{self, PredefinedPrograms, GPU_COPY_KERNEL, SURFACE_INIT_KERNEL};
use crate::print::PrintBuffer;
use crate::program::{KernelArg, KernelId, ProgramId, ProgramLimits, ProgramTables};
use crate::queue::{CmEvent, CmQueue, QueueCreateOption, QueueId};
use crate::sampler::{self, Sampler, Sampler8x8, Sampler8x8Id, SamplerId};
use crate::slot::SlotArray;
use crate::surface::{
    allocate_backing, allocation_size, validate_2d, validate_3d, validate_buffer_size,
    validate_host_addr, DestroyKind, DestroyOutcome, SurfaceId, SurfaceKind, SurfaceLimits,
    SurfaceManager, SurfaceResource, PAGE_SIZE,
};
use crate::task::{CmTask, TaskId};
use crate::thread_space::{
    DependencyPattern, ThreadGroupSpace, ThreadGroupSpaceId, ThreadSpace, ThreadSpaceId,
    MAX_THREAD_SPACE_LEGACY,
};
use crate::vebox::{CmVebox, VeboxId, VeboxState};

const MAX_PROGRAMS: u32 = 1024;
const MAX_KERNELS: u32 = 8192;
const MAX_TASK_OBJECTS: u32 = 1024;
const MAX_THREAD_SPACES: u32 = 1024;
const MAX_VEBOXES: u32 = 64;

/// First platform generation with the wide media walker.
const WIDE_WALKER_PLATFORM: u32 = 9;

/// Program option that keeps the JIT library closed.
const NO_JITTER_OPTION: &str = "nojitter";

static NEXT_DEVICE_ID: AtomicU64 = AtomicU64::new(1);

/// A CM device.
///
/// # Thread safety
///
/// `CmDevice` is `Send + Sync`; share it with `Arc`. Every table has its own
/// lock, so threads working on different resource classes do not contend.
pub struct CmDevice {
    id: u64,
    os: Arc<dyn MosInterface>,
    hal: Arc<dyn CmHal>,
    config: CmConfig,
    max_values: HalMaxValues,
    platform: PlatformInfo,
    ref_count: Mutex<u32>,
    hw_thread_count: AtomicU32,
    destroyed: AtomicBool,

    queues: RankedMutex<Vec<CmQueue>>,
    tasks: RankedMutex<SlotArray<CmTask>>,
    thread_spaces: RankedMutex<SlotArray<ThreadSpace>>,
    group_spaces: RankedMutex<SlotArray<ThreadGroupSpace>>,
    programs: RankedMutex<ProgramTables>,
    samplers: RankedMutex<SlotArray<Sampler>>,
    samplers_8x8: RankedMutex<SlotArray<Sampler8x8>>,
    veboxes: RankedMutex<SlotArray<CmVebox>>,
    surfaces: RankedMutex<SurfaceManager>,

    predefined: Mutex<Option<PredefinedPrograms>>,
    print: Mutex<Option<(PrintBuffer, SurfaceId)>>,
    notifier: Arc<DeviceNotifier>,
    jit: Mutex<Option<JitLibrary>>,
}

impl CmDevice {
    pub fn new(os: Arc<dyn MosInterface>, hal: Arc<dyn CmHal>, config: &CmConfig) -> CmResult<Self> {
        Self::with_notifier(os, hal, config, Arc::new(DeviceNotifier::new()))
    }

    /// Create a device that publishes lifecycle events on `notifier`.
    pub fn with_notifier(
        os: Arc<dyn MosInterface>,
        hal: Arc<dyn CmHal>,
        config: &CmConfig,
        notifier: Arc<DeviceNotifier>,
    ) -> CmResult<Self> {
        let max_values = hal.max_values();
        let platform = hal.platform_info();
        let max_2d = config.max_surfaces_2d.min(max_values.max_2d_surface_table_size);
        let limits = SurfaceLimits {
            max_buffers: config.max_buffers.min(max_values.max_buffer_table_size),
            max_2d,
            max_2d_up: max_2d,
            max_3d: config.max_surfaces_3d.min(max_values.max_3d_surface_table_size),
            max_total: config.max_surfaces,
        };
        let program_limits = ProgramLimits {
            max_kernel_binary_size: max_values.max_kernel_binary_size,
            max_args_per_kernel: max_values.max_args_per_kernel,
            max_arg_size_per_kernel: max_values.max_arg_size_per_kernel,
        };

        let device = Self {
            id: NEXT_DEVICE_ID.fetch_add(1, Ordering::Relaxed),
            hw_thread_count: AtomicU32::new(max_values.max_hw_threads),
            queues: RankedMutex::new(LockRank::Queue, Vec::new()),
            tasks: RankedMutex::new(LockRank::Task, SlotArray::new("task", MAX_TASK_OBJECTS)),
            thread_spaces: RankedMutex::new(
                LockRank::ThreadSpace,
                SlotArray::new("thread space", MAX_THREAD_SPACES),
            ),
            group_spaces: RankedMutex::new(
                LockRank::ThreadGroupSpace,
                SlotArray::new("thread group space", MAX_THREAD_SPACES),
            ),
            programs: RankedMutex::new(
                LockRank::ProgramKernel,
                ProgramTables::new(MAX_PROGRAMS, MAX_KERNELS, program_limits),
            ),
            samplers: RankedMutex::new(
                LockRank::Sampler,
                SlotArray::new("sampler", max_values.max_samplers),
            ),
            samplers_8x8: RankedMutex::new(
                LockRank::Sampler8x8,
                SlotArray::new("sampler8x8", max_values.max_sampler8x8),
            ),
            veboxes: RankedMutex::new(LockRank::Vebox, SlotArray::new("vebox", MAX_VEBOXES)),
            surfaces: RankedMutex::new(LockRank::Surface, SurfaceManager::new(limits)),
            predefined: Mutex::new(None),
            print: Mutex::new(None),
            jit: Mutex::new(None),
            ref_count: Mutex::new(1),
            destroyed: AtomicBool::new(false),
            config: config.clone(),
            max_values,
            platform,
            notifier,
            os,
            hal,
        };

        if config.preload_predefined_kernels {
            let loaded = PredefinedPrograms::load(&mut device.programs.lock())?;
            *device.predefined.lock() = Some(loaded);
        }

        info!(
            device = device.id,
            platform = device.platform.gpu_platform,
            surfaces = limits.max_total,
            "CM device created"
        );
        device.notifier.publish(DeviceEvent::Created { device: device.id });
        Ok(device)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn max_values(&self) -> &HalMaxValues {
        &self.max_values
    }

    pub fn subscribe(&self) -> Receiver<DeviceEvent> {
        self.notifier.subscribe()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    fn ensure_live(&self) -> CmResult<()> {
        if self.is_destroyed() {
            return Err(CmError::Failure("device already destroyed".into()));
        }
        Ok(())
    }

    // -- Reference counting --

    pub fn acquire(&self) -> u32 {
        let mut count = self.ref_count.lock();
        *count += 1;
        *count
    }

    /// Drop one reference. Never goes below zero.
    pub fn release(&self) -> u32 {
        let mut count = self.ref_count.lock();
        *count = count.saturating_sub(1);
        *count
    }

    pub fn ref_count(&self) -> u32 {
        *self.ref_count.lock()
    }

    /// Release one reference and tear the device down if it was the last.
    /// Returns the references left.
    pub fn destroy(&self) -> CmResult<u32> {
        let left = self.release();
        if left == 0 {
            self.teardown()?;
        } else {
            debug!(device = self.id, left, "Device still referenced");
        }
        Ok(left)
    }

    // -- Buffers --

    pub fn create_buffer(&self, size: u32) -> CmResult<SurfaceId> {
        validate_buffer_size(size)?;
        self.create_surface(SurfaceKind::Buffer { size })
    }

    /// Buffer over application memory. The memory must outlive the buffer.
    pub fn create_buffer_up(&self, size: u32, host_addr: usize) -> CmResult<SurfaceId> {
        validate_buffer_size(size)?;
        if size % 4 != 0 {
            return Err(CmError::InvalidWidth(size));
        }
        validate_host_addr(host_addr)?;
        self.create_surface(SurfaceKind::BufferUp { size, host_addr })
    }

    pub fn create_buffer_svm(&self, size: u32, host_addr: usize) -> CmResult<SurfaceId> {
        validate_buffer_size(size)?;
        validate_host_addr(host_addr)?;
        self.create_surface(SurfaceKind::BufferSvm { size, host_addr })
    }

    /// Wrap a resource the caller allocated. The device never frees it.
    pub fn create_buffer_from_resource(
        &self,
        resource: ResourceHandle,
        size: u32,
    ) -> CmResult<SurfaceId> {
        if resource.is_null() {
            return Err(CmError::InvalidMosResourceHandle);
        }
        validate_buffer_size(size)?;
        self.insert_surface(SurfaceKind::Buffer { size }, SurfaceResource::Borrowed(resource))
    }

    // -- Surfaces --

    pub fn create_surface_2d(&self, width: u32, height: u32, format: SurfaceFormat) -> CmResult<SurfaceId> {
        validate_2d(width, height, format)?;
        self.create_surface(SurfaceKind::Surface2D { width, height, format })
    }

    pub fn create_surface_2d_up(
        &self,
        width: u32,
        height: u32,
        format: SurfaceFormat,
        host_addr: usize,
    ) -> CmResult<SurfaceId> {
        validate_2d(width, height, format)?;
        if host_addr == 0 {
            return Err(CmError::NullPointer("surface 2D UP host memory"));
        }
        if host_addr % PAGE_SIZE != 0 {
            return Err(CmError::SystemMemoryNot4kAligned);
        }
        self.create_surface(SurfaceKind::Surface2DUp {
            width,
            height,
            format,
            host_addr,
        })
    }

    pub fn create_surface_3d(
        &self,
        width: u32,
        height: u32,
        depth: u32,
        format: SurfaceFormat,
    ) -> CmResult<SurfaceId> {
        validate_3d(width, height, depth, format)?;
        self.create_surface(SurfaceKind::Surface3D {
            width,
            height,
            depth,
            format,
        })
    }

    /// Sampler view of a live 2D surface.
    pub fn create_sampler_surface_2d(&self, source: SurfaceId) -> CmResult<SurfaceId> {
        {
            let surfaces = self.surfaces.lock();
            if !surfaces.get(source)?.kind().is_2d() {
                return Err(CmError::InvalidArgValue("sampler surface needs a 2D source".into()));
            }
        }
        self.create_surface(SurfaceKind::SamplerSurface2D { source })
    }

    pub fn create_vme_surface(
        &self,
        current: SurfaceId,
        forward: &[SurfaceId],
        backward: &[SurfaceId],
    ) -> CmResult<SurfaceId> {
        {
            let surfaces = self.surfaces.lock();
            for id in std::iter::once(&current).chain(forward).chain(backward) {
                if !surfaces.get(*id)?.kind().is_2d() {
                    return Err(CmError::InvalidArgValue("VME references must be 2D".into()));
                }
            }
        }
        self.create_surface(SurfaceKind::VmeSurface {
            current,
            forward: forward.to_vec(),
            backward: backward.to_vec(),
        })
    }

    pub fn destroy_surface(&self, id: SurfaceId, kind: DestroyKind) -> CmResult<DestroyOutcome> {
        self.ensure_live()?;
        if kind == DestroyKind::Force {
            self.drain_all_queues()?;
        }
        self.surfaces.lock().destroy(self.os.as_ref(), id, kind)
    }

    pub fn surface_kind(&self, id: SurfaceId) -> CmResult<SurfaceKind> {
        Ok(self.surfaces.lock().get(id)?.kind().clone())
    }

    pub fn surface_count(&self) -> usize {
        self.surfaces.lock().len()
    }

    pub fn delayed_destroy_count(&self) -> usize {
        self.surfaces.lock().delayed_count()
    }

    pub fn set_surface_user_data(&self, id: SurfaceId, key: u32, data: Vec<u8>) -> CmResult<()> {
        self.surfaces.lock().set_user_data(id, key, data)
    }

    pub fn surface_user_data(&self, id: SurfaceId, key: u32) -> CmResult<Option<Vec<u8>>> {
        self.surfaces.lock().user_data(id, key)
    }

    fn create_surface(&self, kind: SurfaceKind) -> CmResult<SurfaceId> {
        self.ensure_live()?;
        let has_room = {
            let surfaces = self.surfaces.lock();
            surfaces.check_class_capacity(kind.class())?;
            surfaces.has_free_slot()
        };
        if !has_room {
            self.reclaim_surface_slots()?;
        }
        let resource = allocate_backing(self.os.as_ref(), &kind)?;
        self.insert_surface(kind, resource)
    }

    /// Store a surface; frees an owned resource if the table rejects it.
    fn insert_surface(&self, kind: SurfaceKind, resource: SurfaceResource) -> CmResult<SurfaceId> {
        self.ensure_live()?;
        let inserted = self.surfaces.lock().insert(kind, resource);
        if inserted.is_err() {
            if let SurfaceResource::Owned(handle) = resource {
                if let Err(e) = self.os.free_resource(handle) {
                    warn!(resource = %handle, error = %e, "Failed to free rejected surface backing");
                }
            }
        }
        inserted
    }

    /// Retire finished work and run pending destroys to free table slots.
    fn reclaim_surface_slots(&self) -> CmResult<()> {
        let mut queues = self.queues.lock();
        let mut released = Vec::new();
        for queue in queues.iter_mut() {
            released.extend(queue.retire_finished(self.hal.as_ref())?);
        }
        let mut surfaces = self.surfaces.lock();
        surfaces.release_busy(&released);
        let freed = surfaces.refresh_delayed(self.os.as_ref());
        debug!(retired = released.len(), freed, "Surface table full, reclaimed slots");
        Ok(())
    }

    // -- Programs and kernels --

    pub fn load_program(&self, isa: &[u8], options: &str) -> CmResult<ProgramId> {
        self.ensure_live()?;
        if self.config.jit_library_path.is_some() && !options.contains(NO_JITTER_OPTION) {
            self.load_jit()?;
        }
        self.programs.lock().load_program(isa, options)
    }

    pub fn destroy_program(&self, id: ProgramId) -> CmResult<()> {
        self.programs.lock().release_program(id).map(|_| ())
    }

    pub fn create_kernel(&self, program: ProgramId, name: &str) -> CmResult<KernelId> {
        self.ensure_live()?;
        self.programs.lock().create_kernel(program, name)
    }

    pub fn destroy_kernel(&self, id: KernelId) -> CmResult<()> {
        self.programs.lock().destroy_kernel(id)
    }

    /// Bind one argument. Object arguments must name live objects.
    pub fn set_kernel_arg(&self, kernel: KernelId, index: u32, arg: KernelArg) -> CmResult<()> {
        let mut programs = self.programs.lock();
        match &arg {
            KernelArg::Scalar(_) => {}
            KernelArg::Sampler(id) => {
                self.samplers.lock().get(*id)?;
            }
            KernelArg::Sampler8x8(id) => {
                self.samplers_8x8.lock().get(*id)?;
            }
            KernelArg::Surface(id) => {
                self.surfaces.lock().get(*id)?;
            }
        }
        programs.set_kernel_arg(kernel, index, arg)
    }

    pub fn program_count(&self) -> usize {
        self.programs.lock().program_count()
    }

    pub fn kernel_count(&self) -> usize {
        self.programs.lock().kernel_count()
    }

    /// Open the JIT library if it is not loaded yet.
    pub fn load_jit(&self) -> CmResult<()> {
        let mut jit = self.jit.lock();
        if jit.is_none() {
            *jit = Some(JitLibrary::load(self.config.jit_library_path.as_deref())?);
        }
        Ok(())
    }

    pub fn is_jit_loaded(&self) -> bool {
        self.jit.lock().is_some()
    }

    /// `(major, minor)` of the JIT library, opening it first if needed.
    pub fn jit_version(&self) -> CmResult<(u32, u32)> {
        self.load_jit()?;
        self.jit
            .lock()
            .as_ref()
            .map(JitLibrary::version)
            .ok_or_else(|| CmError::JitLibraryLoad("JIT library not loaded".into()))
    }

    // -- Tasks and thread spaces --

    pub fn create_task(&self) -> CmResult<TaskId> {
        self.ensure_live()?;
        self.tasks
            .lock()
            .insert(CmTask::new(self.max_values.max_kernels_per_task))
            .map_err(|_| CmError::Failure("task table full".into()))
    }

    pub fn destroy_task(&self, id: TaskId) -> CmResult<()> {
        self.tasks.lock().remove(id).map(|_| ())
    }

    pub fn task_add_kernel(&self, task: TaskId, kernel: KernelId) -> CmResult<()> {
        let mut tasks = self.tasks.lock();
        let task = tasks.get_mut(task)?;
        self.programs.lock().kernel(kernel)?;
        task.add_kernel(kernel)
    }

    pub fn task_reset(&self, task: TaskId) -> CmResult<()> {
        self.tasks.lock().get_mut(task)?.reset();
        Ok(())
    }

    pub fn create_thread_space(&self, width: u32, height: u32) -> CmResult<ThreadSpaceId> {
        self.ensure_live()?;
        let (max_width, max_height) = if self.platform.gpu_platform < WIDE_WALKER_PLATFORM {
            (MAX_THREAD_SPACE_LEGACY, MAX_THREAD_SPACE_LEGACY)
        } else {
            (
                self.max_values.max_thread_space_width,
                self.max_values.max_thread_space_height,
            )
        };
        let space = ThreadSpace::new(width, height, max_width, max_height)?;
        self.thread_spaces
            .lock()
            .insert(space)
            .map_err(|_| CmError::Failure("thread space table full".into()))
    }

    pub fn destroy_thread_space(&self, id: ThreadSpaceId) -> CmResult<()> {
        self.thread_spaces.lock().remove(id).map(|_| ())
    }

    pub fn select_thread_dependency(&self, id: ThreadSpaceId, pattern: DependencyPattern) -> CmResult<()> {
        self.thread_spaces.lock().get_mut(id)?.select_dependency(pattern);
        Ok(())
    }

    pub fn create_thread_group_space(
        &self,
        thread_width: u32,
        thread_height: u32,
        group_width: u32,
        group_height: u32,
    ) -> CmResult<ThreadGroupSpaceId> {
        self.ensure_live()?;
        let space = ThreadGroupSpace::new(
            thread_width,
            thread_height,
            group_width,
            group_height,
            self.max_values.max_user_threads_per_thread_group,
        )?;
        self.group_spaces
            .lock()
            .insert(space)
            .map_err(|_| CmError::Failure("thread group space table full".into()))
    }

    pub fn destroy_thread_group_space(&self, id: ThreadGroupSpaceId) -> CmResult<()> {
        self.group_spaces.lock().remove(id).map(|_| ())
    }

    // -- Vebox --

    pub fn create_vebox(&self) -> CmResult<VeboxId> {
        self.ensure_live()?;
        self.veboxes
            .lock()
            .insert(CmVebox::default())
            .map_err(|_| CmError::Failure("vebox table full".into()))
    }

    pub fn destroy_vebox(&self, id: VeboxId) -> CmResult<()> {
        self.veboxes.lock().remove(id).map(|_| ())
    }

    pub fn set_vebox_state(&self, id: VeboxId, state: VeboxState) -> CmResult<()> {
        self.veboxes.lock().get_mut(id)?.set_state(state);
        Ok(())
    }

    pub fn set_vebox_surfaces(&self, id: VeboxId, input: SurfaceId, output: SurfaceId) -> CmResult<()> {
        let mut veboxes = self.veboxes.lock();
        let vebox = veboxes.get_mut(id)?;
        {
            let surfaces = self.surfaces.lock();
            surfaces.get(input)?;
            surfaces.get(output)?;
        }
        vebox.set_surfaces(input, output);
        Ok(())
    }

    // -- Samplers --

    pub fn create_sampler(&self, state: &SamplerState) -> CmResult<SamplerId> {
        self.ensure_live()?;
        sampler::create_sampler(&self.hal, &mut self.samplers.lock(), state)
    }

    pub fn destroy_sampler(&self, id: SamplerId) -> CmResult<()> {
        sampler::destroy_sampler(self.hal.as_ref(), &mut self.samplers.lock(), id)
    }

    pub fn create_sampler8x8(&self, desc: &Sampler8x8Descriptor) -> CmResult<Sampler8x8Id> {
        self.ensure_live()?;
        sampler::create_sampler8x8(&self.hal, &mut self.samplers_8x8.lock(), desc)
    }

    pub fn destroy_sampler8x8(&self, id: Sampler8x8Id) -> CmResult<()> {
        sampler::destroy_sampler8x8(self.hal.as_ref(), &mut self.samplers_8x8.lock(), id)
    }

    // -- Queues --

    pub fn create_queue(&self) -> CmResult<QueueId> {
        self.create_queue_ex(QueueCreateOption::default())
    }

    /// Render queues on the same GPU context are shared; every other
    /// request gets a new queue.
    pub fn create_queue_ex(&self, option: QueueCreateOption) -> CmResult<QueueId> {
        self.ensure_live()?;
        let mut option = option;
        if option.queue_type == CmQueueType::Render && self.config.redirect_render_to_compute {
            option.queue_type = CmQueueType::Compute;
        }
        let mut queues = self.queues.lock();
        if option.queue_type == CmQueueType::Render {
            if let Some(index) = queues.iter().position(|q| q.option() == option) {
                return Ok(QueueId(index as u32));
            }
        }
        queues.push(CmQueue::new(option));
        let id = QueueId(queues.len() as u32 - 1);
        debug!(queue = id.index(), queue_type = ?option.queue_type, "Queue created");
        Ok(id)
    }

    pub fn queue_count(&self) -> usize {
        self.queues.lock().len()
    }

    pub fn queue_option(&self, queue: QueueId) -> CmResult<QueueCreateOption> {
        let queues = self.queues.lock();
        Ok(queue_ref(&queues, queue)?.option())
    }

    pub fn queue_in_flight(&self, queue: QueueId) -> CmResult<usize> {
        let queues = self.queues.lock();
        Ok(queue_ref(&queues, queue)?.in_flight())
    }

    /// Submit `task`. The surfaces its kernels reference stay busy until the
    /// queue sees the task finish.
    pub fn enqueue(
        &self,
        queue: QueueId,
        task: TaskId,
        thread_space: Option<ThreadSpaceId>,
    ) -> CmResult<CmEvent> {
        self.ensure_live()?;
        let mut queues = self.queues.lock();
        self.make_room(&mut queues, queue)?;
        let tasks = self.tasks.lock();
        let task = tasks.get(task)?;
        if task.kernel_count() == 0 {
            return Err(CmError::InvalidArgValue("task has no kernels".into()));
        }
        let thread_count = match thread_space {
            Some(id) => self.thread_spaces.lock().get(id)?.thread_count(),
            None => 1,
        };
        let surfaces = {
            let programs = self.programs.lock();
            let mut surfaces = Vec::new();
            for kernel in task.kernels() {
                surfaces.extend(programs.kernel(*kernel)?.surfaces());
            }
            surfaces
        };
        self.submit(&mut queues, queue, task.kernel_count(), thread_count, surfaces)
    }

    /// Wait for every task on `queue`. Returns how many deferred surface
    /// destroys this completed.
    pub fn flush_queue(&self, queue: QueueId) -> CmResult<usize> {
        self.ensure_live()?;
        let mut queues = self.queues.lock();
        let released = queue_mut(&mut queues, queue)?.drain(self.hal.as_ref())?;
        let mut surfaces = self.surfaces.lock();
        surfaces.release_busy(&released);
        Ok(surfaces.refresh_delayed(self.os.as_ref()))
    }

    /// Copy `src` into `dst` with the built-in copy kernel.
    pub fn enqueue_copy_gpu_to_gpu(
        &self,
        queue: QueueId,
        src: SurfaceId,
        dst: SurfaceId,
    ) -> CmResult<CmEvent> {
        self.ensure_live()?;
        let bytes = {
            let surfaces = self.surfaces.lock();
            let src_size = allocation_size(surfaces.get(src)?.kind())?;
            let dst_size = allocation_size(surfaces.get(dst)?.kind())?;
            if src_size != dst_size {
                return Err(CmError::InvalidArgValue(format!(
                    "copy between surfaces of {src_size} and {dst_size} bytes"
                )));
            }
            src_size
        };
        let program = self.predefined_programs()?.gpu_copy;
        self.run_predefined(
            queue,
            program,
            GPU_COPY_KERNEL,
            vec![KernelArg::Surface(src), KernelArg::Surface(dst)],
            predefined::thread_count_for(bytes),
        )
    }

    /// Fill `surface` with `value` using the built-in init kernel.
    pub fn enqueue_initialization(&self, queue: QueueId, surface: SurfaceId, value: u32) -> CmResult<CmEvent> {
        self.ensure_live()?;
        let bytes = allocation_size(self.surfaces.lock().get(surface)?.kind())?;
        let program = self.predefined_programs()?.surface_init;
        self.run_predefined(
            queue,
            program,
            SURFACE_INIT_KERNEL,
            vec![KernelArg::Surface(surface), KernelArg::Scalar(value.to_le_bytes().to_vec())],
            predefined::thread_count_for(bytes),
        )
    }

    fn predefined_programs(&self) -> CmResult<PredefinedPrograms> {
        let mut predefined = self.predefined.lock();
        if let Some(loaded) = *predefined {
            return Ok(loaded);
        }
        let loaded = PredefinedPrograms::load(&mut self.programs.lock())?;
        *predefined = Some(loaded);
        Ok(loaded)
    }

    /// One-shot kernel from a predefined program, destroyed once submitted.
    fn run_predefined(
        &self,
        queue: QueueId,
        program: ProgramId,
        name: &str,
        args: Vec<KernelArg>,
        thread_count: u32,
    ) -> CmResult<CmEvent> {
        let kernel = self.create_kernel(program, name)?;
        let result = (|| -> CmResult<CmEvent> {
            for (index, arg) in args.into_iter().enumerate() {
                self.set_kernel_arg(kernel, index as u32, arg)?;
            }
            let surfaces = self.programs.lock().kernel(kernel)?.surfaces();
            let mut queues = self.queues.lock();
            self.make_room(&mut queues, queue)?;
            self.submit(&mut queues, queue, 1, thread_count, surfaces)
        })();
        if let Err(e) = self.destroy_kernel(kernel) {
            warn!(kernel = ?kernel, error = %e, "Failed to destroy predefined kernel");
        }
        result
    }

    /// Keep at most `max_tasks` tasks in flight on `queue`.
    fn make_room(&self, queues: &mut [CmQueue], queue: QueueId) -> CmResult<()> {
        let max_in_flight = self.config.max_tasks.min(self.max_values.max_tasks).max(1) as usize;
        let q = queue_mut(queues, queue)?;
        if q.in_flight() < max_in_flight {
            return Ok(());
        }
        let mut released = q.retire_finished(self.hal.as_ref())?;
        if q.in_flight() >= max_in_flight {
            debug!(queue = queue.index(), "Task pool full, waiting on oldest task");
            released.extend(q.wait_oldest(self.hal.as_ref())?);
        }
        let mut surfaces = self.surfaces.lock();
        surfaces.release_busy(&released);
        surfaces.refresh_delayed(self.os.as_ref());
        Ok(())
    }

    fn submit(
        &self,
        queues: &mut [CmQueue],
        queue: QueueId,
        kernel_count: u32,
        thread_count: u32,
        surfaces: Vec<SurfaceId>,
    ) -> CmResult<CmEvent> {
        let q = queue_mut(queues, queue)?;
        let option = q.option();
        let mut manager = self.surfaces.lock();
        manager.mark_busy(&surfaces)?;
        let submission = TaskSubmission {
            queue_type: option.queue_type,
            gpu_context: option.gpu_context,
            kernel_count,
            thread_count,
        };
        let task = match self.hal.submit_task(&submission) {
            Ok(task) => task,
            Err(e) => {
                manager.release_busy(&surfaces);
                error!(queue = queue.index(), error = %e, "Task submission failed");
                return Err(e.into());
            }
        };
        drop(manager);
        q.track(task, surfaces);
        Ok(CmEvent::new(queue, task, Arc::clone(&self.hal)))
    }

    fn drain_all_queues(&self) -> CmResult<()> {
        let mut queues = self.queues.lock();
        let mut released = Vec::new();
        for queue in queues.iter_mut() {
            released.extend(queue.drain(self.hal.as_ref())?);
        }
        self.surfaces.lock().release_busy(&released);
        Ok(())
    }

    // -- Caps --

    pub fn get_caps(&self, cap: CapName, out: &mut [u8]) -> CmResult<usize> {
        let snapshot = CapsSnapshot {
            max_values: self.max_values.clone(),
            platform: self.platform.clone(),
            surfaces: self.surfaces.lock().limits(),
            hw_thread_count: self.hw_thread_count.load(Ordering::Relaxed),
            l3: self.hal.l3_config(),
            vme_supported: true,
        };
        query_cap(cap, &snapshot, out)
    }

    pub fn set_caps(&self, cap: SetCap) -> CmResult<()> {
        match cap {
            SetCap::HwThreadCount(count) => {
                if count == 0 || count > self.max_values.max_hw_threads {
                    return Err(CmError::InvalidHardwareThreadNumber(count));
                }
                self.hal
                    .set_hw_thread_count(count)
                    .map_err(|_| CmError::InvalidHardwareThreadNumber(count))?;
                self.hw_thread_count.store(count, Ordering::Relaxed);
            }
            SetCap::L3Config(config) => {
                self.hal
                    .set_l3_config(&config)
                    .map_err(|_| CmError::InvalidL3Configuration)?;
            }
        }
        Ok(())
    }

    // -- Print buffer --

    /// Allocate the kernel printf buffer. Replaces an existing one.
    pub fn init_print_buffer(&self, size: usize) -> CmResult<SurfaceId> {
        self.ensure_live()?;
        let buffer = PrintBuffer::new(size)?;
        let surface_size = u32::try_from(buffer.size())
            .map_err(|_| CmError::InvalidArgValue(format!("print buffer of {size} bytes")))?;
        let mut print = self.print.lock();
        if let Some((_, old)) = print.take() {
            self.surfaces
                .lock()
                .destroy(self.os.as_ref(), old, DestroyKind::Force)?;
        }
        let id = self.create_buffer_up(surface_size, buffer.host_addr())?;
        *print = Some((buffer, id));
        Ok(id)
    }

    /// Run `f` on the print buffer, e.g. to stand in for kernel output.
    pub fn with_print_buffer<R>(&self, f: impl FnOnce(&mut PrintBuffer) -> R) -> CmResult<R> {
        let mut print = self.print.lock();
        let (buffer, _) = print
            .as_mut()
            .ok_or_else(|| CmError::Failure("print buffer not initialised".into()))?;
        Ok(f(buffer))
    }

    /// Write pending kernel output to `out`.
    pub fn flush_print_buffer(&self, out: &mut dyn Write) -> CmResult<usize> {
        self.with_print_buffer(|buffer| buffer.flush(out))?
    }

    // -- Teardown --

    fn teardown(&self) -> CmResult<()> {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut first_err: Option<CmError> = None;
        let mut note = |step: &str, result: CmResult<()>| {
            if let Err(e) = result {
                error!(device = self.id, step, error = %e, "Device teardown step failed");
                first_err.get_or_insert(e);
            }
        };

        if let Some(predefined) = self.predefined.lock().take() {
            note("predefined programs", predefined.release(&mut self.programs.lock()));
        }

        if let Some((buffer, surface)) = self.print.lock().take() {
            let result = self.surfaces.lock().destroy(self.os.as_ref(), surface, DestroyKind::Force);
            note("print buffer", result.map(|_| ()));
            drop(buffer);
        }

        note("drain queues", self.drain_all_queues());

        self.programs.lock().destroy_all();
        for (_, sampler) in self.samplers.lock().drain() {
            note(
                "samplers",
                self.hal.unregister_sampler(sampler.hal_index()).map_err(CmError::from),
            );
        }
        for (_, sampler) in self.samplers_8x8.lock().drain() {
            note(
                "sampler8x8",
                self.hal.unregister_sampler8x8(sampler.hal_index()).map_err(CmError::from),
            );
        }
        self.thread_spaces.lock().drain();
        self.group_spaces.lock().drain();
        self.tasks.lock().drain();
        self.veboxes.lock().drain();

        note("surfaces", self.surfaces.lock().destroy_all(self.os.as_ref()));

        self.queues.lock().clear();

        self.notifier.publish(DeviceEvent::Destroyed { device: self.id });

        if let Some(jit) = self.jit.lock().take() {
            debug!(library = %jit.path().display(), "Unloading JIT library");
            drop(jit);
        }

        info!(device = self.id, "CM device destroyed");
        first_err.map_or(Ok(()), Err)
    }
}

fn queue_ref(queues: &[CmQueue], id: QueueId) -> CmResult<&CmQueue> {
    queues
        .get(id.index() as usize)
        .ok_or_else(|| CmError::InvalidArgValue(format!("unknown queue {}", id.index())))
}

fn queue_mut(queues: &mut [CmQueue], id: QueueId) -> CmResult<&mut CmQueue> {
    queues
        .get_mut(id.index() as usize)
        .ok_or_else(|| CmError::InvalidArgValue(format!("unknown queue {}", id.index())))
}

impl Drop for CmDevice {
    fn drop(&mut self) {
        if let Err(e) = self.teardown() {
            warn!(device = self.id, error = %e, "CM device teardown failed");
        }
    }
}

impl std::fmt::Debug for CmDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CmDevice")
            .field("id", &self.id)
            .field("ref_count", &*self.ref_count.lock())
            .field("destroyed", &self.is_destroyed())
            .field("platform", &self.platform.gpu_platform)
            .finish()
    }
}
