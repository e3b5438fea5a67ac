//! Integration tests for the CM device.
//!
//! Each test builds a device over `SoftwareOs` and `SoftwareCmHal` and
//! checks both the device's tables and what reached the OS and HAL.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use md_cm::caps::CapName;
use md_cm::{
    CmDevice, DestroyKind, DestroyOutcome, DeviceEvent, DeviceNotifier, KernelArg,
    QueueCreateOption, SetCap, SurfaceKind,
};
use md_common::{
    CmConfig, CmError, CmQueueType, HalTaskStatus, L3Config, PlatformInfo, ResourceHandle,
    SamplerState, SurfaceFormat,
};
use md_common::{HalMaxValues, MosInterface, ResourceDesc};
use md_gpu_hal::{HalCall, OsCall, SoftwareCmHal, SoftwareCmHalConfig, SoftwareOs, SoftwareOsConfig};

// ----------------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------------

struct Fixture {
    os: Arc<SoftwareOs>,
    hal: Arc<SoftwareCmHal>,
    device: CmDevice,
}

fn fixture_with(config: CmConfig, hal_config: SoftwareCmHalConfig) -> Fixture {
    let os = Arc::new(SoftwareOs::new(SoftwareOsConfig::default()));
    let hal = Arc::new(SoftwareCmHal::new(hal_config));
    let device = CmDevice::new(os.clone(), hal.clone(), &config).unwrap();
    Fixture { os, hal, device }
}

fn bare_config() -> CmConfig {
    CmConfig {
        preload_predefined_kernels: false,
        ..CmConfig::default()
    }
}

fn fixture() -> Fixture {
    fixture_with(bare_config(), SoftwareCmHalConfig::default())
}

fn isa() -> Vec<u8> {
    let mut isa = b"CISA".to_vec();
    isa.extend_from_slice(&[3, 6, 0, 0, 0, 0, 0, 0]);
    isa
}

/// A task with one kernel whose first argument is `surface`.
fn task_using(device: &CmDevice, surface: md_cm::SurfaceId) -> md_cm::TaskId {
    let program = device.load_program(&isa(), "").unwrap();
    let kernel = device.create_kernel(program, "k").unwrap();
    device.set_kernel_arg(kernel, 0, KernelArg::Surface(surface)).unwrap();
    let task = device.create_task().unwrap();
    device.task_add_kernel(task, kernel).unwrap();
    task
}

// ----------------------------------------------------------------------------
// Buffers and surfaces
// ----------------------------------------------------------------------------

#[test]
fn zero_sized_buffer_rejected_without_side_effects() {
    let f = fixture();
    let resources = f.os.live_resource_count();
    let err = f.device.create_buffer(0).unwrap_err();
    assert!(matches!(err, CmError::InvalidWidth(0)));
    assert_eq!(err.code(), -13);
    assert_eq!(f.device.surface_count(), 0);
    assert_eq!(f.os.live_resource_count(), resources);
}

#[test]
fn buffer_up_checks_size_and_alignment() {
    let f = fixture();
    assert!(matches!(
        f.device.create_buffer_up(6, 0x1000),
        Err(CmError::InvalidWidth(6))
    ));
    assert!(matches!(
        f.device.create_buffer_up(64, 0x1010),
        Err(CmError::InvalidArgValue(_))
    ));
    assert!(matches!(
        f.device.create_surface_2d_up(64, 64, SurfaceFormat::A8R8G8B8, 0x1010),
        Err(CmError::SystemMemoryNot4kAligned)
    ));
    let id = f.device.create_buffer_up(64, 0x2000).unwrap();
    assert!(matches!(
        f.device.surface_kind(id).unwrap(),
        SurfaceKind::BufferUp { size: 64, host_addr: 0x2000 }
    ));
    // Host memory is never allocated through the OS.
    assert_eq!(f.os.live_resource_count(), 0);
}

#[test]
fn borrowed_resource_survives_destroy() {
    let f = fixture();
    assert!(matches!(
        f.device.create_buffer_from_resource(ResourceHandle::NULL, 64),
        Err(CmError::InvalidMosResourceHandle)
    ));
    let resource = f.os.allocate_resource(&ResourceDesc::linear("app", 64)).unwrap();
    let id = f.device.create_buffer_from_resource(resource, 64).unwrap();
    f.device.destroy_surface(id, DestroyKind::AppDestroy).unwrap();
    assert_eq!(f.os.live_resource_count(), 1);
    assert_eq!(
        f.os.count_calls(|c| matches!(c, OsCall::FreeResource(_))),
        0
    );
}

#[test]
fn stale_handle_does_not_reach_reused_slot() {
    let f = fixture();
    let old = f.device.create_buffer(64).unwrap();
    f.device.destroy_surface(old, DestroyKind::AppDestroy).unwrap();
    let new = f.device.create_buffer(128).unwrap();

    assert_eq!(old.index(), new.index());
    assert_ne!(old.generation(), new.generation());
    assert!(matches!(
        f.device.surface_kind(old),
        Err(CmError::InconsistentHandle { .. })
    ));
    assert!(f.device.destroy_surface(old, DestroyKind::AppDestroy).is_err());
    assert!(matches!(
        f.device.surface_kind(new).unwrap(),
        SurfaceKind::Buffer { size: 128 }
    ));
}

#[test]
fn surface_kinds_and_views() {
    let f = fixture();
    let frame = f.device.create_surface_2d(64, 64, SurfaceFormat::Nv12).unwrap();
    let reference = f.device.create_surface_2d(64, 64, SurfaceFormat::Nv12).unwrap();
    let volume = f.device.create_surface_3d(16, 16, 4, SurfaceFormat::A8R8G8B8).unwrap();
    let sampler_view = f.device.create_sampler_surface_2d(frame).unwrap();
    let vme = f.device.create_vme_surface(frame, &[reference], &[]).unwrap();

    assert!(matches!(
        f.device.create_surface_3d(16, 16, 1, SurfaceFormat::A8R8G8B8),
        Err(CmError::InvalidDepth(1))
    ));
    assert!(matches!(
        f.device.create_sampler_surface_2d(volume),
        Err(CmError::InvalidArgValue(_))
    ));
    assert!(matches!(
        f.device.surface_kind(vme).unwrap(),
        SurfaceKind::VmeSurface { .. }
    ));
    assert!(matches!(
        f.device.surface_kind(sampler_view).unwrap(),
        SurfaceKind::SamplerSurface2D { source } if source == frame
    ));
    // Views own no memory: three allocations for five surfaces.
    assert_eq!(f.device.surface_count(), 5);
    assert_eq!(f.os.live_resource_count(), 3);
}

#[test]
fn per_kind_surface_cap() {
    let f = fixture_with(
        CmConfig {
            max_surfaces_3d: 1,
            ..bare_config()
        },
        SoftwareCmHalConfig::default(),
    );
    f.device.create_surface_3d(8, 8, 2, SurfaceFormat::X8R8G8B8).unwrap();
    assert!(matches!(
        f.device.create_surface_3d(8, 8, 2, SurfaceFormat::X8R8G8B8),
        Err(CmError::ExceedSurfaceAmount { max: 1 })
    ));
    f.device.create_buffer(16).unwrap();
}

#[test]
fn user_data_on_2d_surfaces() {
    let f = fixture();
    let surface = f.device.create_surface_2d(32, 32, SurfaceFormat::A8R8G8B8).unwrap();
    f.device.set_surface_user_data(surface, 7, vec![1, 2, 3]).unwrap();
    assert_eq!(f.device.surface_user_data(surface, 7).unwrap(), Some(vec![1, 2, 3]));
    assert_eq!(f.device.surface_user_data(surface, 8).unwrap(), None);

    let buffer = f.device.create_buffer(32).unwrap();
    assert!(f.device.set_surface_user_data(buffer, 7, vec![]).is_err());
}

// ----------------------------------------------------------------------------
// Delayed destroy
// ----------------------------------------------------------------------------

#[test]
fn busy_surface_destroy_deferred_until_queue_flush() {
    let f = fixture();
    let buffer = f.device.create_buffer(256).unwrap();
    let task = task_using(&f.device, buffer);
    let queue = f.device.create_queue().unwrap();
    let event = f.device.enqueue(queue, task, None).unwrap();
    assert_eq!(event.status().unwrap(), HalTaskStatus::Queued);

    assert_eq!(
        f.device.destroy_surface(buffer, DestroyKind::AppDestroy).unwrap(),
        DestroyOutcome::Deferred
    );
    assert!(matches!(
        f.device.destroy_surface(buffer, DestroyKind::Delayed),
        Err(CmError::SurfaceInUse(_))
    ));
    assert_eq!(f.device.delayed_destroy_count(), 1);
    assert_eq!(f.os.live_resource_count(), 1);

    assert_eq!(f.device.flush_queue(queue).unwrap(), 1);
    assert_eq!(f.device.delayed_destroy_count(), 0);
    assert_eq!(f.device.surface_count(), 0);
    assert_eq!(f.os.live_resource_count(), 0);
    assert_eq!(event.status().unwrap(), HalTaskStatus::Finished);
}

#[test]
fn force_destroy_waits_for_queues() {
    let f = fixture();
    let buffer = f.device.create_buffer(256).unwrap();
    let task = task_using(&f.device, buffer);
    let queue = f.device.create_queue().unwrap();
    let event = f.device.enqueue(queue, task, None).unwrap();

    assert_eq!(
        f.device.destroy_surface(buffer, DestroyKind::Force).unwrap(),
        DestroyOutcome::Destroyed
    );
    assert!(f.hal.calls().contains(&HalCall::WaitTask(event.task_id())));
    assert_eq!(f.device.queue_in_flight(queue).unwrap(), 0);
}

#[test]
fn full_table_reclaims_retired_surfaces() {
    let f = fixture_with(
        CmConfig {
            max_surfaces: 2,
            ..bare_config()
        },
        SoftwareCmHalConfig::default(),
    );
    let busy = f.device.create_buffer(64).unwrap();
    f.device.create_buffer(64).unwrap();
    let task = task_using(&f.device, busy);
    let queue = f.device.create_queue().unwrap();
    f.device.enqueue(queue, task, None).unwrap();
    f.device.destroy_surface(busy, DestroyKind::AppDestroy).unwrap();

    // Work still running: nothing to reclaim.
    assert!(matches!(
        f.device.create_buffer(64),
        Err(CmError::ExceedSurfaceAmount { max: 2 })
    ));
    assert_eq!(f.os.live_resource_count(), 2);

    f.hal.complete_all_tasks();
    f.device.create_buffer(64).unwrap();
    assert_eq!(f.device.surface_count(), 2);
    assert_eq!(f.device.queue_in_flight(queue).unwrap(), 0);
}

// ----------------------------------------------------------------------------
// Programs and kernels
// ----------------------------------------------------------------------------

#[test]
fn shared_program_outlives_first_kernel() {
    let f = fixture();
    let program = f.device.load_program(&isa(), "").unwrap();
    let k1 = f.device.create_kernel(program, "a").unwrap();
    let k2 = f.device.create_kernel(program, "b").unwrap();
    f.device.destroy_program(program).unwrap();

    f.device.destroy_kernel(k1).unwrap();
    assert_eq!(f.device.program_count(), 1);
    f.device.destroy_kernel(k2).unwrap();
    assert_eq!(f.device.program_count(), 0);
}

#[test]
fn kernel_with_released_program_left_in_place() {
    let f = fixture();
    let program = f.device.load_program(&isa(), "").unwrap();
    let kernel = f.device.create_kernel(program, "k").unwrap();
    f.device.destroy_program(program).unwrap();
    f.device.destroy_program(program).unwrap();
    assert_eq!(f.device.program_count(), 0);
    assert_eq!(f.device.kernel_count(), 1);

    assert!(matches!(
        f.device.destroy_kernel(kernel),
        Err(CmError::InconsistentHandle { kind: "program", .. })
    ));
    assert_eq!(f.device.kernel_count(), 1);
}

#[test]
fn kernel_args_must_name_live_objects() {
    let f = fixture();
    let program = f.device.load_program(&isa(), "").unwrap();
    let kernel = f.device.create_kernel(program, "k").unwrap();
    let buffer = f.device.create_buffer(64).unwrap();
    f.device.destroy_surface(buffer, DestroyKind::AppDestroy).unwrap();
    assert!(matches!(
        f.device.set_kernel_arg(kernel, 0, KernelArg::Surface(buffer)),
        Err(CmError::InconsistentHandle { .. })
    ));
    let sampler = f.device.create_sampler(&SamplerState::default()).unwrap();
    f.device.set_kernel_arg(kernel, 0, KernelArg::Sampler(sampler)).unwrap();
}

#[test]
fn oversized_isa_rejected() {
    let f = fixture();
    let mut big = isa();
    big.resize(f.device.max_values().max_kernel_binary_size + 1, 0);
    assert!(matches!(
        f.device.load_program(&big, ""),
        Err(CmError::ExceedMaxKernelSize { .. })
    ));
    assert!(matches!(
        f.device.load_program(&[], ""),
        Err(CmError::InvalidCommonIsa)
    ));
}

#[test]
fn jit_load_failure_is_reported() {
    let f = fixture_with(
        CmConfig {
            jit_library_path: Some(PathBuf::from("/nonexistent/libigfxcmjit64.so")),
            ..bare_config()
        },
        SoftwareCmHalConfig::default(),
    );
    let err = f.device.load_program(&isa(), "").unwrap_err();
    assert!(matches!(err, CmError::JitLibraryLoad(_)));
    assert!(!f.device.is_jit_loaded());
    assert_eq!(f.device.program_count(), 0);
    assert!(matches!(
        f.device.jit_version(),
        Err(CmError::JitLibraryLoad(_))
    ));
}

#[test]
fn nojitter_option_skips_jit_library() {
    let f = fixture_with(
        CmConfig {
            jit_library_path: Some(PathBuf::from("/nonexistent/libigfxcmjit64.so")),
            ..bare_config()
        },
        SoftwareCmHalConfig::default(),
    );
    f.device.load_program(&isa(), "-O2 nojitter").unwrap();
    assert!(!f.device.is_jit_loaded());
    assert_eq!(f.device.program_count(), 1);
}

// ----------------------------------------------------------------------------
// Queues and tasks
// ----------------------------------------------------------------------------

#[test]
fn render_queue_shared_per_gpu_context() {
    let f = fixture();
    let a = f.device.create_queue().unwrap();
    let b = f.device.create_queue().unwrap();
    assert_eq!(a, b);
    assert_eq!(f.device.queue_count(), 1);

    let other_context = f
        .device
        .create_queue_ex(QueueCreateOption {
            queue_type: CmQueueType::Render,
            gpu_context: 1,
        })
        .unwrap();
    assert_ne!(a, other_context);

    let compute = QueueCreateOption {
        queue_type: CmQueueType::Compute,
        gpu_context: 0,
    };
    let c1 = f.device.create_queue_ex(compute).unwrap();
    let c2 = f.device.create_queue_ex(compute).unwrap();
    assert_ne!(c1, c2);
    assert_eq!(f.device.queue_count(), 4);
}

#[test]
fn render_redirected_to_compute() {
    let f = fixture_with(
        CmConfig {
            redirect_render_to_compute: true,
            ..bare_config()
        },
        SoftwareCmHalConfig::default(),
    );
    let a = f.device.create_queue().unwrap();
    let b = f.device.create_queue().unwrap();
    assert_ne!(a, b);
    assert_eq!(f.device.queue_option(a).unwrap().queue_type, CmQueueType::Compute);
}

#[test]
fn empty_task_not_enqueued() {
    let f = fixture();
    let queue = f.device.create_queue().unwrap();
    let task = f.device.create_task().unwrap();
    assert!(matches!(
        f.device.enqueue(queue, task, None),
        Err(CmError::InvalidArgValue(_))
    ));
    assert!(f.hal.pending_tasks() == 0);
}

#[test]
fn task_kernel_limit() {
    let f = fixture_with(
        bare_config(),
        SoftwareCmHalConfig {
            max_values: HalMaxValues {
                max_kernels_per_task: 1,
                ..HalMaxValues::default()
            },
            ..SoftwareCmHalConfig::default()
        },
    );
    let program = f.device.load_program(&isa(), "").unwrap();
    let kernel = f.device.create_kernel(program, "k").unwrap();
    let task = f.device.create_task().unwrap();
    f.device.task_add_kernel(task, kernel).unwrap();
    assert!(matches!(
        f.device.task_add_kernel(task, kernel),
        Err(CmError::ExceedMaxKernelPerEnqueue { max: 1 })
    ));
    f.device.task_reset(task).unwrap();
    f.device.task_add_kernel(task, kernel).unwrap();
}

#[test]
fn thread_space_carries_thread_count() {
    let f = fixture();
    let buffer = f.device.create_buffer(64).unwrap();
    let task = task_using(&f.device, buffer);
    let space = f.device.create_thread_space(16, 8).unwrap();
    let queue = f.device.create_queue().unwrap();
    f.device.enqueue(queue, task, Some(space)).unwrap();
    assert!(matches!(
        f.device.create_thread_space(0, 8),
        Err(CmError::InvalidThreadSpace { width: 0, height: 8 })
    ));
}

#[test]
fn legacy_platform_limits_thread_space() {
    let f = fixture_with(
        bare_config(),
        SoftwareCmHalConfig {
            platform: PlatformInfo {
                gpu_platform: 8,
                ..PlatformInfo::default()
            },
            ..SoftwareCmHalConfig::default()
        },
    );
    f.device.create_thread_space(511, 511).unwrap();
    assert!(matches!(
        f.device.create_thread_space(512, 1),
        Err(CmError::InvalidThreadSpace { .. })
    ));
    assert!(matches!(
        f.device.create_thread_group_space(64, 32, 1, 1),
        Err(CmError::InvalidThreadGroupSpace(_))
    ));
}

#[test]
fn full_task_pool_waits_on_oldest() {
    let f = fixture_with(
        CmConfig {
            max_tasks: 1,
            ..bare_config()
        },
        SoftwareCmHalConfig::default(),
    );
    let buffer = f.device.create_buffer(64).unwrap();
    let task = task_using(&f.device, buffer);
    let queue = f.device.create_queue().unwrap();
    let first = f.device.enqueue(queue, task, None).unwrap();
    f.device.enqueue(queue, task, None).unwrap();

    assert!(f.hal.calls().contains(&HalCall::WaitTask(first.task_id())));
    assert_eq!(f.device.queue_in_flight(queue).unwrap(), 1);
}

#[test]
fn predefined_copy_and_init() {
    let f = fixture_with(CmConfig::default(), SoftwareCmHalConfig::default());
    assert_eq!(f.device.program_count(), 2);
    let src = f.device.create_buffer(1024).unwrap();
    let dst = f.device.create_buffer(1024).unwrap();
    let small = f.device.create_buffer(16).unwrap();
    let queue = f.device.create_queue().unwrap();

    let copy = f.device.enqueue_copy_gpu_to_gpu(queue, src, dst).unwrap();
    let init = f.device.enqueue_initialization(queue, dst, 0xFFFF_FFFF).unwrap();
    assert!(matches!(
        f.device.enqueue_copy_gpu_to_gpu(queue, src, small),
        Err(CmError::InvalidArgValue(_))
    ));
    // One-shot kernels are gone once submitted.
    assert_eq!(f.device.kernel_count(), 0);
    assert_eq!(f.device.queue_in_flight(queue).unwrap(), 2);

    copy.wait().unwrap();
    init.wait().unwrap();
    f.device.flush_queue(queue).unwrap();
    assert_eq!(f.device.queue_in_flight(queue).unwrap(), 0);
}

// ----------------------------------------------------------------------------
// Samplers and vebox
// ----------------------------------------------------------------------------

#[test]
fn sampler_registration_rolled_back_when_table_full() {
    let f = fixture_with(
        bare_config(),
        SoftwareCmHalConfig {
            max_values: HalMaxValues {
                max_samplers: 1,
                ..HalMaxValues::default()
            },
            sampler_capacity: 4,
            ..SoftwareCmHalConfig::default()
        },
    );
    f.device.create_sampler(&SamplerState::default()).unwrap();
    let err = f.device.create_sampler(&SamplerState::default()).unwrap_err();
    assert!(matches!(err, CmError::ExceedSamplerAmount));

    let calls = f.hal.calls();
    assert_eq!(
        &calls[calls.len() - 2..],
        &[HalCall::RegisterSampler(1), HalCall::UnregisterSampler(1)]
    );
    assert_eq!(f.hal.registered_samplers(), 1);
}

#[test]
fn vebox_surfaces_validated() {
    let f = fixture();
    let vebox = f.device.create_vebox().unwrap();
    let input = f.device.create_surface_2d(64, 64, SurfaceFormat::Nv12).unwrap();
    let output = f.device.create_surface_2d(64, 64, SurfaceFormat::Nv12).unwrap();
    f.device.set_vebox_surfaces(vebox, input, output).unwrap();
    f.device.destroy_surface(output, DestroyKind::AppDestroy).unwrap();
    assert!(f.device.set_vebox_surfaces(vebox, input, output).is_err());
    f.device.destroy_vebox(vebox).unwrap();
    assert!(f.device.destroy_vebox(vebox).is_err());
}

// ----------------------------------------------------------------------------
// Caps
// ----------------------------------------------------------------------------

#[test]
fn caps_query_copies_or_rejects() {
    let f = fixture();
    let mut out = [0u8; 4];
    assert_eq!(f.device.get_caps(CapName::Surface2DCount, &mut out).unwrap(), 4);
    assert_eq!(u32::from_le_bytes(out), 256);

    let mut short = [0u8; 2];
    assert!(matches!(
        f.device.get_caps(CapName::MaxBufferSize, &mut short),
        Err(CmError::InvalidParamSize { expected: 8, got: 2 })
    ));
    assert!(matches!(CapName::try_from(1000), Err(CmError::InvalidCapName)));
}

#[test]
fn set_caps_validates() {
    let f = fixture();
    assert!(matches!(
        f.device.set_caps(SetCap::HwThreadCount(0)),
        Err(CmError::InvalidHardwareThreadNumber(0))
    ));
    assert!(matches!(
        f.device.set_caps(SetCap::HwThreadCount(10_000)),
        Err(CmError::InvalidHardwareThreadNumber(10_000))
    ));
    f.device.set_caps(SetCap::HwThreadCount(100)).unwrap();
    let mut out = [0u8; 4];
    f.device.get_caps(CapName::HwThreadCount, &mut out).unwrap();
    assert_eq!(u32::from_le_bytes(out), 100);
    assert_eq!(f.hal.hw_thread_count(), Some(100));

    let unsupported = L3Config {
        config_regs: [1, 2, 3, 4],
    };
    assert!(matches!(
        f.device.set_caps(SetCap::L3Config(unsupported)),
        Err(CmError::InvalidL3Configuration)
    ));
}

// ----------------------------------------------------------------------------
// Print buffer
// ----------------------------------------------------------------------------

#[test]
fn print_buffer_is_aligned_host_buffer() {
    let f = fixture();
    let surface = f.device.init_print_buffer(4096).unwrap();
    match f.device.surface_kind(surface).unwrap() {
        SurfaceKind::BufferUp { size, host_addr } => {
            assert_eq!(size, 4096);
            assert_eq!(host_addr % 4096, 0);
        }
        other => panic!("unexpected kind {other:?}"),
    }

    f.device
        .with_print_buffer(|buffer| buffer.write(b"thread 0: 42\n"))
        .unwrap();
    let mut out = Vec::new();
    assert_eq!(f.device.flush_print_buffer(&mut out).unwrap(), 13);
    assert_eq!(out, b"thread 0: 42\n");
}

// ----------------------------------------------------------------------------
// Lifecycle
// ----------------------------------------------------------------------------

#[test]
fn destroy_only_at_zero_references() {
    let f = fixture();
    assert_eq!(f.device.acquire(), 2);
    assert_eq!(f.device.destroy().unwrap(), 1);
    assert!(!f.device.is_destroyed());
    assert_eq!(f.device.destroy().unwrap(), 0);
    assert!(f.device.is_destroyed());
    assert_eq!(f.device.release(), 0);
    assert!(f.device.create_buffer(64).is_err());
}

#[test]
fn teardown_drains_queues_before_freeing_objects() {
    let notifier = Arc::new(DeviceNotifier::new());
    let events = notifier.subscribe();
    let os = Arc::new(SoftwareOs::new(SoftwareOsConfig::default()));
    let hal = Arc::new(SoftwareCmHal::new(SoftwareCmHalConfig::default()));
    let device = CmDevice::with_notifier(os.clone(), hal.clone(), &CmConfig::default(), notifier).unwrap();
    let id = device.id();
    assert_eq!(events.try_recv().unwrap(), DeviceEvent::Created { device: id });

    let buffer = device.create_buffer(256).unwrap();
    device.create_surface_2d(64, 64, SurfaceFormat::Nv12).unwrap();
    device.init_print_buffer(8192).unwrap();
    device.create_sampler(&SamplerState::default()).unwrap();
    let task = task_using(&device, buffer);
    let queue = device.create_queue().unwrap();
    let event = device.enqueue(queue, task, None).unwrap();

    assert_eq!(device.destroy().unwrap(), 0);

    let calls = hal.calls();
    let waited = calls
        .iter()
        .position(|c| *c == HalCall::WaitTask(event.task_id()))
        .unwrap();
    let unregistered = calls
        .iter()
        .position(|c| matches!(c, HalCall::UnregisterSampler(_)))
        .unwrap();
    assert!(waited < unregistered);

    assert_eq!(os.live_resource_count(), 0);
    assert_eq!(hal.registered_samplers(), 0);
    assert_eq!(device.program_count(), 0);
    assert_eq!(device.queue_count(), 0);
    assert_eq!(events.try_recv().unwrap(), DeviceEvent::Destroyed { device: id });

    drop(device);
    assert!(events.try_recv().is_err());
}

#[test]
fn concurrent_creation_across_classes() {
    let os = Arc::new(SoftwareOs::new(SoftwareOsConfig::default()));
    let hal = Arc::new(SoftwareCmHal::new(SoftwareCmHalConfig::default()));
    let device = Arc::new(CmDevice::new(os.clone(), hal, &bare_config()).unwrap());

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let device = Arc::clone(&device);
            thread::spawn(move || {
                for _ in 0..16 {
                    device.create_buffer(64).unwrap();
                    device.create_task().unwrap();
                }
                if i % 2 == 0 {
                    device.create_sampler(&SamplerState::default()).unwrap();
                }
                let queue = device.create_queue().unwrap();
                queue.index()
            })
        })
        .collect();
    let queues: Vec<u32> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert!(queues.iter().all(|q| *q == queues[0]));
    assert_eq!(device.surface_count(), 64);
    assert_eq!(os.live_resource_count(), 64);
}
