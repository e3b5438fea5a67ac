//! Integration tests for the GPU context cache.
//!
//! Every test drives `MediaContext` against `SoftwareOs` and checks the
//! OS-side bookkeeping (live GPU contexts, live resources) alongside the
//! cache's own view.

use std::sync::Arc;

use md_common::{
    ComponentType, ContextError, DriverConfig, GpuNode, MediaFunction, MosError, MosInterface,
};
use md_gpu_hal::{OsCall, SoftwareOs, SoftwareOsConfig};
use md_media_context::{MediaContext, NoBalancing};
use md_scalability::ScalabilityOption;

// ----------------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------------

fn context_with(
    component: ComponentType,
    os_config: SoftwareOsConfig,
    capacity: usize,
) -> (Arc<SoftwareOs>, MediaContext) {
    let os = Arc::new(SoftwareOs::new(os_config));
    let mut config = DriverConfig::default();
    config.context.max_context_attributes = capacity;
    let ctx = MediaContext::new(component, os.clone(), &config);
    (os, ctx)
}

fn decode_context(capacity: usize) -> (Arc<SoftwareOs>, MediaContext) {
    context_with(ComponentType::Decode, SoftwareOsConfig::default(), capacity)
}

fn single(component: ComponentType) -> ScalabilityOption {
    ScalabilityOption::single_pipe(component)
}

// ----------------------------------------------------------------------------
// Lookup
// ----------------------------------------------------------------------------

#[test]
fn distinct_option_or_function_creates_new_entry() {
    let (os, mut ctx) = decode_context(8);
    let a = ctx
        .switch_context_with_option(MediaFunction::VdboxDecode, &single(ComponentType::Decode))
        .unwrap();
    let two_pipe = ScalabilityOption::with_pipes(ComponentType::Decode, 2, 2);
    let b = ctx
        .switch_context_with_option(MediaFunction::VdboxDecode, &two_pipe)
        .unwrap();
    let c = ctx
        .switch_context_with_option(MediaFunction::VdboxDecodeWa, &single(ComponentType::Decode))
        .unwrap();

    assert!(!Arc::ptr_eq(&a, &b));
    assert!(!Arc::ptr_eq(&a, &c));
    assert_eq!(ctx.len(), 3);
    assert_eq!(os.live_context_count(), 3);
    assert_eq!(b.lock().pipe_num(), 2);
    assert_eq!(c.lock().gpu_node(), Some(GpuNode::Video2));

    let ctx_b = b.lock().gpu_context().unwrap();
    assert_eq!(os.context_options(ctx_b).unwrap().lrca_count, 2);
}

#[test]
fn hit_makes_cached_context_current() {
    let (os, mut ctx) = decode_context(8);
    let a = ctx
        .switch_context_with_option(MediaFunction::VdboxDecode, &single(ComponentType::Decode))
        .unwrap();
    let _b = ctx
        .switch_context_with_option(MediaFunction::VdboxDecodeWa, &single(ComponentType::Decode))
        .unwrap();
    let ctx_a = a.lock().gpu_context().unwrap();
    assert_ne!(os.current_gpu_context(), Some(ctx_a));

    ctx.switch_context_with_option(MediaFunction::VdboxDecode, &single(ComponentType::Decode))
        .unwrap();
    assert_eq!(os.current_gpu_context(), Some(ctx_a));
}

// ----------------------------------------------------------------------------
// Eviction
// ----------------------------------------------------------------------------

#[test]
fn lru_entry_evicted_and_destroyed() {
    let (os, mut ctx) = decode_context(2);
    let decode = single(ComponentType::Decode);

    let ctx_a = ctx
        .switch_context_with_option(MediaFunction::VdboxDecode, &decode)
        .unwrap()
        .lock()
        .gpu_context()
        .unwrap();
    let ctx_b = ctx
        .switch_context_with_option(MediaFunction::VdboxDecodeWa, &decode)
        .unwrap()
        .lock()
        .gpu_context()
        .unwrap();
    // Touch A so B becomes least recently used.
    ctx.switch_context_with_option(MediaFunction::VdboxDecode, &decode)
        .unwrap();

    let two_pipe = ScalabilityOption::with_pipes(ComponentType::Decode, 2, 2);
    ctx.switch_context_with_option(MediaFunction::VdboxDecode, &two_pipe)
        .unwrap();

    assert_eq!(ctx.len(), 2);
    assert_eq!(ctx.stats().evictions, 1);
    assert_eq!(os.count_calls(|c| *c == OsCall::DestroyGpuContext(ctx_b)), 1);
    assert_eq!(os.count_calls(|c| *c == OsCall::DestroyGpuContext(ctx_a)), 0);
    assert!(os.context_node(ctx_b).is_none());
    assert_eq!(os.live_context_count(), 2);
}

#[test]
fn held_entries_are_not_evicted() {
    let (os, mut ctx) = decode_context(1);
    let held = ctx
        .switch_context_with_option(MediaFunction::VdboxDecode, &single(ComponentType::Decode))
        .unwrap();

    let err = ctx
        .switch_context_with_option(MediaFunction::VdboxDecodeWa, &single(ComponentType::Decode))
        .unwrap_err();
    assert!(matches!(err, ContextError::CacheFull { capacity: 1 }));
    assert_eq!(os.live_context_count(), 1);

    drop(held);
    ctx.switch_context_with_option(MediaFunction::VdboxDecodeWa, &single(ComponentType::Decode))
        .unwrap();
    assert_eq!(ctx.len(), 1);
    assert_eq!(ctx.stats().evictions, 1);
    assert_eq!(os.live_context_count(), 1);
}

#[test]
fn failed_creation_on_full_cache_keeps_lru_entry() {
    let (os, mut ctx) = decode_context(1);
    let decode = single(ComponentType::Decode);
    let cached = ctx
        .switch_context_with_option(MediaFunction::VdboxDecode, &decode)
        .unwrap()
        .lock()
        .gpu_context()
        .unwrap();

    os.set_fail_context_creation(true);
    let err = ctx
        .switch_context_with_option(MediaFunction::VdboxDecodeWa, &decode)
        .unwrap_err();
    assert!(matches!(err, ContextError::Mos(MosError::GpuContextCreation(_))));
    assert_eq!(ctx.len(), 1);
    assert_eq!(ctx.stats().evictions, 0);
    assert_eq!(os.count_calls(|c| *c == OsCall::DestroyGpuContext(cached)), 0);

    os.set_fail_context_creation(false);
    let hits = ctx.stats().hits;
    let again = ctx
        .switch_context_with_option(MediaFunction::VdboxDecode, &decode)
        .unwrap();
    assert_eq!(again.lock().gpu_context(), Some(cached));
    assert_eq!(ctx.stats().hits, hits + 1);
}

// ----------------------------------------------------------------------------
// Failure paths
// ----------------------------------------------------------------------------

#[test]
fn missing_engine_is_invalid_node() {
    let (os, mut ctx) = context_with(
        ComponentType::Vp,
        SoftwareOsConfig {
            vebox_count: 0,
            ..SoftwareOsConfig::default()
        },
        8,
    );
    let err = ctx
        .switch_context_with_option(MediaFunction::VeboxVpp, &single(ComponentType::Vp))
        .unwrap_err();
    assert!(matches!(err, ContextError::InvalidNode(MediaFunction::VeboxVpp)));
    assert!(ctx.is_empty());
    assert_eq!(os.live_context_count(), 0);
    assert_eq!(os.count_calls(|c| matches!(c, OsCall::CreateGpuContext { .. })), 0);
}

#[test]
fn context_creation_failure_leaves_nothing_behind() {
    let (os, mut ctx) = context_with(
        ComponentType::Decode,
        SoftwareOsConfig {
            fail_context_creation: true,
            ..SoftwareOsConfig::default()
        },
        8,
    );
    let two_pipe = ScalabilityOption::with_pipes(ComponentType::Decode, 2, 2);
    let err = ctx
        .switch_context_with_option(MediaFunction::VdboxDecode, &two_pipe)
        .unwrap_err();

    assert!(matches!(err, ContextError::Mos(MosError::GpuContextCreation(_))));
    assert!(ctx.is_empty());
    // Semaphores allocated by the multi-pipe instance are freed again.
    assert_eq!(os.live_resource_count(), 0);
    assert!(!os.multi_engine_enabled(ComponentType::Decode));
}

// ----------------------------------------------------------------------------
// Render engine tracking
// ----------------------------------------------------------------------------

#[test]
fn render_engine_use_tracked() {
    let (_os, mut ctx) = context_with(ComponentType::Vp, SoftwareOsConfig::default(), 8);
    ctx.switch_context_with_option(MediaFunction::VeboxVpp, &single(ComponentType::Vp))
        .unwrap();
    assert!(!ctx.is_render_engine_used());

    let compute = ctx
        .switch_context_with_option(MediaFunction::ComputeVpp, &single(ComponentType::Vp))
        .unwrap();
    assert!(ctx.is_render_engine_used());
    assert_eq!(compute.lock().gpu_node(), Some(GpuNode::Compute));
}

#[test]
fn compute_without_compute_engine_runs_on_render() {
    let (os, mut ctx) = context_with(
        ComponentType::Vp,
        SoftwareOsConfig {
            compute_count: 0,
            ..SoftwareOsConfig::default()
        },
        8,
    );
    let shared = ctx
        .switch_context_with_option(MediaFunction::ComputeVpp, &single(ComponentType::Vp))
        .unwrap();
    let handle = shared.lock().gpu_context().unwrap();
    assert_eq!(os.context_node(handle), Some(GpuNode::Render3D));
    assert!(ctx.is_render_engine_used());
}

// ----------------------------------------------------------------------------
// Decode balancing
// ----------------------------------------------------------------------------

#[test]
fn round_robin_alternates_video_nodes() {
    let (_os, mut ctx) = decode_context(8);
    let option = single(ComponentType::Decode);
    let frames: Vec<_> = (0..4)
        .map(|frame| {
            ctx.switch_context_for_decode(MediaFunction::VdboxDecode, &option, frame)
                .unwrap()
        })
        .collect();

    assert_eq!(ctx.len(), 2);
    assert!(Arc::ptr_eq(&frames[0], &frames[2]));
    assert!(Arc::ptr_eq(&frames[1], &frames[3]));
    assert_eq!(frames[0].lock().gpu_node(), Some(GpuNode::Video));
    assert_eq!(frames[1].lock().gpu_node(), Some(GpuNode::Video2));
}

#[test]
fn single_vdbox_never_reassigns() {
    let (_os, mut ctx) = context_with(
        ComponentType::Decode,
        SoftwareOsConfig {
            vdbox_count: 1,
            ..SoftwareOsConfig::default()
        },
        8,
    );
    let option = single(ComponentType::Decode);
    for frame in 0..3 {
        ctx.switch_context_for_decode(MediaFunction::VdboxDecode, &option, frame)
            .unwrap();
    }
    assert_eq!(ctx.len(), 1);
}

#[test]
fn no_balancing_keeps_one_context() {
    let os = Arc::new(SoftwareOs::new(SoftwareOsConfig::default()));
    let mut ctx = MediaContext::with_balancer(
        ComponentType::Decode,
        os.clone(),
        &DriverConfig::default(),
        Box::new(NoBalancing),
    );
    let option = single(ComponentType::Decode);
    let first = ctx
        .switch_context_for_decode(MediaFunction::VdboxDecode, &option, 0)
        .unwrap();
    let second = ctx
        .switch_context_for_decode(MediaFunction::VdboxDecode, &option, 1)
        .unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(ctx.stats().hits, 1);
}

// ----------------------------------------------------------------------------
// Teardown
// ----------------------------------------------------------------------------

#[test]
fn destroy_releases_every_context_and_semaphore() {
    let (os, mut ctx) = decode_context(8);
    ctx.switch_context_with_option(MediaFunction::VdboxDecode, &single(ComponentType::Decode))
        .unwrap();
    let two_pipe = ScalabilityOption::with_pipes(ComponentType::Decode, 2, 2);
    ctx.switch_context_with_option(MediaFunction::VdboxDecode, &two_pipe)
        .unwrap();
    assert!(os.live_resource_count() > 0);

    ctx.destroy().unwrap();
    assert_eq!(os.live_context_count(), 0);
    assert_eq!(os.live_resource_count(), 0);
    assert!(ctx.is_destroyed());
}

#[test]
fn destroy_with_outstanding_handle_still_tears_down() {
    let (os, mut ctx) = decode_context(8);
    let two_pipe = ScalabilityOption::with_pipes(ComponentType::Decode, 2, 2);
    let held = ctx
        .switch_context_with_option(MediaFunction::VdboxDecode, &two_pipe)
        .unwrap();

    ctx.destroy().unwrap();
    assert_eq!(os.live_context_count(), 0);
    assert_eq!(os.live_resource_count(), 0);
    assert_eq!(held.lock().state(), md_scalability::ScalabilityState::Destroyed);
}
