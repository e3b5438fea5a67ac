//! GPU context cache.
//!
//! `MediaContext` keeps one GPU context plus one scalability instance per
//! (function, option) pair a pipeline has asked for. Creating a GPU context
//! is expensive, so repeat requests for an equivalent workload get the
//! cached instance back. The table is bounded; when it is full the
//! least-recently-used entry that no caller still holds is evicted and its
//! GPU context destroyed.

use std::sync::Arc;

use md_common::{
    ComponentType, ContextError, ContextResult, DriverConfig, GpuContextCreateOptions,
    GpuContextHandle, GpuNode, MediaFunction, MosInterface, ScalabilityConfig, ScalabilityError,
};
use md_scalability::{
    create_scalability, gpu_ctx_options_matched, MediaScalability, ScalabilityOption,
    ScalabilityParams,
};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::balancer::{DecodeNodeBalancer, RoundRobinBalancer};
use crate::node::{function_to_node, NodeLimit};

/// Scalability instance shared between the cache and the pipeline using it.
pub type SharedScalability = Arc<Mutex<Box<dyn MediaScalability>>>;

/// Counters describing cache behaviour since creation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ContextStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// One cached GPU context.
///
/// The option and context-create options are copied out of the scalability
/// instance at creation so lookups never need its lock.
struct ContextEntry {
    function: MediaFunction,
    node: GpuNode,
    gpu_context: GpuContextHandle,
    option: ScalabilityOption,
    ctx_option: GpuContextCreateOptions,
    scalability: SharedScalability,
    last_used: u64,
}

impl ContextEntry {
    fn matches(
        &self,
        function: MediaFunction,
        option: &ScalabilityOption,
        ctx_option: &GpuContextCreateOptions,
        node: Option<GpuNode>,
    ) -> bool {
        self.function == function
            && node.map_or(true, |n| n == self.node)
            && self.option.is_option_matched(option)
            && gpu_ctx_options_matched(&self.ctx_option, ctx_option)
    }

    /// Nobody outside the cache holds the scalability instance.
    fn is_idle(&self) -> bool {
        Arc::strong_count(&self.scalability) == 1
    }
}

/// GPU context cache and router for one component.
///
/// # Thread safety
///
/// `MediaContext` is `Send` but not `Sync`. Share it behind a
/// `parking_lot::Mutex` when several threads switch contexts.
pub struct MediaContext {
    os: Arc<dyn MosInterface>,
    component: ComponentType,
    config: ScalabilityConfig,
    capacity: usize,
    node_limit: NodeLimit,
    balancer: Box<dyn DecodeNodeBalancer>,
    entries: Vec<ContextEntry>,
    /// Monotonic access counter used for LRU ordering.
    tick: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
    render_engine_used: bool,
    destroyed: bool,
}

impl MediaContext {
    /// Create an empty cache with the round-robin decode balancer.
    pub fn new(component: ComponentType, os: Arc<dyn MosInterface>, config: &DriverConfig) -> Self {
        Self::with_balancer(component, os, config, Box::new(RoundRobinBalancer))
    }

    pub fn with_balancer(
        component: ComponentType,
        os: Arc<dyn MosInterface>,
        config: &DriverConfig,
        balancer: Box<dyn DecodeNodeBalancer>,
    ) -> Self {
        let node_limit = NodeLimit::from_os(os.as_ref());
        let capacity = config.context.max_context_attributes.max(1);
        debug!(?component, capacity, ?node_limit, "Created media context");
        Self {
            os,
            component,
            config: config.scalability.clone(),
            capacity,
            node_limit,
            balancer,
            entries: Vec::new(),
            tick: 0,
            hits: 0,
            misses: 0,
            evictions: 0,
            render_engine_used: false,
            destroyed: false,
        }
    }

    /// Decide a scalability option for `params` and switch to a context for it.
    pub fn switch_context(
        &mut self,
        function: MediaFunction,
        params: &ScalabilityParams,
    ) -> ContextResult<SharedScalability> {
        self.ensure_live()?;
        let option = ScalabilityOption::new(params, &self.config)?;
        self.switch_context_with_option(function, &option)
    }

    /// Return the cached scalability instance for (`function`, `option`),
    /// creating a GPU context for it on a miss.
    pub fn switch_context_with_option(
        &mut self,
        function: MediaFunction,
        option: &ScalabilityOption,
    ) -> ContextResult<SharedScalability> {
        self.switch(function, option, None)
    }

    /// Like [`switch_context_with_option`](Self::switch_context_with_option),
    /// but lets the decode balancer pin this frame to a specific video node.
    pub fn switch_context_for_decode(
        &mut self,
        function: MediaFunction,
        option: &ScalabilityOption,
        frame_number: u64,
    ) -> ContextResult<SharedScalability> {
        let preferred = self
            .balancer
            .preferred_node(function, frame_number, &self.node_limit);
        if let Some(node) = preferred {
            debug!(frame_number, node = %node, "Decode frame reassigned");
        }
        self.switch(function, option, preferred)
    }

    fn switch(
        &mut self,
        function: MediaFunction,
        option: &ScalabilityOption,
        node: Option<GpuNode>,
    ) -> ContextResult<SharedScalability> {
        self.ensure_live()?;
        if option.component() != self.component {
            return Err(ScalabilityError::InvalidParameter(format!(
                "{:?} option on a {:?} media context",
                option.component(),
                self.component
            ))
            .into());
        }

        let ctx_option = option.gpu_ctx_create_option();
        self.tick += 1;
        let tick = self.tick;
        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|e| e.matches(function, option, &ctx_option, node))
        {
            self.os.set_gpu_context(entry.gpu_context)?;
            entry.last_used = tick;
            self.hits += 1;
            return Ok(Arc::clone(&entry.scalability));
        }

        self.misses += 1;
        self.create_context(function, option, ctx_option, node)
    }

    fn create_context(
        &mut self,
        function: MediaFunction,
        option: &ScalabilityOption,
        ctx_option: GpuContextCreateOptions,
        node_override: Option<GpuNode>,
    ) -> ContextResult<SharedScalability> {
        let node = match node_override {
            Some(node) => node,
            None => function_to_node(function, &self.node_limit)?,
        };
        // Chosen now so a full cache fails fast, evicted only once the
        // replacement exists.
        let victim = if self.entries.len() >= self.capacity {
            Some(self.lru_victim()?)
        } else {
            None
        };

        let mut scalability = create_scalability(self.os.clone(), &self.config, option)?;
        let gpu_context = match self.os.create_gpu_context(node, &ctx_option) {
            Ok(handle) => handle,
            Err(e) => {
                error!(?function, node = %node, error = %e, "GPU context creation failed");
                if let Err(cleanup) = scalability.destroy() {
                    warn!(error = %cleanup, "Scalability cleanup after failed context creation");
                }
                return Err(e.into());
            }
        };
        scalability.bind_gpu_context(gpu_context, node);
        if let Err(e) = self.os.set_gpu_context(gpu_context) {
            if let Err(cleanup) = scalability.destroy() {
                warn!(error = %cleanup, "Scalability cleanup after failed context switch");
            }
            if let Err(cleanup) = self.os.destroy_gpu_context(gpu_context) {
                warn!(ctx = %gpu_context, error = %cleanup, "GPU context cleanup failed");
            }
            return Err(e.into());
        }

        if function.uses_render_engine() || node == GpuNode::Render3D {
            self.render_engine_used = true;
        }
        info!(
            ?function,
            node = %node,
            ctx = %gpu_context,
            pipes = option.num_pipe(),
            "Created media GPU context"
        );

        let shared: SharedScalability = Arc::new(Mutex::new(scalability));
        self.entries.push(ContextEntry {
            function,
            node,
            gpu_context,
            option: option.clone(),
            ctx_option,
            scalability: Arc::clone(&shared),
            last_used: self.tick,
        });
        if let Some(victim) = victim {
            self.evict(victim);
        }
        Ok(shared)
    }

    /// Index of the least recently used entry nobody else holds.
    fn lru_victim(&self) -> ContextResult<usize> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_idle())
            .min_by_key(|(_, e)| e.last_used)
            .map(|(i, _)| i)
            .ok_or(ContextError::CacheFull {
                capacity: self.capacity,
            })
    }

    fn evict(&mut self, index: usize) {
        let entry = self.entries.remove(index);
        info!(
            function = ?entry.function,
            ctx = %entry.gpu_context,
            "Evicting media GPU context"
        );
        self.evictions += 1;
        if let Err(e) = release_entry(self.os.as_ref(), entry) {
            warn!(error = %e, "Evicted media GPU context was not fully released");
        }
    }

    /// Whether any render or compute context has been created.
    pub fn is_render_engine_used(&self) -> bool {
        self.render_engine_used
    }

    pub fn node_limit(&self) -> NodeLimit {
        self.node_limit
    }

    pub fn component(&self) -> ComponentType {
        self.component
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> ContextStats {
        ContextStats {
            entries: self.entries.len(),
            capacity: self.capacity,
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Destroy every cached scalability instance and GPU context.
    ///
    /// Teardown continues past individual failures; the first one is
    /// returned. Calling it again is a no-op.
    pub fn destroy(&mut self) -> ContextResult<()> {
        if self.destroyed {
            return Ok(());
        }
        self.destroyed = true;
        let mut first_err = None;
        for entry in self.entries.drain(..) {
            if let Err(e) = release_entry(self.os.as_ref(), entry) {
                first_err.get_or_insert(e);
            }
        }
        info!(component = ?self.component, "Destroyed media context");
        first_err.map_or(Ok(()), Err)
    }

    fn ensure_live(&self) -> ContextResult<()> {
        if self.destroyed {
            Err(ContextError::Destroyed)
        } else {
            Ok(())
        }
    }
}

/// Tear down one entry: scalability state first, then its GPU context.
fn release_entry(os: &dyn MosInterface, entry: ContextEntry) -> ContextResult<()> {
    let ContextEntry {
        gpu_context,
        scalability,
        ..
    } = entry;
    let mut first_err: Option<ContextError> = None;
    match Arc::try_unwrap(scalability) {
        Ok(mutex) => {
            if let Err(e) = mutex.into_inner().destroy() {
                first_err = Some(e.into());
            }
        }
        Err(shared) => {
            warn!(ctx = %gpu_context, "Scalability still referenced at teardown");
            match shared.try_lock() {
                Some(mut guard) => {
                    if let Err(e) = guard.destroy() {
                        first_err = Some(e.into());
                    }
                }
                None => warn!(ctx = %gpu_context, "Scalability locked, leaving cleanup to its owner"),
            }
        }
    }
    if let Err(e) = os.destroy_gpu_context(gpu_context) {
        warn!(ctx = %gpu_context, error = %e, "Failed to destroy GPU context");
        first_err.get_or_insert(e.into());
    }
    first_err.map_or(Ok(()), Err)
}

impl Drop for MediaContext {
    fn drop(&mut self) {
        if let Err(e) = self.destroy() {
            warn!(error = %e, "Media context teardown failed");
        }
    }
}

impl std::fmt::Debug for MediaContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaContext")
            .field("component", &self.component)
            .field("entries", &self.entries.len())
            .field("capacity", &self.capacity)
            .field("node_limit", &self.node_limit)
            .field("render_engine_used", &self.render_engine_used)
            .field("destroyed", &self.destroyed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use md_common::{Resolution, SurfaceFormat};
    use md_gpu_hal::{SoftwareOs, SoftwareOsConfig};

    fn setup(capacity: usize) -> (Arc<SoftwareOs>, MediaContext) {
        let os = Arc::new(SoftwareOs::new(SoftwareOsConfig::default()));
        let mut config = DriverConfig::default();
        config.context.max_context_attributes = capacity;
        let ctx = MediaContext::new(ComponentType::Decode, os.clone(), &config);
        (os, ctx)
    }

    fn single() -> ScalabilityOption {
        ScalabilityOption::single_pipe(ComponentType::Decode)
    }

    // ── Lookup ──

    #[test]
    fn hit_returns_same_instance() {
        let (os, mut ctx) = setup(4);
        let a = ctx
            .switch_context_with_option(MediaFunction::VdboxDecode, &single())
            .unwrap();
        let b = ctx
            .switch_context_with_option(MediaFunction::VdboxDecode, &single())
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(ctx.len(), 1);
        assert_eq!(os.live_context_count(), 1);
        let stats = ctx.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
    }

    #[test]
    fn params_route_through_option_decision() {
        let (_os, mut ctx) = setup(4);
        let params = ScalabilityParams::decode(Resolution::new(1920, 1080), SurfaceFormat::Nv12, 2);
        let shared = ctx
            .switch_context(MediaFunction::VdboxDecode, &params)
            .unwrap();
        let guard = shared.lock();
        assert_eq!(guard.pipe_num(), 1);
        assert!(guard.gpu_context().is_some());
        assert_eq!(guard.gpu_node(), Some(GpuNode::Video));
    }

    #[test]
    fn component_mismatch_rejected() {
        let (_os, mut ctx) = setup(4);
        let option = ScalabilityOption::single_pipe(ComponentType::Encode);
        assert!(matches!(
            ctx.switch_context_with_option(MediaFunction::VdboxEncode, &option),
            Err(ContextError::Scalability(ScalabilityError::InvalidParameter(_)))
        ));
        assert!(ctx.is_empty());
    }

    // ── Teardown ──

    #[test]
    fn destroy_is_idempotent_and_final() {
        let (os, mut ctx) = setup(4);
        ctx.switch_context_with_option(MediaFunction::VdboxDecode, &single())
            .unwrap();
        ctx.destroy().unwrap();
        ctx.destroy().unwrap();
        assert_eq!(os.live_context_count(), 0);
        assert!(matches!(
            ctx.switch_context_with_option(MediaFunction::VdboxDecode, &single()),
            Err(ContextError::Destroyed)
        ));
    }

    #[test]
    fn drop_releases_contexts() {
        let (os, mut ctx) = setup(4);
        ctx.switch_context_with_option(MediaFunction::VdboxDecode, &single())
            .unwrap();
        drop(ctx);
        assert_eq!(os.live_context_count(), 0);
    }
}
