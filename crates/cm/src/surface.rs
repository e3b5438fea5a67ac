//! Surface manager: buffers, 2D/3D surfaces and their aliases.
//!
//! Every surface kind lives in one homogeneous table; the kind is a closed
//! enum carrying only what that kind needs. Surfaces referenced by in-flight
//! tasks are counted busy; an application destroy of a busy surface is
//! deferred until the queues report the work finished.

use std::collections::HashMap;

use md_common::{CmError, CmResult, MosInterface, ResourceDesc, ResourceHandle, SurfaceFormat};
use tracing::{debug, warn};

use crate::lock_order::{LockRank, RankedMutex};
use crate::slot::{Handle, SlotArray};

pub const MIN_SURF_WIDTH: u32 = 1;
pub const MIN_SURF_HEIGHT: u32 = 1;
pub const MIN_SURF_DEPTH: u32 = 2;
pub const MAX_1D_SURF_WIDTH: u32 = 0x4000_0000;
pub const MAX_2D_SURF_WIDTH: u32 = 16384;
pub const MAX_2D_SURF_HEIGHT: u32 = 16384;
pub const MAX_3D_SURF_WIDTH: u32 = 2048;
pub const MAX_3D_SURF_HEIGHT: u32 = 2048;
pub const MAX_3D_SURF_DEPTH: u32 = 2048;

/// Host memory handed to UP surfaces must be aligned to this.
pub const PAGE_SIZE: usize = 0x1000;

pub const SURFACE_2D_FORMATS: [SurfaceFormat; 12] = [
    SurfaceFormat::A8R8G8B8,
    SurfaceFormat::X8R8G8B8,
    SurfaceFormat::A8B8G8R8,
    SurfaceFormat::R32F,
    SurfaceFormat::L8,
    SurfaceFormat::Nv12,
    SurfaceFormat::P010,
    SurfaceFormat::P016,
    SurfaceFormat::Yuy2,
    SurfaceFormat::Y210,
    SurfaceFormat::Y410,
    SurfaceFormat::Ayuv,
];

pub const SURFACE_3D_FORMATS: [SurfaceFormat; 2] =
    [SurfaceFormat::X8R8G8B8, SurfaceFormat::A8R8G8B8];

/// Serializes 2D surface user-data access across every device in the
/// process.
pub(crate) static SURF2D_USER_DATA_LOCK: RankedMutex<()> =
    RankedMutex::new(LockRank::Surf2DUserData, ());

pub type SurfaceId = Handle<Surface>;

/// What a surface is.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SurfaceKind {
    Buffer { size: u32 },
    BufferUp { size: u32, host_addr: usize },
    BufferSvm { size: u32, host_addr: usize },
    Surface2D { width: u32, height: u32, format: SurfaceFormat },
    Surface2DUp { width: u32, height: u32, format: SurfaceFormat, host_addr: usize },
    Surface3D { width: u32, height: u32, depth: u32, format: SurfaceFormat },
    /// Sampler view of an existing 2D surface.
    SamplerSurface2D { source: SurfaceId },
    /// Motion-estimation view over a current frame and its references.
    VmeSurface {
        current: SurfaceId,
        forward: Vec<SurfaceId>,
        backward: Vec<SurfaceId>,
    },
}

impl SurfaceKind {
    pub fn class(&self) -> SurfaceClass {
        match self {
            Self::Buffer { .. } | Self::BufferUp { .. } | Self::BufferSvm { .. } => SurfaceClass::Buffer,
            Self::Surface2D { .. } => SurfaceClass::Surface2D,
            Self::Surface2DUp { .. } => SurfaceClass::Surface2DUp,
            Self::Surface3D { .. } => SurfaceClass::Surface3D,
            Self::SamplerSurface2D { .. } | Self::VmeSurface { .. } => SurfaceClass::Alias,
        }
    }

    pub fn is_2d(&self) -> bool {
        matches!(self, Self::Surface2D { .. } | Self::Surface2DUp { .. })
    }
}

/// Counting classes for the per-kind caps.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum SurfaceClass {
    Buffer,
    Surface2D,
    Surface2DUp,
    Surface3D,
    Alias,
}

/// Backing storage of a surface.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SurfaceResource {
    /// Allocated by the device; freed when the surface is destroyed.
    Owned(ResourceHandle),
    /// Supplied by the caller; never freed by the device.
    Borrowed(ResourceHandle),
    /// Application host memory.
    Host,
    /// Views of other surfaces.
    None,
}

/// How a destroy request treats a surface still used by queued work.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DestroyKind {
    /// Defer until the work retires.
    AppDestroy,
    /// Destroy only if unreferenced.
    Delayed,
    /// Caller has already drained the queues.
    Force,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DestroyOutcome {
    Destroyed,
    Deferred,
}

#[derive(Debug)]
pub struct Surface {
    kind: SurfaceKind,
    resource: SurfaceResource,
    busy: u32,
    delayed_destroy: bool,
    user_data: HashMap<u32, Vec<u8>>,
}

impl Surface {
    pub fn kind(&self) -> &SurfaceKind {
        &self.kind
    }

    pub fn resource(&self) -> SurfaceResource {
        self.resource
    }

    /// Number of in-flight tasks referencing the surface.
    pub fn busy_count(&self) -> u32 {
        self.busy
    }

    pub fn is_delayed_destroy(&self) -> bool {
        self.delayed_destroy
    }
}

/// Per-class surface caps.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SurfaceLimits {
    pub max_buffers: u32,
    pub max_2d: u32,
    pub max_2d_up: u32,
    pub max_3d: u32,
    pub max_total: u32,
}

// ---------------------------------------------------------------------------
// Validation (no table access)
// ---------------------------------------------------------------------------

pub fn validate_buffer_size(size: u32) -> CmResult<()> {
    if !(MIN_SURF_WIDTH..=MAX_1D_SURF_WIDTH).contains(&size) {
        return Err(CmError::InvalidWidth(size));
    }
    Ok(())
}

/// Host pointers for UP buffers: non-null and page aligned.
pub fn validate_host_addr(host_addr: usize) -> CmResult<()> {
    if host_addr == 0 {
        return Err(CmError::InvalidArgValue("null host memory".into()));
    }
    if host_addr % PAGE_SIZE != 0 {
        return Err(CmError::InvalidArgValue(format!(
            "host memory {host_addr:#x} is not 4K aligned"
        )));
    }
    Ok(())
}

pub fn validate_2d(width: u32, height: u32, format: SurfaceFormat) -> CmResult<()> {
    if !(MIN_SURF_WIDTH..=MAX_2D_SURF_WIDTH).contains(&width) {
        return Err(CmError::InvalidWidth(width));
    }
    if !(MIN_SURF_HEIGHT..=MAX_2D_SURF_HEIGHT).contains(&height) {
        return Err(CmError::InvalidHeight(height));
    }
    if !SURFACE_2D_FORMATS.contains(&format) {
        return Err(CmError::SurfaceFormatNotSupported(format!("{format:?} for 2D")));
    }
    if is_420(format) && height % 2 != 0 {
        return Err(CmError::InvalidHeight(height));
    }
    Ok(())
}

pub fn validate_3d(width: u32, height: u32, depth: u32, format: SurfaceFormat) -> CmResult<()> {
    if !(MIN_SURF_WIDTH..=MAX_3D_SURF_WIDTH).contains(&width) {
        return Err(CmError::InvalidWidth(width));
    }
    if !(MIN_SURF_HEIGHT..=MAX_3D_SURF_HEIGHT).contains(&height) {
        return Err(CmError::InvalidHeight(height));
    }
    if !(MIN_SURF_DEPTH..=MAX_3D_SURF_DEPTH).contains(&depth) {
        return Err(CmError::InvalidDepth(depth));
    }
    if !SURFACE_3D_FORMATS.contains(&format) {
        return Err(CmError::SurfaceFormatNotSupported(format!("{format:?} for 3D")));
    }
    Ok(())
}

fn is_420(format: SurfaceFormat) -> bool {
    matches!(format, SurfaceFormat::Nv12 | SurfaceFormat::P010 | SurfaceFormat::P016)
}

/// Bytes the OS layer must allocate for a surface of this kind.
pub fn allocation_size(kind: &SurfaceKind) -> CmResult<u32> {
    let bytes: u64 = match *kind {
        SurfaceKind::Buffer { size } | SurfaceKind::BufferSvm { size, .. } => u64::from(size),
        SurfaceKind::Surface2D { width, height, format } => {
            let plane = u64::from(width) * u64::from(height) * u64::from(format.bytes_per_pixel());
            if is_420(format) {
                plane * 3 / 2
            } else {
                plane
            }
        }
        SurfaceKind::Surface3D { width, height, depth, format } => {
            u64::from(width) * u64::from(height) * u64::from(depth) * u64::from(format.bytes_per_pixel())
        }
        _ => 0,
    };
    u32::try_from(bytes).map_err(|_| CmError::InvalidArgValue(format!("surface of {bytes} bytes")))
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Surface table plus per-class counters and the delayed-destroy list.
pub struct SurfaceManager {
    table: SlotArray<Surface>,
    limits: SurfaceLimits,
    counts: HashMap<SurfaceClass, u32>,
    delayed: Vec<SurfaceId>,
}

impl SurfaceManager {
    pub fn new(limits: SurfaceLimits) -> Self {
        Self {
            table: SlotArray::new("surface", limits.max_total),
            limits,
            counts: HashMap::new(),
            delayed: Vec::new(),
        }
    }

    pub fn limits(&self) -> SurfaceLimits {
        self.limits
    }

    pub fn count(&self, class: SurfaceClass) -> u32 {
        self.counts.get(&class).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn get(&self, id: SurfaceId) -> CmResult<&Surface> {
        self.table.get(id)
    }

    pub fn contains(&self, id: SurfaceId) -> bool {
        self.table.contains(id)
    }

    /// Per-class cap check, done before any allocation.
    pub fn check_class_capacity(&self, class: SurfaceClass) -> CmResult<()> {
        let max = match class {
            SurfaceClass::Buffer => self.limits.max_buffers,
            SurfaceClass::Surface2D => self.limits.max_2d,
            SurfaceClass::Surface2DUp => self.limits.max_2d_up,
            SurfaceClass::Surface3D => self.limits.max_3d,
            SurfaceClass::Alias => return Ok(()),
        };
        if self.count(class) >= max {
            return Err(CmError::ExceedSurfaceAmount { max });
        }
        Ok(())
    }

    pub fn has_free_slot(&self) -> bool {
        self.table.first_free_index().is_some()
    }

    /// Store a new surface. Fails with `ExceedSurfaceAmount` when the table
    /// itself is full; the caller owns the resource in that case.
    pub fn insert(&mut self, kind: SurfaceKind, resource: SurfaceResource) -> CmResult<SurfaceId> {
        let class = kind.class();
        self.check_class_capacity(class)?;
        let surface = Surface {
            kind,
            resource,
            busy: 0,
            delayed_destroy: false,
            user_data: HashMap::new(),
        };
        let id = self.table.insert(surface).map_err(|_| CmError::ExceedSurfaceAmount {
            max: self.limits.max_total,
        })?;
        *self.counts.entry(class).or_insert(0) += 1;
        debug!(surface = ?id, ?class, "Surface created");
        Ok(id)
    }

    /// Count one more in-flight reference on each surface.
    pub fn mark_busy(&mut self, ids: &[SurfaceId]) -> CmResult<()> {
        for id in ids {
            self.table.get(*id)?;
        }
        for id in ids {
            self.table.get_mut(*id)?.busy += 1;
        }
        Ok(())
    }

    /// Drop one in-flight reference from each surface still alive.
    pub fn release_busy(&mut self, ids: &[SurfaceId]) {
        for id in ids {
            if let Ok(surface) = self.table.get_mut(*id) {
                surface.busy = surface.busy.saturating_sub(1);
            }
        }
    }

    pub fn destroy(
        &mut self,
        os: &dyn MosInterface,
        id: SurfaceId,
        kind: DestroyKind,
    ) -> CmResult<DestroyOutcome> {
        let surface = self.table.get_mut(id)?;
        if surface.busy > 0 {
            match kind {
                DestroyKind::AppDestroy => {
                    if !surface.delayed_destroy {
                        surface.delayed_destroy = true;
                        self.delayed.push(id);
                    }
                    warn!(surface = ?id, busy = surface.busy, "Surface still in use, destroy deferred");
                    return Ok(DestroyOutcome::Deferred);
                }
                DestroyKind::Delayed => return Err(CmError::SurfaceInUse(id.index())),
                DestroyKind::Force => {}
            }
        }
        self.free(os, id)?;
        Ok(DestroyOutcome::Destroyed)
    }

    /// Destroy every deferred surface whose work has retired. Returns how
    /// many were freed.
    pub fn refresh_delayed(&mut self, os: &dyn MosInterface) -> usize {
        let pending = std::mem::take(&mut self.delayed);
        let mut freed = 0;
        for id in pending {
            let idle = self.table.get(id).map(|s| s.busy == 0);
            match idle {
                Ok(true) => match self.free(os, id) {
                    Ok(()) => freed += 1,
                    Err(e) => warn!(surface = ?id, error = %e, "Delayed surface destroy failed"),
                },
                Ok(false) => self.delayed.push(id),
                Err(_) => {}
            }
        }
        freed
    }

    pub fn delayed_count(&self) -> usize {
        self.delayed.len()
    }

    /// Attach user data to a 2D surface under the process-wide lock.
    pub fn set_user_data(&mut self, id: SurfaceId, key: u32, data: Vec<u8>) -> CmResult<()> {
        let surface = self.table.get_mut(id)?;
        if !surface.kind.is_2d() {
            return Err(CmError::InvalidArgValue("user data needs a 2D surface".into()));
        }
        let _serialized = SURF2D_USER_DATA_LOCK.lock();
        surface.user_data.insert(key, data);
        Ok(())
    }

    pub fn user_data(&self, id: SurfaceId, key: u32) -> CmResult<Option<Vec<u8>>> {
        let surface = self.table.get(id)?;
        let _serialized = SURF2D_USER_DATA_LOCK.lock();
        Ok(surface.user_data.get(&key).cloned())
    }

    /// Free every surface. Teardown only.
    pub fn destroy_all(&mut self, os: &dyn MosInterface) -> CmResult<()> {
        let mut first_err = None;
        for (id, surface) in self.table.drain() {
            if surface.busy > 0 {
                warn!(surface = ?id, busy = surface.busy, "Freeing surface with in-flight references");
            }
            if let SurfaceResource::Owned(handle) = surface.resource {
                if let Err(e) = os.free_resource(handle) {
                    first_err.get_or_insert(CmError::from(e));
                }
            }
        }
        self.counts.clear();
        self.delayed.clear();
        first_err.map_or(Ok(()), Err)
    }

    fn free(&mut self, os: &dyn MosInterface, id: SurfaceId) -> CmResult<()> {
        let surface = self.table.remove(id)?;
        let class = surface.kind.class();
        if let Some(count) = self.counts.get_mut(&class) {
            *count = count.saturating_sub(1);
        }
        self.delayed.retain(|d| *d != id);
        debug!(surface = ?id, ?class, "Surface destroyed");
        if let SurfaceResource::Owned(handle) = surface.resource {
            os.free_resource(handle)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for SurfaceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SurfaceManager")
            .field("live", &self.table.len())
            .field("limits", &self.limits)
            .field("delayed", &self.delayed.len())
            .finish()
    }
}

/// Allocate the owned backing resource for `kind`, if it has one.
pub(crate) fn allocate_backing(
    os: &dyn MosInterface,
    kind: &SurfaceKind,
) -> CmResult<SurfaceResource> {
    let resource = match kind {
        SurfaceKind::Buffer { .. } | SurfaceKind::BufferSvm { .. } | SurfaceKind::Surface2D { .. } | SurfaceKind::Surface3D { .. } => {
            let size = allocation_size(kind)?;
            let name = format!("cm-{:?}", kind.class());
            SurfaceResource::Owned(os.allocate_resource(&ResourceDesc::linear(name, size))?)
        }
        SurfaceKind::BufferUp { .. } | SurfaceKind::Surface2DUp { .. } => SurfaceResource::Host,
        SurfaceKind::SamplerSurface2D { .. } | SurfaceKind::VmeSurface { .. } => SurfaceResource::None,
    };
    Ok(resource)
}
