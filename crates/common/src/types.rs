//! Core types with newtype pattern for type safety.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque handle to a GPU-visible resource owned by the OS layer.
///
/// `ResourceHandle::NULL` marks an unacquired command buffer or an absent
/// resource.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceHandle(pub u64);

impl ResourceHandle {
    pub const NULL: Self = Self(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "res#{}", self.0)
    }
}

/// Handle to a GPU context created through the OS layer.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GpuContextHandle(pub u32);

impl GpuContextHandle {
    pub const INVALID: Self = Self(u32::MAX);

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

impl fmt::Display for GpuContextHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx#{}", self.0)
    }
}

/// Which pipeline family is asking for GPU resources.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComponentType {
    Decode,
    Encode,
    Vp,
    Cp,
    Cm,
}

/// A media function, i.e. the kind of work a GPU context is created for.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaFunction {
    RenderGeneric,
    VdboxDecode,
    VdboxDecodeWa,
    VdboxEncode,
    VdboxCp,
    VeboxVpp,
    ComputeMdf,
    ComputeVpp,
}

impl MediaFunction {
    pub const ALL: [MediaFunction; 8] = [
        Self::RenderGeneric,
        Self::VdboxDecode,
        Self::VdboxDecodeWa,
        Self::VdboxEncode,
        Self::VdboxCp,
        Self::VeboxVpp,
        Self::ComputeMdf,
        Self::ComputeVpp,
    ];

    /// Render and compute functions run on the render/compute command streamers.
    pub fn uses_render_engine(self) -> bool {
        matches!(
            self,
            Self::RenderGeneric | Self::ComputeMdf | Self::ComputeVpp
        )
    }
}

/// GPU engine node class a context is bound to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GpuNode {
    Render3D,
    Video,
    Video2,
    VideoEnhance,
    Compute,
}

impl fmt::Display for GpuNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Render3D => "RCS",
            Self::Video => "VCS0",
            Self::Video2 => "VCS1",
            Self::VideoEnhance => "VECS",
            Self::Compute => "CCS",
        };
        f.write_str(name)
    }
}

/// Surface pixel formats known to the scalability and CM layers.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SurfaceFormat {
    Nv12,
    P010,
    P016,
    Yuy2,
    Y210,
    Y410,
    Ayuv,
    A8R8G8B8,
    X8R8G8B8,
    A8B8G8R8,
    R32F,
    L8,
    Buffer,
}

impl SurfaceFormat {
    /// Formats decoded with the non-range-extension path.
    pub fn is_nv12_or_p010(self) -> bool {
        matches!(self, Self::Nv12 | Self::P010)
    }

    /// Bytes per pixel of the first plane.
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            Self::Nv12 | Self::L8 | Self::Buffer => 1,
            Self::P010 | Self::P016 | Self::Yuy2 => 2,
            Self::Y210 | Self::Y410 | Self::Ayuv => 4,
            Self::A8R8G8B8 | Self::X8R8G8B8 | Self::A8B8G8R8 | Self::R32F => 4,
        }
    }
}

/// Frame dimensions in pixels.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const UHD: Self = Self::new(3840, 2160);
    pub const UHD_8K: Self = Self::new(7680, 4320);

    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn area(self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// At least 4K, counting letterboxed 3840-wide content.
    pub fn is_4k_or_larger(self) -> bool {
        self.area() >= 3840 * 2160 || (self.width >= 3840 && self.height >= 1716)
    }

    /// At least 5K, counting wide 5120-wide content.
    pub fn is_5k_or_larger(self) -> bool {
        self.area() >= 5120 * 2160 || (self.width >= 5120 && self.height >= 1440)
    }

    pub fn is_8k_or_larger(self) -> bool {
        self.area() >= Self::UHD_8K.area()
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}
