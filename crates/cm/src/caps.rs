//! Device capability queries.
//!
//! `query_cap` copies one value into a caller buffer. The buffer must be at
//! least as large as the value; a short buffer fails without writing
//! anything.

use md_common::{CmError, CmResult, HalMaxValues, L3Config, PlatformInfo, SurfaceFormat};

use crate::surface::{SurfaceLimits, SURFACE_2D_FORMATS, SURFACE_3D_FORMATS};

/// Queryable capabilities. The discriminants are the raw cap ids.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum CapName {
    KernelCountPerTask = 0,
    KernelBinarySize = 1,
    SamplerCount = 2,
    SamplerCountPerKernel = 3,
    BufferCount = 4,
    Surface2DCount = 5,
    Surface3DCount = 6,
    SurfaceCountPerKernel = 7,
    ArgCountPerKernel = 8,
    ArgSizePerKernel = 9,
    UserDefinedThreadCountPerTask = 10,
    HwThreadCount = 11,
    Surface2DFormatCount = 12,
    Surface2DFormats = 13,
    Surface3DFormatCount = 14,
    Surface3DFormats = 15,
    VmeStatus = 16,
    GpuPlatform = 17,
    GtPlatform = 18,
    MinFrequency = 19,
    MaxFrequency = 20,
    L3Config = 21,
    GpuCurrentFrequency = 22,
    UserDefinedThreadCountPerTaskNoThreadArg = 23,
    UserDefinedThreadCountPerMediaWalker = 24,
    UserDefinedThreadCountPerThreadGroup = 25,
    Surface2DUpCount = 26,
    PlatformInfo = 27,
    MaxBufferSize = 28,
}

impl CapName {
    pub const ALL: [CapName; 29] = [
        Self::KernelCountPerTask,
        Self::KernelBinarySize,
        Self::SamplerCount,
        Self::SamplerCountPerKernel,
        Self::BufferCount,
        Self::Surface2DCount,
        Self::Surface3DCount,
        Self::SurfaceCountPerKernel,
        Self::ArgCountPerKernel,
        Self::ArgSizePerKernel,
        Self::UserDefinedThreadCountPerTask,
        Self::HwThreadCount,
        Self::Surface2DFormatCount,
        Self::Surface2DFormats,
        Self::Surface3DFormatCount,
        Self::Surface3DFormats,
        Self::VmeStatus,
        Self::GpuPlatform,
        Self::GtPlatform,
        Self::MinFrequency,
        Self::MaxFrequency,
        Self::L3Config,
        Self::GpuCurrentFrequency,
        Self::UserDefinedThreadCountPerTaskNoThreadArg,
        Self::UserDefinedThreadCountPerMediaWalker,
        Self::UserDefinedThreadCountPerThreadGroup,
        Self::Surface2DUpCount,
        Self::PlatformInfo,
        Self::MaxBufferSize,
    ];
}

impl TryFrom<u32> for CapName {
    type Error = CmError;

    fn try_from(raw: u32) -> CmResult<Self> {
        Self::ALL
            .get(raw as usize)
            .copied()
            .filter(|cap| *cap as u32 == raw)
            .ok_or(CmError::InvalidCapName)
    }
}

/// Settable capabilities.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SetCap {
    HwThreadCount(u32),
    L3Config(L3Config),
}

/// Everything a query may read, captured under the device's locks.
#[derive(Clone, Debug)]
pub struct CapsSnapshot {
    pub max_values: HalMaxValues,
    pub platform: PlatformInfo,
    pub surfaces: SurfaceLimits,
    pub hw_thread_count: u32,
    pub l3: L3Config,
    pub vme_supported: bool,
}

/// Raw surface format code reported through the format caps.
pub fn format_code(format: SurfaceFormat) -> u32 {
    const fn fourcc(code: &[u8; 4]) -> u32 {
        u32::from_le_bytes(*code)
    }
    match format {
        SurfaceFormat::A8R8G8B8 => 21,
        SurfaceFormat::X8R8G8B8 => 22,
        SurfaceFormat::A8B8G8R8 => 32,
        SurfaceFormat::L8 => 50,
        SurfaceFormat::R32F => 114,
        SurfaceFormat::Buffer => 0,
        SurfaceFormat::Nv12 => fourcc(b"NV12"),
        SurfaceFormat::P010 => fourcc(b"P010"),
        SurfaceFormat::P016 => fourcc(b"P016"),
        SurfaceFormat::Yuy2 => fourcc(b"YUY2"),
        SurfaceFormat::Y210 => fourcc(b"Y210"),
        SurfaceFormat::Y410 => fourcc(b"Y410"),
        SurfaceFormat::Ayuv => fourcc(b"AYUV"),
    }
}

fn encode(cap: CapName, caps: &CapsSnapshot) -> Vec<u8> {
    let m = &caps.max_values;
    let u32_value = |v: u32| v.to_le_bytes().to_vec();
    match cap {
        CapName::KernelCountPerTask => u32_value(m.max_kernels_per_task),
        CapName::KernelBinarySize => (m.max_kernel_binary_size as u64).to_le_bytes().to_vec(),
        CapName::SamplerCount => u32_value(m.max_samplers),
        CapName::SamplerCountPerKernel => u32_value(m.max_samplers_per_kernel),
        CapName::BufferCount => u32_value(caps.surfaces.max_buffers),
        CapName::Surface2DCount => u32_value(caps.surfaces.max_2d),
        CapName::Surface3DCount => u32_value(caps.surfaces.max_3d),
        CapName::Surface2DUpCount => u32_value(caps.surfaces.max_2d_up),
        CapName::SurfaceCountPerKernel => u32_value(m.max_surfaces_per_kernel),
        CapName::ArgCountPerKernel => u32_value(m.max_args_per_kernel),
        CapName::ArgSizePerKernel => u32_value(m.max_arg_size_per_kernel),
        CapName::UserDefinedThreadCountPerTask => u32_value(m.max_user_threads_per_task),
        CapName::UserDefinedThreadCountPerMediaWalker => {
            u32_value(m.max_user_threads_per_media_walker)
        }
        CapName::UserDefinedThreadCountPerThreadGroup => {
            u32_value(m.max_user_threads_per_thread_group)
        }
        CapName::UserDefinedThreadCountPerTaskNoThreadArg => {
            u32_value(m.max_user_threads_per_task_no_thread_arg)
        }
        CapName::HwThreadCount => u32_value(caps.hw_thread_count),
        CapName::Surface2DFormatCount => u32_value(SURFACE_2D_FORMATS.len() as u32),
        CapName::Surface2DFormats => SURFACE_2D_FORMATS
            .iter()
            .flat_map(|f| format_code(*f).to_le_bytes())
            .collect(),
        CapName::Surface3DFormatCount => u32_value(SURFACE_3D_FORMATS.len() as u32),
        CapName::Surface3DFormats => SURFACE_3D_FORMATS
            .iter()
            .flat_map(|f| format_code(*f).to_le_bytes())
            .collect(),
        CapName::VmeStatus => u32_value(u32::from(caps.vme_supported)),
        CapName::GpuPlatform => u32_value(caps.platform.gpu_platform),
        CapName::GtPlatform => u32_value(caps.platform.gt_platform),
        CapName::MinFrequency => u32_value(caps.platform.min_frequency_mhz),
        CapName::MaxFrequency => u32_value(caps.platform.max_frequency_mhz),
        CapName::GpuCurrentFrequency => u32_value(caps.platform.current_frequency_mhz),
        CapName::L3Config => caps.l3.config_regs.iter().flat_map(|r| r.to_le_bytes()).collect(),
        CapName::PlatformInfo => caps.platform.to_bytes(),
        CapName::MaxBufferSize => m.max_buffer_size.to_le_bytes().to_vec(),
    }
}

/// Copy `cap` into `out`; returns the number of bytes written.
pub fn query_cap(cap: CapName, caps: &CapsSnapshot, out: &mut [u8]) -> CmResult<usize> {
    let value = encode(cap, caps);
    if out.len() < value.len() {
        return Err(CmError::InvalidParamSize {
            expected: value.len(),
            got: out.len(),
        });
    }
    out[..value.len()].copy_from_slice(&value);
    Ok(value.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> CapsSnapshot {
        CapsSnapshot {
            max_values: HalMaxValues::default(),
            platform: PlatformInfo::default(),
            surfaces: SurfaceLimits {
                max_buffers: 256,
                max_2d: 256,
                max_2d_up: 256,
                max_3d: 64,
                max_total: 576,
            },
            hw_thread_count: 448,
            l3: L3Config::default(),
            vme_supported: true,
        }
    }

    #[test]
    fn raw_ids_round_trip() {
        for cap in CapName::ALL {
            assert_eq!(CapName::try_from(cap as u32).unwrap(), cap);
        }
        assert!(matches!(CapName::try_from(99), Err(CmError::InvalidCapName)));
    }

    #[test]
    fn short_buffer_leaves_output_untouched() {
        let mut out = [0xAAu8; 2];
        let err = query_cap(CapName::KernelCountPerTask, &snapshot(), &mut out).unwrap_err();
        assert!(matches!(err, CmError::InvalidParamSize { expected: 4, got: 2 }));
        assert_eq!(out, [0xAA, 0xAA]);
    }

    #[test]
    fn values_copied_out() {
        let caps = snapshot();
        let mut out = [0u8; 64];
        assert_eq!(query_cap(CapName::Surface3DCount, &caps, &mut out).unwrap(), 4);
        assert_eq!(u32::from_le_bytes(out[..4].try_into().unwrap()), 64);

        let n = query_cap(CapName::Surface2DFormats, &caps, &mut out).unwrap();
        assert_eq!(n, SURFACE_2D_FORMATS.len() * 4);
        assert_eq!(u32::from_le_bytes(out[..4].try_into().unwrap()), 21);

        assert_eq!(query_cap(CapName::MaxBufferSize, &caps, &mut out).unwrap(), 8);
        assert_eq!(query_cap(CapName::PlatformInfo, &caps, &mut out).unwrap(), 16);
    }

    #[test]
    fn every_cap_answers_with_a_large_buffer() {
        let caps = snapshot();
        let mut out = [0u8; 256];
        for cap in CapName::ALL {
            assert!(query_cap(cap, &caps, &mut out).unwrap() > 0, "{cap:?}");
        }
    }
}
