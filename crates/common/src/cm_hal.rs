//! CM HAL state abstraction: sampler tables, device limits, platform info and
//! task execution. `md-cm` talks to hardware only through [`CmHal`].

use serde::{Deserialize, Serialize};

use crate::error::HalError;

// ---------------------------------------------------------------------------
// Sampler descriptions
// ---------------------------------------------------------------------------

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FilterMode {
    #[default]
    Point,
    Linear,
    Anisotropic,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddressMode {
    #[default]
    Wrap,
    Mirror,
    Clamp,
    Border,
}

/// 3D sampler state registered in the HAL sampler table.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SamplerState {
    pub min_filter: FilterMode,
    pub mag_filter: FilterMode,
    pub address_u: AddressMode,
    pub address_v: AddressMode,
    pub address_w: AddressMode,
    /// Packed RGBA8 border color, only meaningful with `AddressMode::Border`.
    pub border_color: u32,
}

/// Adaptive video scaler coefficients.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvsParams {
    pub adaptive_filter: bool,
    pub gain_factor: u8,
    /// One entry per filter phase.
    pub coefficients: Vec<i16>,
}

/// Convolution kernel of `width * height` taps.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvolveParams {
    pub width: u8,
    pub height: u8,
    pub coefficients: Vec<i16>,
}

/// Miscellaneous 8x8 sampler (erode/dilate/min-max style filters).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MiscParams {
    pub width: u8,
    pub height: u8,
    pub row_mask: u32,
}

/// Sampler8x8 state. Each variant carries the payload its type requires.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Sampler8x8Descriptor {
    Avs(AvsParams),
    Convolve(ConvolveParams),
    Misc(MiscParams),
}

pub const MAX_AVS_PHASES: usize = 17;
pub const MAX_CONVOLVE_DIM: u8 = 16;

impl Sampler8x8Descriptor {
    /// Check the payload is complete for its type.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::Avs(avs) => {
                if avs.coefficients.is_empty() || avs.coefficients.len() > MAX_AVS_PHASES {
                    return Err(format!(
                        "AVS needs 1..={MAX_AVS_PHASES} coefficient phases, got {}",
                        avs.coefficients.len()
                    ));
                }
            }
            Self::Convolve(conv) => {
                if conv.width == 0
                    || conv.height == 0
                    || conv.width > MAX_CONVOLVE_DIM
                    || conv.height > MAX_CONVOLVE_DIM
                {
                    return Err(format!("convolve size {}x{}", conv.width, conv.height));
                }
                let taps = conv.width as usize * conv.height as usize;
                if conv.coefficients.len() != taps {
                    return Err(format!(
                        "convolve expects {taps} coefficients, got {}",
                        conv.coefficients.len()
                    ));
                }
            }
            Self::Misc(misc) => {
                if misc.width == 0 || misc.height == 0 || misc.width > 15 || misc.height > 15 {
                    return Err(format!("misc size {}x{}", misc.width, misc.height));
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Limits and platform
// ---------------------------------------------------------------------------

/// Hardware limits reported by the HAL.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HalMaxValues {
    pub max_tasks: u32,
    pub max_kernels_per_task: u32,
    pub max_kernel_binary_size: usize,
    pub max_samplers: u32,
    pub max_sampler8x8: u32,
    pub max_samplers_per_kernel: u32,
    pub max_buffer_table_size: u32,
    pub max_2d_surface_table_size: u32,
    pub max_3d_surface_table_size: u32,
    pub max_surfaces_per_kernel: u32,
    pub max_args_per_kernel: u32,
    pub max_arg_size_per_kernel: u32,
    pub max_user_threads_per_task: u32,
    pub max_user_threads_per_media_walker: u32,
    pub max_user_threads_per_thread_group: u32,
    pub max_user_threads_per_task_no_thread_arg: u32,
    pub max_hw_threads: u32,
    pub max_thread_space_width: u32,
    pub max_thread_space_height: u32,
    pub max_buffer_size: u64,
}

impl Default for HalMaxValues {
    fn default() -> Self {
        Self {
            max_tasks: 4,
            max_kernels_per_task: 16,
            max_kernel_binary_size: 256 * 1024,
            max_samplers: 16,
            max_sampler8x8: 2,
            max_samplers_per_kernel: 16,
            max_buffer_table_size: 256,
            max_2d_surface_table_size: 256,
            max_3d_surface_table_size: 64,
            max_surfaces_per_kernel: 255,
            max_args_per_kernel: 255,
            max_arg_size_per_kernel: 2016,
            max_user_threads_per_task: 261_121,
            max_user_threads_per_media_walker: 261_121,
            max_user_threads_per_thread_group: 1024,
            max_user_threads_per_task_no_thread_arg: 261_121,
            max_hw_threads: 448,
            max_thread_space_width: 2047,
            max_thread_space_height: 2047,
            max_buffer_size: 0x4000_0000,
        }
    }
}

/// L3 cache partitioning. The HAL decides which combinations are legal.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct L3Config {
    pub config_regs: [u32; 4],
}

/// Platform identification and frequencies.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformInfo {
    pub gpu_platform: u32,
    pub gt_platform: u32,
    pub num_slices: u32,
    pub num_subslices: u32,
    pub num_eus_per_subslice: u32,
    pub num_hw_threads_per_eu: u32,
    pub min_frequency_mhz: u32,
    pub max_frequency_mhz: u32,
    pub current_frequency_mhz: u32,
}

impl Default for PlatformInfo {
    fn default() -> Self {
        Self {
            gpu_platform: 12,
            gt_platform: 2,
            num_slices: 1,
            num_subslices: 6,
            num_eus_per_subslice: 16,
            num_hw_threads_per_eu: 7,
            min_frequency_mhz: 300,
            max_frequency_mhz: 1300,
            current_frequency_mhz: 300,
        }
    }
}

impl PlatformInfo {
    /// Packed little-endian copy-out used by the caps query.
    pub fn to_bytes(&self) -> Vec<u8> {
        [
            self.num_slices,
            self.num_subslices,
            self.num_eus_per_subslice,
            self.num_hw_threads_per_eu,
        ]
        .iter()
        .flat_map(|v| v.to_le_bytes())
        .collect()
    }
}

// ---------------------------------------------------------------------------
// Task execution
// ---------------------------------------------------------------------------

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CmQueueType {
    Render,
    Compute,
    Vebox,
}

/// What a queue hands the HAL for one enqueue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskSubmission {
    pub queue_type: CmQueueType,
    pub gpu_context: u32,
    pub kernel_count: u32,
    pub thread_count: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HalTaskId(pub u64);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum HalTaskStatus {
    Queued,
    Running,
    Finished,
}

/// The CM HAL service boundary.
pub trait CmHal: Send + Sync {
    fn max_values(&self) -> HalMaxValues;

    fn platform_info(&self) -> PlatformInfo;

    /// Register a sampler and return its HAL table index.
    fn register_sampler(&self, state: &SamplerState) -> Result<u32, HalError>;

    fn unregister_sampler(&self, index: u32) -> Result<(), HalError>;

    fn register_sampler8x8(&self, desc: &Sampler8x8Descriptor) -> Result<u32, HalError>;

    fn unregister_sampler8x8(&self, index: u32) -> Result<(), HalError>;

    fn set_hw_thread_count(&self, count: u32) -> Result<(), HalError>;

    fn set_l3_config(&self, config: &L3Config) -> Result<(), HalError>;

    fn l3_config(&self) -> L3Config;

    fn submit_task(&self, task: &TaskSubmission) -> Result<HalTaskId, HalError>;

    fn query_task(&self, id: HalTaskId) -> Result<HalTaskStatus, HalError>;

    /// Block until the task finished.
    fn wait_task(&self, id: HalTaskId) -> Result<(), HalError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn convolve_needs_full_tap_table() {
        let desc = Sampler8x8Descriptor::Convolve(ConvolveParams {
            width: 3,
            height: 3,
            coefficients: vec![1; 8],
        });
        assert!(desc.validate().is_err());

        let desc = Sampler8x8Descriptor::Convolve(ConvolveParams {
            width: 3,
            height: 3,
            coefficients: vec![1; 9],
        });
        assert!(desc.validate().is_ok());
    }

    #[test]
    fn avs_needs_coefficients() {
        let desc = Sampler8x8Descriptor::Avs(AvsParams {
            adaptive_filter: true,
            gain_factor: 44,
            coefficients: Vec::new(),
        });
        assert!(desc.validate().is_err());
    }

    #[test]
    fn platform_info_bytes() {
        let info = PlatformInfo::default();
        let bytes = info.to_bytes();
        assert_eq!(bytes.len(), 16);
        assert_eq!(&bytes[4..8], &6u32.to_le_bytes());
    }
}
