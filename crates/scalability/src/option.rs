//! Pipe-count decisions.
//!
//! A [`ScalabilityOption`] is a pure function of a [`ScalabilityParams`]
//! workload descriptor and the scalability section of the driver config.
//! It is immutable once built and compared structurally by the context cache.

use md_common::{
    ComponentType, GpuContextCreateOptions, Resolution, ScalabilityConfig, SurfaceFormat,
};
use tracing::debug;

use crate::{ScalabilityError, ScalabilityResult};

/// Frames at or below this width only split across pipes when tiles are
/// evenly distributed.
const NARROW_FRAME_WIDTH: u32 = 2048;

/// Workload descriptor a pipeline hands to the option builder.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScalabilityParams {
    pub component: ComponentType,
    pub resolution: Resolution,
    pub format: SurfaceFormat,
    pub using_sfc: bool,
    /// VDBOX instances present on the platform.
    pub num_vdbox: u8,
    /// VEBOX instances present on the platform.
    pub num_vebox: u8,
    /// Encode only: tile columns in the frame.
    pub num_tile_columns: u8,
    /// Real-tile (RA) mode.
    pub ra_mode: bool,
    /// Protected (content-protection) session.
    pub protect_mode: bool,
    /// Decode only: tile columns are split evenly between pipes.
    pub even_tile_split: bool,
    /// Decode only: the front end submits separately from the back ends.
    pub fe_separate_submission: bool,
    /// Caller-side virtual engine switch; combined with the config switch.
    pub enable_virtual_engine: bool,
}

impl ScalabilityParams {
    fn base(component: ComponentType, resolution: Resolution) -> Self {
        Self {
            component,
            resolution,
            format: SurfaceFormat::Nv12,
            using_sfc: false,
            num_vdbox: 1,
            num_vebox: 1,
            num_tile_columns: 1,
            ra_mode: false,
            protect_mode: false,
            even_tile_split: false,
            fe_separate_submission: false,
            enable_virtual_engine: true,
        }
    }

    pub fn decode(resolution: Resolution, format: SurfaceFormat, num_vdbox: u8) -> Self {
        Self {
            format,
            num_vdbox,
            ..Self::base(ComponentType::Decode, resolution)
        }
    }

    pub fn encode(resolution: Resolution, num_tile_columns: u8, num_vdbox: u8) -> Self {
        Self {
            num_tile_columns,
            num_vdbox,
            ..Self::base(ComponentType::Encode, resolution)
        }
    }

    pub fn vp(resolution: Resolution, num_vebox: u8) -> Self {
        Self {
            num_vebox,
            ..Self::base(ComponentType::Vp, resolution)
        }
    }
}

/// Result of a pipe-count decision.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScalabilityOption {
    component: ComponentType,
    num_pipe: u8,
    ra_mode: bool,
    protect_mode: bool,
    using_sfc: bool,
    num_tile_columns: u8,
    num_vebox: u8,
    fe_separate_submission: bool,
    max_pipes: u8,
}

impl ScalabilityOption {
    /// One pipe, no mode flags.
    pub fn single_pipe(component: ComponentType) -> Self {
        Self {
            component,
            num_pipe: 1,
            ra_mode: false,
            protect_mode: false,
            using_sfc: false,
            num_tile_columns: 1,
            num_vebox: 1,
            fe_separate_submission: false,
            max_pipes: 1,
        }
    }

    /// Decide the pipe count for `params`.
    pub fn new(params: &ScalabilityParams, config: &ScalabilityConfig) -> ScalabilityResult<Self> {
        let res = params.resolution;
        if res.width == 0 || res.height == 0 {
            return Err(ScalabilityError::InvalidParameter(format!(
                "frame size {res}"
            )));
        }

        let max_pipes = match params.component {
            ComponentType::Vp => params.num_vebox,
            _ => params.num_vdbox,
        }
        .max(1);

        let scalable = config.enable_virtual_engine
            && params.enable_virtual_engine
            && !config.disable_scalability;

        let num_pipe = if !scalable {
            1
        } else {
            match params.component {
                ComponentType::Decode => decode_pipes(params, config),
                ComponentType::Encode => params.num_tile_columns.min(params.num_vdbox).max(1),
                ComponentType::Vp => {
                    if params.num_vebox >= 2 && res.is_4k_or_larger() {
                        params.num_vebox
                    } else {
                        1
                    }
                }
                ComponentType::Cp | ComponentType::Cm => 1,
            }
        };

        let option = Self {
            component: params.component,
            num_pipe,
            ra_mode: params.ra_mode,
            protect_mode: params.protect_mode,
            using_sfc: params.using_sfc,
            num_tile_columns: params.num_tile_columns,
            num_vebox: params.num_vebox,
            fe_separate_submission: params.fe_separate_submission,
            max_pipes,
        };
        debug!(
            component = ?option.component,
            resolution = %res,
            pipes = option.num_pipe,
            "Scalability option decided"
        );
        Ok(option)
    }

    /// True when a fresh option built from `params` has the same pipe count
    /// and mode flags. An option that cannot be built never matches.
    pub fn is_matched(&self, params: &ScalabilityParams, config: &ScalabilityConfig) -> bool {
        match Self::new(params, config) {
            Ok(other) => self.is_option_matched(&other),
            Err(_) => false,
        }
    }

    pub fn is_option_matched(&self, other: &ScalabilityOption) -> bool {
        self.num_pipe == other.num_pipe
            && self.ra_mode == other.ra_mode
            && self.protect_mode == other.protect_mode
    }

    pub fn component(&self) -> ComponentType {
        self.component
    }

    pub fn num_pipe(&self) -> u8 {
        self.num_pipe
    }

    pub fn ra_mode(&self) -> bool {
        self.ra_mode
    }

    pub fn protect_mode(&self) -> bool {
        self.protect_mode
    }

    pub fn using_sfc(&self) -> bool {
        self.using_sfc
    }

    pub fn num_tile_columns(&self) -> u8 {
        self.num_tile_columns
    }

    pub fn num_vebox(&self) -> u8 {
        self.num_vebox
    }

    /// Engine instances of the relevant class on this platform.
    pub fn max_pipes(&self) -> u8 {
        self.max_pipes
    }

    pub fn fe_separate_submission(&self) -> bool {
        self.fe_separate_submission
    }

    pub fn is_multi_pipe(&self) -> bool {
        self.num_pipe > 1
    }

    /// Logical ring contexts the GPU context needs.
    ///
    /// Three-pipe decode adds a front-end context unless the front end is
    /// submitted separately.
    pub fn lrca_count(&self) -> u32 {
        match (self.component, self.num_pipe) {
            (ComponentType::Decode, 3) if self.fe_separate_submission => 3,
            (ComponentType::Decode, 3) => 4,
            (_, n) => u32::from(n),
        }
    }

    /// GPU context creation options: one engine instance per pipe.
    pub fn gpu_ctx_create_option(&self) -> GpuContextCreateOptions {
        GpuContextCreateOptions {
            lrca_count: self.lrca_count(),
            using_sfc: self.using_sfc,
            engine_instances: (0..self.num_pipe).collect(),
        }
    }

    /// Build an option with an explicit pipe count. Used by pipelines that
    /// have already made the decision themselves.
    pub fn with_pipes(component: ComponentType, num_pipe: u8, max_pipes: u8) -> Self {
        Self {
            num_pipe: num_pipe.max(1),
            max_pipes: max_pipes.max(1),
            ..Self::single_pipe(component)
        }
    }
}

fn decode_pipes(params: &ScalabilityParams, config: &ScalabilityConfig) -> u8 {
    if params.using_sfc || params.num_vdbox < 2 {
        return 1;
    }
    let res = params.resolution;

    if params.num_vdbox > 2 {
        let three_pipe = match config.decode_three_pipe_min_width {
            Some(min) => res.width >= min,
            None => res.is_8k_or_larger(),
        };
        if three_pipe {
            return 3;
        }
    }

    if res.width <= NARROW_FRAME_WIDTH && !params.even_tile_split {
        return 1;
    }
    let two_pipe = match config.decode_two_pipe_min_width {
        Some(min) => res.width >= min,
        None if params.format.is_nv12_or_p010() => res.is_5k_or_larger(),
        None => res.is_4k_or_larger(),
    };
    if two_pipe {
        2
    } else {
        1
    }
}
