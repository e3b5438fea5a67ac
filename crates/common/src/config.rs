//! Driver configuration: scalability, context cache and CM device settings.
//!
//! All sections have sensible defaults; a JSON file can override any subset
//! of fields (missing fields fall back to the defaults).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Top-level driver configuration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    pub scalability: ScalabilityConfig,
    pub context: ContextConfig,
    pub cm: CmConfig,
}

impl DriverConfig {
    /// Parse a config from a JSON string.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config from a JSON file on disk.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn to_json_pretty(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.scalability.verify_attempts == 0 {
            return Err(ConfigError::Invalid("verify_attempts must be > 0".into()));
        }
        if self.scalability.max_passes == 0 {
            return Err(ConfigError::Invalid("max_passes must be > 0".into()));
        }
        if self.context.max_context_attributes == 0 {
            return Err(ConfigError::Invalid(
                "max_context_attributes must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Multi-pipe scalability switches.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalabilityConfig {
    /// Without virtual engine support every workload runs on one pipe.
    pub enable_virtual_engine: bool,
    /// Force single-pipe mode regardless of workload.
    pub disable_scalability: bool,
    pub enable_frame_tracking: bool,
    /// Delay stores emitted inside an all-pipes barrier.
    pub sync_delay_count: u32,
    /// Maximum BRC passes per frame.
    pub max_passes: u8,
    /// Semaphores per sync type.
    pub max_semaphores: u32,
    /// Verify/resize attempts before giving up on command buffer space.
    pub verify_attempts: u32,
    /// Decode: minimum frame width for two pipes (overrides the 4K/5K rule).
    pub decode_two_pipe_min_width: Option<u32>,
    /// Decode: minimum frame width for three pipes.
    pub decode_three_pipe_min_width: Option<u32>,
}

impl Default for ScalabilityConfig {
    fn default() -> Self {
        Self {
            enable_virtual_engine: true,
            disable_scalability: false,
            enable_frame_tracking: true,
            sync_delay_count: 15,
            max_passes: 4,
            max_semaphores: 8,
            verify_attempts: 3,
            decode_two_pipe_min_width: None,
            decode_three_pipe_min_width: None,
        }
    }
}

/// GPU context cache settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    pub max_context_attributes: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_context_attributes: 4096,
        }
    }
}

/// CM device limits and switches.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CmConfig {
    pub max_buffers: u32,
    pub max_surfaces_2d: u32,
    pub max_surfaces_3d: u32,
    /// Total surface table size across all kinds.
    pub max_surfaces: u32,
    pub max_tasks: u32,
    pub preload_predefined_kernels: bool,
    /// Create compute queues when a render queue is requested.
    pub redirect_render_to_compute: bool,
    pub print_buffer_size: usize,
    pub jit_library_path: Option<PathBuf>,
}

impl Default for CmConfig {
    fn default() -> Self {
        Self {
            max_buffers: 1024,
            max_surfaces_2d: 1024,
            max_surfaces_3d: 512,
            max_surfaces: 4096,
            max_tasks: 4,
            preload_predefined_kernels: true,
            redirect_render_to_compute: false,
            print_buffer_size: 1024 * 1024,
            jit_library_path: None,
        }
    }
}
