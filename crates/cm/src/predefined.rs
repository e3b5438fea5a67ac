//! Built-in kernels: GPU-to-GPU surface copy and surface initialisation.

use md_common::CmResult;
use tracing::debug;

use crate::program::{ProgramId, ProgramTables, CISA_MAGIC};

pub const GPU_COPY_KERNEL: &str = "SurfaceCopy_2DTo2D";
pub const SURFACE_INIT_KERNEL: &str = "SurfaceInit";

/// Block size one copy thread moves, in bytes.
const COPY_BLOCK_BYTES: u32 = 32 * 8;

const GPU_COPY_ISA: [u8; 16] = isa_blob(0x01);
const SURFACE_INIT_ISA: [u8; 16] = isa_blob(0x02);

const fn isa_blob(tag: u8) -> [u8; 16] {
    let mut blob = [0u8; 16];
    blob[0] = CISA_MAGIC[0];
    blob[1] = CISA_MAGIC[1];
    blob[2] = CISA_MAGIC[2];
    blob[3] = CISA_MAGIC[3];
    // major 3, minor 6
    blob[4] = 3;
    blob[5] = 6;
    blob[6] = 1;
    blob[8] = tag;
    blob
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PredefinedPrograms {
    pub gpu_copy: ProgramId,
    pub surface_init: ProgramId,
}

impl PredefinedPrograms {
    pub fn load(programs: &mut ProgramTables) -> CmResult<Self> {
        let gpu_copy = programs.load_program(&GPU_COPY_ISA, "")?;
        let surface_init = match programs.load_program(&SURFACE_INIT_ISA, "") {
            Ok(id) => id,
            Err(e) => {
                programs.release_program(gpu_copy)?;
                return Err(e);
            }
        };
        debug!("Predefined programs loaded");
        Ok(Self {
            gpu_copy,
            surface_init,
        })
    }

    /// Drop the load-time reference on both programs.
    pub fn release(self, programs: &mut ProgramTables) -> CmResult<()> {
        programs.release_program(self.gpu_copy)?;
        programs.release_program(self.surface_init)?;
        Ok(())
    }
}

/// Threads needed to cover `bytes` with copy blocks.
pub fn thread_count_for(bytes: u32) -> u32 {
    bytes.div_ceil(COPY_BLOCK_BYTES).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::ProgramLimits;

    #[test]
    fn load_and_release() {
        let mut programs = ProgramTables::new(
            4,
            4,
            ProgramLimits {
                max_kernel_binary_size: 1024,
                max_args_per_kernel: 8,
                max_arg_size_per_kernel: 64,
            },
        );
        let predefined = PredefinedPrograms::load(&mut programs).unwrap();
        assert_eq!(programs.program_count(), 2);
        predefined.release(&mut programs).unwrap();
        assert_eq!(programs.program_count(), 0);
    }

    #[test]
    fn thread_count_rounds_up() {
        assert_eq!(thread_count_for(0), 1);
        assert_eq!(thread_count_for(256), 1);
        assert_eq!(thread_count_for(257), 2);
    }
}
