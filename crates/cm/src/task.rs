//! Tasks: ordered kernel lists submitted to a queue as one unit.

use md_common::{CmError, CmResult};

use crate::program::KernelId;
use crate::slot::Handle;

pub type TaskId = Handle<CmTask>;

#[derive(Debug)]
pub struct CmTask {
    kernels: Vec<KernelId>,
    max_kernels: u32,
}

impl CmTask {
    pub fn new(max_kernels: u32) -> Self {
        Self {
            kernels: Vec::new(),
            max_kernels,
        }
    }

    pub fn add_kernel(&mut self, kernel: KernelId) -> CmResult<()> {
        if self.kernels.len() as u32 >= self.max_kernels {
            return Err(CmError::ExceedMaxKernelPerEnqueue {
                max: self.max_kernels,
            });
        }
        self.kernels.push(kernel);
        Ok(())
    }

    pub fn reset(&mut self) {
        self.kernels.clear();
    }

    pub fn kernels(&self) -> &[KernelId] {
        &self.kernels
    }

    pub fn kernel_count(&self) -> u32 {
        self.kernels.len() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::{ProgramLimits, ProgramTables, CISA_MAGIC};

    #[test]
    fn kernel_cap_and_reset() {
        let mut tables = ProgramTables::new(
            4,
            4,
            ProgramLimits {
                max_kernel_binary_size: 64,
                max_args_per_kernel: 4,
                max_arg_size_per_kernel: 64,
            },
        );
        let program = tables.load_program(&CISA_MAGIC, "").unwrap();
        let kernel = tables.create_kernel(program, "k").unwrap();

        let mut task = CmTask::new(2);
        task.add_kernel(kernel).unwrap();
        task.add_kernel(kernel).unwrap();
        assert!(matches!(
            task.add_kernel(kernel),
            Err(CmError::ExceedMaxKernelPerEnqueue { max: 2 })
        ));
        task.reset();
        assert_eq!(task.kernel_count(), 0);
    }
}
