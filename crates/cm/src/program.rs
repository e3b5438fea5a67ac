//! Programs and the kernels created from them.
//!
//! A program may back several kernels. It carries an explicit acquisition
//! counter: loading acquires once, each kernel created from it acquires
//! once, and every destroy (of the program or of one of its kernels)
//! releases once. The program leaves its table slot when the counter hits
//! zero.

use md_common::{CmError, CmResult};
use tracing::debug;

use crate::sampler::{Sampler8x8Id, SamplerId};
use crate::slot::{Handle, SlotArray};
use crate::surface::SurfaceId;

pub type ProgramId = Handle<Program>;
pub type KernelId = Handle<Kernel>;

/// Magic at the start of every common-ISA binary.
pub const CISA_MAGIC: [u8; 4] = *b"CISA";

#[derive(Debug)]
pub struct Program {
    isa: Vec<u8>,
    options: String,
    acquisitions: u32,
}

impl Program {
    pub fn isa_size(&self) -> usize {
        self.isa.len()
    }

    pub fn options(&self) -> &str {
        &self.options
    }

    pub fn acquisitions(&self) -> u32 {
        self.acquisitions
    }
}

/// One kernel argument.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KernelArg {
    Scalar(Vec<u8>),
    Surface(SurfaceId),
    Sampler(SamplerId),
    Sampler8x8(Sampler8x8Id),
}

impl KernelArg {
    /// Bytes the argument occupies in the kernel payload.
    pub fn size(&self) -> u32 {
        match self {
            Self::Scalar(bytes) => bytes.len() as u32,
            Self::Surface(_) | Self::Sampler(_) | Self::Sampler8x8(_) => 4,
        }
    }
}

#[derive(Debug)]
pub struct Kernel {
    program: ProgramId,
    name: String,
    args: Vec<Option<KernelArg>>,
}

impl Kernel {
    pub fn program(&self) -> ProgramId {
        self.program
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arg(&self, index: u32) -> Option<&KernelArg> {
        self.args.get(index as usize).and_then(Option::as_ref)
    }

    /// Surfaces bound as arguments.
    pub fn surfaces(&self) -> Vec<SurfaceId> {
        self.args
            .iter()
            .filter_map(|arg| match arg {
                Some(KernelArg::Surface(id)) => Some(*id),
                _ => None,
            })
            .collect()
    }
}

/// Limits applied to program loads and kernel arguments.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ProgramLimits {
    pub max_kernel_binary_size: usize,
    pub max_args_per_kernel: u32,
    pub max_arg_size_per_kernel: u32,
}

/// Program and kernel tables. Guarded by one lock because kernel creation
/// and destruction mutate both.
#[derive(Debug)]
pub struct ProgramTables {
    programs: SlotArray<Program>,
    kernels: SlotArray<Kernel>,
    limits: ProgramLimits,
}

impl ProgramTables {
    pub fn new(max_programs: u32, max_kernels: u32, limits: ProgramLimits) -> Self {
        Self {
            programs: SlotArray::new("program", max_programs),
            kernels: SlotArray::new("kernel", max_kernels),
            limits,
        }
    }

    pub fn load_program(&mut self, isa: &[u8], options: &str) -> CmResult<ProgramId> {
        validate_isa(isa, self.limits.max_kernel_binary_size)?;
        let program = Program {
            isa: isa.to_vec(),
            options: options.to_owned(),
            acquisitions: 1,
        };
        let id = self
            .programs
            .insert(program)
            .map_err(|_| CmError::Failure("program table full".into()))?;
        debug!(program = ?id, size = isa.len(), "Program loaded");
        Ok(id)
    }

    /// Take one more reference on a loaded program.
    pub fn acquire_program(&mut self, id: ProgramId) -> CmResult<u32> {
        let program = self.programs.get_mut(id)?;
        program.acquisitions += 1;
        Ok(program.acquisitions)
    }

    /// Release one reference; frees the slot at zero. Returns the count left.
    pub fn release_program(&mut self, id: ProgramId) -> CmResult<u32> {
        let program = self.programs.get_mut(id)?;
        program.acquisitions = program.acquisitions.saturating_sub(1);
        let left = program.acquisitions;
        if left == 0 {
            self.programs.remove(id)?;
            debug!(program = ?id, "Program freed");
        }
        Ok(left)
    }

    pub fn program(&self, id: ProgramId) -> CmResult<&Program> {
        self.programs.get(id)
    }

    pub fn create_kernel(&mut self, program: ProgramId, name: &str) -> CmResult<KernelId> {
        if name.is_empty() {
            return Err(CmError::InvalidArgValue("empty kernel name".into()));
        }
        self.programs.get(program)?;
        let kernel = Kernel {
            program,
            name: name.to_owned(),
            args: Vec::new(),
        };
        let id = self
            .kernels
            .insert(kernel)
            .map_err(|_| CmError::Failure("kernel table full".into()))?;
        self.acquire_program(program)?;
        debug!(kernel = ?id, name, program = ?program, "Kernel created");
        Ok(id)
    }

    /// Destroy a kernel and release its program reference.
    /// Both handles are checked before either table changes.
    pub fn destroy_kernel(&mut self, id: KernelId) -> CmResult<()> {
        let program = self.kernels.get(id)?.program;
        self.programs.get(program)?;
        self.kernels.remove(id)?;
        self.release_program(program)?;
        Ok(())
    }

    pub fn kernel(&self, id: KernelId) -> CmResult<&Kernel> {
        self.kernels.get(id)
    }

    pub fn set_kernel_arg(&mut self, id: KernelId, index: u32, arg: KernelArg) -> CmResult<()> {
        let limits = self.limits;
        if index >= limits.max_args_per_kernel {
            return Err(CmError::ExceedKernelArgAmount {
                max: limits.max_args_per_kernel,
            });
        }
        let kernel = self.kernels.get_mut(id)?;
        let size = arg.size();
        if size == 0 {
            return Err(CmError::InvalidArgValue("zero-sized kernel argument".into()));
        }
        let used: u32 = kernel
            .args
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != index as usize)
            .filter_map(|(_, a)| a.as_ref().map(KernelArg::size))
            .sum();
        if used + size > limits.max_arg_size_per_kernel {
            return Err(CmError::ExceedKernelArgSize {
                size: used + size,
                max: limits.max_arg_size_per_kernel,
            });
        }
        let slot = index as usize;
        if kernel.args.len() <= slot {
            kernel.args.resize(slot + 1, None);
        }
        kernel.args[slot] = Some(arg);
        Ok(())
    }

    pub fn program_count(&self) -> usize {
        self.programs.len()
    }

    pub fn kernel_count(&self) -> usize {
        self.kernels.len()
    }

    /// Destroy every kernel, then release whatever program references are
    /// left until the program table is empty. Teardown only.
    pub fn destroy_all(&mut self) {
        for (_, kernel) in self.kernels.drain() {
            if let Ok(program) = self.programs.get_mut(kernel.program) {
                program.acquisitions = program.acquisitions.saturating_sub(1);
            }
        }
        let freed = self.programs.drain().len();
        debug!(programs = freed, "Program table cleared");
    }
}

/// Check a common-ISA binary before anything is allocated for it.
pub fn validate_isa(isa: &[u8], max_size: usize) -> CmResult<()> {
    if isa.is_empty() || !isa.starts_with(&CISA_MAGIC) {
        return Err(CmError::InvalidCommonIsa);
    }
    if isa.len() > max_size {
        return Err(CmError::ExceedMaxKernelSize {
            size: isa.len(),
            max: max_size,
        });
    }
    Ok(())
}
