//! Thread spaces (media walker dispatch shape) and thread-group spaces
//! (GPGPU dispatch shape).

use md_common::{CmError, CmResult};

use crate::slot::Handle;

pub type ThreadSpaceId = Handle<ThreadSpace>;
pub type ThreadGroupSpaceId = Handle<ThreadGroupSpace>;

/// Thread space edge limit on platforms older than the Gen9 media walker.
pub const MAX_THREAD_SPACE_LEGACY: u32 = 511;

/// Scoreboard dependency between neighbouring threads.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum DependencyPattern {
    #[default]
    None,
    WavefrontLeft,
    Wavefront,
    Wavefront26,
    Vertical,
    Horizontal,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ThreadSpace {
    width: u32,
    height: u32,
    dependency: DependencyPattern,
}

impl ThreadSpace {
    /// Validate against the walker limits and build.
    pub fn new(width: u32, height: u32, max_width: u32, max_height: u32) -> CmResult<Self> {
        if width == 0 || height == 0 || width > max_width || height > max_height {
            return Err(CmError::InvalidThreadSpace { width, height });
        }
        Ok(Self {
            width,
            height,
            dependency: DependencyPattern::None,
        })
    }

    pub fn select_dependency(&mut self, pattern: DependencyPattern) {
        self.dependency = pattern;
    }

    pub fn dependency(&self) -> DependencyPattern {
        self.dependency
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn thread_count(&self) -> u32 {
        self.width * self.height
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ThreadGroupSpace {
    thread_width: u32,
    thread_height: u32,
    group_width: u32,
    group_height: u32,
}

impl ThreadGroupSpace {
    pub fn new(
        thread_width: u32,
        thread_height: u32,
        group_width: u32,
        group_height: u32,
        max_threads_per_group: u32,
    ) -> CmResult<Self> {
        if thread_width == 0 || thread_height == 0 || group_width == 0 || group_height == 0 {
            return Err(CmError::InvalidThreadGroupSpace(format!(
                "{thread_width}x{thread_height} threads in {group_width}x{group_height} groups"
            )));
        }
        let per_group = u64::from(thread_width) * u64::from(thread_height);
        if per_group > u64::from(max_threads_per_group) {
            return Err(CmError::InvalidThreadGroupSpace(format!(
                "{per_group} threads per group exceeds {max_threads_per_group}"
            )));
        }
        Ok(Self {
            thread_width,
            thread_height,
            group_width,
            group_height,
        })
    }

    pub fn threads_per_group(&self) -> u32 {
        self.thread_width * self.thread_height
    }

    pub fn group_count(&self) -> u32 {
        self.group_width * self.group_height
    }

    pub fn thread_count(&self) -> u32 {
        self.threads_per_group() * self.group_count()
    }
}
