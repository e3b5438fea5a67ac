//! Lazily loaded JIT compiler library.
//!
//! The library is opened the first time a program needs compiling and is
//! kept until the device is destroyed, where unloading is the very last
//! teardown step.

use std::ffi::c_int;
use std::path::{Path, PathBuf};

use libloading::Library;
use md_common::{CmError, CmResult};
use tracing::{debug, info};

#[cfg(target_os = "windows")]
pub const DEFAULT_JIT_LIBRARY: &str = "igfxcmjit64.dll";
#[cfg(not(target_os = "windows"))]
pub const DEFAULT_JIT_LIBRARY: &str = "libigfxcmjit64.so";

type JitVersionFn = unsafe extern "C" fn(*mut u32, *mut u32) -> c_int;

pub struct JitLibrary {
    path: PathBuf,
    /// Held so the library stays mapped until the device is torn down.
    _lib: Library,
    version: (u32, u32),
}

impl JitLibrary {
    /// Open the JIT from `path`, or the platform default name.
    pub fn load(path: Option<&Path>) -> CmResult<Self> {
        let path = path.map_or_else(|| PathBuf::from(DEFAULT_JIT_LIBRARY), Path::to_path_buf);
        info!(library = %path.display(), "Loading JIT library");

        // SAFETY: The JIT library only exports compiler entry points and has
        // no load-time side effects beyond its own static initialisers.
        let lib = unsafe { Library::new(&path) }
            .map_err(|e| CmError::JitLibraryLoad(format!("{}: {e}", path.display())))?;

        // SAFETY: The signature matches the JIT library's exported C API. The
        // copied function pointer is only called below, while `lib` is loaded.
        let version_fn = unsafe {
            *lib.get::<JitVersionFn>(b"getJITVersion\0")
                .map_err(|e| CmError::JitLibraryLoad(format!("getJITVersion: {e}")))?
        };
        let version = query_version(version_fn)?;

        info!(library = %path.display(), major = version.0, minor = version.1, "JIT library loaded");
        Ok(Self {
            path,
            _lib: lib,
            version,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `(major, minor)` reported when the library was opened.
    pub fn version(&self) -> (u32, u32) {
        self.version
    }
}

fn query_version(version_fn: JitVersionFn) -> CmResult<(u32, u32)> {
    let (mut major, mut minor) = (0u32, 0u32);
    // SAFETY: Both out-pointers reference live locals for the duration of the
    // call and the library does not retain them.
    let status = unsafe { version_fn(&mut major, &mut minor) };
    if status != 0 {
        return Err(CmError::JitLibraryLoad(format!("getJITVersion returned {status}")));
    }
    debug!(major, minor, "JIT version queried");
    Ok((major, minor))
}

impl std::fmt::Debug for JitLibrary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JitLibrary")
            .field("path", &self.path)
            .field("version", &self.version)
            .finish()
    }
}
