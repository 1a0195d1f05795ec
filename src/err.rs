use std::io;
use thiserror::Error;

/// Errors reported by module loading, memory access and hooking routines.
///
/// Not-found outcomes of scans and lookups are *not* errors; those surface
/// as `None` from the respective methods.
#[derive(Error, Debug)]
pub enum VtHookError {
    /// Invalid parameter
    #[error("invalid parameter")]
    InvalidParameter,

    /// The named module is not loaded in the current process
    #[error("module not loaded: {0}")]
    ModuleNotFound(String),

    /// The platform loader refused the module; carries the OS diagnostic
    /// (`dlerror` on POSIX, `FormatMessage` on Windows)
    #[error("loader error: {0}")]
    Loader(String),

    /// Error occurs when modifying the memory protect
    #[error("memory protect error, code:{0}")]
    MemoryProtect(u32),

    /// The target region is not accessible for the requested operation
    #[error("memory region not accessible")]
    NoAccess,

    /// Can't get memory layout from /proc/${PID}/maps (only in linux)
    #[error("memory layout format error")]
    MemoryLayoutFormat,

    /// Some io error
    #[error("io error")]
    Io(#[from] io::Error),
}
