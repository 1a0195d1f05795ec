use bitflags::bitflags;

bitflags! {
    /// Abstract memory-protection flags.
    ///
    /// The empty set means "not observed" (no information about the page).
    /// [`Prot::N`] is the explicit no-access marker and is distinct from
    /// "not observed".
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Prot: u32 {
        /// Execute permission
        const X = 1 << 1;
        /// Read permission
        const R = 1 << 2;
        /// Write permission
        const W = 1 << 3;
        /// Shared memory
        const S = 1 << 4;
        /// Private memory
        const P = 1 << 5;
        /// Explicit no-access (the protection was read and is unset)
        const N = 1 << 6;
        /// Read, write and execute
        const RWX = Self::R.bits() | Self::W.bits() | Self::X.bits();
    }
}

impl Prot {
    /// The "not observed" value.
    pub const UNSET: Prot = Prot::empty();
}

/// Rounds `value` down to a multiple of `multiple` (a power of two).
#[must_use]
pub const fn round_down(value: usize, multiple: usize) -> usize {
    value & !(multiple - 1)
}

/// Rounds `value` up to a multiple of `multiple` (a power of two).
#[must_use]
pub const fn round_up(value: usize, multiple: usize) -> usize {
    (value + multiple - 1) & !(multiple - 1)
}

/// The VM page size of the current process.
#[cfg(unix)]
#[must_use]
pub fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// The VM page size of the current process.
#[cfg(windows)]
#[must_use]
pub fn page_size() -> usize {
    use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

    let mut info: SYSTEM_INFO = unsafe { std::mem::zeroed() };
    unsafe { GetSystemInfo(&mut info) };
    info.dwPageSize as usize
}

/// Translates abstract flags to a `PROT_*` bit set. [`Prot::N`] forces
/// `PROT_NONE` regardless of other bits.
#[cfg(unix)]
pub fn to_native(flags: Prot) -> i32 {
    let mut native = libc::PROT_NONE;
    if flags.contains(Prot::X) {
        native |= libc::PROT_EXEC;
    }
    if flags.contains(Prot::R) {
        native |= libc::PROT_READ;
    }
    if flags.contains(Prot::W) {
        native |= libc::PROT_WRITE;
    }
    if flags.contains(Prot::N) {
        native = libc::PROT_NONE;
    }
    native
}

/// Translates a `PROT_*` bit set back to abstract flags.
#[cfg(unix)]
pub fn from_native(prot: i32) -> Prot {
    let mut flags = Prot::UNSET;
    if prot & libc::PROT_EXEC != 0 {
        flags |= Prot::X;
    }
    if prot & libc::PROT_READ != 0 {
        flags |= Prot::R;
    }
    if prot & libc::PROT_WRITE != 0 {
        flags |= Prot::W;
    }
    if prot == libc::PROT_NONE {
        flags |= Prot::N;
    }
    flags
}

/// Translates abstract flags to the single matching `PAGE_*` constant.
#[cfg(windows)]
pub fn to_native(flags: Prot) -> u32 {
    use windows_sys::Win32::System::Memory::{
        PAGE_EXECUTE, PAGE_EXECUTE_READ, PAGE_EXECUTE_READWRITE, PAGE_NOACCESS, PAGE_READONLY,
        PAGE_READWRITE,
    };

    let mut native = 0;
    if flags == Prot::X {
        native = PAGE_EXECUTE;
    }
    if flags == Prot::R {
        native = PAGE_READONLY;
    }
    if flags == Prot::W || flags == Prot::R | Prot::W {
        native = PAGE_READWRITE;
    }
    if flags.contains(Prot::X) && flags.contains(Prot::R) {
        native = PAGE_EXECUTE_READ;
    }
    if flags.contains(Prot::X) && flags.contains(Prot::W) {
        native = PAGE_EXECUTE_READWRITE;
    }
    if flags.contains(Prot::N) {
        native = PAGE_NOACCESS;
    }
    native
}

/// Translates a `PAGE_*` constant back to abstract flags.
#[cfg(windows)]
pub fn from_native(prot: u32) -> Prot {
    use windows_sys::Win32::System::Memory::{
        PAGE_EXECUTE, PAGE_EXECUTE_READ, PAGE_EXECUTE_READWRITE, PAGE_NOACCESS, PAGE_READONLY,
        PAGE_READWRITE,
    };

    match prot {
        PAGE_EXECUTE => Prot::X,
        PAGE_READONLY => Prot::R,
        PAGE_READWRITE => Prot::R | Prot::W,
        PAGE_EXECUTE_READ => Prot::X | Prot::R,
        PAGE_EXECUTE_READWRITE => Prot::X | Prot::R | Prot::W,
        PAGE_NOACCESS => Prot::N,
        _ => Prot::UNSET,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_set_operations() {
        let mut flags = Prot::R;
        flags |= Prot::W;
        assert!(flags.contains(Prot::R));
        assert!(flags.contains(Prot::W));
        assert!(!flags.contains(Prot::X));
        assert_eq!(Prot::R | Prot::W | Prot::X, Prot::RWX);
        assert_eq!(Prot::UNSET, Prot::empty());
        assert_ne!(Prot::UNSET, Prot::N);
    }

    #[test]
    fn rounding() {
        assert_eq!(round_down(0x1234, 0x1000), 0x1000);
        assert_eq!(round_up(0x1234, 0x1000), 0x2000);
        assert_eq!(round_down(0x1000, 0x1000), 0x1000);
        assert_eq!(round_up(0x1000, 0x1000), 0x1000);
        assert_eq!(round_up(0, 0x1000), 0);
    }

    #[cfg(unix)]
    #[test]
    fn native_round_trip() {
        for flags in [
            Prot::R,
            Prot::R | Prot::W,
            Prot::R | Prot::X,
            Prot::RWX,
            Prot::N,
        ] {
            assert_eq!(from_native(to_native(flags)), flags);
        }
    }
}
