//! In-process memory access primitives.
//!
//! `mem_copy` is the raw routine used on paths expected to succeed;
//! `safe_mem_read`/`safe_mem_write` probe the target region first and clamp
//! to it, so a partially-mapped range yields a short count instead of a
//! fault; `protect` flips page protection and reports the previous flags.

use crate::addr::Address;
use crate::err::VtHookError;
use crate::prot::Prot;

/// Copies `size` bytes from `src` to `dest` with no probing.
///
/// # Safety
///
/// Both ranges must be mapped with the required access; unmapped memory
/// faults. Use [`safe_mem_read`]/[`safe_mem_write`] when that is not known.
pub unsafe fn mem_copy(dest: Address, src: Address, size: usize) -> bool {
    std::ptr::copy_nonoverlapping(src.as_ptr::<u8>(), dest.as_mut_ptr::<u8>(), size);
    true
}

#[cfg(target_os = "linux")]
pub(crate) mod maps {
    //! `/proc/self/maps` region lookup.

    use std::fs::File;
    use std::io::{BufRead, BufReader};
    use std::process;

    use lazy_static::lazy_static;
    use regex::Regex;

    use crate::err::VtHookError;
    use crate::prot::Prot;

    #[derive(Debug, Clone, Copy)]
    pub(crate) struct Region {
        pub start: usize,
        pub end: usize,
        pub prot: Prot,
    }

    /// Finds the mapped region containing `addr`. `vdso`/`vsyscall` rows are
    /// skipped, as the original pages they describe are not ordinary module
    /// memory.
    pub(crate) fn region_of(addr: usize) -> Result<Region, VtHookError> {
        lazy_static! {
            static ref RE: Regex =
                Regex::new("^([a-fA-F0-9]+)-([a-fA-F0-9]+) ([rwx-]{3})([sp])").unwrap();
        }

        let maps = File::open(format!("/proc/{}/maps", process::id()))?;
        for line in BufReader::new(maps).lines() {
            let line = line.map_err(|_| VtHookError::MemoryLayoutFormat)?;
            if line.contains("vdso") || line.contains("vsyscall") {
                continue;
            }

            let cap = RE.captures(&line).ok_or(VtHookError::MemoryLayoutFormat)?;
            let start = usize::from_str_radix(&cap[1], 16)
                .map_err(|_| VtHookError::MemoryLayoutFormat)?;
            let end = usize::from_str_radix(&cap[2], 16)
                .map_err(|_| VtHookError::MemoryLayoutFormat)?;
            if start == 0 || end == 0 || addr < start || addr >= end {
                continue;
            }

            let perms = cap[3].as_bytes();
            let mut prot = Prot::UNSET;
            if perms[0] == b'r' {
                prot |= Prot::R;
            }
            if perms[1] == b'w' {
                prot |= Prot::W;
            }
            if perms[2] == b'x' {
                prot |= Prot::X;
            }
            if prot == Prot::UNSET {
                prot = Prot::N;
            }
            prot |= if &cap[4] == "s" { Prot::S } else { Prot::P };

            return Ok(Region { start, end, prot });
        }

        Err(VtHookError::NoAccess)
    }
}

/// Reads up to `dst.len()` bytes from `src` into `dst`, clamped to the
/// mapped region containing `src`. Returns the byte count actually read.
///
/// On Linux the region and its readability come from `/proc/self/maps`; on
/// Windows a partial `ReadProcessMemory` is retried once with the length
/// clamped to the queried region end. On macOS the copy is unchecked: an
/// inaccessible page is not detected before the read.
///
/// # Safety
///
/// `src..src + dst.len()` may be probed concurrently with remapping by other
/// threads; the region check is advisory, not a guarantee.
pub unsafe fn safe_mem_read(src: Address, dst: &mut [u8]) -> Result<usize, VtHookError> {
    safe_mem_read_impl(src, dst)
}

/// Writes up to `src.len()` bytes to `dst`, clamped to the mapped region
/// containing `dst`. Returns the byte count actually written.
///
/// # Safety
///
/// As for [`safe_mem_read`].
pub unsafe fn safe_mem_write(dst: Address, src: &[u8]) -> Result<usize, VtHookError> {
    safe_mem_write_impl(dst, src)
}

#[cfg(target_os = "linux")]
unsafe fn safe_mem_read_impl(src: Address, dst: &mut [u8]) -> Result<usize, VtHookError> {
    let region = maps::region_of(src.get())?;
    if !region.prot.contains(Prot::R) {
        return Err(VtHookError::NoAccess);
    }

    let size = dst.len().min(region.end - src.get());
    std::ptr::copy_nonoverlapping(src.as_ptr::<u8>(), dst.as_mut_ptr(), size);
    Ok(size)
}

#[cfg(target_os = "linux")]
unsafe fn safe_mem_write_impl(dst: Address, src: &[u8]) -> Result<usize, VtHookError> {
    let region = maps::region_of(dst.get())?;
    if !region.prot.contains(Prot::W) {
        return Err(VtHookError::NoAccess);
    }

    let size = src.len().min(region.end - dst.get());
    std::ptr::copy_nonoverlapping(src.as_ptr(), dst.as_mut_ptr::<u8>(), size);
    Ok(size)
}

#[cfg(target_os = "macos")]
unsafe fn safe_mem_read_impl(src: Address, dst: &mut [u8]) -> Result<usize, VtHookError> {
    // No page probing on this platform; the copy itself is the probe.
    std::ptr::copy_nonoverlapping(src.as_ptr::<u8>(), dst.as_mut_ptr(), dst.len());
    Ok(dst.len())
}

#[cfg(target_os = "macos")]
unsafe fn safe_mem_write_impl(dst: Address, src: &[u8]) -> Result<usize, VtHookError> {
    std::ptr::copy_nonoverlapping(src.as_ptr(), dst.as_mut_ptr::<u8>(), src.len());
    Ok(src.len())
}

#[cfg(windows)]
unsafe fn safe_mem_read_impl(src: Address, dst: &mut [u8]) -> Result<usize, VtHookError> {
    use std::ffi::c_void;
    use windows_sys::Win32::Foundation::{GetLastError, ERROR_PARTIAL_COPY};
    use windows_sys::Win32::System::Diagnostics::Debug::ReadProcessMemory;
    use windows_sys::Win32::System::Memory::{VirtualQueryEx, MEMORY_BASIC_INFORMATION};
    use windows_sys::Win32::System::Threading::GetCurrentProcess;

    let process = GetCurrentProcess();
    let mut read = 0usize;

    let ok = ReadProcessMemory(
        process,
        src.as_ptr::<c_void>(),
        dst.as_mut_ptr().cast(),
        dst.len(),
        &mut read,
    );
    if ok != 0 && read > 0 {
        return Ok(read);
    }

    // Retry a partial copy, limited by the end of the memory region.
    if GetLastError() == ERROR_PARTIAL_COPY {
        let mut info: MEMORY_BASIC_INFORMATION = std::mem::zeroed();
        if VirtualQueryEx(
            process,
            src.as_ptr::<c_void>(),
            &mut info,
            std::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
        ) != 0
        {
            let end = info.BaseAddress as usize + info.RegionSize;
            if src.get() + dst.len() > end {
                let ok = ReadProcessMemory(
                    process,
                    src.as_ptr::<c_void>(),
                    dst.as_mut_ptr().cast(),
                    end - src.get(),
                    &mut read,
                );
                if ok != 0 && read > 0 {
                    return Ok(read);
                }
            }
        }
    }

    Err(VtHookError::NoAccess)
}

#[cfg(windows)]
unsafe fn safe_mem_write_impl(dst: Address, src: &[u8]) -> Result<usize, VtHookError> {
    use std::ffi::c_void;
    use windows_sys::Win32::System::Diagnostics::Debug::WriteProcessMemory;
    use windows_sys::Win32::System::Threading::GetCurrentProcess;

    let mut written = 0usize;
    let ok = WriteProcessMemory(
        GetCurrentProcess(),
        dst.as_mut_ptr::<c_void>(),
        src.as_ptr().cast(),
        src.len(),
        &mut written,
    );
    if ok != 0 {
        Ok(written)
    } else {
        Err(VtHookError::NoAccess)
    }
}

/// Sets the protection of the page-aligned range enclosing
/// `dst..dst + size` and returns the previous flags.
///
/// On Linux the previous flags come from `/proc/self/maps` (or
/// [`Prot::UNSET`] when the lookup fails); on macOS the platform API does
/// not report the prior state, so `R | X` is returned.
///
/// # Safety
///
/// Changing the protection of pages another thread is concurrently
/// executing or writing is undefined; the caller must own the region for
/// the duration.
pub unsafe fn protect(dst: Address, size: usize, flags: Prot) -> Result<Prot, VtHookError> {
    protect_impl(dst, size, flags)
}

#[cfg(unix)]
unsafe fn protect_impl(dst: Address, size: usize, flags: Prot) -> Result<Prot, VtHookError> {
    use crate::prot::{page_size, round_down, round_up, to_native};

    #[cfg(target_os = "linux")]
    let old = maps::region_of(dst.get())
        .map(|region| region.prot)
        .unwrap_or(Prot::UNSET);
    #[cfg(target_os = "macos")]
    let old = Prot::R | Prot::X;

    let page = page_size();
    let start = round_down(dst.get(), page);
    let len = round_up(dst.get() + size, page) - start;

    if libc::mprotect(start as *mut libc::c_void, len, to_native(flags)) != 0 {
        return Err(VtHookError::MemoryProtect(errno() as u32));
    }

    Ok(old)
}

#[cfg(target_os = "linux")]
unsafe fn errno() -> i32 {
    *libc::__errno_location()
}

#[cfg(target_os = "macos")]
unsafe fn errno() -> i32 {
    *libc::__error()
}

#[cfg(windows)]
unsafe fn protect_impl(dst: Address, size: usize, flags: Prot) -> Result<Prot, VtHookError> {
    use std::ffi::c_void;
    use windows_sys::Win32::Foundation::GetLastError;
    use windows_sys::Win32::System::Memory::VirtualProtect;

    use crate::prot::{from_native, to_native};

    let mut old = 0u32;
    let ok = VirtualProtect(dst.as_ptr::<c_void>(), size, to_native(flags), &mut old);
    if ok == 0 {
        return Err(VtHookError::MemoryProtect(GetLastError()));
    }

    Ok(from_native(old))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_copy_roundtrip() {
        let src = [1u8, 2, 3, 4];
        let mut dst = [0u8; 4];
        let ok = unsafe {
            mem_copy(
                Address::from_ptr(dst.as_ptr()),
                Address::from_ptr(src.as_ptr()),
                4,
            )
        };
        assert!(ok);
        assert_eq!(dst, src);
    }

    #[test]
    fn safe_read_own_buffer() {
        let src = [0xaau8; 32];
        let mut dst = [0u8; 32];
        let read =
            unsafe { safe_mem_read(Address::from_ptr(src.as_ptr()), &mut dst) }.unwrap();
        assert!(read > 0);
        assert_eq!(&dst[..read], &src[..read]);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn region_of_stack_is_rw() {
        let local = 0u8;
        let region = maps::region_of(&local as *const u8 as usize).unwrap();
        assert!(region.prot.contains(Prot::R));
        assert!(region.prot.contains(Prot::W));
        assert!(region.start <= &local as *const u8 as usize);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn safe_read_clamps_to_region() {
        let region = maps::region_of(safe_read_clamps_to_region as usize).unwrap();
        // One byte before the region end: only one byte can be read.
        let tail = Address::new(region.end - 1);
        let mut dst = [0u8; 16];
        let read = unsafe { safe_mem_read(tail, &mut dst) };
        if let Ok(read) = read {
            assert_eq!(read, 1);
        }
    }
}
