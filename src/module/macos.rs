//! Mach-O backend: section enumeration from the image load commands and
//! `dlsym` symbol lookup. RTTI lookup is not implemented on this platform.

use std::ffi::{c_void, CStr, CString};
use std::mem;

use lock_api::RawRwLock;

use crate::addr::Address;
use crate::err::VtHookError;
use crate::module::{LoadFlags, ModuleImage, Section};

pub(crate) const EXTENSION: &str = ".dylib";
pub(crate) const EXECUTABLE_SECTION: &str = "__TEXT";

const LC_SEGMENT_64: u32 = 0x19;
const MH_MAGIC_64: u32 = 0xfeed_facf;

// Loader structures per the Mach-O ABI; libc does not carry them.
#[repr(C)]
#[allow(dead_code)]
struct MachHeader64 {
    magic: u32,
    cputype: i32,
    cpusubtype: i32,
    filetype: u32,
    ncmds: u32,
    sizeofcmds: u32,
    flags: u32,
    reserved: u32,
}

#[repr(C)]
#[allow(dead_code)]
struct LoadCommand {
    cmd: u32,
    cmdsize: u32,
}

#[repr(C)]
#[allow(dead_code)]
struct SegmentCommand64 {
    cmd: u32,
    cmdsize: u32,
    segname: [u8; 16],
    vmaddr: u64,
    vmsize: u64,
    fileoff: u64,
    filesize: u64,
    maxprot: i32,
    initprot: i32,
    nsects: u32,
    flags: u32,
}

#[repr(C)]
#[allow(dead_code)]
struct Section64 {
    sectname: [u8; 16],
    segname: [u8; 16],
    addr: u64,
    size: u64,
    offset: u32,
    align: u32,
    reloff: u32,
    nreloc: u32,
    flags: u32,
    reserved1: u32,
    reserved2: u32,
    reserved3: u32,
}

fn last_dl_error() -> String {
    let err = unsafe { libc::dlerror() };
    if err.is_null() {
        "unknown loader error".to_owned()
    } else {
        unsafe { CStr::from_ptr(err) }.to_string_lossy().into_owned()
    }
}

fn native_flags(flags: LoadFlags) -> libc::c_int {
    let mut native = if flags.contains(LoadFlags::NOW) {
        libc::RTLD_NOW
    } else {
        libc::RTLD_LAZY
    };
    if flags.contains(LoadFlags::GLOBAL) {
        native |= libc::RTLD_GLOBAL;
    }
    if flags.contains(LoadFlags::LOCAL) {
        native |= libc::RTLD_LOCAL;
    }
    if flags.contains(LoadFlags::NODELETE) {
        native |= libc::RTLD_NODELETE;
    }
    if flags.contains(LoadFlags::NOLOAD) {
        native |= libc::RTLD_NOLOAD;
    }
    native
}

pub(crate) fn loaded_module_path(name: &str) -> Result<String, VtHookError> {
    // No phdr-style walk here; the loader resolves the adorned name itself.
    Ok(name.to_owned())
}

pub(crate) fn module_path_of(address: Address) -> Result<String, VtHookError> {
    let mut info: libc::Dl_info = unsafe { mem::zeroed() };
    let found = unsafe { libc::dladdr(address.as_ptr(), &mut info) };
    if found == 0 || info.dli_fbase.is_null() || info.dli_fname.is_null() {
        return Err(VtHookError::ModuleNotFound(format!("{:#x}", address.get())));
    }

    Ok(unsafe { CStr::from_ptr(info.dli_fname) }
        .to_string_lossy()
        .into_owned())
}

pub(crate) unsafe fn path_from_handle(_handle: *mut c_void) -> Result<String, VtHookError> {
    // dyld offers no handle-to-path query equivalent to dlinfo(LINKMAP).
    Err(VtHookError::InvalidParameter)
}

pub(crate) fn open(path: &str, flags: LoadFlags) -> Result<*mut c_void, VtHookError> {
    let cpath = CString::new(path).map_err(|_| VtHookError::InvalidParameter)?;

    let handle = unsafe { libc::dlopen(cpath.as_ptr(), native_flags(flags)) };
    if handle.is_null() {
        return Err(VtHookError::Loader(last_dl_error()));
    }

    if flags.contains(LoadFlags::PIN) {
        unsafe {
            libc::dlopen(
                cpath.as_ptr(),
                libc::RTLD_LAZY | libc::RTLD_NOLOAD | libc::RTLD_NODELETE,
            )
        };
    }

    Ok(handle)
}

pub(crate) unsafe fn close(handle: *mut c_void) {
    libc::dlclose(handle);
}

pub(crate) unsafe fn base(handle: *mut c_void) -> Address {
    Address::new(handle as usize)
}

pub(crate) unsafe fn symbol(handle: *mut c_void, name: &str) -> Option<Address> {
    let cname = CString::new(name).ok()?;
    let sym = libc::dlsym(handle, cname.as_ptr());
    if sym.is_null() {
        None
    } else {
        Some(Address::new(sym as usize))
    }
}

fn fixed_name(raw: &[u8; 16]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

/// Walks the load commands of the mapped image, recording every section of
/// every 64-bit segment.
pub(crate) fn sections(handle: *mut c_void, path: &str) -> Result<Vec<Section>, VtHookError> {
    let image_base = handle as usize;

    unsafe {
        let header = &*(image_base as *const MachHeader64);
        if header.magic != MH_MAGIC_64 {
            return Err(VtHookError::Loader(format!("not a Mach-O image: {path}")));
        }

        let mut sections = Vec::new();
        let mut command = image_base + mem::size_of::<MachHeader64>();
        for _ in 0..header.ncmds {
            let load = &*(command as *const LoadCommand);
            if load.cmd == LC_SEGMENT_64 {
                let segment = &*(command as *const SegmentCommand64);
                let first = (command + mem::size_of::<SegmentCommand64>()) as *const Section64;
                for j in 0..segment.nsects as usize {
                    let section = &*first.add(j);
                    sections.push(Section::new(
                        fixed_name(&section.sectname),
                        Address::new(image_base + section.addr as usize),
                        section.size as usize,
                    ));
                }
            }
            command += load.cmdsize as usize;
        }

        Ok(sections)
    }
}

/// RTTI lookup is not implemented for Mach-O images.
pub(crate) fn virtual_table<R: RawRwLock>(
    _module: &ModuleImage<R>,
    _name: &str,
    _decorated: bool,
) -> Option<Address> {
    None
}
