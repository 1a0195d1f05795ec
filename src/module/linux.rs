//! ELF/glibc backend: name resolution over `dl_iterate_phdr`, section
//! enumeration from the on-disk image, Itanium-ABI RTTI lookup.

use std::ffi::{c_void, CStr, CString};
use std::fs::File;
use std::mem;

use lock_api::RawRwLock;

use crate::addr::Address;
use crate::err::VtHookError;
use crate::module::{LoadFlags, ModuleImage, Section};

pub(crate) const EXTENSION: &str = ".so";
pub(crate) const EXECUTABLE_SECTION: &str = ".text";

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

struct PhdrSearch<'a> {
    name: &'a str,
    path: Option<String>,
}

unsafe extern "C" fn phdr_callback(
    info: *mut libc::dl_phdr_info,
    _size: libc::size_t,
    data: *mut c_void,
) -> libc::c_int {
    let search = &mut *(data as *mut PhdrSearch<'_>);
    if (*info).dlpi_name.is_null() {
        return 0;
    }

    if let Ok(path) = CStr::from_ptr((*info).dlpi_name).to_str() {
        if !path.is_empty() && path.contains(search.name) {
            search.path = Some(path.to_owned());
        }
    }
    0
}

pub(crate) fn loaded_module_path(name: &str) -> Result<String, VtHookError> {
    let mut search = PhdrSearch { name, path: None };
    unsafe {
        libc::dl_iterate_phdr(
            Some(phdr_callback),
            &mut search as *mut PhdrSearch<'_> as *mut c_void,
        );
    }

    search
        .path
        .ok_or_else(|| VtHookError::ModuleNotFound(name.to_owned()))
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

// `libc` does not expose glibc's `struct link_map` (declared in `<link.h>`);
// its leading fields are part of the stable public ABI, so we mirror them
// here rather than pull in a whole ELF-loader crate for one struct.
#[repr(C)]
struct link_map {
    l_addr: libc::c_ulong,
    l_name: *mut libc::c_char,
    l_ld: *mut c_void,
    l_next: *mut c_void,
    l_prev: *mut c_void,
}

unsafe fn link_map(handle: *mut c_void) -> Result<*mut link_map, VtHookError> {
    let mut map: *mut link_map = std::ptr::null_mut();
    let status = libc::dlinfo(
        handle,
        libc::RTLD_DI_LINKMAP,
        &mut map as *mut *mut link_map as *mut c_void,
    );
    if status != 0 || map.is_null() {
        return Err(VtHookError::Loader(last_dl_error()));
    }
    Ok(map)
}

pub(crate) unsafe fn path_from_handle(handle: *mut c_void) -> Result<String, VtHookError> {
    let map = link_map(handle)?;
    if (*map).l_name.is_null() {
        return Err(VtHookError::Loader("link map carries no path".to_owned()));
    }

    let path = CStr::from_ptr((*map).l_name).to_string_lossy().into_owned();
    if path.is_empty() {
        return Err(VtHookError::Loader("link map carries no path".to_owned()));
    }
    Ok(path)
}

pub(crate) fn open(path: &str, flags: LoadFlags) -> Result<*mut c_void, VtHookError> {
    let cpath = CString::new(path).map_err(|_| VtHookError::InvalidParameter)?;

    let handle = unsafe { libc::dlopen(cpath.as_ptr(), native_flags(flags)) };
    if handle.is_null() {
        return Err(VtHookError::Loader(last_dl_error()));
    }

    if flags.contains(LoadFlags::PIN) {
        // An extra reference that is never released, so a later unload of
        // the library has no effect.
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
    match link_map(handle) {
        Ok(map) => Address::new((*map).l_addr as usize),
        Err(_) => Address::INVALID,
    }
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

/// Walks the section headers of the on-disk image; the runtime addresses
/// are the recorded `sh_addr` values displaced by the load base.
pub(crate) fn sections(handle: *mut c_void, path: &str) -> Result<Vec<Section>, VtHookError> {
    let load_base = unsafe { link_map(handle)? };
    let load_base = unsafe { (*load_base).l_addr as usize };

    let file = File::open(path)?;
    let map = unsafe { memmap2::Mmap::map(&file) }?;
    let data = &map[..];

    if data.len() < mem::size_of::<libc::Elf64_Ehdr>() || &data[..4] != b"\x7fELF" {
        return Err(VtHookError::Loader(format!("not an ELF image: {path}")));
    }

    let ehdr = unsafe { &*(data.as_ptr() as *const libc::Elf64_Ehdr) };
    let shoff = ehdr.e_shoff as usize;
    let shentsize = ehdr.e_shentsize as usize;
    let shnum = ehdr.e_shnum as usize;

    if shentsize < mem::size_of::<libc::Elf64_Shdr>()
        || shoff + shnum * shentsize > data.len()
        || (ehdr.e_shstrndx as usize) >= shnum
    {
        return Err(VtHookError::Loader(format!(
            "malformed section headers: {path}"
        )));
    }

    let shdr_at = |index: usize| unsafe {
        &*(data.as_ptr().add(shoff + index * shentsize) as *const libc::Elf64_Shdr)
    };
    let strtab_offset = shdr_at(ehdr.e_shstrndx as usize).sh_offset as usize;

    let mut sections = Vec::with_capacity(shnum);
    for i in 0..shnum {
        let shdr = shdr_at(i);
        let name_offset = strtab_offset + shdr.sh_name as usize;
        if name_offset >= data.len() {
            continue;
        }

        let name =
            unsafe { CStr::from_ptr(data.as_ptr().add(name_offset) as *const libc::c_char) };
        let name = name.to_string_lossy();
        if name.is_empty() {
            continue;
        }

        sections.push(Section::new(
            name.into_owned(),
            Address::new(load_base + shdr.sh_addr as usize),
            shdr.sh_size as usize,
        ));
    }

    Ok(sections)
}

/// Itanium-ABI RTTI walk: find the mangled type name in `.rodata`, find the
/// `type_info` that points at it, then find a vtable whose `type_info` slot
/// references it with an `offset_to_top` of zero. The virtual function
/// pointers start one word past that slot.
pub(crate) fn virtual_table<R: RawRwLock>(
    module: &ModuleImage<R>,
    name: &str,
    decorated: bool,
) -> Option<Address> {
    let rodata = module.section(".rodata")?;
    let rel_ro = module.section(".data.rel.ro")?;

    let decorated_name = if decorated {
        name.to_owned()
    } else {
        format!("{}{}", name.len(), name)
    };
    let mut needle = decorated_name.into_bytes();
    needle.push(0);

    let type_info_name = module.find_bytes(&needle, None, rodata)?;

    // The hit is the `__type_name` field of the owning `type_info`.
    let name_reference =
        module.find_bytes(&type_info_name.get().to_ne_bytes(), None, rel_ro)?;
    let type_info = name_reference - 0x8usize;

    for section_name in [".data.rel.ro", ".data.rel.ro.local"] {
        let Some(section) = module.section(section_name) else {
            continue;
        };

        let mut start = None;
        while let Some(reference) =
            module.find_bytes(&type_info.get().to_ne_bytes(), start, section)
        {
            // A vtable's type_info slot is preceded by offset_to_top.
            if unsafe { (reference - 0x8usize).read::<i64>() } == 0 {
                return Some(reference + 0x8usize);
            }
            start = Some(reference + 0x8usize);
        }
    }

    None
}
