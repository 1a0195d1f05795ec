//! PE backend: handle/path resolution via the loader, section enumeration
//! from the in-memory headers, MSVC RTTI lookup through Complete Object
//! Locators.

use std::ffi::{c_void, CString};
use std::mem;

use lock_api::RawRwLock;
use windows_sys::Win32::Foundation::GetLastError;
use windows_sys::Win32::System::Diagnostics::Debug::{
    FormatMessageA, IMAGE_NT_HEADERS64, IMAGE_SECTION_HEADER, FORMAT_MESSAGE_FROM_SYSTEM,
    FORMAT_MESSAGE_IGNORE_INSERTS,
};
use windows_sys::Win32::System::LibraryLoader::{
    FreeLibrary, GetModuleFileNameA, GetModuleHandleA, GetModuleHandleExA, GetProcAddress,
    LoadLibraryExA, DONT_RESOLVE_DLL_REFERENCES, GET_MODULE_HANDLE_EX_FLAG_PIN,
    LOAD_IGNORE_CODE_AUTHZ_LEVEL, LOAD_LIBRARY_AS_DATAFILE, LOAD_LIBRARY_AS_IMAGE_RESOURCE,
    LOAD_LIBRARY_REQUIRE_SIGNED_TARGET, LOAD_LIBRARY_SEARCH_DLL_LOAD_DIR,
    LOAD_LIBRARY_SEARCH_SYSTEM32, LOAD_LIBRARY_SEARCH_USER_DIRS, LOAD_WITH_ALTERED_SEARCH_PATH,
};
use windows_sys::Win32::System::Memory::{VirtualQuery, MEMORY_BASIC_INFORMATION};
use windows_sys::Win32::System::SystemServices::IMAGE_DOS_HEADER;

use crate::addr::Address;
use crate::err::VtHookError;
use crate::module::{LoadFlags, ModuleImage, Section};

pub(crate) const EXTENSION: &str = ".dll";
pub(crate) const EXECUTABLE_SECTION: &str = ".text";

fn last_error_message() -> String {
    let code = unsafe { GetLastError() };
    let mut buffer = [0u8; 512];
    let len = unsafe {
        FormatMessageA(
            FORMAT_MESSAGE_FROM_SYSTEM | FORMAT_MESSAGE_IGNORE_INSERTS,
            std::ptr::null(),
            code,
            0,
            buffer.as_mut_ptr(),
            buffer.len() as u32,
            std::ptr::null(),
        )
    };

    if len == 0 {
        format!("error code {code}")
    } else {
        String::from_utf8_lossy(&buffer[..len as usize])
            .trim_end()
            .to_owned()
    }
}

fn native_flags(flags: LoadFlags) -> u32 {
    let mut native = 0;
    if flags.contains(LoadFlags::DONT_RESOLVE_DLL_REFERENCES) {
        native |= DONT_RESOLVE_DLL_REFERENCES;
    }
    if flags.contains(LoadFlags::ALTERED_SEARCH_PATH) {
        native |= LOAD_WITH_ALTERED_SEARCH_PATH;
    }
    if flags.contains(LoadFlags::AS_DATAFILE) {
        native |= LOAD_LIBRARY_AS_DATAFILE;
    }
    if flags.contains(LoadFlags::AS_IMAGE_RESOURCE) {
        native |= LOAD_LIBRARY_AS_IMAGE_RESOURCE;
    }
    if flags.contains(LoadFlags::SEARCH_DLL_LOAD_DIR) {
        native |= LOAD_LIBRARY_SEARCH_DLL_LOAD_DIR;
    }
    if flags.contains(LoadFlags::SEARCH_SYSTEM32) {
        native |= LOAD_LIBRARY_SEARCH_SYSTEM32;
    }
    if flags.contains(LoadFlags::SEARCH_USER_DIRS) {
        native |= LOAD_LIBRARY_SEARCH_USER_DIRS;
    }
    if flags.contains(LoadFlags::REQUIRE_SIGNED) {
        native |= LOAD_LIBRARY_REQUIRE_SIGNED_TARGET;
    }
    if flags.contains(LoadFlags::IGNORE_AUTHZ) {
        native |= LOAD_IGNORE_CODE_AUTHZ_LEVEL;
    }
    native
}

fn module_file_name(handle: *mut c_void) -> Result<String, VtHookError> {
    let mut buffer = vec![0u8; 260];
    loop {
        let len =
            unsafe { GetModuleFileNameA(handle, buffer.as_mut_ptr(), buffer.len() as u32) };
        if len == 0 {
            return Err(VtHookError::Loader(last_error_message()));
        }
        if (len as usize) < buffer.len() {
            buffer.truncate(len as usize);
            return Ok(String::from_utf8_lossy(&buffer).into_owned());
        }
        let doubled = buffer.len() * 2;
        buffer.resize(doubled, 0);
    }
}

pub(crate) fn loaded_module_path(name: &str) -> Result<String, VtHookError> {
    let cname = CString::new(name).map_err(|_| VtHookError::InvalidParameter)?;
    let handle = unsafe { GetModuleHandleA(cname.as_ptr() as *const u8) };
    if handle.is_null() {
        return Err(VtHookError::ModuleNotFound(name.to_owned()));
    }
    module_file_name(handle)
}

pub(crate) fn module_path_of(address: Address) -> Result<String, VtHookError> {
    let mut info: MEMORY_BASIC_INFORMATION = unsafe { mem::zeroed() };
    let len = unsafe {
        VirtualQuery(
            address.as_ptr::<c_void>(),
            &mut info,
            mem::size_of::<MEMORY_BASIC_INFORMATION>(),
        )
    };
    if len == 0 || info.AllocationBase.is_null() {
        return Err(VtHookError::ModuleNotFound(format!("{:#x}", address.get())));
    }

    module_file_name(info.AllocationBase)
}

pub(crate) unsafe fn path_from_handle(handle: *mut c_void) -> Result<String, VtHookError> {
    module_file_name(handle)
}

pub(crate) fn open(path: &str, flags: LoadFlags) -> Result<*mut c_void, VtHookError> {
    let cpath = CString::new(path).map_err(|_| VtHookError::InvalidParameter)?;

    let handle = if flags.contains(LoadFlags::NOLOAD) {
        // Handle-only: take a reference on the already-resident image
        // instead of loading it.
        let mut handle: *mut c_void = std::ptr::null_mut();
        let pin = if flags.contains(LoadFlags::PIN) {
            GET_MODULE_HANDLE_EX_FLAG_PIN
        } else {
            0
        };
        unsafe { GetModuleHandleExA(pin, cpath.as_ptr() as *const u8, &mut handle) };
        handle
    } else {
        let handle =
            unsafe { LoadLibraryExA(cpath.as_ptr() as *const u8, std::ptr::null_mut(), native_flags(flags)) };
        if !handle.is_null() && flags.contains(LoadFlags::PIN) {
            let mut pinned: *mut c_void = std::ptr::null_mut();
            unsafe {
                GetModuleHandleExA(
                    GET_MODULE_HANDLE_EX_FLAG_PIN,
                    cpath.as_ptr() as *const u8,
                    &mut pinned,
                )
            };
        }
        handle
    };

    if handle.is_null() {
        return Err(VtHookError::Loader(last_error_message()));
    }
    Ok(handle)
}

pub(crate) unsafe fn close(handle: *mut c_void) {
    FreeLibrary(handle);
}

pub(crate) unsafe fn base(handle: *mut c_void) -> Address {
    Address::new(handle as usize)
}

pub(crate) unsafe fn symbol(handle: *mut c_void, name: &str) -> Option<Address> {
    let cname = CString::new(name).ok()?;
    GetProcAddress(handle, cname.as_ptr() as *const u8)
        .map(|function| Address::new(function as usize))
}

/// Walks `IMAGE_SECTION_HEADER`s from the in-memory PE headers.
pub(crate) fn sections(handle: *mut c_void, path: &str) -> Result<Vec<Section>, VtHookError> {
    let image_base = handle as usize;

    unsafe {
        let dos = &*(image_base as *const IMAGE_DOS_HEADER);
        if dos.e_magic != 0x5a4d {
            return Err(VtHookError::Loader(format!("not a PE image: {path}")));
        }

        let nt_address = image_base + dos.e_lfanew as usize;
        let nt = &*(nt_address as *const IMAGE_NT_HEADERS64);
        if nt.Signature != 0x4550 {
            return Err(VtHookError::Loader(format!("not a PE image: {path}")));
        }

        let first_section = nt_address
            + mem::offset_of!(IMAGE_NT_HEADERS64, OptionalHeader)
            + nt.FileHeader.SizeOfOptionalHeader as usize;

        let count = nt.FileHeader.NumberOfSections as usize;
        let mut sections = Vec::with_capacity(count);
        for i in 0..count {
            let header = &*((first_section + i * mem::size_of::<IMAGE_SECTION_HEADER>())
                as *const IMAGE_SECTION_HEADER);

            let name = String::from_utf8_lossy(&header.Name);
            let name = name.trim_end_matches('\0');
            if name.is_empty() {
                continue;
            }

            sections.push(Section::new(
                name,
                Address::new(image_base + header.VirtualAddress as usize),
                header.SizeOfRawData as usize,
            ));
        }

        Ok(sections)
    }
}

/// MSVC RTTI walk: find the type-descriptor name in `.data`, scan `.rdata`
/// for the descriptor's image-relative address, confirm a Complete Object
/// Locator around each hit (signature 1, object offset 0), then find the
/// vtable that points at the locator. The virtual function pointers start
/// one word past that pointer.
pub(crate) fn virtual_table<R: RawRwLock>(
    module: &ModuleImage<R>,
    name: &str,
    decorated: bool,
) -> Option<Address> {
    let data = module.section(".data")?;
    let rdata = module.section(".rdata")?;

    let decorated_name = if decorated {
        name.to_owned()
    } else {
        format!(".?AV{name}@@")
    };
    let mut needle = decorated_name.into_bytes();
    needle.push(0);

    let descriptor_name = module.find_bytes(&needle, None, data)?;
    let type_descriptor = descriptor_name - 0x10usize;

    // The descriptor is referenced by a 4-byte RVA inside each locator.
    let rva = (type_descriptor.get() - module.base().get()) as u32;

    let mut start = None;
    while let Some(reference) = module.find_bytes(&rva.to_ne_bytes(), start, rdata) {
        let signature = unsafe { (reference - 0xcusize).read::<i32>() };
        let object_offset = unsafe { (reference - 0x8usize).read::<i32>() };
        if signature == 1 && object_offset == 0 {
            let locator = reference - 0xcusize;
            if let Some(vtable_meta) =
                module.find_bytes(&locator.get().to_ne_bytes(), None, rdata)
            {
                return Some(vtable_meta + 0x8usize);
            }
        }
        start = Some(reference + 0x4usize);
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::LocalModule;

    #[test]
    fn resolves_kernel32() {
        let module = LocalModule::from_name("kernel32").unwrap();
        assert!(module.name().eq_ignore_ascii_case("kernel32.dll"));
        assert!(module.executable_section().is_some());

        let load_library = module.symbol("LoadLibraryExA").unwrap();
        assert!(load_library.is_valid());
        assert!(module.symbol("definitely_not_a_real_export_42").is_none());

        let again = LocalModule::from_address(load_library).unwrap();
        assert!(again.name().eq_ignore_ascii_case("kernel32.dll"));
    }
}
