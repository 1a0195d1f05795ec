use std::collections::HashMap;
use std::ffi::c_void;

use lock_api::{RawRwLock, RwLock};
use tracing::{debug, trace};

use crate::addr::Address;
use crate::err::VtHookError;
use crate::pattern::Pattern;
use crate::scanner;

use bitflags::bitflags;

#[cfg(windows)]
#[path = "module/windows.rs"]
pub(crate) mod imp;

#[cfg(target_os = "linux")]
#[path = "module/linux.rs"]
pub(crate) mod imp;

#[cfg(target_os = "macos")]
#[path = "module/macos.rs"]
pub(crate) mod imp;

bitflags! {
    /// Abstract loader flags, translated to the platform loader's bits.
    ///
    /// Flags with no equivalent on the current platform are ignored there.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LoadFlags: u32 {
        /// Resolve symbols lazily (`RTLD_LAZY`)
        const LAZY = 1 << 0;
        /// Resolve all symbols at load time (`RTLD_NOW`)
        const NOW = 1 << 1;
        /// Make symbols available to later loads (`RTLD_GLOBAL`)
        const GLOBAL = 1 << 2;
        /// Keep symbols local (`RTLD_LOCAL`)
        const LOCAL = 1 << 3;
        /// Never unload the library (`RTLD_NODELETE`)
        const NODELETE = 1 << 4;
        /// Only obtain a handle if the image is already resident
        /// (`RTLD_NOLOAD` / `GetModuleHandleEx`)
        const NOLOAD = 1 << 5;
        /// Do not run initializers or resolve imports
        /// (`DONT_RESOLVE_DLL_REFERENCES`)
        const DONT_RESOLVE_DLL_REFERENCES = 1 << 6;
        /// `LOAD_WITH_ALTERED_SEARCH_PATH`
        const ALTERED_SEARCH_PATH = 1 << 7;
        /// Map as a data file (`LOAD_LIBRARY_AS_DATAFILE`)
        const AS_DATAFILE = 1 << 8;
        /// Map as an image resource (`LOAD_LIBRARY_AS_IMAGE_RESOURCE`)
        const AS_IMAGE_RESOURCE = 1 << 9;
        /// `LOAD_LIBRARY_SEARCH_DLL_LOAD_DIR`
        const SEARCH_DLL_LOAD_DIR = 1 << 10;
        /// `LOAD_LIBRARY_SEARCH_SYSTEM32`
        const SEARCH_SYSTEM32 = 1 << 11;
        /// `LOAD_LIBRARY_SEARCH_USER_DIRS`
        const SEARCH_USER_DIRS = 1 << 12;
        /// `LOAD_LIBRARY_REQUIRE_SIGNED_TARGET`
        const REQUIRE_SIGNED = 1 << 13;
        /// `LOAD_IGNORE_CODE_AUTHZ_LEVEL`
        const IGNORE_AUTHZ = 1 << 14;
        /// Pin the image for the life of the process; unloading has no
        /// effect while pinned. Takes an extra pinning reference in
        /// addition to the normal handle.
        const PIN = 1 << 15;
    }
}

impl Default for LoadFlags {
    fn default() -> Self {
        LoadFlags::LAZY | LoadFlags::NOLOAD | LoadFlags::DONT_RESOLVE_DLL_REFERENCES
    }
}

/// A named, contiguous memory range of a mapped image.
#[derive(Debug, Clone)]
pub struct Section {
    name: String,
    base: Address,
    size: usize,
}

impl Section {
    pub(crate) fn new(name: impl Into<String>, base: Address, size: usize) -> Self {
        Self {
            name: name.into(),
            base,
            size,
        }
    }

    /// Section name as recorded in the image headers.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Start address of the section in this process.
    #[must_use]
    pub fn base(&self) -> Address {
        self.base
    }

    /// Section size in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// A section is valid when its base address is non-null.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.base.is_valid()
    }

    /// The section contents as a byte slice.
    ///
    /// # Safety
    ///
    /// The whole range `base..base + size` must still be mapped and
    /// readable, which holds while the owning [`Module`] is alive and the
    /// image has not been unmapped behind its back.
    #[must_use]
    pub unsafe fn bytes(&self) -> &[u8] {
        std::slice::from_raw_parts(self.base.as_ptr::<u8>(), self.size)
    }
}

/// A no-op [`RawRwLock`] for single-threaded [`Module`] use: scan-cache
/// bookkeeping still happens, but with zero synchronization cost. A module
/// parameterized with it is deliberately not `Sync`.
pub struct NullLock {
    _not_sync: std::marker::PhantomData<std::cell::Cell<()>>,
}

unsafe impl RawRwLock for NullLock {
    const INIT: Self = NullLock {
        _not_sync: std::marker::PhantomData,
    };

    type GuardMarker = lock_api::GuardNoSend;

    fn lock_shared(&self) {}

    fn try_lock_shared(&self) -> bool {
        true
    }

    unsafe fn unlock_shared(&self) {}

    fn lock_exclusive(&self) {}

    fn try_lock_exclusive(&self) -> bool {
        true
    }

    unsafe fn unlock_exclusive(&self) {}
}

/// A [`ModuleImage`] with the thread-safe cache lock; the type to reach for
/// unless single-threaded use is certain.
pub type Module = ModuleImage;

/// A [`ModuleImage`] without cache synchronization, for single-threaded use.
pub type LocalModule = ModuleImage<NullLock>;

#[derive(PartialEq, Eq, Hash)]
struct ScanKey {
    pattern: Pattern,
    from: usize,
    section_base: usize,
    section_size: usize,
}

/// A dynamic library mapped into the current process: its sections, its
/// exports, and pattern/RTTI lookup over its memory.
///
/// The type parameter selects the scan-cache lock: the default
/// (`parking_lot::RawRwLock`) is thread-safe, [`NullLock`] (via
/// [`LocalModule`]) is free but single-threaded.
///
/// ```no_run
/// use vthook::Module;
///
/// let module = Module::from_name("server").unwrap();
/// let sig = module.signature("48 8B 05 ?? ?? ?? ?? 48 85 C0");
/// if let Some(hit) = sig.find(None, None) {
///     println!("match at {hit:x}");
/// }
/// ```
pub struct ModuleImage<R: RawRwLock = parking_lot::RawRwLock> {
    handle: *mut c_void,
    path: String,
    sections: Vec<Section>,
    executable: Option<usize>,
    cache: RwLock<R, HashMap<ScanKey, usize>>,
}

unsafe impl<R: RawRwLock + Send> Send for ModuleImage<R> {}
unsafe impl<R: RawRwLock + Send + Sync> Sync for ModuleImage<R> {}

impl<R: RawRwLock> ModuleImage<R> {
    /// Opens an already-loaded module by its unadorned name, appending the
    /// platform extension when the name does not carry it.
    pub fn from_name(name: &str) -> Result<Self, VtHookError> {
        if name.is_empty() {
            return Err(VtHookError::InvalidParameter);
        }

        let mut adorned = name.to_owned();
        if !adorned.contains(imp::EXTENSION) {
            adorned.push_str(imp::EXTENSION);
        }

        let path = imp::loaded_module_path(&adorned)?;
        Self::load(&path, LoadFlags::default())
    }

    /// Opens the module whose mapped image contains `address`.
    pub fn from_address(address: Address) -> Result<Self, VtHookError> {
        if !address.is_valid() {
            return Err(VtHookError::InvalidParameter);
        }

        let path = imp::module_path_of(address)?;
        Self::load(&path, LoadFlags::default())
    }

    /// Opens a module from a native loader handle.
    ///
    /// # Safety
    ///
    /// `handle` must be a live handle returned by the platform loader.
    pub unsafe fn from_handle(handle: *mut c_void) -> Result<Self, VtHookError> {
        if handle.is_null() {
            return Err(VtHookError::InvalidParameter);
        }

        let path = imp::path_from_handle(handle)?;
        Self::load(&path, LoadFlags::default())
    }

    /// Opens a module from an on-disk path with explicit loader flags, then
    /// enumerates its sections.
    pub fn load(path: &str, flags: LoadFlags) -> Result<Self, VtHookError> {
        if path.is_empty() {
            return Err(VtHookError::InvalidParameter);
        }

        let handle = imp::open(path, flags)?;
        let sections = imp::sections(handle, path)?;
        let executable = sections
            .iter()
            .position(|section| section.name() == imp::EXECUTABLE_SECTION);

        debug!(path, sections = sections.len(), "module opened");

        Ok(Self {
            handle,
            path: path.to_owned(),
            sections,
            executable,
            cache: RwLock::new(HashMap::new()),
        })
    }

    /// The native loader handle.
    #[must_use]
    pub fn handle(&self) -> *mut c_void {
        self.handle
    }

    /// The canonical on-disk path of the mapped image.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The file-name component of the path.
    #[must_use]
    pub fn name(&self) -> &str {
        self.path
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(&self.path)
    }

    /// The image load base.
    #[must_use]
    pub fn base(&self) -> Address {
        unsafe { imp::base(self.handle) }
    }

    /// All enumerated sections, in image order.
    #[must_use]
    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    /// Looks a section up by exact name.
    #[must_use]
    pub fn section(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|section| section.name() == name)
    }

    /// The executable section (`.text` / `__TEXT`), when present.
    #[must_use]
    pub fn executable_section(&self) -> Option<&Section> {
        self.executable.map(|index| &self.sections[index])
    }

    /// Resolves an exported symbol.
    #[must_use]
    pub fn symbol(&self, name: &str) -> Option<Address> {
        if name.is_empty() {
            return None;
        }
        unsafe { imp::symbol(self.handle, name) }
    }

    /// Locates a virtual table by RTTI type name.
    ///
    /// When `decorated` is false the platform decoration is applied first
    /// (`.?AV<Name>@@` for MSVC images, `<len><Name>` for Itanium ones).
    /// Only vtables at object offset zero are found; types whose vtable
    /// lives at a non-zero offset (multiple inheritance) are not matched.
    /// Unimplemented on macOS.
    #[must_use]
    pub fn vtable(&self, name: &str, decorated: bool) -> Option<Address> {
        if name.is_empty() {
            return None;
        }

        let found = imp::virtual_table(self, name, decorated);
        trace!(name, found = found.is_some(), "vtable lookup");
        found
    }

    /// Scans for `pattern`, starting at `start` (defaults to the section
    /// base) within `section` (defaults to the executable section).
    /// Successful scans are memoized per module.
    #[must_use]
    pub fn find_pattern(
        &self,
        pattern: &Pattern,
        start: Option<Address>,
        section: Option<&Section>,
    ) -> Option<Address> {
        let section = match section {
            Some(section) => section,
            None => self.executable_section()?,
        };
        if !section.is_valid() || pattern.is_empty() || pattern.len() > section.size() {
            return None;
        }

        let from = self.start_offset(start, section, pattern.len())?;

        let key = ScanKey {
            pattern: *pattern,
            from,
            section_base: section.base().get(),
            section_size: section.size(),
        };
        if let Some(&hit) = self.cache.read().get(&key) {
            return Some(Address::new(hit));
        }

        let data = unsafe { section.bytes() };
        let offset = scanner::find(data, from, pattern.bytes(), pattern.mask())?;
        let hit = section.base() + offset;

        self.cache.write().insert(key, hit.get());
        Some(hit)
    }

    /// Uncached scan for an exact byte sequence of any length; used for the
    /// RTTI lookups, whose needles can exceed [`Pattern`] capacity.
    pub(crate) fn find_bytes(
        &self,
        needle: &[u8],
        start: Option<Address>,
        section: &Section,
    ) -> Option<Address> {
        if !section.is_valid() || needle.is_empty() || needle.len() > section.size() {
            return None;
        }

        let from = self.start_offset(start, section, needle.len())?;
        let mask = vec![b'x'; needle.len()];
        let data = unsafe { section.bytes() };
        let offset = scanner::find(data, from, needle, &mask)?;
        Some(section.base() + offset)
    }

    fn start_offset(
        &self,
        start: Option<Address>,
        section: &Section,
        needle_len: usize,
    ) -> Option<usize> {
        match start {
            None => Some(0),
            Some(start) => {
                let last = section.base() + (section.size() - needle_len);
                if start < section.base() || start > last {
                    None
                } else {
                    Some(start.get() - section.base().get())
                }
            }
        }
    }

    /// Parses `source` and binds the resulting pattern to this module.
    #[must_use]
    pub fn signature(&self, source: &str) -> Signature<'_, R> {
        self.bind(Pattern::parse(source))
    }

    /// Binds an already-parsed pattern to this module.
    #[must_use]
    pub fn bind(&self, pattern: Pattern) -> Signature<'_, R> {
        Signature {
            pattern,
            module: self,
        }
    }
}

impl<R: RawRwLock> Drop for ModuleImage<R> {
    fn drop(&mut self) {
        if !self.handle.is_null() {
            unsafe { imp::close(self.handle) };
        }
    }
}

impl<R: RawRwLock> std::fmt::Debug for ModuleImage<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Module")
            .field("path", &self.path)
            .field("sections", &self.sections.len())
            .finish()
    }
}

/// A parsed pattern bound to the module it searches, with the usual
/// follow-up combinators applied to the match address.
pub struct Signature<'m, R: RawRwLock = parking_lot::RawRwLock> {
    pattern: Pattern,
    module: &'m ModuleImage<R>,
}

impl<'m, R: RawRwLock> Signature<'m, R> {
    /// The bound pattern.
    #[must_use]
    pub fn pattern(&self) -> &Pattern {
        &self.pattern
    }

    /// Scans for the pattern; `start` and `section` default as in
    /// [`ModuleImage::find_pattern`].
    #[must_use]
    pub fn find(&self, start: Option<Address>, section: Option<&Section>) -> Option<Address> {
        self.module.find_pattern(&self.pattern, start, section)
    }

    /// Scans, then displaces the match by `delta` bytes.
    #[must_use]
    pub fn offset(
        &self,
        delta: isize,
        start: Option<Address>,
        section: Option<&Section>,
    ) -> Option<Address> {
        self.find(start, section).map(|hit| hit.offset(delta))
    }

    /// Scans, then follows `levels` levels of indirection from the match.
    ///
    /// # Safety
    ///
    /// As for [`Address::deref`]: every dereferenced address must be mapped.
    #[must_use]
    pub unsafe fn deref(
        &self,
        levels: usize,
        start: Option<Address>,
        section: Option<&Section>,
    ) -> Option<Address> {
        self.find(start, section).map(|hit| hit.deref(levels, 0))
    }

    /// Scans, then resolves the match as a relative call/jump operand.
    /// The defaults for an `E8 cd` near call are `opcode_offset = 1`,
    /// `next_instruction_offset = 5`.
    ///
    /// # Safety
    ///
    /// As for [`Address::resolve_relative`].
    #[must_use]
    pub unsafe fn follow_near_call(
        &self,
        opcode_offset: isize,
        next_instruction_offset: isize,
        start: Option<Address>,
        section: Option<&Section>,
    ) -> Option<Address> {
        self.find(start, section)
            .map(|hit| hit.resolve_relative(opcode_offset, next_instruction_offset))
    }

    /// Enumerates every match in the section, resuming each search one
    /// pattern length past the previous hit. The callback receives the
    /// running index and the match; returning `false` stops the walk.
    /// Returns the number of matches the callback accepted.
    pub fn find_all<F>(
        &self,
        mut callback: F,
        start: Option<Address>,
        section: Option<&Section>,
    ) -> usize
    where
        F: FnMut(usize, Address) -> bool,
    {
        let section = match section {
            Some(section) => section,
            None => match self.module.executable_section() {
                Some(section) => section,
                None => return 0,
            },
        };
        if !section.is_valid() {
            return 0;
        }

        let mut count = 0;
        let mut cursor = start;
        while let Some(hit) = self.find(cursor, Some(section)) {
            if !callback(count, hit) {
                break;
            }
            count += 1;
            cursor = Some(hit + self.pattern.len());
        }

        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 0x90 padding around two `48 8B 05` sites so stride and caching can be
    // observed on a module fabricated over a static buffer.
    static TEXT: [u8; 32] = [
        0x90, 0x90, 0x48, 0x8b, 0x05, 0x10, 0x00, 0x00, 0x00, 0x90, 0x90, 0x90, 0x48, 0x8b, 0x05,
        0x20, 0x00, 0x00, 0x00, 0x90, 0xde, 0xad, 0xbe, 0xef, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90,
        0x90, 0x90,
    ];

    fn fake_module() -> LocalModule {
        let base = Address::from_ptr(TEXT.as_ptr());
        ModuleImage {
            handle: std::ptr::null_mut(),
            path: "/tmp/fake.bin".to_owned(),
            sections: vec![
                Section::new(".text", base, TEXT.len()),
                Section::new(".stale", Address::INVALID, 0x1000),
            ],
            executable: Some(0),
            cache: RwLock::new(HashMap::new()),
        }
    }

    #[test]
    fn name_is_path_tail() {
        let module = fake_module();
        assert_eq!(module.name(), "fake.bin");
        assert_eq!(module.section(".text").unwrap().size(), TEXT.len());
        assert!(module.section(".missing").is_none());
        assert!(!module.section(".stale").unwrap().is_valid());
    }

    #[test]
    fn pattern_scan_defaults_to_executable_section() {
        let module = fake_module();
        let base = module.executable_section().unwrap().base();

        let hit = module
            .find_pattern(&Pattern::parse("48 8B 05 ?? ?? ?? ??"), None, None)
            .unwrap();
        assert_eq!(hit, base + 2usize);
    }

    #[test]
    fn start_bounds_are_enforced() {
        let module = fake_module();
        let section = module.executable_section().unwrap().clone();
        let pattern = Pattern::parse("48 8B 05");

        let before = section.base() - 1usize;
        let past = section.base() + section.size();
        assert!(module.find_pattern(&pattern, Some(before), None).is_none());
        assert!(module.find_pattern(&pattern, Some(past), None).is_none());

        let second = module
            .find_pattern(&pattern, Some(section.base() + 3usize), None)
            .unwrap();
        assert_eq!(second, section.base() + 12usize);
    }

    #[test]
    fn invalid_section_yields_no_match() {
        let module = fake_module();
        let stale = module.section(".stale").unwrap().clone();
        assert!(module
            .find_pattern(&Pattern::parse("90"), None, Some(&stale))
            .is_none());
    }

    #[test]
    fn second_scan_is_served_from_cache() {
        let module = fake_module();
        let pattern = Pattern::parse("DE AD BE EF");

        let first = module.find_pattern(&pattern, None, None).unwrap();
        let again = module.find_pattern(&pattern, None, None).unwrap();
        assert_eq!(first, again);

        // Redirect the cached entry; a repeated query must return it,
        // proving the scan was not re-run.
        let poisoned = first + 1usize;
        for value in module.cache.write().values_mut() {
            *value = poisoned.get();
        }
        assert_eq!(module.find_pattern(&pattern, None, None), Some(poisoned));
    }

    #[test]
    fn signature_combinators() {
        let module = fake_module();
        let base = module.executable_section().unwrap().base();
        let sig = module.signature("48 8B 05");

        assert_eq!(sig.find(None, None), Some(base + 2usize));
        assert_eq!(sig.offset(3, None, None), Some(base + 5usize));

        // 48 8B 05 <disp32>: operand at +3, next instruction at +7.
        let resolved = unsafe { sig.follow_near_call(3, 7, None, None) }.unwrap();
        assert_eq!(resolved, base + 2usize + 7usize + 0x10usize);
    }

    #[test]
    fn find_all_strides_past_each_hit() {
        let module = fake_module();
        let sig = module.signature("48 8B 05");
        let base = module.executable_section().unwrap().base();

        let mut hits = Vec::new();
        let count = sig.find_all(
            |index, hit| {
                hits.push((index, hit));
                true
            },
            None,
            None,
        );

        assert_eq!(count, 2);
        assert_eq!(hits, vec![(0, base + 2usize), (1, base + 12usize)]);

        // Early stop: the refusing callback's match is not counted.
        let stopped = sig.find_all(|_, _| false, None, None);
        assert_eq!(stopped, 0);
    }

    #[test]
    fn default_flags() {
        let flags = LoadFlags::default();
        assert!(flags.contains(LoadFlags::LAZY));
        assert!(flags.contains(LoadFlags::NOLOAD));
        assert!(flags.contains(LoadFlags::DONT_RESOLVE_DLL_REFERENCES));
        assert!(!flags.contains(LoadFlags::PIN));
    }
}
