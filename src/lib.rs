/*!
This crate provides runtime introspection and virtual-method-table hooking of
dynamic libraries loaded in the current process.

A [`Module`] wraps a library the platform loader already mapped (PE on
Windows, ELF on Linux, Mach-O on macOS): it enumerates the image sections,
resolves exports, scans executable and data sections for masked byte
patterns with SIMD, and locates C++ virtual tables by RTTI type name. A
[`VtHook`] then redirects a single vtable slot to a replacement function,
keeping the original for chaining and restoring it on drop.

# Installation

This crate works with Cargo. Add it to your `Cargo.toml` like so:

```toml
[dependencies]
vthook = "0.1"
```

# Opening a module

A module is opened by unadorned name (the platform extension is appended
when missing), by an address inside its mapped image, or by a raw loader
handle. The default [`LoadFlags`] only take a handle to an image that is
already resident; nothing new is loaded.

```no_run
use vthook::Module;

let server = Module::from_name("server").unwrap();
println!("{} mapped at {:x}", server.name(), server.base());
for section in server.sections() {
    println!("  {} {} bytes", section.name(), section.size());
}
```

# Pattern scanning

A signature string holds two-digit hex bytes and `?`/`??` wildcards.
[`Pattern::parse`] is a `const fn`, so signatures can live in constants;
[`ModuleImage::signature`] binds a pattern to a module for scanning and the
usual follow-up combinators. Successful scans are memoized per module.

```no_run
use vthook::{Module, Pattern};

const GET_WORLD: Pattern = Pattern::parse("E8 ?? ?? ?? ?? 48 8B D8 48 85 C0");

let server = Module::from_name("server").unwrap();
let sig = server.bind(GET_WORLD);

// The call target of the E8 at the match:
let get_world = unsafe { sig.follow_near_call(1, 5, None, None) };

// Every match in .text:
sig.find_all(
    |index, hit| {
        println!("match {index} at {hit:x}");
        true
    },
    None,
    None,
);
# let _ = get_world;
```

# Virtual tables and hooking

[`ModuleImage::vtable`] finds a class's vtable by RTTI type name;
[`VirtualTable`] also reads straight off a live object. A [`VtHook`] swaps
one slot under a temporary protection change:

```no_run
use std::ffi::c_void;
use vthook::{Module, VirtualTable, VtHook};

type StartupFn = unsafe extern "C" fn(*mut c_void, u32) -> u32;

static mut STARTUP_HOOK: VtHook<StartupFn> = VtHook::new();

unsafe extern "C" fn startup_hook(this: *mut c_void, stage: u32) -> u32 {
    // chain to the original
    unsafe { STARTUP_HOOK.call(this, (stage,)) }
}

let server = Module::from_name("server").unwrap();
let table = VirtualTable::from_address(server.vtable("CGameServer", false).unwrap());
unsafe { STARTUP_HOOK.hook(table, 21, startup_hook) };
```

[`MultiHook`] keeps one such hook per vtable; [`FanoutHook`] registers any
number of closures behind a single slot replacement, fanning out to all of
them whenever any object of the hooked class dispatches through the slot.

# Notes

Scanning and hooking read and write raw process memory; everything that
does is `unsafe` and documents its contract. Hooks restore the original
pointer on drop, so keep the hook value alive as long as the redirect must
stay.

[`Module`] is `Sync` with the default lock parameter and may be shared
across threads; the scan cache takes a shared lock on probes and an
exclusive lock on inserts. [`LocalModule`] skips the synchronization and is
single-threaded by construction. Installing a hook stores one aligned
pointer, so threads racing through the slot observe either the old or the
new target, never a torn value; installing and removing the *same* hook
from two threads still needs external ordering.
*/

#![warn(missing_docs)]

mod accessor;
mod addr;
mod err;
mod module;
mod pattern;
mod prot;
mod protector;
mod scanner;
mod vtable;
mod vthook;

pub use accessor::{mem_copy, protect, safe_mem_read, safe_mem_write};
pub use addr::{is_human_char, to_human_char, Address};
pub use err::VtHookError;
pub use module::{LoadFlags, LocalModule, Module, ModuleImage, NullLock, Section, Signature};
pub use pattern::{Pattern, MAX_PATTERN_LEN};
pub use prot::{from_native, page_size, round_down, round_up, to_native, Prot};
pub use protector::MemProtector;
#[cfg(target_arch = "x86_64")]
pub use vtable::thunk_virtual_index;
pub use vtable::{itanium_virtual_index, FanoutFn, VirtualFn, VirtualTable};
pub use vthook::{FanoutHook, MultiHook, VtHook};
