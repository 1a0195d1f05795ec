//! Virtual-table views and typed virtual-function pointers.
//!
//! [`VirtualTable`] is a zero-overhead view over an object's leading vtable
//! pointer. [`VirtualFn`] is implemented for `unsafe extern "C"` function
//! pointers whose first parameter is the `this` pointer, up to eight further
//! arguments; it gives hooks a typed argument tuple and return type without
//! spelling either out.

use std::ffi::c_void;
use std::mem;

use crate::addr::Address;

/// A view over an object's virtual method table: the address of its array
/// of function pointers.
///
/// The layout is a single machine word holding the vtable address, which is
/// exactly the leading field of a polymorphic object. A reference to the
/// view therefore doubles as a minimal `this` pointer whose virtual
/// dispatch goes through the viewed table; [`VirtualTable::call`] relies on
/// that.
///
/// Equality and ordering compare the table address, so views can key maps.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct VirtualTable(Address);

impl VirtualTable {
    /// Reads the vtable pointer out of an object's first machine word.
    ///
    /// # Safety
    ///
    /// `object` must point to a live object whose first word is a vtable
    /// pointer.
    #[must_use]
    pub unsafe fn of(object: *const c_void) -> Self {
        Self(Address::new(*(object as *const usize)))
    }

    /// Wraps a known vtable address (for example one returned by
    /// [`crate::ModuleImage::vtable`]).
    #[must_use]
    pub const fn from_address(address: Address) -> Self {
        Self(address)
    }

    /// The vtable address.
    #[must_use]
    pub const fn address(self) -> Address {
        self.0
    }

    /// Whether the view holds a non-null table address.
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0.is_valid()
    }

    /// Address of slot `index` (not its contents).
    #[must_use]
    pub fn slot_address(self, index: usize) -> Address {
        self.0 + index * mem::size_of::<usize>()
    }

    /// The function pointer stored in slot `index`.
    ///
    /// # Safety
    ///
    /// The table must be valid and `index` in range.
    #[must_use]
    pub unsafe fn method(self, index: usize) -> Address {
        Address::new(self.slot_address(index).read::<usize>())
    }

    /// Invokes slot `index` with this view as the `this` argument.
    ///
    /// # Safety
    ///
    /// Slot `index` must hold a function of type `F`, and `F` must tolerate
    /// a `this` that is only the vtable word (anything that touches other
    /// object fields will read past the view).
    pub unsafe fn call<F: VirtualFn>(&self, index: usize, args: F::Args) -> F::Ret {
        let function = F::from_address(self.method(index));
        function.invoke(self as *const Self as *mut c_void, args)
    }
}

/// A typed virtual-function pointer: an `unsafe extern "C" fn` whose first
/// parameter is the `this` pointer.
///
/// Implemented for zero through eight arguments after `this`. The argument
/// tuple and return type become associated types, so hook containers can be
/// generic over the whole signature.
pub trait VirtualFn: Copy + 'static {
    /// The argument tuple, excluding `this`.
    type Args: Copy + 'static;
    /// The return type.
    type Ret: 'static;

    /// Calls the function with an explicit `this`.
    ///
    /// # Safety
    ///
    /// `self` must point to a live function of this exact signature and
    /// `this` must satisfy whatever that function requires.
    unsafe fn invoke(self, this: *mut c_void, args: Self::Args) -> Self::Ret;

    /// Reinterprets a slot value as a function pointer of this type.
    ///
    /// # Safety
    ///
    /// `address` must be the non-null address of a function of this exact
    /// signature.
    #[must_use]
    unsafe fn from_address(address: Address) -> Self {
        debug_assert_eq!(mem::size_of::<Self>(), mem::size_of::<usize>());
        mem::transmute_copy(&address.get())
    }

    /// The slot value for this function pointer.
    #[must_use]
    fn to_address(self) -> Address {
        debug_assert_eq!(mem::size_of::<Self>(), mem::size_of::<usize>());
        Address::new(unsafe { mem::transmute_copy(&self) })
    }
}

/// A [`VirtualFn`] whose signature also has a fan-out trampoline: a raw
/// function of the same ABI that looks its caller's vtable up in the
/// process-wide callback registry and invokes every registered callback.
/// Requires `Ret: Default` for the empty-registry result.
pub trait FanoutFn: VirtualFn {
    /// The fan-out trampoline for this signature.
    #[must_use]
    fn fanout() -> Self;
}

macro_rules! impl_virtual_fn {
    ($fanout:ident $(, $arg:ident)*) => {
        impl<Ret, $($arg,)*> VirtualFn for unsafe extern "C" fn(*mut c_void $(, $arg)*) -> Ret
        where
            Ret: 'static,
            $($arg: Copy + 'static,)*
        {
            type Args = ($($arg,)*);
            type Ret = Ret;

            #[allow(non_snake_case)]
            unsafe fn invoke(self, this: *mut c_void, args: Self::Args) -> Ret {
                let ($($arg,)*) = args;
                self(this $(, $arg)*)
            }
        }

        #[allow(non_snake_case)]
        unsafe extern "C" fn $fanout<Ret, $($arg,)*>(this: *mut c_void $(, $arg: $arg)*) -> Ret
        where
            Ret: Default + 'static,
            $($arg: Copy + 'static,)*
        {
            crate::vthook::dispatch_fanout::<unsafe extern "C" fn(*mut c_void $(, $arg)*) -> Ret>(
                this,
                ($($arg,)*),
            )
        }

        impl<Ret, $($arg,)*> FanoutFn for unsafe extern "C" fn(*mut c_void $(, $arg)*) -> Ret
        where
            Ret: Default + 'static,
            $($arg: Copy + 'static,)*
        {
            fn fanout() -> Self {
                $fanout::<Ret $(, $arg)*>
            }
        }
    };
}

impl_virtual_fn!(fanout0);
impl_virtual_fn!(fanout1, A1);
impl_virtual_fn!(fanout2, A1, A2);
impl_virtual_fn!(fanout3, A1, A2, A3);
impl_virtual_fn!(fanout4, A1, A2, A3, A4);
impl_virtual_fn!(fanout5, A1, A2, A3, A4, A5);
impl_virtual_fn!(fanout6, A1, A2, A3, A4, A5, A6);
impl_virtual_fn!(fanout7, A1, A2, A3, A4, A5, A6, A7);
impl_virtual_fn!(fanout8, A1, A2, A3, A4, A5, A6, A7, A8);

/// Derives a vtable slot index from an Itanium-ABI pointer-to-member value:
/// virtual members encode `1 + byte offset` of the slot, so odd values are
/// virtual and non-virtual members are rejected.
#[must_use]
pub fn itanium_virtual_index(pmf_addr: usize) -> Option<usize> {
    if pmf_addr & 1 == 1 {
        Some((pmf_addr - 1) / mem::size_of::<usize>())
    } else {
        None
    }
}

/// Derives a vtable slot index from a virtual-dispatch thunk by decoding
/// its leading instructions. Recognizes an optional `jmp rel32` forwarder
/// followed by `mov reg, [this]` / `jmp [reg + disp]`, with `this` in `rcx`
/// (MS x64) or `rdi` (System V).
///
/// # Safety
///
/// `thunk` must point to at least 32 bytes of readable code.
#[cfg(target_arch = "x86_64")]
#[must_use]
pub unsafe fn thunk_virtual_index(thunk: Address) -> Option<usize> {
    use iced_x86::{Decoder, DecoderOptions, Mnemonic, OpKind, Register};

    const MAX_THUNK_BYTES: usize = 0x20;

    let mut address = thunk;
    let mut followed = false;

    'decode: loop {
        let code = std::slice::from_raw_parts(address.as_ptr::<u8>(), MAX_THUNK_BYTES);
        let mut decoder = Decoder::new(64, code, DecoderOptions::NONE);
        decoder.set_ip(address.get() as u64);

        let mut this_register = Register::None;
        while decoder.can_decode() {
            let inst = decoder.decode();
            if inst.is_invalid() {
                return None;
            }

            if inst.mnemonic() == Mnemonic::Jmp && inst.op0_kind() == OpKind::NearBranch64 {
                // A jmp-thunk forwarder; follow it once.
                if followed || this_register != Register::None {
                    return None;
                }
                followed = true;
                address = Address::new(inst.near_branch64() as usize);
                continue 'decode;
            }

            if inst.mnemonic() == Mnemonic::Mov
                && inst.op0_kind() == OpKind::Register
                && inst.op1_kind() == OpKind::Memory
                && inst.memory_index() == Register::None
                && inst.memory_displacement64() == 0
                && matches!(inst.memory_base().full_register(), Register::RCX | Register::RDI)
                && this_register == Register::None
            {
                this_register = inst.op0_register().full_register();
                continue;
            }

            if inst.mnemonic() == Mnemonic::Jmp
                && inst.op0_kind() == OpKind::Memory
                && this_register != Register::None
                && inst.memory_base().full_register() == this_register
                && inst.memory_index() == Register::None
            {
                return Some(inst.memory_displacement64() as usize / mem::size_of::<usize>());
            }

            return None;
        }

        return None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn view_reads_leading_word() {
        let slots: [usize; 3] = [0x11, 0x22, 0x33];
        let object: [usize; 2] = [slots.as_ptr() as usize, 0xffff];

        let table = unsafe { VirtualTable::of(object.as_ptr() as *const c_void) };
        assert!(table.is_valid());
        assert_eq!(table.address().get(), slots.as_ptr() as usize);
        assert_eq!(
            table.slot_address(2).get(),
            slots.as_ptr() as usize + 2 * mem::size_of::<usize>()
        );
        assert_eq!(unsafe { table.method(1) }.get(), 0x22);
    }

    #[test]
    fn views_key_by_table_address() {
        let slots: [usize; 1] = [0x11];
        let a: [usize; 1] = [slots.as_ptr() as usize];
        let b: [usize; 1] = [slots.as_ptr() as usize];

        let va = unsafe { VirtualTable::of(a.as_ptr() as *const c_void) };
        let vb = unsafe { VirtualTable::of(b.as_ptr() as *const c_void) };
        assert_eq!(va, vb);
    }

    unsafe extern "C" fn double_it(_this: *mut c_void, x: u64) -> u64 {
        x * 2
    }

    #[test]
    fn typed_call_through_view() {
        type Method = unsafe extern "C" fn(*mut c_void, u64) -> u64;

        let slots: [usize; 2] = [0, double_it as usize];
        let table = VirtualTable::from_address(Address::from_ptr(slots.as_ptr()));

        let result = unsafe { table.call::<Method>(1, (21,)) };
        assert_eq!(result, 42);
    }

    #[test]
    fn function_pointer_round_trip() {
        type Method = unsafe extern "C" fn(*mut c_void, u64) -> u64;

        let f: Method = double_it;
        let addr = f.to_address();
        assert_eq!(addr.get(), double_it as usize);

        let back = unsafe { Method::from_address(addr) };
        assert_eq!(unsafe { back.invoke(std::ptr::null_mut(), (5,)) }, 10);
    }

    #[test]
    fn itanium_index_arithmetic() {
        let word = mem::size_of::<usize>();
        assert_eq!(itanium_virtual_index(1), Some(0));
        assert_eq!(itanium_virtual_index(1 + 3 * word), Some(3));
        // Non-virtual members have even addresses.
        assert_eq!(itanium_virtual_index(0x401000), None);
        assert_eq!(itanium_virtual_index(0), None);
    }

    #[cfg(target_arch = "x86_64")]
    mod thunks {
        use super::*;

        #[test]
        fn disp8_form() {
            // mov rax, [rcx]; jmp [rax+0x10]
            let mut code = [0xccu8; 0x40];
            code[..6].copy_from_slice(&[0x48, 0x8b, 0x01, 0xff, 0x60, 0x10]);
            let index = unsafe { thunk_virtual_index(Address::from_ptr(code.as_ptr())) };
            assert_eq!(index, Some(2));
        }

        #[test]
        fn disp32_form() {
            // mov rax, [rcx]; jmp [rax+0x318]
            let mut code = [0xccu8; 0x40];
            code[..9]
                .copy_from_slice(&[0x48, 0x8b, 0x01, 0xff, 0xa0, 0x18, 0x03, 0x00, 0x00]);
            let index = unsafe { thunk_virtual_index(Address::from_ptr(code.as_ptr())) };
            assert_eq!(index, Some(0x318 / 8));
        }

        #[test]
        fn slot_zero_form() {
            // mov rax, [rcx]; jmp [rax]
            let mut code = [0xccu8; 0x40];
            code[..5].copy_from_slice(&[0x48, 0x8b, 0x01, 0xff, 0x20]);
            let index = unsafe { thunk_virtual_index(Address::from_ptr(code.as_ptr())) };
            assert_eq!(index, Some(0));
        }

        #[test]
        fn sysv_this_register() {
            // mov rax, [rdi]; jmp [rax+0x18]
            let mut code = [0xccu8; 0x40];
            code[..6].copy_from_slice(&[0x48, 0x8b, 0x07, 0xff, 0x60, 0x18]);
            let index = unsafe { thunk_virtual_index(Address::from_ptr(code.as_ptr())) };
            assert_eq!(index, Some(3));
        }

        #[test]
        fn follows_jmp_forwarder() {
            let mut code = [0xccu8; 0x40];
            // jmp +11 (to offset 0x10), then the real thunk there.
            code[0] = 0xe9;
            code[1..5].copy_from_slice(&0x0bi32.to_le_bytes());
            code[0x10..0x16].copy_from_slice(&[0x48, 0x8b, 0x01, 0xff, 0x60, 0x08]);
            let index = unsafe { thunk_virtual_index(Address::from_ptr(code.as_ptr())) };
            assert_eq!(index, Some(1));
        }

        #[test]
        fn rejects_non_dispatch_code() {
            let mut code = [0xccu8; 0x40];
            code[0] = 0xc3; // ret
            assert_eq!(
                unsafe { thunk_virtual_index(Address::from_ptr(code.as_ptr())) },
                None
            );

            // mov rax, rbx; jmp [rax] is not a this-load.
            code[..5].copy_from_slice(&[0x48, 0x89, 0xd8, 0xff, 0x20]);
            assert_eq!(
                unsafe { thunk_virtual_index(Address::from_ptr(code.as_ptr())) },
                None
            );
        }
    }
}
