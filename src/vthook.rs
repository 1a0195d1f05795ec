//! Vtable-slot hooking: single-slot hooks, per-table multi-hooks, and the
//! per-class fan-out registry.
//!
//! A slot hook swaps one function pointer under a [`MemProtector`], keeps
//! the original for chaining, and restores it on drop. [`MultiHook`] stores
//! slot hooks per vtable; [`FanoutHook`] installs a single trampoline per
//! hooked slot that dispatches to any number of registered closures for the
//! caller's class.

use std::any::{Any, TypeId};
use std::collections::{BTreeMap, HashMap};
use std::ffi::c_void;
use std::marker::PhantomData;
use std::mem;

use lazy_static::lazy_static;
use parking_lot::RwLock;
use tracing::trace;

use crate::addr::Address;
use crate::prot::Prot;
use crate::protector::MemProtector;
use crate::vtable::{FanoutFn, VirtualFn, VirtualTable};

/// Writes `value` into a vtable slot under temporarily relaxed protection.
/// The write proceeds best-effort even when the protection change was
/// refused; callers watching for that should check the slot afterwards.
unsafe fn write_slot(slot: Address, value: Address) {
    let _guard = MemProtector::new(slot, mem::size_of::<usize>(), Prot::RWX);
    slot.write::<usize>(value.get());
}

/// A hook over a single vtable slot.
///
/// Installing records the slot address and the original function pointer,
/// then overwrites the slot. Dropping (or [`VtHook::unhook`]) writes the
/// original back. The type parameter is the slot's function-pointer
/// signature, so the original can be re-invoked type-safely.
///
/// ```no_run
/// use std::ffi::c_void;
/// use vthook::{VirtualTable, VtHook};
///
/// type OnEvent = unsafe extern "C" fn(*mut c_void, u32) -> u32;
///
/// unsafe extern "C" fn on_event_hook(this: *mut c_void, id: u32) -> u32 {
///     // ... custom behavior, then chain to the original:
///     unsafe { HOOK.call(this, (id,)) }
/// }
///
/// static mut HOOK: VtHook<OnEvent> = VtHook::new();
///
/// unsafe {
///     let table = VirtualTable::of(0x7f00_1234_0000usize as *const c_void);
///     HOOK.hook(table, 12, on_event_hook);
/// }
/// ```
pub struct VtHook<F: VirtualFn> {
    slot: Address,
    original: Address,
    _signature: PhantomData<F>,
}

impl<F: VirtualFn> VtHook<F> {
    /// An empty, uninstalled hook.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slot: Address::INVALID,
            original: Address::INVALID,
            _signature: PhantomData,
        }
    }

    /// Whether the hook is currently installed.
    #[must_use]
    pub fn is_hooked(&self) -> bool {
        self.slot.is_valid()
    }

    /// Address of the hooked slot, or the invalid address when not
    /// installed.
    #[must_use]
    pub fn slot(&self) -> Address {
        self.slot
    }

    /// Installs `replacement` into slot `index` of `table`.
    ///
    /// # Panics
    ///
    /// Panics when already installed or when `table` is invalid; both are
    /// contract violations.
    ///
    /// # Safety
    ///
    /// `index` must be in range for the table, the slot must hold a
    /// function of type `F`, and no other thread may be executing through
    /// the slot's page in a way that conflicts with the protection flip.
    pub unsafe fn hook(&mut self, table: VirtualTable, index: usize, replacement: F) {
        assert!(!self.is_hooked(), "vtable slot already hooked");
        assert!(table.is_valid(), "invalid virtual table");

        self.slot = table.slot_address(index);
        self.original = Address::new(self.slot.read::<usize>());

        write_slot(self.slot, replacement.to_address());
        trace!(slot = self.slot.get(), index, "vtable slot hooked");
    }

    /// Restores the original pointer and clears the hook. Returns `false`
    /// when nothing was installed.
    ///
    /// # Safety
    ///
    /// As for [`VtHook::hook`].
    pub unsafe fn unhook(&mut self) -> bool {
        if !self.is_hooked() {
            return false;
        }

        write_slot(self.slot, self.original);
        trace!(slot = self.slot.get(), "vtable slot restored");

        self.slot = Address::INVALID;
        self.original = Address::INVALID;
        true
    }

    /// The original function pointer.
    ///
    /// # Safety
    ///
    /// The hook must be installed; the returned pointer is only meaningful
    /// while the hooked object's class is loaded.
    #[must_use]
    pub unsafe fn origin(&self) -> F {
        debug_assert!(self.is_hooked());
        F::from_address(self.original)
    }

    /// Invokes the original function; call this from the replacement to
    /// chain to the hooked-over logic.
    ///
    /// # Safety
    ///
    /// As for [`VtHook::origin`]; `this` and `args` must satisfy the
    /// original function's contract.
    pub unsafe fn call(&self, this: *mut c_void, args: F::Args) -> F::Ret {
        self.origin().invoke(this, args)
    }
}

impl<F: VirtualFn> Default for VtHook<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: VirtualFn> Drop for VtHook<F> {
    fn drop(&mut self) {
        if self.is_hooked() {
            unsafe { self.unhook() };
        }
    }
}

/// A collection of slot hooks of one signature, keyed by vtable.
///
/// Dispatch helpers look an object's vtable up and invoke the stored hooks'
/// *originals*, which is what a replacement function wants when chaining.
pub struct MultiHook<F: VirtualFn> {
    storage: BTreeMap<VirtualTable, Vec<VtHook<F>>>,
}

impl<F: VirtualFn> MultiHook<F> {
    /// An empty collection.
    #[must_use]
    pub fn new() -> Self {
        Self {
            storage: BTreeMap::new(),
        }
    }

    /// Whether no hooks are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    /// The hooks registered under `table`, in insertion order.
    #[must_use]
    pub fn hooks(&self, table: VirtualTable) -> &[VtHook<F>] {
        self.storage.get(&table).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Installs `replacement` into slot `index` of `table` and stores the
    /// resulting hook under `table`.
    ///
    /// # Safety
    ///
    /// As for [`VtHook::hook`].
    pub unsafe fn add_hook(&mut self, table: VirtualTable, index: usize, replacement: F) {
        let mut hook = VtHook::new();
        hook.hook(table, index, replacement);
        self.storage.entry(table).or_default().push(hook);
    }

    /// Looks `this`'s vtable up and invokes the first stored hook's
    /// original. `None` when no hook is registered for that vtable.
    ///
    /// # Safety
    ///
    /// `this` must be a live object with a leading vtable pointer, and the
    /// stored originals must accept it.
    pub unsafe fn call(&self, this: *mut c_void, args: F::Args) -> Option<F::Ret> {
        let table = VirtualTable::of(this);
        let hook = self.storage.get(&table)?.first()?;
        Some(hook.call(this, args))
    }

    /// Invokes every stored hook's original for `this`'s vtable, in
    /// insertion order, collecting the results.
    ///
    /// # Safety
    ///
    /// As for [`MultiHook::call`].
    pub unsafe fn call_all(&self, this: *mut c_void, args: F::Args) -> Vec<F::Ret> {
        let table = VirtualTable::of(this);
        let Some(hooks) = self.storage.get(&table) else {
            return Vec::new();
        };

        hooks.iter().map(|hook| hook.call(this, args)).collect()
    }

    /// Removes (and thereby uninstalls) every hook stored under `table`,
    /// returning how many there were.
    pub fn remove_hook(&mut self, table: VirtualTable) -> usize {
        self.storage.remove(&table).map_or(0, |hooks| hooks.len())
    }

    /// Removes every stored hook.
    pub fn clear(&mut self) {
        self.storage.clear();
    }
}

impl<F: VirtualFn> Default for MultiHook<F> {
    fn default() -> Self {
        Self::new()
    }
}

type Callback<F> =
    Box<dyn Fn(*mut c_void, <F as VirtualFn>::Args) -> <F as VirtualFn>::Ret + Send + Sync>;

lazy_static! {
    /// Process-wide fan-out callbacks, keyed by vtable address and
    /// signature. The `TypeId` component gives each signature its own
    /// registry, mirroring one-registry-per-instantiation semantics.
    static ref FANOUT_CALLBACKS: RwLock<HashMap<(usize, TypeId), Vec<Box<dyn Any + Send + Sync>>>> =
        RwLock::new(HashMap::new());
}

/// Trampoline body: invokes every callback registered for the caller's
/// vtable, returning the last result (or the default when the registry has
/// no entry, which can happen transiently during removal).
///
/// # Safety
///
/// `this` must be a live object with a leading vtable pointer.
pub(crate) unsafe fn dispatch_fanout<F>(this: *mut c_void, args: F::Args) -> F::Ret
where
    F: VirtualFn,
    F::Ret: Default,
{
    let table = VirtualTable::of(this);
    let registry = FANOUT_CALLBACKS.read();

    let mut result = F::Ret::default();
    let Some(callbacks) = registry.get(&(table.address().get(), TypeId::of::<F>())) else {
        return result;
    };

    for erased in callbacks {
        let callback = erased
            .downcast_ref::<Callback<F>>()
            .expect("fanout registry entry matches its signature key");
        result = callback(this, args);
    }
    result
}

/// Per-class fan-out hooking: any number of closures per vtable behind a
/// single slot replacement.
///
/// The first callback registered for a `(table, index)` installs one
/// trampoline; later callbacks just join the list. Every object whose class
/// shares the vtable dispatches through the same fan-out. The callback
/// registry is process-wide per signature, so two `FanoutHook`s of the same
/// `F` feed the same lists.
pub struct FanoutHook<F: FanoutFn> {
    inner: MultiHook<F>,
}

impl<F: FanoutFn> FanoutHook<F> {
    /// An empty fan-out manager.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: MultiHook::new(),
        }
    }

    fn registry_key(table: VirtualTable) -> (usize, TypeId) {
        (table.address().get(), TypeId::of::<F>())
    }

    /// Appends `callback` to the list for `table`, installing the fan-out
    /// trampoline into slot `index` if this manager has not hooked that
    /// slot yet.
    ///
    /// # Safety
    ///
    /// As for [`VtHook::hook`]; additionally every callback for a table
    /// must tolerate the `this` pointers of all classes sharing it.
    pub unsafe fn add_hook<C>(&mut self, table: VirtualTable, index: usize, callback: C)
    where
        C: Fn(*mut c_void, F::Args) -> F::Ret + Send + Sync + 'static,
    {
        let boxed: Callback<F> = Box::new(callback);
        FANOUT_CALLBACKS
            .write()
            .entry(Self::registry_key(table))
            .or_default()
            .push(Box::new(boxed));

        let slot = table.slot_address(index);
        let installed = self.inner.hooks(table).iter().any(|hook| hook.slot() == slot);
        if !installed {
            self.inner.add_hook(table, index, F::fanout());
        }
    }

    /// Drops every callback for `table` and uninstalls its trampolines.
    /// Returns whether anything was removed. The callbacks go first, so a
    /// concurrent dispatch never observes a stale list.
    pub fn remove_hook(&mut self, table: VirtualTable) -> bool {
        FANOUT_CALLBACKS.write().remove(&Self::registry_key(table));
        self.inner.remove_hook(table) != 0
    }

    /// Removes every callback and trampoline owned by this signature.
    pub fn clear(&mut self) {
        let signature = TypeId::of::<F>();
        FANOUT_CALLBACKS
            .write()
            .retain(|(_, key), _| *key != signature);
        self.inner.clear();
    }

    /// Whether no trampolines are installed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl<F: FanoutFn> Default for FanoutHook<F> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    type Speak = unsafe extern "C" fn(*mut c_void, u64) -> u64;

    unsafe extern "C" fn orig_speak(_this: *mut c_void, x: u64) -> u64 {
        x + 1
    }

    unsafe extern "C" fn repl_speak(_this: *mut c_void, x: u64) -> u64 {
        x + 100
    }

    // A minimal polymorphic object: leading word points at the slot array.
    #[repr(C)]
    struct Object {
        vtable: *mut usize,
    }

    fn make_class(methods: &[(usize, usize)], slot_count: usize) -> Vec<usize> {
        let mut slots = vec![0usize; slot_count];
        for &(index, function) in methods {
            slots[index] = function;
        }
        slots
    }

    #[test]
    fn hook_swaps_and_unhook_restores() {
        let mut slots = make_class(&[(3, orig_speak as usize)], 8);
        let object = Object {
            vtable: slots.as_mut_ptr(),
        };
        let table = unsafe { VirtualTable::of(&object as *const Object as *const c_void) };

        let mut hook = VtHook::<Speak>::new();
        assert!(!hook.is_hooked());

        unsafe {
            hook.hook(table, 3, repl_speak);
            assert!(hook.is_hooked());
            assert_eq!(slots[3], repl_speak as usize);

            // Dispatch through the object now reaches the replacement;
            // chaining through the hook reaches the original.
            assert_eq!(table.call::<Speak>(3, (1,)), 101);
            assert_eq!(hook.call(std::ptr::null_mut(), (1,)), 2);

            assert!(hook.unhook());
            assert_eq!(slots[3], orig_speak as usize);
            assert_eq!(table.call::<Speak>(3, (1,)), 2);

            // Idempotent once uninstalled.
            assert!(!hook.unhook());
        }
    }

    #[test]
    fn drop_uninstalls() {
        let mut slots = make_class(&[(0, orig_speak as usize)], 4);
        let table = VirtualTable::from_address(Address::from_ptr(slots.as_mut_ptr()));

        {
            let mut hook = VtHook::<Speak>::new();
            unsafe { hook.hook(table, 0, repl_speak) };
            assert_eq!(slots[0], repl_speak as usize);
        }
        assert_eq!(slots[0], orig_speak as usize);
    }

    #[test]
    #[should_panic(expected = "already hooked")]
    fn double_hook_is_a_contract_violation() {
        let mut slots = make_class(&[(0, orig_speak as usize)], 4);
        let table = VirtualTable::from_address(Address::from_ptr(slots.as_mut_ptr()));

        let mut hook = VtHook::<Speak>::new();
        unsafe {
            hook.hook(table, 0, repl_speak);
            hook.hook(table, 0, repl_speak);
        }
    }

    #[test]
    fn multi_hook_dispatches_originals() {
        let mut slots_a = make_class(&[(2, orig_speak as usize)], 4);
        let mut slots_b = make_class(&[(2, repl_speak as usize)], 4);
        let a = Object {
            vtable: slots_a.as_mut_ptr(),
        };
        let b = Object {
            vtable: slots_b.as_mut_ptr(),
        };

        unsafe extern "C" fn noop(_this: *mut c_void, x: u64) -> u64 {
            x
        }

        let table_a = unsafe { VirtualTable::of(&a as *const Object as *const c_void) };
        let table_b = unsafe { VirtualTable::of(&b as *const Object as *const c_void) };

        let mut hooks = MultiHook::<Speak>::new();
        assert!(hooks.is_empty());

        unsafe {
            hooks.add_hook(table_a, 2, noop);
            hooks.add_hook(table_b, 2, noop);

            // Each object resolves to its own original through the map.
            let this_a = &a as *const Object as *mut c_void;
            let this_b = &b as *const Object as *mut c_void;
            assert_eq!(hooks.call(this_a, (1,)), Some(2));
            assert_eq!(hooks.call(this_b, (1,)), Some(101));
            assert_eq!(hooks.call_all(this_a, (5,)), vec![6]);

            // An object of an unhooked class dispatches nothing.
            let mut other_slots = make_class(&[(2, orig_speak as usize)], 4);
            let other = Object {
                vtable: other_slots.as_mut_ptr(),
            };
            let this_other = &other as *const Object as *mut c_void;
            assert_eq!(hooks.call(this_other, (1,)), None);
            assert!(hooks.call_all(this_other, (1,)).is_empty());
        }

        assert_eq!(hooks.remove_hook(table_a), 1);
        assert_eq!(slots_a[2], orig_speak as usize);
        hooks.clear();
        assert_eq!(slots_b[2], repl_speak as usize);
        assert!(hooks.is_empty());
    }

    #[test]
    fn fanout_runs_every_callback_once_in_order() {
        let mut slots = make_class(&[(4, orig_speak as usize)], 8);
        let object = Object {
            vtable: slots.as_mut_ptr(),
        };
        let table = unsafe { VirtualTable::of(&object as *const Object as *const c_void) };

        let log = Arc::new(Mutex::new(Vec::new()));
        let mut fan = FanoutHook::<Speak>::new();

        unsafe {
            let log_a = Arc::clone(&log);
            fan.add_hook(table, 4, move |_this, (x,)| {
                log_a.lock().unwrap().push('A');
                x * 2
            });

            let log_b = Arc::clone(&log);
            fan.add_hook(table, 4, move |_this, (x,)| {
                log_b.lock().unwrap().push('B');
                x * 3
            });

            // One trampoline installed; dispatch through the object runs A
            // then B exactly once each and yields B's result.
            assert_ne!(slots[4], orig_speak as usize);
            assert_eq!(table.call::<Speak>(4, (7,)), 21);
            assert_eq!(*log.lock().unwrap(), vec!['A', 'B']);
        }

        assert!(fan.remove_hook(table));
        assert_eq!(slots[4], orig_speak as usize);

        // Restored dispatch reaches the original and no callback.
        unsafe {
            assert_eq!(table.call::<Speak>(4, (7,)), 8);
        }
        assert_eq!(*log.lock().unwrap(), vec!['A', 'B']);
        assert!(!fan.remove_hook(table));
    }

    #[test]
    fn fanout_keeps_one_trampoline_per_slot() {
        let mut slots = make_class(&[(1, orig_speak as usize)], 4);
        let table = VirtualTable::from_address(Address::from_ptr(slots.as_mut_ptr()));

        let mut fan = FanoutHook::<Speak>::new();
        unsafe {
            fan.add_hook(table, 1, |_this, (x,)| x);
            let installed = slots[1];
            fan.add_hook(table, 1, |_this, (x,)| x + 1);
            // The second callback joined the list without re-hooking.
            assert_eq!(slots[1], installed);
            assert_eq!(fan.inner.hooks(table).len(), 1);
        }
        fan.clear();
        assert_eq!(slots[1], orig_speak as usize);
    }

    #[test]
    fn fanout_void_signature() {
        type Notify = unsafe extern "C" fn(*mut c_void, u32);

        unsafe extern "C" fn orig_notify(_this: *mut c_void, _id: u32) {}

        let mut slots = make_class(&[(0, orig_notify as usize)], 2);
        let table = VirtualTable::from_address(Address::from_ptr(slots.as_mut_ptr()));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut fan = FanoutHook::<Notify>::new();
        unsafe {
            let sink = Arc::clone(&seen);
            fan.add_hook(table, 0, move |_this, (id,)| {
                sink.lock().unwrap().push(id);
            });

            table.call::<Notify>(0, (9,));
        }
        assert_eq!(*seen.lock().unwrap(), vec![9]);
        assert!(fan.remove_hook(table));
    }
}
