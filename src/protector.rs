use crate::accessor;
use crate::addr::Address;
use crate::prot::Prot;

/// RAII guard that coerces a memory region to a requested protection and
/// restores the previous protection when dropped.
///
/// Construction never fails; a refused protection change leaves the guard
/// invalid ([`MemProtector::is_valid`] returns `false`) and nothing is
/// restored on drop. Callers about to write through the region should check
/// validity first.
///
/// ```no_run
/// use vthook::{Address, MemProtector, Prot};
///
/// let slot = Address::new(0x7f00_dead_0000);
/// unsafe {
///     let guard = MemProtector::new(slot, std::mem::size_of::<usize>(), Prot::RWX);
///     if guard.is_valid() {
///         slot.write(0usize);
///     }
///     // previous protection restored here
/// }
/// ```
#[derive(Debug)]
pub struct MemProtector {
    address: Address,
    length: usize,
    original: Prot,
    status: bool,
    restore_on_drop: bool,
}

impl MemProtector {
    /// Sets `prot` on the pages enclosing `address..address + length`,
    /// restoring the previous protection on drop.
    ///
    /// # Safety
    ///
    /// As for [`accessor::protect`]: no other thread may be executing or
    /// writing the affected pages while the guard is live.
    #[must_use]
    pub unsafe fn new(address: Address, length: usize, prot: Prot) -> Self {
        Self::with_restore(address, length, prot, true)
    }

    /// As [`MemProtector::new`], with the restore-on-drop behavior made
    /// explicit.
    ///
    /// # Safety
    ///
    /// As for [`MemProtector::new`].
    #[must_use]
    pub unsafe fn with_restore(
        address: Address,
        length: usize,
        prot: Prot,
        restore_on_drop: bool,
    ) -> Self {
        let (original, status) = match accessor::protect(address, length, prot) {
            Ok(old) => (old, true),
            Err(_) => (Prot::UNSET, false),
        };

        Self {
            address,
            length,
            original,
            status,
            restore_on_drop,
        }
    }

    /// Whether the protection change was applied.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.status
    }

    /// The protection observed before the change, or [`Prot::UNSET`] when it
    /// could not be observed.
    #[must_use]
    pub fn original_prot(&self) -> Prot {
        self.original
    }
}

impl Drop for MemProtector {
    fn drop(&mut self) {
        if !self.restore_on_drop || !self.status || self.original == Prot::UNSET {
            return;
        }

        let _ = unsafe { accessor::protect(self.address, self.length, self.original) };
    }
}
