use std::fmt;
use std::ops::{Add, Sub};

/// A machine address inside the current process.
///
/// `Address` is a plain integer value: arithmetic on it is always defined,
/// whether or not the address is mapped. Reading through it is a separate,
/// `unsafe` step.
///
/// ```
/// use vthook::Address;
///
/// let a = Address::new(0x1000);
/// assert_eq!((a + 8usize).get(), 0x1008);
/// assert!(a.is_valid());
/// assert!(!Address::INVALID.is_valid());
/// ```
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address(usize);

impl Address {
    /// The null address, used as the not-found sentinel in low-level code.
    pub const INVALID: Address = Address(0);

    /// Wraps a raw integer address.
    #[must_use]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    /// Wraps a raw pointer.
    #[must_use]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize)
    }

    /// Returns the integer value.
    #[must_use]
    pub const fn get(self) -> usize {
        self.0
    }

    /// Returns the address as a typed raw pointer.
    #[must_use]
    pub const fn as_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    /// Returns the address as a typed mutable raw pointer.
    #[must_use]
    pub const fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    /// True unless this is the null address.
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }

    /// Returns the address displaced by a signed byte offset.
    #[must_use]
    pub const fn offset(self, offset: isize) -> Self {
        Self(self.0.wrapping_add_signed(offset))
    }

    /// Reads a `T` at this address.
    ///
    /// # Safety
    ///
    /// The address must be mapped, readable and hold a valid `T`.
    #[must_use]
    pub unsafe fn read<T: Copy>(self) -> T {
        *(self.0 as *const T)
    }

    /// Writes a `T` at this address.
    ///
    /// # Safety
    ///
    /// The address must be mapped and writable for `size_of::<T>()` bytes.
    pub unsafe fn write<T>(self, value: T) {
        *(self.0 as *mut T) = value;
    }

    /// Follows `levels` levels of indirection, reading one machine word per
    /// level at `self + offset`, then `result + offset`, and so on.
    /// `levels == 0` returns `self` unchanged.
    ///
    /// # Safety
    ///
    /// Every intermediate address must be mapped and readable; nothing is
    /// validated here.
    #[must_use]
    pub unsafe fn deref(self, levels: usize, offset: isize) -> Self {
        let mut base = self.0;
        for _ in 0..levels {
            base = *(base.wrapping_add_signed(offset) as *const usize);
        }
        Self(base)
    }

    /// Resolves an instruction-relative operand: reads the signed 32-bit
    /// displacement at `self + register_offset` and returns
    /// `self + next_instruction_offset + displacement`.
    ///
    /// # Safety
    ///
    /// `self + register_offset` must be mapped and readable for 4 bytes.
    #[must_use]
    pub unsafe fn resolve_relative(
        self,
        register_offset: isize,
        next_instruction_offset: isize,
    ) -> Self {
        let displacement =
            (self.0.wrapping_add_signed(register_offset) as *const i32).read_unaligned();
        self.offset(next_instruction_offset)
            .offset(displacement as isize)
    }

    /// Resolves an `E8 cd` near call at this address: the operand starts one
    /// byte in and the next instruction five bytes in.
    ///
    /// # Safety
    ///
    /// As for [`Address::resolve_relative`].
    #[must_use]
    pub unsafe fn follow_near_call(self) -> Self {
        self.resolve_relative(0x1, 0x5)
    }

    /// Emits a canonical hex + ASCII dump of `size` bytes, one call to `out`
    /// per line. Returns the number of lines emitted.
    ///
    /// # Safety
    ///
    /// `size` bytes starting at this address must be mapped and readable.
    pub unsafe fn dump<F>(self, size: usize, bytes_per_line: usize, out: F) -> usize
    where
        F: FnMut(&str),
    {
        self.dump_with(size, bytes_per_line, |_, byte| format!("{byte:02X}"), out)
    }

    /// As [`Address::dump`], with a caller-supplied byte formatter
    /// `(index, byte) -> text`.
    ///
    /// # Safety
    ///
    /// As for [`Address::dump`].
    pub unsafe fn dump_with<H, F>(
        self,
        size: usize,
        bytes_per_line: usize,
        mut to_hex: H,
        mut out: F,
    ) -> usize
    where
        H: FnMut(usize, u8) -> String,
        F: FnMut(&str),
    {
        assert!(bytes_per_line > 0);

        let data = std::slice::from_raw_parts(self.as_ptr::<u8>(), size);
        let hex_width = bytes_per_line * 3 - 1;

        let mut lines = 0;
        for chunk in data.chunks(bytes_per_line) {
            let mut hex = String::with_capacity(hex_width);
            let mut ascii = String::with_capacity(bytes_per_line);

            for (i, &byte) in chunk.iter().enumerate() {
                if i > 0 {
                    hex.push(' ');
                }
                hex.push_str(&to_hex(lines * bytes_per_line + i, byte));
                ascii.push(to_human_char(byte));
            }

            while hex.len() < hex_width {
                hex.push(' ');
            }

            out(&format!("{hex} |{ascii}|"));
            lines += 1;
        }

        lines
    }
}

/// Whether `byte` is in the printable ASCII range `' '..='~'`.
#[must_use]
pub const fn is_human_char(byte: u8) -> bool {
    byte >= b' ' && byte <= b'~'
}

/// Maps `byte` to itself when printable, `'.'` otherwise.
#[must_use]
pub const fn to_human_char(byte: u8) -> char {
    if is_human_char(byte) {
        byte as char
    } else {
        '.'
    }
}

impl From<usize> for Address {
    fn from(addr: usize) -> Self {
        Self(addr)
    }
}

impl From<Address> for usize {
    fn from(addr: Address) -> usize {
        addr.0
    }
}

impl Add<usize> for Address {
    type Output = Address;

    fn add(self, rhs: usize) -> Address {
        Address(self.0.wrapping_add(rhs))
    }
}

impl Sub<usize> for Address {
    type Output = Address;

    fn sub(self, rhs: usize) -> Address {
        Address(self.0.wrapping_sub(rhs))
    }
}

impl Add<isize> for Address {
    type Output = Address;

    fn add(self, rhs: isize) -> Address {
        self.offset(rhs)
    }
}

impl Sub<isize> for Address {
    type Output = Address;

    fn sub(self, rhs: isize) -> Address {
        self.offset(rhs.wrapping_neg())
    }
}

/// The right-hand address is interpreted as a signed delta.
impl Add<Address> for Address {
    type Output = Address;

    fn add(self, rhs: Address) -> Address {
        self.offset(rhs.0 as isize)
    }
}

impl Sub<Address> for Address {
    type Output = Address;

    fn sub(self, rhs: Address) -> Address {
        self.offset((rhs.0 as isize).wrapping_neg())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({:#x})", self.0)
    }
}

impl fmt::LowerHex for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arithmetic() {
        let a = Address::new(0x1000);
        assert_eq!((a + 0x10usize).get(), 0x1010);
        assert_eq!((a - 0x10usize).get(), 0xff0);
        assert_eq!((a + (-8isize)).get(), 0xff8);
        assert_eq!((a - (-8isize)).get(), 0x1008);
        assert_eq!((a + Address::new(0x20)).get(), 0x1020);
        assert_eq!((a - Address::new(0x20)).get(), 0xfe0);
        assert!(Address::new(0xfff) < a);
    }

    #[test]
    fn deref_levels() {
        let target: usize = 0xdead_beef;
        let level1: usize = &target as *const usize as usize;
        let level2: usize = &level1 as *const usize as usize;

        let a = Address::from_ptr(&level2);
        assert_eq!(unsafe { a.deref(0, 0) }, a);
        assert_eq!(unsafe { a.deref(1, 0) }.get(), level1);
        assert_eq!(unsafe { a.deref(2, 0) }.get(), &target as *const _ as usize);
        assert_eq!(unsafe { a.deref(3, 0) }.get(), 0xdead_beef);
    }

    #[test]
    fn deref_with_offset() {
        // Two-word records chained by their second word.
        let tail: [usize; 2] = [0x77, 0];
        let head: [usize; 2] = [0x33, tail.as_ptr() as usize];

        let a = Address::from_ptr(head.as_ptr());
        let next = unsafe { a.deref(1, 8) };
        assert_eq!(next.get(), tail.as_ptr() as usize);
        assert_eq!(unsafe { next.read::<usize>() }, 0x77);
    }

    #[test]
    fn follow_near_call() {
        // call +0x10
        let code: [u8; 8] = [0xe8, 0x10, 0x00, 0x00, 0x00, 0x90, 0x90, 0x90];
        let p = Address::from_ptr(code.as_ptr());
        assert_eq!(unsafe { p.follow_near_call() }, p + 0x15usize);
    }

    #[test]
    fn follow_near_call_negative_disp() {
        let code: [u8; 8] = [0xe8, 0xfc, 0xff, 0xff, 0xff, 0x90, 0x90, 0x90];
        let p = Address::from_ptr(code.as_ptr());
        assert_eq!(unsafe { p.follow_near_call() }, p + 0x1usize);
    }

    #[test]
    fn dump_format() {
        let data: [u8; 13] = [
            0x48, 0x65, 0x6c, 0x6c, 0x6f, 0x00, 0x01, 0x7e, 0x7f, 0x20, 0x41, 0x42, 0x43,
        ];
        let mut lines = Vec::new();
        let count = unsafe {
            Address::from_ptr(data.as_ptr()).dump(data.len(), 8, |line| {
                lines.push(line.to_owned());
            })
        };

        assert_eq!(count, 2);
        assert_eq!(lines[0], "48 65 6C 6C 6F 00 01 7E |Hello..~|");
        assert_eq!(lines[1], "7F 20 41 42 43          |. ABC|");
    }

    #[test]
    fn dump_exact_line() {
        let data: [u8; 4] = [0xde, 0xad, 0xbe, 0xef];
        let mut lines = Vec::new();
        let count = unsafe {
            Address::from_ptr(data.as_ptr()).dump(data.len(), 4, |line| {
                lines.push(line.to_owned());
            })
        };

        assert_eq!(count, 1);
        assert_eq!(lines[0], "DE AD BE EF |....|");
    }
}
