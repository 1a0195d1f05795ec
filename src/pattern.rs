use std::fmt;

/// Maximum number of byte positions a [`Pattern`] can hold.
pub const MAX_PATTERN_LEN: usize = 64;

/// A masked byte pattern parsed from a signature string such as
/// `"48 8B ?? 89 ?? ?? 41"`.
///
/// Each token is either a two-digit hex byte or a `?`/`??` wildcard.
/// Parsing is a `const fn`, so the same routine serves compile-time
/// constants and runtime strings:
///
/// ```
/// use vthook::Pattern;
///
/// const CALL_SITE: Pattern = Pattern::parse("E8 ?? ?? ?? ?? 45 33 F6");
/// assert_eq!(CALL_SITE.len(), 8);
/// assert_eq!(CALL_SITE, Pattern::parse("e8 ? ? ? ? 45 33 f6"));
/// ```
///
/// Unknown characters are skipped one byte at a time, and a trailing lone
/// hex digit is discarded; parsing never fails.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pattern {
    bytes: [u8; MAX_PATTERN_LEN],
    mask: [u8; MAX_PATTERN_LEN],
    len: usize,
}

const fn is_hex_digit(c: u8) -> bool {
    matches!(c, b'0'..=b'9' | b'a'..=b'f' | b'A'..=b'F')
}

const fn hex_digit(c: u8) -> u8 {
    match c {
        b'0'..=b'9' => c - b'0',
        b'a'..=b'f' => c - b'a' + 10,
        _ => c - b'A' + 10,
    }
}

impl Pattern {
    /// Parses a signature string. Truncates after [`MAX_PATTERN_LEN`]
    /// positions.
    #[must_use]
    pub const fn parse(source: &str) -> Self {
        let src = source.as_bytes();
        let mut bytes = [0u8; MAX_PATTERN_LEN];
        let mut mask = [0u8; MAX_PATTERN_LEN];
        let mut len = 0usize;

        let mut i = 0usize;
        while i < src.len() && len < MAX_PATTERN_LEN {
            let c = src[i];
            if c == b' ' {
                i += 1;
            } else if c == b'?' {
                i += 1;
                if i < src.len() && src[i] == b'?' {
                    i += 1;
                }
                mask[len] = b'?';
                len += 1;
            } else if i + 1 < src.len() && is_hex_digit(c) && is_hex_digit(src[i + 1]) {
                bytes[len] = (hex_digit(c) << 4) | hex_digit(src[i + 1]);
                mask[len] = b'x';
                len += 1;
                i += 2;
            } else {
                // Unknown character or trailing lone hex digit.
                i += 1;
            }
        }

        Self { bytes, mask, len }
    }

    /// Number of byte positions in the pattern.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether the pattern has no positions at all.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Pattern bytes; wildcard positions hold `0`.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    /// Per-position mask: `b'x'` must match, `b'?'` is a wildcard.
    #[must_use]
    pub fn mask(&self) -> &[u8] {
        &self.mask[..self.len]
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for i in 0..self.len {
            if i > 0 {
                f.write_str(" ")?;
            }
            if self.mask[i] == b'x' {
                write!(f, "{:02X}", self.bytes[i])?;
            } else {
                f.write_str("??")?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pattern(\"{self}\")")
    }
}
