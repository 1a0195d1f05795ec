//! Masked byte-pattern scanning over in-memory sections.
//!
//! Three backends: an AVX2 filtered compare for patterns up to 32 bytes, an
//! SSE2 block compare for patterns that fit one 16-byte block, and a scalar
//! backend that bulk-compares precomputed runs of strict bytes. The widest
//! backend that does not need multi-block masking is chosen per scan, and
//! SIMD candidate loops hand over to the scalar backend where a full vector
//! load would cross the section end, so all backends return identical
//! results.

/// Finds the first offset `p >= from` in `data` such that every non-wildcard
/// pattern byte matches `data[p + i]`.
///
/// `bytes` and `mask` must have equal length; `mask[i] == b'x'` marks a
/// strict byte, anything else is a wildcard.
pub(crate) fn find(data: &[u8], from: usize, bytes: &[u8], mask: &[u8]) -> Option<usize> {
    debug_assert_eq!(bytes.len(), mask.len());

    let len = mask.len();
    if len == 0 || len > data.len() || from > data.len() - len {
        return None;
    }

    #[cfg(target_arch = "x86_64")]
    {
        if len <= 32 && std::arch::is_x86_feature_detected!("avx2") {
            return unsafe { simd::find_avx2(data, from, bytes, mask) };
        }
        if len <= 16 {
            // SSE2 is part of the x86_64 baseline.
            return unsafe { simd::find_sse2(data, from, bytes, mask) };
        }
    }

    scalar::find(data, from, bytes, mask)
}

#[cfg(target_arch = "x86_64")]
pub(crate) mod simd {
    use std::arch::x86_64::{
        __m128i, __m256i, _mm256_and_si256, _mm256_cmpeq_epi8, _mm256_loadu_si256,
        _mm256_movemask_epi8, _mm_cmpeq_epi8, _mm_loadu_si128, _mm_movemask_epi8, _mm_prefetch,
        _MM_HINT_NTA,
    };

    use super::scalar;
    use crate::pattern::MAX_PATTERN_LEN;

    const BLOCK: usize = 16;
    const MAX_BLOCKS: usize = MAX_PATTERN_LEN / BLOCK;

    /// SSE2 backend. Compares the pattern in 16-byte blocks; the movemask of
    /// each block compare must cover that block's strict-byte bits.
    ///
    /// # Safety
    ///
    /// Requires SSE2 (always present on x86_64).
    pub(crate) unsafe fn find_sse2(
        data: &[u8],
        from: usize,
        bytes: &[u8],
        mask: &[u8],
    ) -> Option<usize> {
        let len = mask.len();
        let blocks = (len + BLOCK - 1) / BLOCK;
        debug_assert!(blocks <= MAX_BLOCKS);

        let mut padded = [0u8; MAX_BLOCKS * BLOCK];
        padded[..len].copy_from_slice(bytes);

        let mut bit_masks = [0u16; MAX_BLOCKS];
        for (i, &m) in mask.iter().enumerate() {
            if m == b'x' {
                bit_masks[i / BLOCK] |= 1 << (i % BLOCK);
            }
        }

        let mut chunks = [std::mem::zeroed::<__m128i>(); MAX_BLOCKS];
        for (i, chunk) in chunks.iter_mut().enumerate().take(blocks) {
            *chunk = _mm_loadu_si128(padded.as_ptr().add(i * BLOCK) as *const __m128i);
        }

        let last = data.len() - len;
        let base = data.as_ptr();
        let mut p = from;

        if let Some(full_last) = data.len().checked_sub(blocks * BLOCK) {
            while p <= full_last.min(last) {
                _mm_prefetch::<_MM_HINT_NTA>(base.wrapping_add(p + 64) as *const i8);

                let mut found = true;
                for j in 0..blocks {
                    let hay = _mm_loadu_si128(base.add(p + j * BLOCK) as *const __m128i);
                    let cmp = _mm_cmpeq_epi8(hay, chunks[j]);
                    let m = _mm_movemask_epi8(cmp) as u16;
                    if m & bit_masks[j] != bit_masks[j] {
                        found = false;
                        break;
                    }
                }
                if found {
                    return Some(p);
                }
                p += 1;
            }
        }

        // Tail candidates where a full block load would cross the end.
        if p <= last {
            return scalar::find(data, p, bytes, mask);
        }
        None
    }

    /// AVX2 backend for patterns up to 32 bytes: a single compare of the
    /// wildcard-filtered haystack against the wildcard-filtered pattern.
    ///
    /// # Safety
    ///
    /// Requires AVX2; check `is_x86_feature_detected!("avx2")` first.
    #[target_feature(enable = "avx2")]
    pub(crate) unsafe fn find_avx2(
        data: &[u8],
        from: usize,
        bytes: &[u8],
        mask: &[u8],
    ) -> Option<usize> {
        let len = mask.len();
        debug_assert!(len <= 32);

        let mut filtered = [0u8; 32];
        let mut strict = [0u8; 32];
        for i in 0..len {
            if mask[i] == b'x' {
                filtered[i] = bytes[i];
                strict[i] = 0xff;
            }
        }

        let pattern = _mm256_loadu_si256(filtered.as_ptr() as *const __m256i);
        let byte_mask = _mm256_loadu_si256(strict.as_ptr() as *const __m256i);
        let required: u32 = if len == 32 { u32::MAX } else { (1u32 << len) - 1 };

        let last = data.len() - len;
        let base = data.as_ptr();
        let mut p = from;

        if let Some(full_last) = data.len().checked_sub(32) {
            while p <= full_last.min(last) {
                _mm_prefetch::<_MM_HINT_NTA>(base.wrapping_add(p + 64) as *const i8);

                let hay = _mm256_loadu_si256(base.add(p) as *const __m256i);
                let eq = _mm256_cmpeq_epi8(_mm256_and_si256(hay, byte_mask), pattern);
                let m = _mm256_movemask_epi8(eq) as u32;
                if m & required == required {
                    return Some(p);
                }
                p += 1;
            }
        }

        if p <= last {
            return scalar::find(data, p, bytes, mask);
        }
        None
    }
}

pub(crate) mod scalar {
    /// Upper bound on precomputed strict-byte runs; patterns with more runs
    /// fall back to the byte-wise loop.
    const MAX_RUNS: usize = 16;

    /// Scalar backend: bulk-compares each contiguous run of strict bytes at
    /// every candidate position.
    pub(crate) fn find(data: &[u8], from: usize, bytes: &[u8], mask: &[u8]) -> Option<usize> {
        let len = mask.len();
        debug_assert!(len > 0 && len <= data.len() && from <= data.len() - len);

        let mut runs = [(0usize, 0usize); MAX_RUNS];
        let mut run_count = 0;
        let mut i = 0;
        while i < len {
            if mask[i] != b'x' {
                i += 1;
                continue;
            }
            let start = i;
            while i < len && mask[i] == b'x' {
                i += 1;
            }
            if run_count == MAX_RUNS {
                return find_bytewise(data, from, bytes, mask);
            }
            runs[run_count] = (start, i - start);
            run_count += 1;
        }

        // A pattern with no strict byte matches at the first candidate.
        if run_count == 0 {
            return Some(from);
        }

        let last = data.len() - len;
        'candidates: for p in from..=last {
            for &(off, run_len) in &runs[..run_count] {
                if data[p + off..p + off + run_len] != bytes[off..off + run_len] {
                    continue 'candidates;
                }
            }
            return Some(p);
        }
        None
    }

    fn find_bytewise(data: &[u8], from: usize, bytes: &[u8], mask: &[u8]) -> Option<usize> {
        let len = mask.len();
        let last = data.len() - len;

        'candidates: for p in from..=last {
            for i in 0..len {
                if mask[i] == b'x' && data[p + i] != bytes[i] {
                    continue 'candidates;
                }
            }
            return Some(p);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::Pattern;

    fn find_pattern(data: &[u8], from: usize, pattern: &Pattern) -> Option<usize> {
        find(data, from, pattern.bytes(), pattern.mask())
    }

    const SECTION: [u8; 13] = [
        0xde, 0xad, 0xbe, 0xef, 0x90, 0x90, 0x48, 0x8b, 0x05, 0x10, 0x00, 0x00, 0x00,
    ];

    #[test]
    fn deterministic_match() {
        let pattern = Pattern::parse("48 8B 05 ?? ?? ?? ??");
        assert_eq!(find_pattern(&SECTION, 0, &pattern), Some(6));
    }

    #[test]
    fn leading_wildcard() {
        let pattern = Pattern::parse("?? 8B 05");
        assert_eq!(find_pattern(&SECTION, 0, &pattern), Some(6));
    }

    #[test]
    fn no_match() {
        let pattern = Pattern::parse("48 8B 06");
        assert_eq!(find_pattern(&SECTION, 0, &pattern), None);
    }

    #[test]
    fn bounds() {
        let pattern = Pattern::parse("DE AD");
        assert_eq!(find_pattern(&SECTION, 0, &pattern), Some(0));
        // Start past the last admissible candidate.
        assert_eq!(find_pattern(&SECTION, 12, &pattern), None);
        // Empty pattern and over-long pattern.
        assert_eq!(find_pattern(&SECTION, 0, &Pattern::parse("")), None);
        let long = "90 ".repeat(14);
        assert_eq!(find_pattern(&SECTION, 0, &Pattern::parse(&long)), None);
    }

    #[test]
    fn all_wildcards_match_first_candidate() {
        let pattern = Pattern::parse("?? ?? ??");
        assert_eq!(find_pattern(&SECTION, 0, &pattern), Some(0));
        assert_eq!(find_pattern(&SECTION, 5, &pattern), Some(5));
    }

    #[test]
    fn match_at_section_end() {
        let pattern = Pattern::parse("10 00 00 00");
        assert_eq!(find_pattern(&SECTION, 0, &pattern), Some(9));
    }

    // Small deterministic PRNG so the equivalence sweep needs no extra
    // dependency.
    struct XorShift(u64);

    impl XorShift {
        fn next(&mut self) -> u64 {
            let mut x = self.0;
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            self.0 = x;
            x
        }
    }

    #[test]
    fn backends_agree_on_random_inputs() {
        let mut rng = XorShift(0x9e37_79b9_7f4a_7c15);

        let mut data = vec![0u8; 512];
        for byte in data.iter_mut() {
            *byte = rng.next() as u8;
        }

        for pattern_len in 1..=48usize {
            for _ in 0..32 {
                // Pick a real slice of the haystack, then knock holes in it
                // so matches actually occur.
                let at = rng.next() as usize % (data.len() - pattern_len);
                let mut bytes = data[at..at + pattern_len].to_vec();
                let mut mask = vec![b'x'; pattern_len];
                for i in 0..pattern_len {
                    if rng.next() % 3 == 0 {
                        mask[i] = b'?';
                        bytes[i] = 0;
                    }
                }

                for from in [0usize, at / 2, at] {
                    let expected = scalar::find(&data, from, &bytes, &mask);
                    assert_eq!(find(&data, from, &bytes, &mask), expected);

                    #[cfg(target_arch = "x86_64")]
                    {
                        let got = unsafe { simd::find_sse2(&data, from, &bytes, &mask) };
                        assert_eq!(got, expected);
                        if pattern_len <= 32
                            && std::arch::is_x86_feature_detected!("avx2")
                        {
                            let got = unsafe { simd::find_avx2(&data, from, &bytes, &mask) };
                            assert_eq!(got, expected);
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn run_overflow_falls_back_correctly() {
        // 17 isolated strict bytes -> more runs than the run table holds.
        let mut source = String::new();
        for i in 0..17 {
            if i > 0 {
                source.push_str(" ?? ");
            }
            source.push_str("41");
        }
        let pattern = Pattern::parse(&source);
        assert_eq!(pattern.len(), 33);

        let mut data = vec![0u8; 128];
        for (i, byte) in data.iter_mut().enumerate().skip(40) {
            *byte = if i % 2 == 0 { 0x41 } else { 0x7f };
        }
        let expected = Some(40);
        assert_eq!(
            scalar::find(&data, 0, pattern.bytes(), pattern.mask()),
            expected
        );
        assert_eq!(find(&data, 0, pattern.bytes(), pattern.mask()), expected);
    }

    #[test]
    fn match_near_end_uses_tail_path() {
        // Force SIMD candidates to run out before the match so the scalar
        // tail hand-off is what finds it.
        let mut data = vec![0u8; 70];
        data[66] = 0xaa;
        data[67] = 0xbb;
        data[68] = 0xcc;
        data[69] = 0xdd;
        let pattern = Pattern::parse("AA BB CC DD");
        assert_eq!(find_pattern(&data, 0, &pattern), Some(66));
        assert_eq!(find_pattern(&data, 66, &pattern), Some(66));
    }
}
