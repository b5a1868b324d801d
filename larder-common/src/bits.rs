// Copyright 2025 foyer Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

/// Check if the given value is a power of 2.
#[inline(always)]
pub fn is_pow2(v: usize) -> bool {
    v != 0 && v & (v - 1) == 0
}

/// Align up the given value with the given align.
///
/// Note: The given align must be a power of 2.
#[inline(always)]
pub fn align_up(align: usize, v: usize) -> usize {
    debug_assert!(is_pow2(align), "align: {align}");
    (v + align - 1) & !(align - 1)
}

/// Align down the given value with the given align.
///
/// Note: The given align must be a power of 2.
#[inline(always)]
pub fn align_down(align: usize, v: usize) -> usize {
    debug_assert!(is_pow2(align), "align: {align}");
    v & !(align - 1)
}

/// Returns the `n` most significant bits of `v`.
#[inline(always)]
pub fn high_bits(v: u64, n: u32) -> u64 {
    if n == 0 {
        0
    } else {
        v >> (64 - n)
    }
}

/// Returns the `n` least significant bits of `v`.
#[inline(always)]
pub fn low_bits(v: u64, n: u32) -> u64 {
    if n >= 64 {
        v
    } else {
        v & ((1u64 << n) - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align() {
        assert_eq!(align_up(4096, 0), 0);
        assert_eq!(align_up(4096, 1), 4096);
        assert_eq!(align_up(4096, 4096), 4096);
        assert_eq!(align_up(4096, 4097), 8192);
        assert_eq!(align_down(4096, 4095), 0);
        assert_eq!(align_down(4096, 8193), 8192);
    }

    #[test]
    fn test_pow2() {
        assert!(!is_pow2(0));
        assert!(is_pow2(1));
        assert!(is_pow2(4096));
        assert!(!is_pow2(4097));
    }

    #[test]
    fn test_bits() {
        let v = 0xABCD_0000_0000_1234u64;
        assert_eq!(high_bits(v, 0), 0);
        assert_eq!(high_bits(v, 16), 0xABCD);
        assert_eq!(low_bits(v, 16), 0x1234);
        assert_eq!(low_bits(v, 64), v);
    }
}
