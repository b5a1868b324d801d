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

//! Unsigned LEB128 varints, as used by record headers.

/// Maximum encoded length of a `u64`.
pub const MAX_LEN: usize = 10;

/// Returns the encoded length of `v`.
pub fn encoded_len(mut v: u64) -> usize {
    let mut len = 1;
    while v >= 0x80 {
        v >>= 7;
        len += 1;
    }
    len
}

/// Encodes `v` at the beginning of `buf` and returns the number of bytes written.
///
/// # Panics
///
/// Panics if `buf` is shorter than [`encoded_len`] of `v`.
pub fn encode(mut v: u64, buf: &mut [u8]) -> usize {
    let mut i = 0;
    while v >= 0x80 {
        buf[i] = (v as u8) | 0x80;
        v >>= 7;
        i += 1;
    }
    buf[i] = v as u8;
    i + 1
}

/// Decodes a varint from the beginning of `buf`.
///
/// Returns the value and the number of bytes consumed, or `None` if `buf` ends before the varint does or the varint
/// overflows a `u64`.
pub fn decode(buf: &[u8]) -> Option<(u64, usize)> {
    let mut v = 0u64;
    for (i, &b) in buf.iter().enumerate().take(MAX_LEN) {
        let bits = (b & 0x7f) as u64;
        if i == MAX_LEN - 1 && bits > 1 {
            return None;
        }
        v |= bits << (7 * i);
        if b & 0x80 == 0 {
            return Some((v, i + 1));
        }
    }
    None
}
