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

//! Compact index entry layout.
//!
//! Every entry takes 12 bytes:
//!
//! ```plain
//! signature: u32 | hit (1 bit) | fingerprint high (31 bits) |
//! location:  u64 | fingerprint low (16 bits) | segment id (16 bits) | offset (32 bits) |
//! ```
//!
//! The fingerprint is the low 47 bits of the key hash. [`IndexFormat::CompactWithExpire`] adds a `u32` expiration
//! time in seconds.

use serde::{Deserialize, Serialize};

use crate::segment::SegmentId;

/// Bits of the key hash kept in an entry.
pub const FINGERPRINT_BITS: u32 = 47;

const FINGERPRINT_MASK: u64 = (1 << FINGERPRINT_BITS) - 1;
pub(crate) const HIT_BIT: u32 = 1 << 31;
const SIGNATURE_MASK: u32 = !HIT_BIT;

/// Index entry format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexFormat {
    /// Fingerprint, hit bit and location. Items never expire.
    Compact,
    /// [`IndexFormat::Compact`] plus an expiration time with second precision.
    CompactWithExpire,
}

impl IndexFormat {
    /// Bytes per entry.
    pub fn entry_size(&self) -> usize {
        match self {
            Self::Compact => 12,
            Self::CompactWithExpire => 16,
        }
    }

    /// Whether entries carry an expiration time.
    pub fn has_expire(&self) -> bool {
        matches!(self, Self::CompactWithExpire)
    }
}

/// Where a record lives: a segment and the offset of its block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    /// Segment id.
    pub segment: SegmentId,
    /// Offset of the block holding the record.
    pub offset: u32,
}

impl Location {
    /// Create a location.
    pub fn new(segment: SegmentId, offset: u32) -> Self {
        Self { segment, offset }
    }
}

#[inline]
pub(crate) fn fingerprint(hash: u64) -> u64 {
    hash & FINGERPRINT_MASK
}

#[inline]
pub(crate) fn signature(fingerprint: u64) -> u32 {
    (fingerprint >> 16) as u32 & SIGNATURE_MASK
}

#[inline]
pub(crate) fn pack_location(fingerprint: u64, location: Location) -> u64 {
    (fingerprint & 0xFFFF) << 48 | (location.segment as u64) << 32 | location.offset as u64
}

#[inline]
pub(crate) fn unpack_location(packed: u64) -> Location {
    Location {
        segment: (packed >> 32) as u16,
        offset: packed as u32,
    }
}

/// Whether a stored entry carries `fingerprint`.
#[inline]
pub(crate) fn matches(sig: u32, packed: u64, fingerprint: u64) -> bool {
    sig & SIGNATURE_MASK == signature(fingerprint) && packed >> 48 == fingerprint & 0xFFFF
}

/// The fingerprint of a stored entry.
#[inline]
pub(crate) fn stored_fingerprint(sig: u32, packed: u64) -> u64 {
    ((sig & SIGNATURE_MASK) as u64) << 16 | packed >> 48
}

/// Absolute expiration in millis to stored seconds, rounded up so an item never expires early.
#[inline]
pub(crate) fn expire_to_secs(expire: u64) -> u32 {
    if expire == 0 {
        return 0;
    }
    u64::min(expire.div_ceil(1000), u32::MAX as u64) as u32
}

/// Stored seconds back to absolute millis.
#[inline]
pub(crate) fn secs_to_expire(secs: u32) -> u64 {
    secs as u64 * 1000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_packing() {
        let hash = 0xDEAD_BEEF_CAFE_BABE_u64;
        let fp = fingerprint(hash);
        let location = Location::new(0xABCD, 0x1234_5678);
        let sig = signature(fp);
        let packed = pack_location(fp, location);

        assert_eq!(unpack_location(packed), location);
        assert!(matches(sig, packed, fp));
        assert!(matches(sig | HIT_BIT, packed, fp));
        assert_eq!(stored_fingerprint(sig | HIT_BIT, packed), fp);
        assert!(!matches(sig, packed, fingerprint(hash ^ 1)));
        assert!(!matches(sig, packed, fingerprint(hash ^ (1 << 40))));
        // Bits above the fingerprint are not stored.
        assert!(matches(sig, packed, fingerprint(hash ^ (1 << 60))));
    }

    #[test]
    fn test_expire_seconds() {
        assert_eq!(expire_to_secs(0), 0);
        assert_eq!(expire_to_secs(1), 1);
        assert_eq!(expire_to_secs(1000), 1);
        assert_eq!(expire_to_secs(1001), 2);
        assert_eq!(secs_to_expire(2), 2000);
        assert_eq!(expire_to_secs(u64::MAX), u32::MAX);
    }
}
