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

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Whether an absolute expiration time (millis, `0` for never) has passed at `now`.
#[inline]
pub fn is_expired(expire: u64, now: u64) -> bool {
    expire != 0 && expire <= now
}

/// Relative time to live of an absolute expiration time, in milliseconds.
///
/// Returns `None` for items that never expire and `Some(0)` for items already expired.
#[inline]
pub fn ttl(expire: u64, now: u64) -> Option<u64> {
    match expire {
        0 => None,
        e => Some(e.saturating_sub(now)),
    }
}
