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

use std::hash::Hasher;

use twox_hash::XxHash64;

/// Hashes raw key bytes.
///
/// The hash is persisted inside index snapshots, so the seed must stay fixed.
pub fn hash_key(key: &[u8]) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(key);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_key_stable() {
        assert_eq!(hash_key(b"larder"), hash_key(b"larder"));
        assert_ne!(hash_key(b"larder"), hash_key(b"larde"));
        assert_ne!(hash_key(b""), hash_key(b"\0"));
    }
}
