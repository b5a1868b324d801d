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

//! Shared components for larder.

/// Assertion macros that can be promoted to hard assertions.
pub mod assert;
/// Power-of-two and alignment helpers.
pub mod bits;
/// Wall clock helpers for expiration math.
pub mod clock;
/// Key hashing.
pub mod hasher;
/// A bounded pool of reusable objects.
pub mod object_pool;
/// Unsigned LEB128 varint codec.
pub mod varint;
