// Copyright 2024 Cloudflare, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


use std::fmt;

/// A snapshot of the pool counters, either for one route or for the whole pool.
///
/// All fields are read under the same lock, they are consistent with each other.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// connections handed out, including the ones still being created
    pub leased: usize,
    /// lease requests waiting for a connection
    pub pending: usize,
    /// idle connections kept for reuse
    pub available: usize,
    /// the effective connection limit
    pub max: usize,
}

impl PoolStats {
    /// leased + available
    pub fn allocated(&self) -> usize {
        self.leased + self.available
    }
}

impl fmt::Display for PoolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[leased: {}; pending: {}; available: {}; max: {}]",
            self.leased, self.pending, self.available, self.max
        )
    }
}
