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

use lru::LruCache;
use std::time::Instant;

use crate::{EntryId, Route};

/// Where an available entry lives and when it was released
#[derive(Debug, Clone)]
pub struct IdleNode {
    pub route: Route,
    pub released: Instant,
}

/// The release order of every available entry across all routes.
///
/// The least recently released entry is the first one to be evicted when another route needs
/// the capacity. Entries released at the same instant keep their insertion order.
pub struct IdleIndex {
    lru: LruCache<EntryId, IdleNode>,
}

impl IdleIndex {
    pub fn new() -> Self {
        IdleIndex {
            lru: LruCache::unbounded(),
        }
    }

    pub fn add(&mut self, id: EntryId, route: Route, released: Instant) {
        self.lru.put(id, IdleNode { route, released });
    }

    /// Put back an entry that left the index, in the place its `released` time gives it
    pub fn restore(&mut self, id: EntryId, route: Route, released: Instant) {
        self.lru.put(id, IdleNode { route, released });
        let newer: Vec<EntryId> = self
            .lru
            .iter()
            .rev()
            .filter(|(_, node)| node.released > released)
            .map(|(id, _)| *id)
            .collect();
        for id in newer {
            self.lru.promote(&id);
        }
    }

    pub fn remove(&mut self, id: EntryId) -> Option<IdleNode> {
        self.lru.pop(&id)
    }

    /// Remove and return the least recently released entry
    pub fn pop_oldest(&mut self) -> Option<(EntryId, IdleNode)> {
        self.lru.pop_lru()
    }

    pub fn peek_oldest(&self) -> Option<(&EntryId, &IdleNode)> {
        self.lru.peek_lru()
    }

    pub fn len(&self) -> usize {
        self.lru.len()
    }

    pub fn clear(&mut self) {
        self.lru.clear();
    }
}
