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

use std::collections::{HashSet, VecDeque};

use crate::entry::IdleEntry;
use crate::lease::RequestId;
use crate::EntryId;

/// The connections and waiters of a single route
pub(crate) struct RoutePool<T> {
    leased: HashSet<EntryId>,
    // the front is the most recently released, so one hot connection gets reused
    available: VecDeque<IdleEntry<T>>,
    pending: VecDeque<RequestId>,
}

impl<T> RoutePool<T> {
    pub fn new() -> Self {
        RoutePool {
            leased: HashSet::new(),
            available: VecDeque::new(),
            pending: VecDeque::new(),
        }
    }

    /// leased + available, what counts against the route limit
    pub fn allocated(&self) -> usize {
        self.leased.len() + self.available.len()
    }

    pub fn leased_count(&self) -> usize {
        self.leased.len()
    }

    pub fn available_count(&self) -> usize {
        self.available.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Nothing is tracked for this route anymore
    pub fn is_unused(&self) -> bool {
        self.leased.is_empty() && self.available.is_empty() && self.pending.is_empty()
    }

    pub fn lease(&mut self, id: EntryId) {
        self.leased.insert(id);
    }

    /// Forget a leased entry, returns false if it was not leased
    pub fn free(&mut self, id: EntryId) -> bool {
        self.leased.remove(&id)
    }

    pub fn put_available(&mut self, entry: IdleEntry<T>) {
        self.available.push_front(entry);
    }

    /// Put back an entry that was taken out, ordered by when it was released
    pub fn restore_available(&mut self, entry: IdleEntry<T>) {
        let pos = self
            .available
            .iter()
            .position(|e| e.meta.updated <= entry.meta.updated)
            .unwrap_or(self.available.len());
        self.available.insert(pos, entry);
    }

    /// Take the most recently released entry
    pub fn take_available(&mut self) -> Option<IdleEntry<T>> {
        self.available.pop_front()
    }

    /// Take the least recently released entry
    pub fn take_oldest_available(&mut self) -> Option<IdleEntry<T>> {
        self.available.pop_back()
    }

    pub fn remove_available(&mut self, id: EntryId) -> Option<IdleEntry<T>> {
        // old entries sit at the back, which is where eviction looks
        let pos = self.available.iter().rposition(|e| e.meta.id == id)?;
        self.available.remove(pos)
    }

    /// Remove and return every available entry matching `pred`
    pub fn drain_available<F>(&mut self, mut pred: F) -> Vec<IdleEntry<T>>
    where
        F: FnMut(&IdleEntry<T>) -> bool,
    {
        let mut drained = Vec::new();
        let mut kept = VecDeque::with_capacity(self.available.len());
        for entry in self.available.drain(..) {
            if pred(&entry) {
                drained.push(entry);
            } else {
                kept.push_back(entry);
            }
        }
        self.available = kept;
        drained
    }

    pub fn enqueue(&mut self, request: RequestId) {
        self.pending.push_back(request);
    }

    pub fn head(&self) -> Option<RequestId> {
        self.pending.front().copied()
    }

    /// Remove a request from the queue, returns false if it was not queued
    pub fn dequeue(&mut self, request: RequestId) -> bool {
        match self.pending.iter().position(|r| *r == request) {
            Some(pos) => {
                self.pending.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Tear the route down, returning the available connections
    pub fn shutdown(&mut self) -> Vec<T> {
        self.leased.clear();
        self.pending.clear();
        self.available.drain(..).map(|e| e.connection).collect()
    }
}
