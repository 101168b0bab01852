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

//! Pool entries: one connection bound to one route

use log::{trace, warn};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crate::manager::Shared;
use crate::{Connector, Route};

/// The unique ID of a pooled connection
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(pub(crate) u64);

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The bookkeeping of a pooled connection, shared by its leased and available forms
#[derive(Clone, Debug)]
pub(crate) struct EntryMeta {
    pub id: EntryId,
    pub route: Route,
    pub created: Instant,
    /// last time the entry was released to the pool
    pub updated: Instant,
    /// absolute end of life, from the time-to-live
    pub deadline: Option<Instant>,
    /// after this point the entry is not handed out again
    pub expiry: Option<Instant>,
}

impl EntryMeta {
    pub fn new(id: EntryId, route: Route, now: Instant, ttl: Option<Duration>) -> Self {
        let deadline = ttl.and_then(|ttl| now.checked_add(ttl));
        EntryMeta {
            id,
            route,
            created: now,
            updated: now,
            deadline,
            expiry: deadline,
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.expiry.map_or(false, |expiry| now >= expiry)
    }

    /// Mark the entry released at `now`, valid for `valid_for` but never past its deadline.
    pub fn touch(&mut self, now: Instant, valid_for: Option<Duration>) {
        self.updated = now;
        let expiry = valid_for.and_then(|d| now.checked_add(d));
        self.expiry = match (expiry, self.deadline) {
            (Some(expiry), Some(deadline)) => Some(expiry.min(deadline)),
            (expiry, deadline) => expiry.or(deadline),
        };
    }
}

/// An available connection waiting in its route pool
pub(crate) struct IdleEntry<T> {
    pub meta: EntryMeta,
    pub connection: T,
}

impl<T> IdleEntry<T> {
    /// Whether this entry can be handed out at `now`.
    ///
    /// The connector's staleness check only runs on entries idle for at least
    /// `validate_after`, or always if it is `None`.
    pub fn is_usable<C>(
        &self,
        connector: &C,
        now: Instant,
        validate_after: Option<Duration>,
    ) -> bool
    where
        C: Connector<Connection = T>,
    {
        if self.meta.is_expired(now) {
            trace!("idle connection {} expired", self.meta.id);
            return false;
        }
        if !connector.is_open(&self.connection) {
            trace!("idle connection {} is no longer open", self.meta.id);
            return false;
        }
        let idle_for = now.saturating_duration_since(self.meta.updated);
        if validate_after.map_or(true, |after| idle_for >= after)
            && connector.is_stale(&self.connection, now)
        {
            trace!("idle connection {} is stale", self.meta.id);
            return false;
        }
        true
    }
}

/// A leased connection.
///
/// The holder has exclusive use of the connection until it is handed back with
/// [ConnectionManager::release](crate::ConnectionManager::release). Dropping a [PoolEntry]
/// without releasing it discards the connection and frees its slot.
pub struct PoolEntry<C: Connector> {
    meta: EntryMeta,
    // present until the entry is consumed by release or drop
    connection: Option<C::Connection>,
    reused: bool,
    pool: Weak<Shared<C>>,
}

impl<C: Connector> PoolEntry<C> {
    pub(crate) fn new(
        meta: EntryMeta,
        connection: C::Connection,
        reused: bool,
        pool: &Arc<Shared<C>>,
    ) -> Self {
        PoolEntry {
            meta,
            connection: Some(connection),
            reused,
            pool: Arc::downgrade(pool),
        }
    }

    pub fn id(&self) -> EntryId {
        self.meta.id
    }

    pub fn route(&self) -> &Route {
        &self.meta.route
    }

    pub fn connection(&self) -> &C::Connection {
        self.connection
            .as_ref()
            .expect("connection present until the entry is released")
    }

    pub fn connection_mut(&mut self) -> &mut C::Connection {
        self.connection
            .as_mut()
            .expect("connection present until the entry is released")
    }

    /// Whether the connection was reused from the pool rather than freshly created
    pub fn is_reused(&self) -> bool {
        self.reused
    }

    pub fn created(&self) -> Instant {
        self.meta.created
    }

    /// The last time this connection was released to the pool
    pub fn updated(&self) -> Instant {
        self.meta.updated
    }

    pub fn expiry(&self) -> Option<Instant> {
        self.meta.expiry
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.meta.is_expired(now)
    }

    pub(crate) fn issued_by(&self, shared: &Arc<Shared<C>>) -> bool {
        std::ptr::eq(self.pool.as_ptr(), Arc::as_ptr(shared))
    }

    pub(crate) fn take(&mut self) -> Option<(EntryMeta, C::Connection)> {
        self.connection
            .take()
            .map(|connection| (self.meta.clone(), connection))
    }
}

impl<C: Connector> fmt::Debug for PoolEntry<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolEntry")
            .field("id", &self.meta.id)
            .field("route", &self.meta.route)
            .field("reused", &self.reused)
            .field("expiry", &self.meta.expiry)
            .finish()
    }
}

impl<C: Connector> Drop for PoolEntry<C> {
    fn drop(&mut self) {
        let Some((meta, connection)) = self.take() else {
            return;
        };
        match self.pool.upgrade() {
            Some(shared) => {
                let id = meta.id;
                if let Err(e) = shared.check_in(meta, connection, false, None) {
                    warn!("fail to discard dropped connection {id}: {e}");
                }
            }
            None => {
                trace!("pool of connection {} is gone, dropping it", meta.id);
                drop(connection);
            }
        }
    }
}
