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

//! The pool engine
//!
//! All the state of a pool lives in one [PoolState] behind one lock. Every lease, release,
//! eviction, cancellation and shutdown is a single critical section on it. Connections are
//! only created and closed outside of the lock.

use harbor_error::{Error, ErrorContext, ErrorSource, ErrorType, ErrorType::*, Result};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::entry::{EntryMeta, IdleEntry};
use crate::idle::IdleIndex;
use crate::lease::{Grant, LeaseRequest, LeaseSlot, RequestId, SlotState};
use crate::route_pool::RoutePool;
use crate::{Connector, EntryId, PoolConf, PoolEntry, PoolStats, Route};

pub(crate) fn pool_error<S: Into<ErrorContext>>(etype: ErrorType, context: S) -> Box<Error> {
    Error::create(etype, ErrorSource::Internal, Some(context.into()), None)
}

/// The capacity limits of a pool
#[derive(Debug, Clone)]
pub(crate) struct Limits {
    pub max_total: usize,
    pub default_max_per_route: usize,
    pub max_per_route: HashMap<Route, usize>,
}

impl Limits {
    pub fn max_for(&self, route: &Route) -> usize {
        self.max_per_route
            .get(route)
            .copied()
            .unwrap_or(self.default_max_per_route)
    }
}

pub(crate) struct PoolState<T> {
    pub routes: HashMap<Route, RoutePool<T>>,
    pub idle: IdleIndex,
    pub requests: HashMap<RequestId, LeaseSlot<T>>,
    // every pending request in arrival order
    pub waiting: BTreeMap<RequestId, Route>,
    pub leased: usize,
    pub limits: Limits,
    pub time_to_live: Option<Duration>,
    pub default_keepalive: Option<Duration>,
    pub validate_after_inactivity: Option<Duration>,
    pub shutdown: bool,
    next_entry: u64,
    next_request: u64,
}

impl<T> PoolState<T> {
    fn new(conf: &PoolConf) -> Self {
        PoolState {
            routes: HashMap::new(),
            idle: IdleIndex::new(),
            requests: HashMap::new(),
            waiting: BTreeMap::new(),
            leased: 0,
            limits: Limits {
                max_total: conf.max_total,
                default_max_per_route: conf.default_max_per_route,
                max_per_route: conf
                    .per_route
                    .iter()
                    .map(|l| (l.route.clone(), l.max))
                    .collect(),
            },
            time_to_live: conf.time_to_live(),
            default_keepalive: conf.default_keepalive(),
            validate_after_inactivity: conf.validate_after_inactivity(),
            shutdown: false,
            next_entry: 0,
            next_request: 0,
        }
    }

    /// leased + available over all routes
    pub fn allocated(&self) -> usize {
        self.leased + self.idle.len()
    }

    pub fn next_request_id(&mut self) -> RequestId {
        self.next_request += 1;
        RequestId(self.next_request)
    }

    fn next_entry_id(&mut self) -> EntryId {
        self.next_entry += 1;
        EntryId(self.next_entry)
    }

    pub fn enqueue(&mut self, id: RequestId, route: &Route) {
        self.routes
            .entry(route.clone())
            .or_insert_with(RoutePool::new)
            .enqueue(id);
        self.waiting.insert(id, route.clone());
    }

    /// Take a request out of the queues, returns false if it was not queued
    pub fn unqueue(&mut self, id: RequestId) -> bool {
        let Some(route) = self.waiting.remove(&id) else {
            return false;
        };
        if let Some(pool) = self.routes.get_mut(&route) {
            pool.dequeue(id);
        }
        self.prune(&route);
        true
    }

    // drop the bookkeeping of a route that has nothing left in it
    fn prune(&mut self, route: &Route) {
        if self.routes.get(route).map_or(false, |p| p.is_unused()) {
            self.routes.remove(route);
        }
    }

    /// Try to hand a connection of `route` to one more caller.
    ///
    /// Returns `None` when the caller has to wait. Invalid idle connections and evicted
    /// connections of other routes are pushed to `closing`.
    pub fn admit<C>(
        &mut self,
        route: &Route,
        now: Instant,
        connector: &C,
        closing: &mut Vec<T>,
    ) -> Option<Grant<T>>
    where
        C: Connector<Connection = T>,
    {
        let max_per_route = self.limits.max_for(route);
        let pool = self
            .routes
            .entry(route.clone())
            .or_insert_with(RoutePool::new);

        while let Some(idle) = pool.take_available() {
            self.idle.remove(idle.meta.id);
            if idle.is_usable(connector, now, self.validate_after_inactivity) {
                debug!("reuse connection {} for {route}", idle.meta.id);
                pool.lease(idle.meta.id);
                self.leased += 1;
                return Some(Grant::Reuse(idle));
            }
            debug!("close invalid idle connection {} of {route}", idle.meta.id);
            closing.push(idle.connection);
        }

        if pool.allocated() >= max_per_route {
            debug!("{route} is at its limit of {max_per_route}");
            return None;
        }

        // steal the capacity of the least recently released connection of another route
        while self.allocated() >= self.limits.max_total {
            let evicted = self.evict_oldest()?;
            debug!(
                "evict idle connection {} of {} for {route}",
                evicted.meta.id, evicted.meta.route
            );
            closing.push(evicted.connection);
        }

        let meta = EntryMeta::new(self.next_entry_id(), route.clone(), now, self.time_to_live);
        debug!("reserve new connection {} for {route}", meta.id);
        self.routes
            .entry(route.clone())
            .or_insert_with(RoutePool::new)
            .lease(meta.id);
        self.leased += 1;
        Some(Grant::Create(meta))
    }

    fn evict_oldest(&mut self) -> Option<IdleEntry<T>> {
        let (id, node) = self.idle.pop_oldest()?;
        let evicted = self
            .routes
            .get_mut(&node.route)
            .and_then(|p| p.remove_available(id));
        self.prune(&node.route);
        if evicted.is_none() {
            warn!("idle connection {id} of {} is not in its route pool", node.route);
        }
        evicted
    }

    /// Serve pending requests after capacity or connections became available.
    ///
    /// The queue of `first` is served before any other route, so a connection released on a
    /// route goes to a waiter of the same route even if a waiter of another route came first.
    /// The remaining requests are then tried in arrival order.
    pub fn dispatch<C>(
        &mut self,
        first: Option<&Route>,
        now: Instant,
        connector: &C,
        closing: &mut Vec<T>,
    ) where
        C: Connector<Connection = T>,
    {
        if let Some(route) = first {
            while let Some(id) = self.routes.get(route).and_then(|p| p.head()) {
                match self.admit(route, now, connector, closing) {
                    Some(grant) => self.grant(id, grant, closing),
                    None => break,
                }
            }
        }
        if self.waiting.is_empty() {
            return;
        }

        // only the head of each route queue can be served, and if it cannot, neither can
        // the ones behind it
        let mut blocked: HashSet<Route> = first.into_iter().cloned().collect();
        let queued: Vec<(RequestId, Route)> = self
            .waiting
            .iter()
            .map(|(id, route)| (*id, route.clone()))
            .collect();
        for (id, route) in queued {
            if blocked.contains(&route) {
                continue;
            }
            match self.admit(&route, now, connector, closing) {
                Some(grant) => self.grant(id, grant, closing),
                None => {
                    blocked.insert(route);
                }
            }
        }
    }

    /// Put a leased connection back, or throw it away when it cannot be reused.
    #[allow(clippy::too_many_arguments)]
    pub fn check_in<C>(
        &mut self,
        connector: &C,
        mut meta: EntryMeta,
        connection: T,
        reusable: bool,
        valid_for: Option<Duration>,
        now: Instant,
        closing: &mut Vec<T>,
    ) -> Result<()>
    where
        C: Connector<Connection = T>,
    {
        if self.shutdown {
            // the pool is torn down already, just close it
            closing.push(connection);
            return Ok(());
        }
        let route = meta.route.clone();
        if !self.routes.get_mut(&route).map_or(false, |p| p.free(meta.id)) {
            closing.push(connection);
            return Err(Error::explain(
                InvalidArgument,
                format!("connection {} is not leased from this pool", meta.id),
            )
            .into_caller());
        }
        self.leased -= 1;

        // the limits may have been lowered while the connection was out
        let route_allocated = self.routes.get(&route).map_or(0, |p| p.allocated());
        let over_limit = route_allocated >= self.limits.max_for(&route)
            || self.allocated() >= self.limits.max_total;
        if reusable && !over_limit && connector.is_open(&connection) {
            meta.touch(now, valid_for.or(self.default_keepalive));
            debug!("connection {} of {route} released for reuse", meta.id);
            self.idle.add(meta.id, route.clone(), now);
            self.routes
                .entry(route.clone())
                .or_insert_with(RoutePool::new)
                .put_available(IdleEntry { meta, connection });
        } else if over_limit {
            debug!("connection {} of {route} released over the limit, closed", meta.id);
            closing.push(connection);
        } else {
            debug!("connection {} of {route} released and closed", meta.id);
            closing.push(connection);
        }

        self.dispatch(Some(&route), now, connector, closing);
        self.prune(&route);
        Ok(())
    }

    /// Give back the slot of a connection that was reserved but never created
    pub fn cancel_reservation<C>(
        &mut self,
        meta: &EntryMeta,
        now: Instant,
        connector: &C,
        closing: &mut Vec<T>,
    ) where
        C: Connector<Connection = T>,
    {
        if self.free_reservation(meta) {
            self.dispatch(Some(&meta.route), now, connector, closing);
            self.prune(&meta.route);
        }
    }

    /// Free the slot of a granted entry that nobody will use, returns false if it was not held
    pub fn free_reservation(&mut self, meta: &EntryMeta) -> bool {
        if self.shutdown {
            return false;
        }
        let freed = self
            .routes
            .get_mut(&meta.route)
            .map_or(false, |p| p.free(meta.id));
        if freed {
            self.leased -= 1;
        }
        freed
    }

    /// Put a granted but unclaimed idle connection back where it came from
    pub fn restore_idle(&mut self, idle: IdleEntry<T>, closing: &mut Vec<T>) {
        if !self.free_reservation(&idle.meta) {
            closing.push(idle.connection);
            return;
        }
        self.idle
            .restore(idle.meta.id, idle.meta.route.clone(), idle.meta.updated);
        self.routes
            .entry(idle.meta.route.clone())
            .or_insert_with(RoutePool::new)
            .restore_available(idle);
    }

    /// Complete a queued request with `grant`
    pub fn grant(&mut self, id: RequestId, grant: Grant<T>, closing: &mut Vec<T>) {
        self.unqueue(id);
        match self.requests.get_mut(&id) {
            Some(slot) => slot.grant(grant),
            None => {
                warn!("lease request {id:?} is gone, taking its grant back");
                match grant {
                    Grant::Reuse(idle) => self.restore_idle(idle, closing),
                    Grant::Create(meta) => {
                        self.free_reservation(&meta);
                        self.prune(&meta.route);
                    }
                }
            }
        }
    }

    // close idle connections of a route beyond `max`, oldest first
    fn trim_route(&mut self, route: &Route, max: usize, closing: &mut Vec<T>) {
        let Some(pool) = self.routes.get_mut(route) else {
            return;
        };
        while pool.allocated() > max {
            let Some(entry) = pool.take_oldest_available() else {
                break;
            };
            self.idle.remove(entry.meta.id);
            closing.push(entry.connection);
        }
        self.prune(route);
    }

    fn trim_total(&mut self, closing: &mut Vec<T>) {
        while self.allocated() > self.limits.max_total {
            match self.evict_oldest() {
                Some(entry) => closing.push(entry.connection),
                None => break,
            }
        }
    }

    fn remove_idle_where<F>(&mut self, mut pred: F) -> Vec<T>
    where
        F: FnMut(&IdleEntry<T>) -> bool,
    {
        let mut closed = Vec::new();
        for pool in self.routes.values_mut() {
            for entry in pool.drain_available(&mut pred) {
                self.idle.remove(entry.meta.id);
                closed.push(entry.connection);
            }
        }
        self.routes.retain(|_, p| !p.is_unused());
        closed
    }

    fn stats_for(&self, route: &Route) -> PoolStats {
        let max = self.limits.max_for(route);
        match self.routes.get(route) {
            Some(pool) => PoolStats {
                leased: pool.leased_count(),
                pending: pool.pending_count(),
                available: pool.available_count(),
                max,
            },
            None => PoolStats {
                max,
                ..Default::default()
            },
        }
    }
}

pub(crate) struct Shared<C: Connector> {
    pub connector: C,
    pub state: Mutex<PoolState<C::Connection>>,
}

impl<C: Connector> Shared<C> {
    pub fn close_all(&self, closing: Vec<C::Connection>) {
        for connection in closing {
            self.connector.close(connection);
        }
    }

    pub fn check_in(
        &self,
        meta: EntryMeta,
        connection: C::Connection,
        reusable: bool,
        valid_for: Option<Duration>,
    ) -> Result<()> {
        let mut closing = Vec::new();
        let res = self.state.lock().check_in(
            &self.connector,
            meta,
            connection,
            reusable,
            valid_for,
            Instant::now(),
            &mut closing,
        );
        self.close_all(closing);
        res
    }

    /// Run `f` on the locked state, then close whatever it decided to close.
    pub fn with_state<R, F>(&self, f: F) -> R
    where
        F: FnOnce(&mut PoolState<C::Connection>, &C, &mut Vec<C::Connection>) -> R,
    {
        let mut closing = Vec::new();
        let res = {
            let mut state = self.state.lock();
            f(&mut state, &self.connector, &mut closing)
        };
        self.close_all(closing);
        res
    }
}

/// Connection manager
///
/// [ConnectionManager] hands out connections per [Route] under a total limit and a limit per
/// route. Connections released for reuse are kept open and handed out again to callers of the
/// same route. When the total limit is reached, an idle connection of another route is closed
/// to make room.
///
/// The manager is a cheap handle, clones refer to the same pool.
pub struct ConnectionManager<C: Connector> {
    shared: Arc<Shared<C>>,
}

impl<C: Connector> Clone for ConnectionManager<C> {
    fn clone(&self) -> Self {
        ConnectionManager {
            shared: self.shared.clone(),
        }
    }
}

impl<C: Connector> ConnectionManager<C> {
    /// Create a new [ConnectionManager] with the default [PoolConf]
    pub fn new(connector: C) -> Self {
        Self::build(connector, &PoolConf::default())
    }

    /// Create a new [ConnectionManager] with the given [PoolConf]
    ///
    /// Fails with [InvalidArgument](harbor_error::ErrorType::InvalidArgument) if a limit in
    /// the conf is zero.
    pub fn with_conf(connector: C, conf: &PoolConf) -> Result<Self> {
        let conf = conf.clone().validate()?;
        Ok(Self::build(connector, &conf))
    }

    fn build(connector: C, conf: &PoolConf) -> Self {
        ConnectionManager {
            shared: Arc::new(Shared {
                connector,
                state: Mutex::new(PoolState::new(conf)),
            }),
        }
    }

    pub fn connector(&self) -> &C {
        &self.shared.connector
    }

    /// Ask for a connection to `route`.
    ///
    /// The returned [LeaseRequest] is either granted already or queued behind the other
    /// requests of the route. `timeout` bounds how long the request may wait, counting from
    /// now: `None` waits forever, a zero timeout fails right away if nothing is free.
    ///
    /// Fails with [PoolClosed](harbor_error::ErrorType::PoolClosed) once the pool is shut down.
    pub fn lease(&self, route: &Route, timeout: Option<Duration>) -> Result<LeaseRequest<C>> {
        let now = Instant::now();
        let deadline = timeout.and_then(|t| now.checked_add(t));
        let request = self.shared.with_state(|state, connector, closing| {
            if state.shutdown {
                return Err(pool_error(PoolClosed, "connection pool is shut down"));
            }
            let id = state.next_request_id();
            // never jump ahead of the requests already waiting on this route
            let queue_empty = state.routes.get(route).map_or(true, |p| p.head().is_none());
            let grant = if queue_empty {
                state.admit(route, now, connector, closing)
            } else {
                None
            };
            let mut slot = LeaseSlot::new(route.clone());
            let signal = slot.signal.clone();
            match grant {
                Some(grant) => slot.state = SlotState::Granted(grant),
                None => {
                    debug!("queue lease request {id:?} for {route}");
                    state.enqueue(id, route);
                }
            }
            state.requests.insert(id, slot);
            Ok((id, signal))
        });
        let (id, signal) = request?;
        Ok(LeaseRequest::new(
            id,
            route.clone(),
            deadline,
            signal,
            self.shared.clone(),
        ))
    }

    /// Hand a leased connection back.
    ///
    /// A `reusable` connection that is still open is kept for reuse for `valid_for`, or for
    /// the configured default keepalive. Otherwise it is closed. After [Self::shutdown] the
    /// connection is always closed and no error is returned.
    ///
    /// Fails with [InvalidArgument](harbor_error::ErrorType::InvalidArgument) if the entry was
    /// not issued by this pool.
    pub fn release(
        &self,
        mut entry: PoolEntry<C>,
        reusable: bool,
        valid_for: Option<Duration>,
    ) -> Result<()> {
        if !entry.issued_by(&self.shared) {
            warn!("connection {} was not issued by this pool", entry.id());
            // dropping it hands it back to the pool it came from
            return Err(Error::explain(
                InvalidArgument,
                "connection entry was not issued by this pool",
            )
            .into_caller());
        }
        let Some((meta, connection)) = entry.take() else {
            return Err(Error::explain(InvalidArgument, "connection entry already released")
                .into_caller());
        };
        self.shared
            .check_in(meta, connection, reusable, valid_for)
    }

    /// Close a leased connection and free its slot
    pub fn discard(&self, entry: PoolEntry<C>) -> Result<()> {
        self.release(entry, false, None)
    }

    /// Shut the pool down.
    ///
    /// Idle connections are closed, pending requests fail with
    /// [Interrupted](harbor_error::ErrorType::Interrupted) and later leases with
    /// [PoolClosed](harbor_error::ErrorType::PoolClosed). Connections still leased are closed
    /// when they are released. Calling it more than once is harmless.
    pub fn shutdown(&self) {
        let closed = self.shared.with_state(|state, _, closing| {
            if state.shutdown {
                return 0;
            }
            state.shutdown = true;
            for slot in state.requests.values_mut() {
                slot.shut(closing);
            }
            for (_, pool) in state.routes.iter_mut() {
                closing.extend(pool.shutdown());
            }
            state.routes.clear();
            state.waiting.clear();
            state.idle.clear();
            state.leased = 0;
            closing.len()
        });
        info!("connection pool shut down, {closed} idle connections closed");
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.state.lock().shutdown
    }

    /// Close idle connections whose expiry has passed
    pub fn close_expired(&self) {
        self.shared.with_state(|state, connector, closing| {
            let now = Instant::now();
            let expired = state.remove_idle_where(|e| e.meta.is_expired(now));
            if !expired.is_empty() {
                debug!("close {} expired connections", expired.len());
                closing.extend(expired);
                state.dispatch(None, now, connector, closing);
            }
        })
    }

    /// Close connections that have been idle in the pool for at least `idle_for`
    pub fn close_idle(&self, idle_for: Duration) {
        self.shared.with_state(|state, connector, closing| {
            let now = Instant::now();
            let Some(cutoff) = now.checked_sub(idle_for) else {
                return;
            };
            let mut closed = 0;
            while let Some((id, node)) = state.idle.peek_oldest() {
                if node.released > cutoff {
                    break;
                }
                let (id, route) = (*id, node.route.clone());
                state.idle.remove(id);
                if let Some(entry) = state
                    .routes
                    .get_mut(&route)
                    .and_then(|p| p.remove_available(id))
                {
                    closing.push(entry.connection);
                    closed += 1;
                }
                state.prune(&route);
            }
            if closed > 0 {
                debug!("close {closed} connections idle for {idle_for:?}");
                state.dispatch(None, now, connector, closing);
            }
        })
    }

    /// Set the maximum number of connections across all routes.
    ///
    /// Idle connections beyond the new limit are closed, oldest first. Leased connections are
    /// never taken away from their holders.
    pub fn set_max_total(&self, max: usize) -> Result<()> {
        if max == 0 {
            return Err(Error::explain(InvalidArgument, "max_total must be positive").into_caller());
        }
        self.shared.with_state(|state, connector, closing| {
            state.limits.max_total = max;
            state.trim_total(closing);
            state.dispatch(None, Instant::now(), connector, closing);
        });
        Ok(())
    }

    /// Set the connection limit of routes without their own limit
    pub fn set_default_max_per_route(&self, max: usize) -> Result<()> {
        if max == 0 {
            return Err(
                Error::explain(InvalidArgument, "default_max_per_route must be positive")
                    .into_caller(),
            );
        }
        self.shared.with_state(|state, connector, closing| {
            state.limits.default_max_per_route = max;
            let routes: Vec<Route> = state
                .routes
                .keys()
                .filter(|r| !state.limits.max_per_route.contains_key(*r))
                .cloned()
                .collect();
            for route in routes.iter() {
                state.trim_route(route, max, closing);
            }
            state.dispatch(None, Instant::now(), connector, closing);
        });
        Ok(())
    }

    /// Set the connection limit of one route
    pub fn set_max_per_route(&self, route: &Route, max: usize) -> Result<()> {
        if max == 0 {
            return Err(Error::explain(
                InvalidArgument,
                format!("max for route {route} must be positive"),
            )
            .into_caller());
        }
        self.shared.with_state(|state, connector, closing| {
            state.limits.max_per_route.insert(route.clone(), max);
            state.trim_route(route, max, closing);
            state.dispatch(Some(route), Instant::now(), connector, closing);
        });
        Ok(())
    }

    pub fn max_total(&self) -> usize {
        self.shared.state.lock().limits.max_total
    }

    pub fn default_max_per_route(&self) -> usize {
        self.shared.state.lock().limits.default_max_per_route
    }

    pub fn max_per_route(&self, route: &Route) -> usize {
        self.shared.state.lock().limits.max_for(route)
    }

    /// The counters of the whole pool
    pub fn total_stats(&self) -> PoolStats {
        let state = self.shared.state.lock();
        PoolStats {
            leased: state.leased,
            pending: state.waiting.len(),
            available: state.idle.len(),
            max: state.limits.max_total,
        }
    }

    /// The counters of one route
    pub fn stats(&self, route: &Route) -> PoolStats {
        self.shared.state.lock().stats_for(route)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Host;
    use harbor_error::ErrorType;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        created: AtomicUsize,
        closed: AtomicUsize,
        refuse: AtomicBool,
    }

    struct Conn {
        open: Arc<AtomicBool>,
    }

    impl Connector for Counting {
        type Connection = Conn;

        fn create(&self, _route: &Route) -> Result<Conn> {
            if self.refuse.load(Ordering::SeqCst) {
                return Error::e_explain(ErrorType::ConnectRefused, "refused by test");
            }
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Conn {
                open: Arc::new(AtomicBool::new(true)),
            })
        }

        fn close(&self, connection: Conn) {
            connection.open.store(false, Ordering::SeqCst);
            self.closed.fetch_add(1, Ordering::SeqCst);
        }

        fn is_open(&self, connection: &Conn) -> bool {
            connection.open.load(Ordering::SeqCst)
        }
    }

    fn route(n: u16) -> Route {
        Route::direct(Host::http(&format!("www.test{n}.invalid"), 80), false)
    }

    type TestManager = ConnectionManager<Arc<Counting>>;

    fn manager(max_total: usize, max_per_route: usize) -> (TestManager, Arc<Counting>) {
        let counting = Arc::new(Counting::default());
        let conf = PoolConf {
            max_total,
            default_max_per_route: max_per_route,
            ..Default::default()
        };
        (
            ConnectionManager::with_conf(counting.clone(), &conf).unwrap(),
            counting,
        )
    }

    fn lease_now(
        mgr: &ConnectionManager<Arc<Counting>>,
        route: &Route,
    ) -> Result<PoolEntry<Arc<Counting>>> {
        mgr.lease(route, Some(Duration::ZERO))?.get()
    }

    #[test]
    fn test_reuse_without_recreation() {
        let (mgr, counting) = manager(2, 2);
        let r1 = route(1);
        let entry = lease_now(&mgr, &r1).unwrap();
        assert!(!entry.is_reused());
        let id = entry.id();
        mgr.release(entry, true, None).unwrap();
        assert_eq!(mgr.stats(&r1).available, 1);

        let entry = lease_now(&mgr, &r1).unwrap();
        assert!(entry.is_reused());
        assert_eq!(entry.id(), id);
        assert_eq!(counting.created.load(Ordering::SeqCst), 1);
        assert_eq!(mgr.total_stats().leased, 1);
        assert_eq!(mgr.total_stats().available, 0);
    }

    #[test]
    fn test_hot_connection_reused_first() {
        let (mgr, _) = manager(4, 4);
        let r1 = route(1);
        let e1 = lease_now(&mgr, &r1).unwrap();
        let e2 = lease_now(&mgr, &r1).unwrap();
        let id2 = e2.id();
        mgr.release(e1, true, None).unwrap();
        mgr.release(e2, true, None).unwrap();
        // the most recently released one
        assert_eq!(lease_now(&mgr, &r1).unwrap().id(), id2);
    }

    #[test]
    fn test_evict_idle_of_other_route() {
        let (mgr, counting) = manager(2, 2);
        let (r1, r2, r3) = (route(1), route(2), route(3));
        let e1 = lease_now(&mgr, &r1).unwrap();
        let e2 = lease_now(&mgr, &r2).unwrap();
        mgr.release(e1, true, None).unwrap();
        mgr.release(e2, true, None).unwrap();
        assert_eq!(mgr.total_stats().available, 2);

        // r1 was released first, it goes first
        let e3 = lease_now(&mgr, &r3).unwrap();
        assert_eq!(counting.closed.load(Ordering::SeqCst), 1);
        assert_eq!(mgr.stats(&r1).available, 0);
        assert_eq!(mgr.stats(&r2).available, 1);
        assert_eq!(mgr.stats(&r3).leased, 1);
        assert!(mgr.total_stats().allocated() <= 2);
        drop(e3);
    }

    #[test]
    fn test_no_eviction_when_route_at_limit() {
        let (mgr, counting) = manager(2, 1);
        let (r1, r2) = (route(1), route(2));
        let _e1 = lease_now(&mgr, &r1).unwrap();
        let e2 = lease_now(&mgr, &r2).unwrap();
        mgr.release(e2, true, None).unwrap();
        // r1 has its one connection, r2's idle connection must survive
        let err = lease_now(&mgr, &r1).unwrap_err();
        assert_eq!(err.etype(), &ErrorType::PoolTimeout);
        assert_eq!(counting.closed.load(Ordering::SeqCst), 0);
        assert_eq!(mgr.stats(&r2).available, 1);
    }

    #[test]
    fn test_invalid_idle_connection_dropped() {
        let (mgr, counting) = manager(2, 2);
        let r1 = route(1);
        let entry = lease_now(&mgr, &r1).unwrap();
        let open = entry.connection().open.clone();
        mgr.release(entry, true, None).unwrap();
        open.store(false, Ordering::SeqCst);

        let entry = lease_now(&mgr, &r1).unwrap();
        assert!(!entry.is_reused());
        assert_eq!(counting.created.load(Ordering::SeqCst), 2);
        assert_eq!(counting.closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_release_not_reusable() {
        let (mgr, counting) = manager(2, 2);
        let r1 = route(1);
        let entry = lease_now(&mgr, &r1).unwrap();
        mgr.release(entry, false, None).unwrap();
        assert_eq!(mgr.stats(&r1), PoolStats { max: 2, ..Default::default() });
        assert_eq!(counting.closed.load(Ordering::SeqCst), 1);

        let entry = lease_now(&mgr, &r1).unwrap();
        entry.connection().open.store(false, Ordering::SeqCst);
        mgr.release(entry, true, None).unwrap();
        assert_eq!(mgr.total_stats().available, 0);
    }

    #[test]
    fn test_foreign_entry() {
        let (mgr, _) = manager(2, 2);
        let (other, _) = manager(2, 2);
        let r1 = route(1);
        let _mine = lease_now(&mgr, &r1).unwrap();
        let foreign = lease_now(&other, &r1).unwrap();
        let before = mgr.total_stats();

        let err = mgr.release(foreign, true, None).unwrap_err();
        assert_eq!(err.etype(), &ErrorType::InvalidArgument);
        assert_eq!(err.esource(), &ErrorSource::Caller);
        assert_eq!(mgr.total_stats(), before);
        // the dropped foreign entry went back to its own pool
        assert_eq!(other.total_stats().leased, 0);
    }

    #[test]
    fn test_dropped_entry_frees_slot() {
        let (mgr, counting) = manager(1, 1);
        let r1 = route(1);
        let entry = lease_now(&mgr, &r1).unwrap();
        drop(entry);
        assert_eq!(mgr.total_stats().allocated(), 0);
        assert_eq!(counting.closed.load(Ordering::SeqCst), 1);
        lease_now(&mgr, &r1).unwrap();
    }

    #[test]
    fn test_create_failure_rolls_back() {
        let (mgr, counting) = manager(1, 1);
        let r1 = route(1);
        counting.refuse.store(true, Ordering::SeqCst);
        let err = lease_now(&mgr, &r1).unwrap_err();
        assert_eq!(err.etype(), &ErrorType::ConnectRefused);
        assert_eq!(mgr.total_stats().allocated(), 0);

        counting.refuse.store(false, Ordering::SeqCst);
        lease_now(&mgr, &r1).unwrap();
    }

    #[test]
    fn test_valid_for_expiry() {
        let (mgr, counting) = manager(2, 2);
        let r1 = route(1);
        let entry = lease_now(&mgr, &r1).unwrap();
        mgr.release(entry, true, Some(Duration::ZERO)).unwrap();
        let entry = lease_now(&mgr, &r1).unwrap();
        assert!(!entry.is_reused());
        assert_eq!(counting.closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_close_expired_and_idle() {
        let (mgr, counting) = manager(4, 4);
        let r1 = route(1);
        let e1 = lease_now(&mgr, &r1).unwrap();
        let e2 = lease_now(&mgr, &r1).unwrap();
        mgr.release(e1, true, Some(Duration::ZERO)).unwrap();
        mgr.release(e2, true, Some(Duration::from_secs(3600))).unwrap();

        mgr.close_expired();
        assert_eq!(mgr.stats(&r1).available, 1);
        assert_eq!(counting.closed.load(Ordering::SeqCst), 1);

        mgr.close_idle(Duration::from_secs(3600));
        assert_eq!(mgr.stats(&r1).available, 1);
        mgr.close_idle(Duration::ZERO);
        assert_eq!(mgr.stats(&r1).available, 0);
        assert_eq!(counting.closed.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_shrink_limits_closes_idle() {
        let (mgr, counting) = manager(4, 4);
        let (r1, r2) = (route(1), route(2));
        let entries: Vec<_> = (0..3).map(|_| lease_now(&mgr, &r1).unwrap()).collect();
        let e4 = lease_now(&mgr, &r2).unwrap();
        for e in entries {
            mgr.release(e, true, None).unwrap();
        }
        mgr.set_max_per_route(&r1, 2).unwrap();
        assert_eq!(mgr.stats(&r1).available, 2);
        assert_eq!(mgr.stats(&r1).max, 2);

        mgr.set_max_total(2).unwrap();
        // r2's connection is leased and stays
        assert_eq!(mgr.stats(&r1).available, 1);
        assert_eq!(mgr.stats(&r2).leased, 1);
        assert_eq!(counting.closed.load(Ordering::SeqCst), 2);
        drop(e4);
    }

    #[test]
    fn test_release_over_lowered_route_limit() {
        let (mgr, counting) = manager(4, 2);
        let r1 = route(1);
        let e1 = lease_now(&mgr, &r1).unwrap();
        let e2 = lease_now(&mgr, &r1).unwrap();
        mgr.set_max_per_route(&r1, 1).unwrap();

        mgr.release(e1, true, None).unwrap();
        // e2 still holds the only slot r1 has now
        assert_eq!(mgr.stats(&r1).available, 0);
        assert_eq!(counting.closed.load(Ordering::SeqCst), 1);
        mgr.release(e2, true, None).unwrap();
        let stats = mgr.stats(&r1);
        assert_eq!(stats.available, 1);
        assert!(stats.allocated() <= stats.max);
    }

    #[test]
    fn test_release_over_lowered_total_limit() {
        let (mgr, counting) = manager(2, 2);
        let (r1, r2) = (route(1), route(2));
        let e1 = lease_now(&mgr, &r1).unwrap();
        let e2 = lease_now(&mgr, &r2).unwrap();
        mgr.set_max_total(1).unwrap();

        mgr.release(e1, true, None).unwrap();
        assert_eq!(mgr.total_stats().available, 0);
        assert_eq!(counting.closed.load(Ordering::SeqCst), 1);
        mgr.release(e2, true, None).unwrap();
        let stats = mgr.total_stats();
        assert_eq!(stats.available, 1);
        assert!(stats.allocated() <= stats.max);
    }

    #[test]
    fn test_zero_conf_rejected() {
        let conf = PoolConf {
            max_total: 0,
            ..Default::default()
        };
        let err = ConnectionManager::with_conf(Arc::new(Counting::default()), &conf)
            .err()
            .unwrap();
        assert_eq!(err.etype(), &ErrorType::InvalidArgument);

        let conf = PoolConf {
            default_max_per_route: 0,
            ..Default::default()
        };
        assert!(ConnectionManager::with_conf(Arc::new(Counting::default()), &conf).is_err());
    }

    #[test]
    fn test_zero_limits_rejected() {
        let (mgr, _) = manager(2, 2);
        assert_eq!(
            mgr.set_max_total(0).unwrap_err().etype(),
            &ErrorType::InvalidArgument
        );
        assert_eq!(
            mgr.set_default_max_per_route(0).unwrap_err().etype(),
            &ErrorType::InvalidArgument
        );
        assert_eq!(
            mgr.set_max_per_route(&route(1), 0).unwrap_err().etype(),
            &ErrorType::InvalidArgument
        );
        assert_eq!(mgr.max_total(), 2);
    }

    #[test]
    fn test_limits_getters() {
        let (mgr, _) = manager(100, 1);
        mgr.set_max_per_route(&route(2), 2).unwrap();
        mgr.set_default_max_per_route(3).unwrap();
        assert_eq!(mgr.default_max_per_route(), 3);
        assert_eq!(mgr.max_per_route(&route(1)), 3);
        assert_eq!(mgr.max_per_route(&route(2)), 2);
        assert_eq!(mgr.total_stats().max, 100);
    }
}
