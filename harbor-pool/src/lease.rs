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

//! Lease requests: the handle a caller waits on for a connection

use harbor_error::{Error, ErrorType, ErrorType::*, Result};
use log::{debug, trace, warn};
use parking_lot::Condvar;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

use crate::entry::{EntryMeta, IdleEntry};
use crate::manager::{pool_error, PoolState, Shared};
use crate::{Connector, PoolEntry, Route};

/// Orders every lease request of a pool by arrival
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct RequestId(pub u64);

/// Wakes whoever waits on a request, either a thread or a task
#[derive(Default)]
pub(crate) struct Signal {
    // always paired with the pool state lock
    cond: Condvar,
    notify: Notify,
}

impl Signal {
    pub fn wake(&self) {
        self.cond.notify_all();
        // stores a permit if the task is not parked yet
        self.notify.notify_one();
    }
}

/// What a request was granted
pub(crate) enum Grant<T> {
    /// An available connection, validated already
    Reuse(IdleEntry<T>),
    /// A reserved slot, the connection is created by the caller outside of the lock
    Create(EntryMeta),
}

pub(crate) enum SlotState<T> {
    Pending,
    Granted(Grant<T>),
    Failed(ErrorType, &'static str),
}

/// The result cell of a request. It is only ever written under the pool state lock and
/// moves out of `Pending` at most once.
pub(crate) struct LeaseSlot<T> {
    pub route: Route,
    pub signal: Arc<Signal>,
    pub state: SlotState<T>,
}

impl<T> LeaseSlot<T> {
    pub fn new(route: Route) -> Self {
        LeaseSlot {
            route,
            signal: Arc::new(Signal::default()),
            state: SlotState::Pending,
        }
    }

    pub fn grant(&mut self, grant: Grant<T>) {
        if matches!(self.state, SlotState::Pending) {
            self.state = SlotState::Granted(grant);
            self.signal.wake();
        }
    }

    fn fail(&mut self, etype: ErrorType, context: &'static str) -> bool {
        if !matches!(self.state, SlotState::Pending) {
            return false;
        }
        self.state = SlotState::Failed(etype, context);
        self.signal.wake();
        true
    }

    /// Fail the request because the pool shuts down, revoking an unclaimed grant
    pub fn shut(&mut self, closing: &mut Vec<T>) {
        match std::mem::replace(&mut self.state, SlotState::Pending) {
            SlotState::Pending => {
                self.fail(Interrupted, "connection pool shut down while waiting");
            }
            SlotState::Granted(grant) => {
                if let Grant::Reuse(idle) = grant {
                    closing.push(idle.connection);
                }
                self.state = SlotState::Failed(PoolClosed, "connection pool is shut down");
                self.signal.wake();
            }
            failed => self.state = failed,
        }
    }
}

impl<T> PoolState<T> {
    /// Take the outcome of a request, `None` while it is still pending
    pub(crate) fn claim(&mut self, id: RequestId) -> Option<Result<Grant<T>>> {
        let Some(slot) = self.requests.get(&id) else {
            return Some(Err(pool_error(
                InternalError,
                "lease request already completed",
            )));
        };
        if matches!(slot.state, SlotState::Pending) {
            return None;
        }
        let slot = self.requests.remove(&id)?;
        match slot.state {
            SlotState::Granted(grant) => Some(Ok(grant)),
            SlotState::Failed(etype, context) => {
                Some(Err(pool_error(etype, context).more_context(format!(
                    "lease request for {}",
                    slot.route
                ))))
            }
            SlotState::Pending => None,
        }
    }

    /// Give up on a request whose deadline passed. The caller checked it is still pending.
    pub(crate) fn time_out(&mut self, id: RequestId) -> Result<Grant<T>> {
        self.unqueue(id);
        let route = self.requests.remove(&id).map(|slot| slot.route);
        let context = match route {
            Some(route) => format!("timeout waiting for a connection to {route}"),
            None => "timeout waiting for a connection".to_string(),
        };
        Err(pool_error(PoolTimeout, context))
    }

    /// Cancel a pending request, returns false if it was already completed
    pub(crate) fn cancel(&mut self, id: RequestId) -> bool {
        let cancelled = self
            .requests
            .get_mut(&id)
            .map_or(false, |slot| slot.fail(Interrupted, "lease request cancelled"));
        if cancelled {
            debug!("lease request {id:?} cancelled");
            self.unqueue(id);
        }
        cancelled
    }

    /// Forget a request nobody waits on anymore, returning what it was granted to the pool
    pub(crate) fn abandon<C>(
        &mut self,
        id: RequestId,
        now: Instant,
        connector: &C,
        closing: &mut Vec<T>,
    ) where
        C: Connector<Connection = T>,
    {
        let Some(slot) = self.requests.remove(&id) else {
            return;
        };
        match slot.state {
            SlotState::Pending => {
                trace!("drop pending lease request {id:?}");
                self.unqueue(id);
            }
            SlotState::Granted(Grant::Reuse(idle)) => {
                trace!("lease request {id:?} dropped, connection {} goes back", idle.meta.id);
                let route = idle.meta.route.clone();
                self.restore_idle(idle, closing);
                self.dispatch(Some(&route), now, connector, closing);
            }
            SlotState::Granted(Grant::Create(meta)) => {
                trace!("lease request {id:?} dropped, freeing reserved {}", meta.id);
                self.cancel_reservation(&meta, now, connector, closing);
            }
            SlotState::Failed(..) => {}
        }
    }
}

/// A pending or completed request for a connection, returned by
/// [ConnectionManager::lease](crate::ConnectionManager::lease).
///
/// Dropping the request without taking its connection cancels it. A connection granted but not
/// taken goes back to the pool.
pub struct LeaseRequest<C: Connector> {
    id: RequestId,
    route: Route,
    deadline: Option<Instant>,
    signal: Arc<Signal>,
    shared: Arc<Shared<C>>,
}

impl<C: Connector> LeaseRequest<C> {
    pub(crate) fn new(
        id: RequestId,
        route: Route,
        deadline: Option<Instant>,
        signal: Arc<Signal>,
        shared: Arc<Shared<C>>,
    ) -> Self {
        LeaseRequest {
            id,
            route,
            deadline,
            signal,
            shared,
        }
    }

    pub fn route(&self) -> &Route {
        &self.route
    }

    /// The point in time after which waiting fails, if the lease had a timeout
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Whether the request got an outcome already, so that [Self::get] returns right away
    pub fn is_done(&self) -> bool {
        let state = self.shared.state.lock();
        state
            .requests
            .get(&self.id)
            .map_or(true, |slot| !matches!(slot.state, SlotState::Pending))
    }

    /// Block the current thread until the connection is granted or the lease timeout passes.
    ///
    /// The error is
    /// - [PoolTimeout](ErrorType::PoolTimeout) when the deadline passed first
    /// - [Interrupted](ErrorType::Interrupted) when the request was cancelled or the pool was
    ///   shut down while waiting
    /// - [PoolClosed](ErrorType::PoolClosed) when the pool was shut down after the grant
    /// - the connector's error when a new connection could not be created
    pub fn get(&mut self) -> Result<PoolEntry<C>> {
        self.wait(self.deadline)
    }

    /// Like [Self::get], but wait at most `timeout` from now
    pub fn get_timeout(&mut self, timeout: Duration) -> Result<PoolEntry<C>> {
        let deadline = Instant::now().checked_add(timeout);
        let deadline = match (deadline, self.deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.wait(deadline)
    }

    fn wait(&mut self, deadline: Option<Instant>) -> Result<PoolEntry<C>> {
        let id = self.id;
        let grant = {
            let mut state = self.shared.state.lock();
            loop {
                if let Some(res) = state.claim(id) {
                    break res;
                }
                match deadline {
                    Some(deadline) => {
                        if self.signal.cond.wait_until(&mut state, deadline).timed_out() {
                            // a grant may have landed together with the timeout
                            break state.claim(id).unwrap_or_else(|| state.time_out(id));
                        }
                    }
                    None => self.signal.cond.wait(&mut state),
                }
            }
        };
        finish(&self.shared, grant?)
    }

    /// Wait for the connection without blocking the runtime.
    ///
    /// New connections are created on the blocking thread pool. If this future is dropped
    /// while a connection is being created, the connection is discarded once it is ready.
    pub async fn get_async(&mut self) -> Result<PoolEntry<C>> {
        let id = self.id;
        let grant = loop {
            let notified = self.signal.notify.notified();
            let claimed = self.shared.state.lock().claim(id);
            if let Some(res) = claimed {
                break res;
            }
            match self.deadline {
                Some(deadline) => {
                    let deadline = tokio::time::Instant::from_std(deadline);
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        let mut state = self.shared.state.lock();
                        break state.claim(id).unwrap_or_else(|| state.time_out(id));
                    }
                }
                None => notified.await,
            }
        };
        match grant? {
            Grant::Create(meta) => {
                let shared = self.shared.clone();
                tokio::task::spawn_blocking(move || finish(&shared, Grant::Create(meta)))
                    .await
                    .map_err(|e| {
                        Error::because(InternalError, "connection creation task failed", e)
                    })?
            }
            reuse => finish(&self.shared, reuse),
        }
    }

    /// Cancel the request if it is still pending.
    ///
    /// Returns false if it already had an outcome, in which case a granted connection still
    /// has to be taken and released.
    pub fn cancel(&self) -> bool {
        self.shared.state.lock().cancel(self.id)
    }

    /// A handle to cancel this request from another thread
    pub fn canceller(&self) -> LeaseCanceller<C> {
        LeaseCanceller {
            id: self.id,
            shared: Arc::downgrade(&self.shared),
        }
    }
}

// turn a grant into a leased entry, creating the connection if needed
fn finish<C: Connector>(
    shared: &Arc<Shared<C>>,
    grant: Grant<C::Connection>,
) -> Result<PoolEntry<C>> {
    let meta = match grant {
        Grant::Reuse(idle) => {
            return Ok(PoolEntry::new(idle.meta, idle.connection, true, shared));
        }
        Grant::Create(meta) => meta,
    };
    match shared.connector.create(&meta.route) {
        Ok(connection) => {
            if shared.state.lock().shutdown {
                debug!("pool shut down while connecting to {}", meta.route);
                shared.connector.close(connection);
                return Err(pool_error(PoolClosed, "connection pool is shut down"));
            }
            debug!("new connection {} to {}", meta.id, meta.route);
            Ok(PoolEntry::new(meta, connection, false, shared))
        }
        Err(e) => {
            warn!("fail to connect to {}: {e}", meta.route);
            let context = format!("fail to create connection to {}", meta.route);
            shared.with_state(|state, connector, closing| {
                state.cancel_reservation(&meta, Instant::now(), connector, closing)
            });
            Err(e.into_up().more_context(context))
        }
    }
}

impl<C: Connector> fmt::Debug for LeaseRequest<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaseRequest")
            .field("id", &self.id)
            .field("route", &self.route)
            .field("deadline", &self.deadline)
            .finish()
    }
}

impl<C: Connector> Drop for LeaseRequest<C> {
    fn drop(&mut self) {
        let id = self.id;
        self.shared.with_state(|state, connector, closing| {
            state.abandon(id, Instant::now(), connector, closing)
        });
    }
}

/// Cancels a [LeaseRequest] from anywhere, without holding on to the pool
pub struct LeaseCanceller<C: Connector> {
    id: RequestId,
    shared: Weak<Shared<C>>,
}

impl<C: Connector> Clone for LeaseCanceller<C> {
    fn clone(&self) -> Self {
        LeaseCanceller {
            id: self.id,
            shared: self.shared.clone(),
        }
    }
}

impl<C: Connector> LeaseCanceller<C> {
    /// See [LeaseRequest::cancel]
    pub fn cancel(&self) -> bool {
        match self.shared.upgrade() {
            Some(shared) => shared.state.lock().cancel(self.id),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ConnectionManager, Host};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Plain {
        closed: AtomicUsize,
    }

    impl Connector for Plain {
        type Connection = u32;

        fn create(&self, _route: &Route) -> Result<u32> {
            Ok(1)
        }

        fn close(&self, _connection: u32) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }

        fn is_open(&self, _connection: &u32) -> bool {
            true
        }
    }

    fn setup(max: usize) -> (ConnectionManager<Arc<Plain>>, Route) {
        let mgr = ConnectionManager::new(Arc::new(Plain::default()));
        mgr.set_max_total(max).unwrap();
        mgr.set_default_max_per_route(max).unwrap();
        (mgr, Route::direct(Host::http("www.test.invalid", 80), false))
    }

    #[test]
    fn test_claim_once() {
        let (mgr, route) = setup(1);
        let mut req = mgr.lease(&route, None).unwrap();
        assert!(req.is_done());
        let entry = req.get().unwrap();
        let err = req.get().unwrap_err();
        assert_eq!(err.etype(), &ErrorType::InternalError);
        // completed, nothing to cancel
        assert!(!req.cancel());
        mgr.release(entry, true, None).unwrap();
    }

    #[test]
    fn test_cancel_pending() {
        let (mgr, route) = setup(1);
        let entry = mgr.lease(&route, None).unwrap().get().unwrap();
        let mut req = mgr.lease(&route, None).unwrap();
        assert!(!req.is_done());
        assert_eq!(mgr.stats(&route).pending, 1);

        assert!(req.canceller().cancel());
        assert!(!req.cancel());
        assert_eq!(mgr.stats(&route).pending, 0);

        // the freed connection does not go to the cancelled request
        mgr.release(entry, true, None).unwrap();
        let err = req.get().unwrap_err();
        assert_eq!(err.etype(), &ErrorType::Interrupted);
        assert_eq!(mgr.stats(&route).available, 1);
    }

    #[test]
    fn test_dropped_grant_goes_back() {
        let (mgr, route) = setup(1);
        let entry = mgr.lease(&route, None).unwrap().get().unwrap();
        let req = mgr.lease(&route, None).unwrap();
        mgr.release(entry, true, None).unwrap();
        // granted to the queued request, which gives it back
        assert_eq!(mgr.stats(&route).leased, 1);
        drop(req);
        assert_eq!(mgr.stats(&route).leased, 0);
        assert_eq!(mgr.stats(&route).available, 1);
    }

    #[test]
    fn test_dropped_reservation_frees_slot() {
        let (mgr, route) = setup(1);
        let req = mgr.lease(&route, None).unwrap();
        assert_eq!(mgr.total_stats().leased, 1);
        drop(req);
        assert_eq!(mgr.total_stats().allocated(), 0);
    }

    #[test]
    fn test_get_timeout_shorter_than_lease() {
        let (mgr, route) = setup(1);
        let _entry = mgr.lease(&route, None).unwrap().get().unwrap();
        let mut req = mgr.lease(&route, None).unwrap();
        let err = req.get_timeout(Duration::from_millis(10)).unwrap_err();
        assert_eq!(err.etype(), &ErrorType::PoolTimeout);
        assert_eq!(mgr.stats(&route).pending, 0);
    }

    #[test]
    fn test_canceller_outlives_pool() {
        let (mgr, route) = setup(1);
        let _entry = mgr.lease(&route, None).unwrap().get().unwrap();
        let req = mgr.lease(&route, None).unwrap();
        let canceller = req.canceller();
        assert!(canceller.clone().cancel());
        drop(req);
        drop(mgr);
        assert!(!canceller.cancel());
    }

    #[tokio::test]
    async fn test_get_async_woken_by_release() {
        let (mgr, route) = setup(1);
        let entry = mgr.lease(&route, None).unwrap().get_async().await.unwrap();
        let mut req = mgr.lease(&route, Some(Duration::from_secs(5))).unwrap();
        let mgr2 = mgr.clone();
        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            mgr2.release(entry, true, None).unwrap();
        });
        let entry = req.get_async().await.unwrap();
        assert!(entry.is_reused());
        release.await.unwrap();
    }

    #[tokio::test]
    async fn test_get_async_timeout() {
        let (mgr, route) = setup(1);
        let _entry = mgr.lease(&route, None).unwrap().get_async().await.unwrap();
        let mut req = mgr.lease(&route, Some(Duration::from_millis(10))).unwrap();
        let err = req.get_async().await.unwrap_err();
        assert_eq!(err.etype(), &ErrorType::PoolTimeout);
    }
}
