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

#![allow(dead_code)]

use harbor_pool::harbor_error::{Error, ErrorType, Result};
use harbor_pool::{ConnectionManager, Connector, Host, PoolConf, Route};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

pub fn init_log() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A connection that only knows whether it is open
pub struct MockConnection {
    pub serial: usize,
    pub route: Route,
    open: Arc<AtomicBool>,
}

impl MockConnection {
    /// Simulate the peer closing the connection
    pub fn shut(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

/// Counts what the pool asks it to do
#[derive(Default)]
pub struct MockConnector {
    pub created: AtomicUsize,
    pub closed: AtomicUsize,
    pub stale: AtomicBool,
    /// attempts to create, including the ones still connecting
    pub attempts: AtomicUsize,
    /// how long a create takes
    pub delay_ms: AtomicU64,
    refused: Mutex<HashSet<Route>>,
}

impl MockConnector {
    pub fn refuse(&self, route: &Route) {
        self.refused.lock().insert(route.clone());
    }

    pub fn accept(&self, route: &Route) {
        self.refused.lock().remove(route);
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Connector for MockConnector {
    type Connection = MockConnection;

    fn create(&self, route: &Route) -> Result<MockConnection> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            thread::sleep(Duration::from_millis(delay));
        }
        if self.refused.lock().contains(route) {
            return Error::e_explain(ErrorType::ConnectRefused, format!("{route} refused"));
        }
        let serial = self.created.fetch_add(1, Ordering::SeqCst);
        Ok(MockConnection {
            serial,
            route: route.clone(),
            open: Arc::new(AtomicBool::new(true)),
        })
    }

    fn close(&self, connection: MockConnection) {
        connection.shut();
        self.closed.fetch_add(1, Ordering::SeqCst);
    }

    fn is_open(&self, connection: &MockConnection) -> bool {
        connection.is_open()
    }

    fn is_stale(&self, _connection: &MockConnection, _now: Instant) -> bool {
        self.stale.load(Ordering::SeqCst)
    }
}

pub type TestManager = ConnectionManager<Arc<MockConnector>>;

pub fn manager(max_total: usize, max_per_route: usize) -> (TestManager, Arc<MockConnector>) {
    init_log();
    let connector = Arc::new(MockConnector::default());
    let conf = PoolConf {
        max_total,
        default_max_per_route: max_per_route,
        ..Default::default()
    };
    (
        ConnectionManager::with_conf(connector.clone(), &conf).unwrap(),
        connector,
    )
}

pub fn route(n: u16) -> Route {
    Route::direct(Host::http(&format!("www.test{n}.invalid"), 80), false)
}
