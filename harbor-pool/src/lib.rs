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

//! Route-keyed connection pooling
//!
//! [ConnectionManager] keeps persistent connections grouped by [Route] and hands them out
//! under a total limit and a limit per route. Callers get a [LeaseRequest] right away and wait
//! on it, with a timeout, for a [PoolEntry]. Idle connections of one route are closed to make
//! room for another route once the total limit is reached.
//!
//! The pool never does I/O while holding its lock. Connections are created and closed by a
//! [Connector] supplied by the user.
//!
//! ```ignore
//! let pool = ConnectionManager::new(MyConnector::default());
//! let route = Route::direct(Host::http("example.invalid", 80), false);
//! let entry = pool.lease(&route, Some(Duration::from_secs(1)))?.get()?;
//! // use entry.connection()
//! pool.release(entry, true, Some(Duration::from_secs(60)))?;
//! ```

#![warn(clippy::all)]
#![allow(clippy::new_without_default)]
#![allow(clippy::type_complexity)]

mod conf;
mod connector;
mod entry;
mod idle;
mod lease;
mod manager;
mod route;
mod route_pool;
mod stats;

pub use conf::{PoolConf, RouteLimit};
pub use connector::Connector;
pub use entry::{EntryId, PoolEntry};
pub use lease::{LeaseCanceller, LeaseRequest};
pub use manager::ConnectionManager;
pub use route::{Host, Route, Scheme};
pub use stats::PoolStats;

pub use harbor_error;
