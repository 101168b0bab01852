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

use harbor_error::Result;
use std::sync::Arc;
use std::time::Instant;

use crate::Route;

/// The factory the pool uses to open, probe and close connections.
///
/// The pool never performs I/O itself. [Connector::create] and [Connector::close] are always
/// called outside of the pool lock; [Connector::is_open] and [Connector::is_stale] are called
/// while it is held and should return promptly.
pub trait Connector: Send + Sync + 'static {
    /// The connection handle. The pool treats it as opaque.
    type Connection: Send + 'static;

    /// Establish a new connection for the route.
    fn create(&self, route: &Route) -> Result<Self::Connection>;

    /// Shut the connection down and release its resources.
    fn close(&self, connection: Self::Connection);

    /// Whether the connection is still usable at all.
    fn is_open(&self, connection: &Self::Connection) -> bool;

    /// Whether an idle connection should be considered broken before being handed out again.
    ///
    /// The default assumes that an open connection which has not expired is fresh.
    fn is_stale(&self, _connection: &Self::Connection, _now: Instant) -> bool {
        false
    }
}

/// A shared connector, so the caller can keep a handle to it next to the pool.
impl<C: Connector> Connector for Arc<C> {
    type Connection = C::Connection;

    fn create(&self, route: &Route) -> Result<Self::Connection> {
        C::create(self, route)
    }

    fn close(&self, connection: Self::Connection) {
        C::close(self, connection)
    }

    fn is_open(&self, connection: &Self::Connection) -> bool {
        C::is_open(self, connection)
    }

    fn is_stale(&self, connection: &Self::Connection, now: Instant) -> bool {
        C::is_stale(self, connection, now)
    }
}
