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


//! Pool configurations
//!
//! The pool configuration defines the capacity limits, per route and in total, and how long
//! idle connections stay reusable.

use harbor_error::{Error, ErrorType::*, OrErr, Result};
use log::{debug, trace};
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

use crate::Route;

/// A connection limit that overrides [PoolConf::default_max_per_route] for one route
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteLimit {
    pub route: Route,
    pub max: usize,
}

/// The configuration file
///
/// Pool configuration files are YAML files. Unknown keys are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConf {
    /// Version
    pub version: usize,
    /// The maximum number of connections across all routes, leased and idle combined.
    pub max_total: usize,
    /// The maximum number of connections of a route without its own limit.
    pub default_max_per_route: usize,
    /// Routes with their own limit.
    pub per_route: Vec<RouteLimit>,
    /// How long a connection may live after it is created, regardless of how it is used.
    /// Unlimited when not set.
    pub time_to_live_ms: Option<u64>,
    /// How long a released connection stays reusable when the release does not say.
    /// Unlimited when not set.
    pub default_keepalive_ms: Option<u64>,
    /// Only ask the connector whether an idle connection is stale after it has been idle for
    /// this long. When not set every idle connection is checked before reuse.
    pub validate_after_inactivity_ms: Option<u64>,
}

impl Default for PoolConf {
    fn default() -> Self {
        PoolConf {
            version: 0,
            max_total: 20,
            default_max_per_route: 2,
            per_route: vec![],
            time_to_live_ms: None,
            default_keepalive_ms: None,
            validate_after_inactivity_ms: None,
        }
    }
}

impl PoolConf {
    pub fn load_from_yaml<P>(path: P) -> Result<Self>
    where
        P: AsRef<std::path::Path> + std::fmt::Display,
    {
        let conf_str = fs::read_to_string(&path).or_err_with(ReadError, || {
            format!("Unable to read conf file from {path}")
        })?;
        debug!("Conf file read from {path}");
        Self::from_yaml(&conf_str)
    }

    pub fn from_yaml(conf_str: &str) -> Result<Self> {
        trace!("Read conf file: {conf_str}");
        let conf: PoolConf = serde_yaml::from_str(conf_str).or_err_with(ReadError, || {
            format!("Unable to parse yaml conf {conf_str}")
        })?;

        trace!("Loaded conf: {conf:?}");
        conf.validate()
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).or_err(InternalError, "Unable to serialize conf")
    }

    /// Reject limits the pool cannot work with
    pub fn validate(self) -> Result<Self> {
        if self.max_total == 0 {
            return Error::e_explain(InvalidArgument, "max_total must be positive");
        }
        if self.default_max_per_route == 0 {
            return Error::e_explain(InvalidArgument, "default_max_per_route must be positive");
        }
        if let Some(limit) = self.per_route.iter().find(|l| l.max == 0) {
            return Error::e_explain(
                InvalidArgument,
                format!("max for route {} must be positive", limit.route),
            );
        }
        Ok(self)
    }

    pub fn time_to_live(&self) -> Option<Duration> {
        self.time_to_live_ms.map(Duration::from_millis)
    }

    pub fn default_keepalive(&self) -> Option<Duration> {
        self.default_keepalive_ms.map(Duration::from_millis)
    }

    pub fn validate_after_inactivity(&self) -> Option<Duration> {
        self.validate_after_inactivity_ms.map(Duration::from_millis)
    }
}
