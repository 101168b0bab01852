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

//! Routes: the key connections are pooled under

use serde::{Deserialize, Serialize};
use std::fmt;

/// The scheme used to talk to a [Host]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    #[default]
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

#[derive(Deserialize)]
struct RawHost {
    hostname: String,
    port: Option<u16>,
    #[serde(default)]
    scheme: Scheme,
}

impl From<RawHost> for Host {
    fn from(raw: RawHost) -> Self {
        Host::new(&raw.hostname, raw.port, raw.scheme)
    }
}

/// A single hop: a target server or a proxy.
///
/// Host names are compared case-insensitively.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "RawHost")]
pub struct Host {
    hostname: String,
    port: u16,
    scheme: Scheme,
}

impl Host {
    /// Create a new [Host]. The scheme's default port is used when `port` is `None`.
    pub fn new(hostname: &str, port: Option<u16>, scheme: Scheme) -> Self {
        Host {
            hostname: hostname.to_ascii_lowercase(),
            port: port.unwrap_or_else(|| scheme.default_port()),
            scheme,
        }
    }

    /// Shorthand for a plain `http` host
    pub fn http(hostname: &str, port: u16) -> Self {
        Self::new(hostname, Some(port), Scheme::Http)
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme.as_str(), self.hostname, self.port)
    }
}

/// [Route] identifies where a connection goes: the target, the proxies in front of it and
/// whether the transport is secured.
///
/// Connections are only reused between requests of equal routes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Route {
    target: Host,
    #[serde(default)]
    proxies: Vec<Host>,
    #[serde(default)]
    secure: bool,
}

impl Route {
    /// A route straight to `target`
    pub fn direct(target: Host, secure: bool) -> Self {
        Route {
            target,
            proxies: vec![],
            secure,
        }
    }

    /// A route to `target` through a single proxy
    pub fn via_proxy(target: Host, proxy: Host, secure: bool) -> Self {
        Self::with_proxies(target, vec![proxy], secure)
    }

    /// A route to `target` through `proxies`, first hop first
    pub fn with_proxies(target: Host, proxies: Vec<Host>, secure: bool) -> Self {
        Route {
            target,
            proxies,
            secure,
        }
    }

    pub fn target(&self) -> &Host {
        &self.target
    }

    /// The first proxy, if any
    pub fn proxy(&self) -> Option<&Host> {
        self.proxies.first()
    }

    pub fn proxies(&self) -> &[Host] {
        &self.proxies
    }

    /// Number of hops including the target
    pub fn hop_count(&self) -> usize {
        self.proxies.len() + 1
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.secure {
            write!(f, "{{s}}->")?;
        }
        for proxy in self.proxies.iter() {
            write!(f, "{}->", proxy)?;
        }
        write!(f, "{}", self.target)
    }
}
