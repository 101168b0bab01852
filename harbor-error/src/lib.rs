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

#![warn(clippy::all)]
//! The error type shared by the harbor crates.
//!
//! Every fallible pool operation returns a [BError]. The [ErrorType] tells the caller what
//! went wrong (a lease timed out, the pool was closed, ...) while the optional cause keeps
//! the underlying error, e.g. the I/O error of a failed connection attempt.

pub use std::error::Error as ErrorTrait;
use std::borrow::Cow;
use std::fmt;
use std::result::Result as StdResult;

/// The boxed [Error], the desired way to pass [Error]
pub type BError = Box<Error>;
/// Syntax sugar for `std::Result<T, BError>`
pub type Result<T, E = BError> = StdResult<T, E>;

/// Context attached to an [Error]. Static strings are kept without allocation.
pub type ErrorContext = Cow<'static, str>;

/// The struct that represents an error
#[derive(Debug)]
pub struct Error {
    /// the type of error
    pub etype: ErrorType,
    /// where the error comes from: the remote server, the caller or the pool itself
    pub esource: ErrorSource,
    /// chain to the cause of this error
    pub cause: Option<Box<dyn ErrorTrait + Send + Sync>>,
    /// an arbitrary string that explains the context when the error happens
    pub context: Option<ErrorContext>,
}

/// The source of the error
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ErrorSource {
    /// The remote server, or the connector talking to it
    Upstream,
    /// The code calling into the pool, e.g. releasing an entry the pool never issued
    Caller,
    /// The pool itself
    Internal,
    /// Error source unknown or to be set
    Unset,
}

impl ErrorSource {
    /// for displaying the error source
    pub fn as_str(&self) -> &str {
        match self {
            Self::Upstream => "Upstream",
            Self::Caller => "Caller",
            Self::Internal => "Internal",
            Self::Unset => "",
        }
    }
}

/// Predefined type of errors
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum ErrorType {
    // lease errors
    /// No connection was granted before the wait deadline
    PoolTimeout,
    /// The lease was cancelled, or the pool shut down while it was pending
    Interrupted,
    /// The pool is shut down
    PoolClosed,
    /// An argument the pool cannot accept, e.g. an entry it did not issue
    InvalidArgument,
    // connection factory errors
    ConnectTimedout,
    ConnectRefused,
    ConnectError, // catch all
    ConnectionClosed,
    // configuration
    ReadError,
    // other errors
    InternalError,
    /// Custom error with static string.
    /// this field is to allow connectors to extend the types of errors. If runtime generated
    /// string is needed, it is more likely to be treated as "context" rather than "type".
    Custom(&'static str),
}

impl ErrorType {
    /// create a new type of error. Users should try to make `name` unique.
    pub const fn new(name: &'static str) -> Self {
        ErrorType::Custom(name)
    }

    /// for displaying the error type
    pub fn as_str(&self) -> &str {
        match self {
            ErrorType::PoolTimeout => "PoolTimeout",
            ErrorType::Interrupted => "Interrupted",
            ErrorType::PoolClosed => "PoolClosed",
            ErrorType::InvalidArgument => "InvalidArgument",
            ErrorType::ConnectTimedout => "ConnectTimedout",
            ErrorType::ConnectRefused => "ConnectRefused",
            ErrorType::ConnectError => "ConnectError",
            ErrorType::ConnectionClosed => "ConnectionClosed",
            ErrorType::ReadError => "ReadError",
            ErrorType::InternalError => "InternalError",
            ErrorType::Custom(s) => s,
        }
    }
}

impl Error {
    /// Simply create the error. See other functions that provide less verbose interfaces.
    #[inline]
    pub fn create(
        etype: ErrorType,
        esource: ErrorSource,
        context: Option<ErrorContext>,
        cause: Option<Box<dyn ErrorTrait + Send + Sync>>,
    ) -> BError {
        Box::new(Error {
            etype,
            esource,
            cause,
            context,
        })
    }

    /// Create an error with the given type
    #[inline]
    pub fn new(e: ErrorType) -> BError {
        Self::create(e, ErrorSource::Unset, None, None)
    }

    /// Create an error with the given type, a context string and the causing error.
    /// ```
    /// use harbor_error::{Error, ErrorType, Result};
    ///
    /// fn dial() -> std::io::Result<()> {
    ///     // ...
    ///     Ok(())
    /// }
    /// fn connect() -> Result<()> {
    ///     dial().map_err(|e| Error::because(ErrorType::ConnectError, "dial failed", e))
    /// }
    /// ```
    /// Only use because() when there is extra context that is not captured by the causing
    /// error itself.
    #[inline]
    pub fn because<S: Into<ErrorContext>, E: Into<Box<dyn ErrorTrait + Send + Sync>>>(
        e: ErrorType,
        context: S,
        cause: E,
    ) -> BError {
        Self::create(
            e,
            ErrorSource::Unset,
            Some(context.into()),
            Some(cause.into()),
        )
    }

    /// Create an error with context but no direct causing error
    #[inline]
    pub fn explain<S: Into<ErrorContext>>(e: ErrorType, context: S) -> BError {
        Self::create(e, ErrorSource::Unset, Some(context.into()), None)
    }

    /// Short for Err(Self::explain)
    #[inline]
    pub fn e_explain<T, S: Into<ErrorContext>>(e: ErrorType, context: S) -> Result<T> {
        Err(Self::explain(e, context))
    }

    pub fn etype(&self) -> &ErrorType {
        &self.etype
    }

    pub fn esource(&self) -> &ErrorSource {
        &self.esource
    }

    /// The into_{up, caller} functions change the source of the error and return it
    pub fn into_up(mut self: BError) -> BError {
        self.esource = ErrorSource::Upstream;
        self
    }

    pub fn into_caller(mut self: BError) -> BError {
        self.esource = ErrorSource::Caller;
        self
    }

    /// Create a new error from self, with the same type and source, and put self as the cause
    /// ```
    /// use harbor_error::{Error, ErrorType::ConnectRefused, Result};
    ///
    /// fn connect() -> Result<()> {
    ///     Error::e_explain(ConnectRefused, "127.0.0.1:80")
    /// }
    ///
    /// fn lease() -> Result<()> {
    ///     connect().map_err(|e| e.more_context("while leasing a new connection"))
    /// }
    /// ```
    pub fn more_context<T: Into<ErrorContext>>(self: BError, context: T) -> BError {
        let esource = self.esource;
        let mut e = Self::because(self.etype.clone(), context, self);
        e.esource = esource;
        e
    }

    // Display error but skip the duplicate elements from the error in previous hop
    fn chain_display(&self, previous: Option<&Error>, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if previous.map_or(true, |p| p.esource != self.esource) {
            write!(f, "{}", self.esource.as_str())?
        }
        if previous.map_or(true, |p| p.etype != self.etype) {
            write!(f, " {}", self.etype.as_str())?
        }

        if let Some(c) = self.context.as_ref() {
            write!(f, " context: {}", c)?;
        }
        match self.cause.as_ref() {
            Some(c) => match c.downcast_ref::<BError>() {
                Some(e) => {
                    write!(f, " cause: ")?;
                    e.chain_display(Some(self), f)
                }
                None => write!(f, " cause: {}", c),
            },
            None => Ok(()),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.chain_display(None, f)
    }
}

impl ErrorTrait for Error {}

/// Helper trait to chain errors with context
pub trait OrErr<T, E> {
    /// Wrap the E in [Result] with new [ErrorType] and context, the existing E will be the cause.
    ///
    /// This is a shortcut for map_err() + because()
    fn or_err(self, et: ErrorType, context: &'static str) -> Result<T>
    where
        E: Into<Box<dyn ErrorTrait + Send + Sync>>;

    /// Similar to or_err(), but takes a closure, which is useful for constructing String.
    fn or_err_with<C: Into<ErrorContext>, F: FnOnce() -> C>(
        self,
        et: ErrorType,
        context: F,
    ) -> Result<T>
    where
        E: Into<Box<dyn ErrorTrait + Send + Sync>>;
}

impl<T, E> OrErr<T, E> for StdResult<T, E> {
    fn or_err(self, et: ErrorType, context: &'static str) -> Result<T>
    where
        E: Into<Box<dyn ErrorTrait + Send + Sync>>,
    {
        self.map_err(|e| Error::because(et, context, e))
    }

    fn or_err_with<C: Into<ErrorContext>, F: FnOnce() -> C>(
        self,
        et: ErrorType,
        context: F,
    ) -> Result<T>
    where
        E: Into<Box<dyn ErrorTrait + Send + Sync>>,
    {
        self.map_err(|e| Error::because(et, context(), e))
    }
}
