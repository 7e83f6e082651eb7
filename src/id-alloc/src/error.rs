// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Errors produced while allocating identifiers.

use std::error::Error;
use std::fmt;

use thiserror::Error;

/// An error that can occur while interacting with a
/// [`CounterStore`](crate::store::CounterStore).
///
/// Store errors are deliberately opaque. They indicate that no identifier
/// could be reserved: the backing database is unreachable, a lock timed out,
/// or the durable state is corrupt. None of them are retried internally.
#[derive(Debug)]
pub struct StoreError {
    // Internal to avoid leaking implementation details about the backends.
    inner: InternalStoreError,
}

impl StoreError {
    /// Returns whether the error is unrecoverable (retrying will never succeed).
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self.inner, InternalStoreError::Corrupt(_))
    }

    pub(crate) fn corrupt(msg: impl Into<String>) -> StoreError {
        StoreError {
            inner: InternalStoreError::Corrupt(msg.into()),
        }
    }
}

#[derive(Debug)]
enum InternalStoreError {
    Sqlite(rusqlite::Error),
    Postgres(::postgres::Error),
    Corrupt(String),
    Other(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("counter store error: ")?;
        match &self.inner {
            InternalStoreError::Sqlite(e) => fmt::Display::fmt(e, f),
            InternalStoreError::Postgres(e) => fmt::Display::fmt(e, f),
            InternalStoreError::Corrupt(e) => write!(f, "corrupt state: {}", e),
            InternalStoreError::Other(e) => f.write_str(e),
        }
    }
}

impl Error for StoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self.inner {
            InternalStoreError::Sqlite(e) => Some(e),
            InternalStoreError::Postgres(e) => Some(e),
            InternalStoreError::Corrupt(_) | InternalStoreError::Other(_) => None,
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> StoreError {
        StoreError {
            inner: InternalStoreError::Sqlite(e),
        }
    }
}

impl From<::postgres::Error> for StoreError {
    fn from(e: ::postgres::Error) -> StoreError {
        StoreError {
            inner: InternalStoreError::Postgres(e),
        }
    }
}

impl From<String> for StoreError {
    fn from(e: String) -> StoreError {
        StoreError {
            inner: InternalStoreError::Other(e),
        }
    }
}

impl From<&str> for StoreError {
    fn from(e: &str) -> StoreError {
        StoreError {
            inner: InternalStoreError::Other(e.into()),
        }
    }
}

/// An error returned by the public allocation entry points.
#[derive(Error, Debug)]
pub enum AllocError {
    /// The request was rejected before any allocator state was touched.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The counter store could not reserve a new block.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The allocated value does not fit in the identifier's width.
    #[error("could not allocate identifier for {key}: value {value} is out of range")]
    Exhausted { key: String, value: i64 },
}

impl AllocError {
    pub(crate) fn invalid(msg: impl Into<String>) -> AllocError {
        AllocError::InvalidArgument(msg.into())
    }
}
