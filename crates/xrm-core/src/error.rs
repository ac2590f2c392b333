/* Copyright 2023- The Binedge, Lda team. All rights reserved.
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *     http://www.apache.org/licenses/LICENSE-2.0
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Error handling for the resource manager core.
//!
//! Every mutator returns a [`XrmError`] instead of a sentinel int; the transport edge (out of
//! scope for this crate) is the only place that should ever project a [`StatusKind`] back onto
//! the wire's integer status code.

use thiserror::Error;

/// Stable error kinds, one per spec.md §7 status. Names are for diagnostics only; the transport
/// edge is responsible for mapping a kind onto the negative integer it has standardized on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusKind {
    Ok,
    InvalidRequest,
    NoDevice,
    NoCapacity,
    ExclusiveConflict,
    PoolEmpty,
    UnknownAlloc,
    UnknownPool,
    UnknownGroup,
    CapReached,
    DriverError,
    Cancelled,
}

/// Errors produced by the resource manager core.
#[derive(Debug, Error)]
pub enum XrmError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("no enabled, loaded device available")]
    NoDevice,

    #[error("no candidate has enough free capacity")]
    NoCapacity,

    #[error("device is exclusively held by another client")]
    ExclusiveConflict,

    #[error("pool {0} has no remaining quota for this request")]
    PoolEmpty(u64),

    #[error("unknown allocation service id {0}")]
    UnknownAlloc(u64),

    #[error("unknown pool id {0}")]
    UnknownPool(u64),

    #[error("unknown cu group {0:?}")]
    UnknownGroup(String),

    #[error("maximum concurrent client count reached")]
    CapReached,

    #[error("device driver error: {0}")]
    DriverError(String),

    #[error("blocking allocation cancelled: owning client disconnected")]
    Cancelled,
}

impl XrmError {
    /// Maps this error onto its stable [`StatusKind`].
    pub fn kind(&self) -> StatusKind {
        match self {
            XrmError::InvalidRequest(_) => StatusKind::InvalidRequest,
            XrmError::NoDevice => StatusKind::NoDevice,
            XrmError::NoCapacity => StatusKind::NoCapacity,
            XrmError::ExclusiveConflict => StatusKind::ExclusiveConflict,
            XrmError::PoolEmpty(_) => StatusKind::PoolEmpty,
            XrmError::UnknownAlloc(_) => StatusKind::UnknownAlloc,
            XrmError::UnknownPool(_) => StatusKind::UnknownPool,
            XrmError::UnknownGroup(_) => StatusKind::UnknownGroup,
            XrmError::CapReached => StatusKind::CapReached,
            XrmError::DriverError(_) => StatusKind::DriverError,
            XrmError::Cancelled => StatusKind::Cancelled,
        }
    }
}

/// Result alias used throughout the core.
pub type XrmResult<T> = Result<T, XrmError>;
