//! Error types for coordinator calls and the status model of the transport.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::context::CancelReason;
use crate::pointer::PointerViolation;
use crate::redundancy::RedundancyScheme;
use crate::rpc::Operation;

/// Status codes reported by the coordinator transport.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusCode {
    /// The addressed entity does not exist.
    NotFound,
    /// The request was rejected as malformed.
    InvalidArgument,
    /// The entity already exists.
    AlreadyExists,
    /// The caller lacks permission.
    PermissionDenied,
    /// The API key was missing or not recognized.
    Unauthenticated,
    /// A quota or capacity limit was hit.
    ResourceExhausted,
    /// The system is not in a state that allows the operation.
    FailedPrecondition,
    /// The coordinator is temporarily unreachable.
    Unavailable,
    /// The coordinator-side deadline expired.
    DeadlineExceeded,
    /// The call was cancelled on the coordinator side.
    Cancelled,
    /// Coordinator internal failure.
    Internal,
    /// Unclassified failure.
    Unknown,
}

impl StatusCode {
    /// Codes for which repeating the call later may succeed.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            StatusCode::Unavailable
                | StatusCode::ResourceExhausted
                | StatusCode::DeadlineExceeded
                | StatusCode::Internal
        )
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A structured failure reported by the coordinator transport.
#[derive(Clone, Debug, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct Status {
    /// Classification of the failure.
    pub code: StatusCode,
    /// Human-readable detail.
    pub message: String,
}

impl Status {
    /// Creates a status.
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Shorthand for a `NotFound` status.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NotFound, message)
    }

    /// Shorthand for an `InvalidArgument` status.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(StatusCode::InvalidArgument, message)
    }

    /// Shorthand for an `Internal` status.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Internal, message)
    }
}

/// Errors returned by segment coordination operations.
///
/// Nothing in this crate retries; [`MetainfoError::is_retryable`] only tells the
/// caller whether doing so could help.
#[derive(Debug, Error)]
pub enum MetainfoError {
    /// The redundancy scheme violates its ordering invariant.
    #[error("invalid redundancy scheme ({reason}): {scheme:?}")]
    InvalidRedundancy {
        /// The offending scheme.
        scheme: RedundancyScheme,
        /// Which inequality failed.
        reason: &'static str,
    },

    /// The coordinator placed fewer pieces than the scheme needs to be reconstructible.
    #[error("placement failed: {placed} of {requested} pieces placed, {min_required} required")]
    PlacementFailed {
        /// Pieces requested (the scheme total).
        requested: u32,
        /// Authorizations returned.
        placed: usize,
        /// Minimum the scheme requires.
        min_required: u32,
    },

    /// A pointer's piece set is corrupt.
    #[error("malformed pointer: {0}")]
    MalformedPointer(#[from] PointerViolation),

    /// The segment does not exist.
    #[error("{op}: segment not found")]
    NotFound {
        /// Operation that observed the absence.
        op: Operation,
        /// Status reported by the coordinator.
        #[source]
        status: Status,
    },

    /// Any other failure reported by the coordinator or its transport.
    #[error("{op}: coordinator error")]
    Coordinator {
        /// Failed operation.
        op: Operation,
        /// Status reported by the coordinator.
        #[source]
        status: Status,
    },

    /// The operation was abandoned before a response arrived.
    #[error("{op}: cancelled ({reason})")]
    Cancelled {
        /// Abandoned operation.
        op: Operation,
        /// Why it was abandoned.
        reason: CancelReason,
    },

    /// The channel to the coordinator could not be established.
    #[error("dial {address}: {status}")]
    Dial {
        /// Address that was dialed.
        address: String,
        /// Why the dial failed.
        #[source]
        status: Status,
    },

    /// The locator names a numbered segment below zero.
    #[error("{op}: invalid segment index {index}")]
    InvalidSegmentIndex {
        /// Operation that was refused.
        op: Operation,
        /// The negative index.
        index: i64,
    },

    /// The coordinator answered with a response that breaks the protocol.
    #[error("{op}: invalid coordinator response: {reason}")]
    InvalidResponse {
        /// Operation whose response was rejected.
        op: Operation,
        /// What was wrong with it.
        reason: String,
    },
}

impl MetainfoError {
    /// Classifies a transport status for `op`.
    ///
    /// Only lookups of a single segment translate `NotFound` into
    /// [`MetainfoError::NotFound`]; every other status is a coordinator error.
    pub fn from_status(op: Operation, status: Status) -> Self {
        if status.code == StatusCode::NotFound && op.maps_not_found() {
            MetainfoError::NotFound { op, status }
        } else {
            MetainfoError::Coordinator { op, status }
        }
    }

    /// Returns true for the distinguished not-found outcome.
    pub fn is_not_found(&self) -> bool {
        matches!(self, MetainfoError::NotFound { .. })
    }

    /// Returns true if the operation was cancelled or ran out of time.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, MetainfoError::Cancelled { .. })
    }

    /// Returns true if the caller may reasonably retry with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            MetainfoError::PlacementFailed { .. } => true,
            MetainfoError::Coordinator { status, .. } | MetainfoError::Dial { status, .. } => {
                status.code.is_transient()
            }
            _ => false,
        }
    }

    /// The coordinator status behind this error, if there is one.
    pub fn status(&self) -> Option<&Status> {
        match self {
            MetainfoError::NotFound { status, .. }
            | MetainfoError::Coordinator { status, .. }
            | MetainfoError::Dial { status, .. } => Some(status),
            _ => None,
        }
    }
}
