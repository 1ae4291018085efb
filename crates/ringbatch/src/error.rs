//! Batch error types.

use std::fmt;
use thiserror::Error;

/// Result type for batch operations.
pub type Result<T> = std::result::Result<T, BatchError>;

/// Which kind of batch produced an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BatchKind {
    /// A write batch (data entries followed by a durability barrier)
    Write,
    /// A read batch
    Read,
}

impl fmt::Display for BatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchKind::Write => f.write_str("write"),
            BatchKind::Read => f.write_str("read"),
        }
    }
}

/// Identifies one submission entry within a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Entry {
    /// Data entry for the request at this index
    Data(usize),
    /// The trailing fsync of a write batch
    Barrier,
}

impl Entry {
    /// Token value carried through the facility for the barrier entry.
    pub const BARRIER_TOKEN: u64 = u64::MAX;

    /// Encode as the facility's `user_data` token.
    #[must_use]
    pub fn token(self) -> u64 {
        match self {
            Entry::Data(index) => index as u64,
            Entry::Barrier => Self::BARRIER_TOKEN,
        }
    }

    /// Decode a facility token.
    #[must_use]
    pub fn from_token(token: u64) -> Self {
        if token == Self::BARRIER_TOKEN {
            Entry::Barrier
        } else {
            Entry::Data(token as usize)
        }
    }
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Entry::Data(index) => write!(f, "request {index}"),
            Entry::Barrier => f.write_str("barrier"),
        }
    }
}

/// Batch errors
///
/// Every variant is terminal for the batch. The queue has already been
/// released by the time one of these reaches the caller.
#[derive(Debug, Error)]
pub enum BatchError {
    /// The facility could not allocate a queue
    #[error("{kind} batch: failed to initialize queue of {capacity} entries: {source}")]
    QueueInit {
        /// Batch kind
        kind: BatchKind,
        /// Requested queue capacity
        capacity: u32,
        /// Underlying facility error
        #[source]
        source: std::io::Error,
    },

    /// No submission slot for an entry (queue sized incorrectly)
    #[error("{kind} batch: no submission slot available for {entry}")]
    NoSubmissionSlot {
        /// Batch kind
        kind: BatchKind,
        /// Entry that could not be queued
        entry: Entry,
    },

    /// The facility rejected the submission
    #[error("{kind} batch: submission failed: {source}")]
    Submission {
        /// Batch kind
        kind: BatchKind,
        /// Underlying facility error
        #[source]
        source: std::io::Error,
    },

    /// Waiting for a completion failed
    #[error("{kind} batch: waiting for completion failed: {source}")]
    Wait {
        /// Batch kind
        kind: BatchKind,
        /// Underlying facility error
        #[source]
        source: std::io::Error,
    },

    /// One operation completed with an error code
    #[error("{kind} batch: {entry} failed: {}", errno_text(.code))]
    Operation {
        /// Batch kind
        kind: BatchKind,
        /// Failing entry
        entry: Entry,
        /// Positive errno reported by the facility
        code: i32,
    },

    /// A request is larger than one submission entry can describe
    #[error("{kind} batch: request {index} is {len} bytes, limit is {max}")]
    RequestTooLarge {
        /// Batch kind
        kind: BatchKind,
        /// Request index
        index: usize,
        /// Request length
        len: usize,
        /// Largest length one entry can carry
        max: usize,
    },
}

fn errno_text(code: &i32) -> std::io::Error {
    std::io::Error::from_raw_os_error(*code)
}

impl BatchError {
    /// Kind of the batch that failed.
    #[must_use]
    pub fn kind(&self) -> BatchKind {
        match self {
            BatchError::QueueInit { kind, .. }
            | BatchError::NoSubmissionSlot { kind, .. }
            | BatchError::Submission { kind, .. }
            | BatchError::Wait { kind, .. }
            | BatchError::Operation { kind, .. }
            | BatchError::RequestTooLarge { kind, .. } => *kind,
        }
    }

    /// Numeric status for diagnostics.
    ///
    /// The errno for `Operation`, the raw OS error for facility failures
    /// when one is present.
    #[must_use]
    pub fn code(&self) -> Option<i32> {
        match self {
            BatchError::Operation { code, .. } => Some(*code),
            BatchError::QueueInit { source, .. }
            | BatchError::Submission { source, .. }
            | BatchError::Wait { source, .. } => source.raw_os_error(),
            BatchError::NoSubmissionSlot { .. } | BatchError::RequestTooLarge { .. } => None,
        }
    }

    /// Whether this error came from a single failing operation.
    #[must_use]
    pub fn is_operation(&self) -> bool {
        matches!(self, BatchError::Operation { .. })
    }
}
