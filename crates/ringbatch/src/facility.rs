//! The asynchronous I/O facility seam.
//!
//! A [`Facility`] hands out bounded submission/completion queues. The batch
//! executor only talks to these traits, so the same logic runs against the
//! kernel's io_uring ([`crate::uring`]) and the in-memory facility
//! ([`crate::memory`]).

use crate::error::Entry;
use std::io;
use std::os::fd::BorrowedFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;

/// No submission slot is left in the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("submission queue is full")]
pub struct QueueFull;

/// A source of submission queues.
pub trait Facility {
    /// Queue type. `'buf` is the lifetime of every buffer the queue may
    /// reference while operations are in flight.
    type Queue<'buf>: SubmissionQueue<'buf>;

    /// Open a queue with room for at least `capacity` entries.
    ///
    /// # Errors
    ///
    /// Returns the facility's error if the queue cannot be allocated.
    fn open<'buf>(&self, capacity: u32) -> io::Result<Self::Queue<'buf>>;
}

/// One open submission/completion queue pair.
///
/// Dropping the queue (or calling [`SubmissionQueue::close`]) tears it down
/// and discards any completions that were never awaited. Teardown does not
/// return until no submitted operation can still touch a queued buffer.
pub trait SubmissionQueue<'buf> {
    /// Queue a write of `buf` to `fd` at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`QueueFull`] when no slot is left.
    ///
    /// # Safety
    ///
    /// The queue must be closed or dropped, never leaked, once this entry has
    /// been submitted. Leaking it lets the operation outlive the borrow of
    /// `buf`.
    unsafe fn prepare_write(
        &mut self,
        fd: BorrowedFd<'buf>,
        buf: &'buf [u8],
        offset: i64,
        token: u64,
    ) -> Result<(), QueueFull>;

    /// Queue a read into `buf` from `fd` at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`QueueFull`] when no slot is left.
    ///
    /// # Safety
    ///
    /// Same contract as [`SubmissionQueue::prepare_write`].
    unsafe fn prepare_read(
        &mut self,
        fd: BorrowedFd<'buf>,
        buf: &'buf mut [u8],
        offset: i64,
        token: u64,
    ) -> Result<(), QueueFull>;

    /// Queue a whole-file fsync of `fd`.
    ///
    /// # Errors
    ///
    /// Returns [`QueueFull`] when no slot is left.
    fn prepare_barrier(&mut self, fd: BorrowedFd<'buf>, token: u64) -> Result<(), QueueFull>;

    /// Submit every queued entry in one call, returning how many the
    /// facility accepted.
    ///
    /// # Errors
    ///
    /// Returns the facility's error if the submission is rejected.
    fn submit(&mut self) -> io::Result<usize>;

    /// Block until one completion is available and return it.
    ///
    /// # Errors
    ///
    /// Returns the facility's error if waiting fails.
    fn wait_one(&mut self) -> io::Result<Completion>;

    /// Number of submitted operations whose completion has not been returned.
    fn in_flight(&self) -> usize;

    /// Tear down the queue.
    fn close(self)
    where
        Self: Sized,
    {
        drop(self);
    }
}

/// Completion event from the facility
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    /// Token the entry was submitted with
    pub token: u64,
    /// Result of the operation (bytes transferred or negative errno)
    pub result: i32,
}

impl Completion {
    /// Entry this completion belongs to
    #[must_use]
    pub fn entry(&self) -> Entry {
        Entry::from_token(self.token)
    }

    /// Check if this completion represents a successful operation
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.result >= 0
    }

    /// Get the number of bytes transferred (if successful)
    #[must_use]
    pub fn bytes_transferred(&self) -> Option<usize> {
        usize::try_from(self.result).ok()
    }

    /// Get the positive errno (if failed)
    #[must_use]
    pub fn error_code(&self) -> Option<i32> {
        if self.result < 0 {
            Some(-self.result)
        } else {
            None
        }
    }
}

/// Queue allocation counters shared by a facility and its queues.
#[derive(Debug, Default)]
pub struct QueueCounters {
    opened: AtomicUsize,
    closed: AtomicUsize,
}

impl QueueCounters {
    /// Create zeroed counters
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues opened so far
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::Acquire)
    }

    /// Queues torn down so far
    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::Acquire)
    }

    /// Queues currently open
    pub fn live(&self) -> usize {
        self.opened().saturating_sub(self.closed())
    }

    pub(crate) fn record_open(&self) {
        self.opened.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn record_close(&self) {
        self.closed.fetch_add(1, Ordering::AcqRel);
    }
}
