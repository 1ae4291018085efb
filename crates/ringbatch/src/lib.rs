//! # ringbatch
//!
//! Batched asynchronous file I/O over a submission/completion queue.
//!
//! A batch call opens one queue sized to its requests, prepares every entry,
//! submits them with a single call and blocks until every completion has been
//! observed. Write batches end with a whole-file fsync that is always the last
//! entry submitted. The first failing completion fails the whole batch, and
//! the queue is torn down exactly once on every path.
//!
//! This crate provides:
//! - [`BatchExecutor`] with `batch_write` / `batch_read`
//! - Chunked variants for request lists longer than one queue
//! - The [`facility`] traits, an io_uring implementation (Linux) and an
//!   in-memory implementation with fault injection
//!
//! ```no_run
//! # #[cfg(target_os = "linux")]
//! # {
//! use ringbatch::{ReadRequest, WriteRequest};
//! use std::fs::OpenOptions;
//! use std::os::fd::AsFd;
//!
//! let file = OpenOptions::new().read(true).write(true).create(true).open("/tmp/data").unwrap();
//! ringbatch::batch_write(
//!     &[WriteRequest::new(b"AB", 0), WriteRequest::new(b"CD", 2)],
//!     file.as_fd(),
//! )
//! .unwrap();
//!
//! let mut buf = [0u8; 4];
//! ringbatch::batch_read(&mut [ReadRequest::new(&mut buf, 0)], file.as_fd()).unwrap();
//! assert_eq!(&buf, b"ABCD");
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod chunked;
pub mod config;
pub mod error;
pub mod executor;
pub mod facility;
pub mod memory;
pub mod request;

// io_uring is Linux-specific
#[cfg(target_os = "linux")]
pub mod uring;

pub use chunked::ChunkedError;
pub use config::BatchConfig;
pub use error::{BatchError, BatchKind, Entry, Result};
pub use executor::BatchExecutor;
pub use request::{BatchOutcome, ReadRequest, WriteRequest};

#[cfg(target_os = "linux")]
use std::os::fd::BorrowedFd;

/// Write `requests` to `fd` and fsync it, using a fresh io_uring instance.
///
/// # Errors
///
/// Returns the first failure observed; see [`BatchError`].
#[cfg(target_os = "linux")]
pub fn batch_write(requests: &[WriteRequest<'_>], fd: BorrowedFd<'_>) -> Result<BatchOutcome> {
    BatchExecutor::new(uring::UringFacility::new()).batch_write(requests, fd)
}

/// Read `requests` from `fd`, using a fresh io_uring instance.
///
/// # Errors
///
/// Returns the first failure observed; see [`BatchError`].
#[cfg(target_os = "linux")]
pub fn batch_read(requests: &mut [ReadRequest<'_>], fd: BorrowedFd<'_>) -> Result<BatchOutcome> {
    BatchExecutor::new(uring::UringFacility::new()).batch_read(requests, fd)
}
