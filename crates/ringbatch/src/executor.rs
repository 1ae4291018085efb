//! The batch executor.
//!
//! One call opens one queue sized to the batch, prepares every entry, submits
//! them with a single call, and then waits for exactly as many completions as
//! were submitted. The first failing completion ends the call. The queue is
//! released exactly once on every path through [`QueueGuard`].

use crate::error::{BatchError, BatchKind, Entry, Result};
use crate::facility::{Facility, SubmissionQueue};
use crate::request::{BatchOutcome, MAX_REQUEST_LEN, ReadRequest, WriteRequest};
use std::io;
use std::marker::PhantomData;
use std::os::fd::{AsRawFd, BorrowedFd};
use tracing::{debug, trace, warn};

/// Runs write and read batches against one facility.
///
/// The executor holds no per-batch state; each call opens and tears down its
/// own queue, so one executor can serve any number of sequential calls.
#[derive(Debug, Clone, Default)]
pub struct BatchExecutor<F> {
    facility: F,
}

impl<F: Facility> BatchExecutor<F> {
    /// Create an executor over `facility`
    #[must_use]
    pub fn new(facility: F) -> Self {
        Self { facility }
    }

    /// The underlying facility
    #[must_use]
    pub fn facility(&self) -> &F {
        &self.facility
    }

    /// Write every request to `fd`, then fsync the whole file.
    ///
    /// Submits `requests.len() + 1` entries in one call, the fsync last, and
    /// waits for all of them. An empty slice submits only the fsync.
    ///
    /// # Errors
    ///
    /// Returns the first failure observed; see [`BatchError`].
    pub fn batch_write(
        &self,
        requests: &[WriteRequest<'_>],
        fd: BorrowedFd<'_>,
    ) -> Result<BatchOutcome> {
        let kind = BatchKind::Write;
        check_lengths(kind, requests.iter().map(WriteRequest::len))?;

        let entries = requests.len() + 1;
        debug!(
            fd = fd.as_raw_fd(),
            requests = requests.len(),
            entries,
            "opening write batch"
        );

        let mut guard = self.open(kind, entries)?;
        let queue = guard.queue_mut();
        for (index, request) in requests.iter().enumerate() {
            let entry = Entry::Data(index);
            // SAFETY: The guard owns the queue and drops it before this call
            // returns, so no entry outlives the borrow of `request.buffer`.
            let prepared =
                unsafe { queue.prepare_write(fd, request.buffer, request.offset, entry.token()) };
            prepared.map_err(|_| no_slot(kind, entry))?;
        }
        queue
            .prepare_barrier(fd, Entry::Barrier.token())
            .map_err(|_| no_slot(kind, Entry::Barrier))?;

        let outcome = submit_and_collect(kind, queue, entries, requests.len())
            .inspect_err(|e| warn!(fd = fd.as_raw_fd(), "{}", e))?;
        guard.release();
        Ok(outcome)
    }

    /// Read every request from `fd` into its buffer.
    ///
    /// Submits `requests.len()` entries in one call and waits for all of
    /// them. A short read is not an error; the byte count of each request is
    /// in the returned [`BatchOutcome`]. An empty slice returns immediately
    /// without opening a queue.
    ///
    /// # Errors
    ///
    /// Returns the first failure observed; see [`BatchError`].
    pub fn batch_read(
        &self,
        requests: &mut [ReadRequest<'_>],
        fd: BorrowedFd<'_>,
    ) -> Result<BatchOutcome> {
        let kind = BatchKind::Read;
        check_lengths(kind, requests.iter().map(ReadRequest::capacity))?;

        let entries = requests.len();
        if entries == 0 {
            debug!(fd = fd.as_raw_fd(), "empty read batch, nothing to submit");
            return Ok(BatchOutcome::default());
        }
        debug!(fd = fd.as_raw_fd(), entries, "opening read batch");

        let mut guard = self.open(kind, entries)?;
        let queue = guard.queue_mut();
        for (index, request) in requests.iter_mut().enumerate() {
            let entry = Entry::Data(index);
            // SAFETY: As in `batch_write`; the queue is dropped before the
            // mutable borrow of `requests` ends.
            let prepared = unsafe {
                queue.prepare_read(fd, &mut *request.buffer, request.offset, entry.token())
            };
            prepared.map_err(|_| no_slot(kind, entry))?;
        }

        let outcome = submit_and_collect(kind, queue, entries, entries)
            .inspect_err(|e| warn!(fd = fd.as_raw_fd(), "{}", e))?;
        guard.release();
        Ok(outcome)
    }

    fn open<'buf>(
        &self,
        kind: BatchKind,
        entries: usize,
    ) -> Result<QueueGuard<'buf, F::Queue<'buf>>> {
        let capacity = u32::try_from(entries).map_err(|_| BatchError::QueueInit {
            kind,
            capacity: u32::MAX,
            source: io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{entries} entries exceed the queue size limit"),
            ),
        })?;

        let queue = self
            .facility
            .open(capacity)
            .map_err(|source| BatchError::QueueInit {
                kind,
                capacity,
                source,
            })
            .inspect_err(|e| warn!("{}", e))?;
        Ok(QueueGuard::new(queue))
    }
}

/// Closes a queue exactly once.
///
/// [`QueueGuard::release`] may be called any number of times; only the first
/// call (or the drop, if release was never called) tears the queue down.
pub struct QueueGuard<'buf, Q: SubmissionQueue<'buf>> {
    queue: Option<Q>,
    _buffers: PhantomData<&'buf mut [u8]>,
}

impl<'buf, Q: SubmissionQueue<'buf>> QueueGuard<'buf, Q> {
    /// Take ownership of an open queue
    #[must_use]
    pub fn new(queue: Q) -> Self {
        Self {
            queue: Some(queue),
            _buffers: PhantomData,
        }
    }

    /// Whether the queue has been released
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.queue.is_none()
    }

    /// Tear down the queue if it is still open
    pub fn release(&mut self) {
        if let Some(queue) = self.queue.take() {
            let outstanding = queue.in_flight();
            queue.close();
            debug!(outstanding, "queue released");
        }
    }

    fn queue_mut(&mut self) -> &mut Q {
        match self.queue.as_mut() {
            Some(queue) => queue,
            None => unreachable!("queue used after release"),
        }
    }
}

impl<'buf, Q: SubmissionQueue<'buf>> Drop for QueueGuard<'buf, Q> {
    fn drop(&mut self) {
        self.release();
    }
}

fn check_lengths(kind: BatchKind, lengths: impl Iterator<Item = usize>) -> Result<()> {
    for (index, len) in lengths.enumerate() {
        if len > MAX_REQUEST_LEN {
            return Err(BatchError::RequestTooLarge {
                kind,
                index,
                len,
                max: MAX_REQUEST_LEN,
            });
        }
    }
    Ok(())
}

fn no_slot(kind: BatchKind, entry: Entry) -> BatchError {
    BatchError::NoSubmissionSlot { kind, entry }
}

/// Submit everything queued and wait for `expected` completions.
fn submit_and_collect<'buf, Q: SubmissionQueue<'buf>>(
    kind: BatchKind,
    queue: &mut Q,
    expected: usize,
    data_entries: usize,
) -> Result<BatchOutcome> {
    let submitted = queue
        .submit()
        .map_err(|source| BatchError::Submission { kind, source })?;
    if submitted != expected {
        return Err(BatchError::Submission {
            kind,
            source: io::Error::other(format!(
                "facility accepted {submitted} of {expected} entries"
            )),
        });
    }
    debug!(%kind, submitted, "batch submitted");

    let mut outcome = BatchOutcome::with_len(data_entries);
    for _ in 0..submitted {
        let completion = queue
            .wait_one()
            .map_err(|source| BatchError::Wait { kind, source })?;
        let entry = completion.entry();
        trace!(%kind, ?entry, result = completion.result, "completion");

        if let Some(code) = completion.error_code() {
            return Err(BatchError::Operation { kind, entry, code });
        }
        if let (Entry::Data(index), Some(bytes)) = (entry, completion.bytes_transferred()) {
            outcome.record(index, bytes);
        }
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{CompletionOrder, Faults, MemoryFacility, OpKind};
    use std::collections::HashMap;
    use std::os::fd::AsFd;

    fn executor(facility: MemoryFacility) -> BatchExecutor<MemoryFacility> {
        BatchExecutor::new(facility)
    }

    #[test]
    fn test_write_awaits_requests_plus_barrier() {
        let exec = executor(MemoryFacility::new());
        let file = exec.facility().create_file(b"").unwrap();

        let requests = [
            WriteRequest::new(b"AB", 0),
            WriteRequest::new(b"CD", 2),
            WriteRequest::new(b"EF", 4),
        ];
        let outcome = exec.batch_write(&requests, file.as_fd()).unwrap();

        assert_eq!(outcome.transferred(), &[2, 2, 2]);
        let stats = exec.facility().stats();
        assert_eq!(stats.submit_calls, 1);
        assert_eq!(stats.submitted, 4);
        assert_eq!(stats.awaited, 4);
        assert_eq!(exec.facility().contents(&file), b"ABCDEF");
        assert_eq!(exec.facility().syncs(&file), 1);
        assert_eq!(exec.facility().counters().live(), 0);
    }

    #[test]
    fn test_barrier_is_prepared_last() {
        let exec = executor(MemoryFacility::new());
        let file = exec.facility().create_file(b"").unwrap();

        let requests = [WriteRequest::new(b"x", 0), WriteRequest::new(b"y", 1)];
        exec.batch_write(&requests, file.as_fd()).unwrap();

        let kinds: Vec<_> = exec.facility().prepared().iter().map(|op| op.kind).collect();
        assert_eq!(kinds, vec![OpKind::Write, OpKind::Write, OpKind::Barrier]);
    }

    #[test]
    fn test_empty_write_submits_only_barrier() {
        let exec = executor(MemoryFacility::new());
        let file = exec.facility().create_file(b"abc").unwrap();

        let outcome = exec.batch_write(&[], file.as_fd()).unwrap();
        assert!(outcome.is_empty());

        let stats = exec.facility().stats();
        assert_eq!(stats.submitted, 1);
        assert_eq!(stats.awaited, 1);
        assert_eq!(exec.facility().syncs(&file), 1);
        assert_eq!(exec.facility().counters().opened(), 1);
        assert_eq!(exec.facility().counters().closed(), 1);
    }

    #[test]
    fn test_empty_read_opens_nothing() {
        let exec = executor(MemoryFacility::new());
        let file = exec.facility().create_file(b"abc").unwrap();

        let outcome = exec.batch_read(&mut [], file.as_fd()).unwrap();
        assert!(outcome.is_empty());
        assert_eq!(exec.facility().counters().opened(), 0);
    }

    #[test]
    fn test_read_awaits_exactly_n() {
        let exec = executor(MemoryFacility::new());
        let file = exec.facility().create_file(b"0123456789").unwrap();

        let mut a = [0u8; 4];
        let mut b = [0u8; 4];
        let mut requests = [ReadRequest::new(&mut a, 0), ReadRequest::new(&mut b, 8)];
        let outcome = exec.batch_read(&mut requests, file.as_fd()).unwrap();

        assert_eq!(outcome.transferred(), &[4, 2]);
        assert_eq!(outcome.short_requests(&[4, 4]), vec![1]);
        assert_eq!(&a, b"0123");
        assert_eq!(&b[..2], b"89");

        let stats = exec.facility().stats();
        assert_eq!(stats.submitted, 2);
        assert_eq!(stats.awaited, 2);
        assert!(exec.facility().prepared().iter().all(|op| op.kind == OpKind::Read));
    }

    #[test]
    fn test_out_of_order_completions() {
        let exec = executor(MemoryFacility::new().with_order(CompletionOrder::Reversed));
        let file = exec.facility().create_file(b"").unwrap();

        let requests = [WriteRequest::new(b"abc", 0), WriteRequest::new(b"d", 3)];
        let outcome = exec.batch_write(&requests, file.as_fd()).unwrap();
        assert_eq!(outcome.transferred(), &[3, 1]);
        assert_eq!(exec.facility().contents(&file), b"abcd");
    }

    #[test]
    fn test_queue_init_failure() {
        let exec = executor(MemoryFacility::new().with_faults(Faults {
            open_errno: Some(libc::ENOMEM),
            ..Faults::default()
        }));
        let file = exec.facility().create_file(b"").unwrap();

        let err = exec
            .batch_write(&[WriteRequest::new(b"a", 0)], file.as_fd())
            .unwrap_err();
        assert!(matches!(
            err,
            BatchError::QueueInit {
                kind: BatchKind::Write,
                capacity: 2,
                ..
            }
        ));
        assert_eq!(err.code(), Some(libc::ENOMEM));
        assert_eq!(exec.facility().counters().opened(), 0);
    }

    #[test]
    fn test_missing_slot_for_barrier() {
        let exec = executor(MemoryFacility::new().with_faults(Faults {
            slot_limit: Some(2),
            ..Faults::default()
        }));
        let file = exec.facility().create_file(b"").unwrap();

        let requests = [WriteRequest::new(b"a", 0), WriteRequest::new(b"b", 1)];
        let err = exec.batch_write(&requests, file.as_fd()).unwrap_err();
        assert!(matches!(
            err,
            BatchError::NoSubmissionSlot {
                entry: Entry::Barrier,
                ..
            }
        ));
        assert_eq!(exec.facility().stats().submit_calls, 0);
        assert_eq!(exec.facility().counters().live(), 0);
    }

    #[test]
    fn test_missing_slot_for_read() {
        let exec = executor(MemoryFacility::new().with_faults(Faults {
            slot_limit: Some(1),
            ..Faults::default()
        }));
        let file = exec.facility().create_file(b"abcd").unwrap();

        let mut a = [0u8; 2];
        let mut b = [0u8; 2];
        let mut requests = [ReadRequest::new(&mut a, 0), ReadRequest::new(&mut b, 2)];
        let err = exec.batch_read(&mut requests, file.as_fd()).unwrap_err();
        assert!(matches!(
            err,
            BatchError::NoSubmissionSlot {
                kind: BatchKind::Read,
                entry: Entry::Data(1)
            }
        ));
        assert_eq!(exec.facility().counters().live(), 0);
    }

    #[test]
    fn test_submission_failure() {
        let exec = executor(MemoryFacility::new().with_faults(Faults {
            submit_errno: Some(libc::EBUSY),
            ..Faults::default()
        }));
        let file = exec.facility().create_file(b"").unwrap();

        let err = exec
            .batch_write(&[WriteRequest::new(b"a", 0)], file.as_fd())
            .unwrap_err();
        assert!(matches!(err, BatchError::Submission { .. }));
        assert_eq!(err.code(), Some(libc::EBUSY));
        assert_eq!(exec.facility().counters().live(), 0);
    }

    #[test]
    fn test_short_submission_is_an_error() {
        let exec = executor(MemoryFacility::new().with_faults(Faults {
            submit_limit: Some(1),
            ..Faults::default()
        }));
        let file = exec.facility().create_file(b"").unwrap();

        let err = exec
            .batch_write(&[WriteRequest::new(b"a", 0)], file.as_fd())
            .unwrap_err();
        assert!(matches!(err, BatchError::Submission { .. }));
        assert_eq!(exec.facility().stats().awaited, 0);
        assert_eq!(exec.facility().stats().discarded, 1);
        assert_eq!(exec.facility().counters().live(), 0);
    }

    #[test]
    fn test_wait_failure() {
        let exec = executor(MemoryFacility::new().with_faults(Faults {
            wait_fails_after: Some(1),
            ..Faults::default()
        }));
        let file = exec.facility().create_file(b"").unwrap();

        let requests = [WriteRequest::new(b"a", 0), WriteRequest::new(b"b", 1)];
        let err = exec.batch_write(&requests, file.as_fd()).unwrap_err();
        assert!(matches!(err, BatchError::Wait { .. }));
        assert_eq!(err.code(), Some(libc::EINTR));

        let stats = exec.facility().stats();
        assert_eq!(stats.awaited, 1);
        assert_eq!(stats.discarded, 2);
        assert_eq!(exec.facility().counters().live(), 0);
    }

    #[test]
    fn test_single_failing_operation_fails_batch() {
        let mut entry_errnos = HashMap::new();
        entry_errnos.insert(Entry::Data(1), libc::EIO);
        let exec = executor(MemoryFacility::new().with_faults(Faults {
            entry_errnos,
            ..Faults::default()
        }));
        let file = exec.facility().create_file(b"").unwrap();

        let requests = [
            WriteRequest::new(b"a", 0),
            WriteRequest::new(b"b", 1),
            WriteRequest::new(b"c", 2),
        ];
        let err = exec.batch_write(&requests, file.as_fd()).unwrap_err();
        assert!(matches!(
            err,
            BatchError::Operation {
                kind: BatchKind::Write,
                entry: Entry::Data(1),
                code: libc::EIO
            }
        ));

        // Stops at the first failure; the rest are discarded by teardown
        let stats = exec.facility().stats();
        assert_eq!(stats.awaited, 2);
        assert_eq!(stats.discarded, 2);
        assert_eq!(exec.facility().counters().live(), 0);
    }

    #[test]
    fn test_short_writes_succeed_and_are_reported() {
        let exec = executor(MemoryFacility::new().with_faults(Faults {
            transfer_limit: Some(1),
            ..Faults::default()
        }));
        let file = exec.facility().create_file(b"").unwrap();

        let requests = [
            WriteRequest::new(b"a", 0),
            WriteRequest::new(b"bc", 1),
            WriteRequest::new(b"def", 3),
        ];
        let outcome = exec.batch_write(&requests, file.as_fd()).unwrap();

        assert_eq!(outcome.transferred(), &[1, 1, 1]);
        let lengths: Vec<usize> = requests.iter().map(WriteRequest::len).collect();
        assert_eq!(outcome.short_requests(&lengths), vec![1, 2]);
        assert_eq!(exec.facility().syncs(&file), 1);
    }

    #[test]
    fn test_oversized_request_rejected() {
        let err = check_lengths(BatchKind::Write, [1, MAX_REQUEST_LEN + 1].into_iter()).unwrap_err();
        assert!(matches!(
            err,
            BatchError::RequestTooLarge {
                kind: BatchKind::Write,
                index: 1,
                len,
                max: MAX_REQUEST_LEN,
            } if len == MAX_REQUEST_LEN + 1
        ));
        assert!(check_lengths(BatchKind::Read, [0, MAX_REQUEST_LEN].into_iter()).is_ok());
    }

    #[test]
    fn test_unreachable_offset_fails_with_errno() {
        let exec = executor(MemoryFacility::new());
        let file = exec.facility().create_file(b"").unwrap();

        let err = exec
            .batch_write(&[WriteRequest::new(b"x", i64::MAX)], file.as_fd())
            .unwrap_err();
        assert!(matches!(
            err,
            BatchError::Operation {
                entry: Entry::Data(0),
                code: libc::EFBIG,
                ..
            }
        ));
        assert_eq!(exec.facility().counters().live(), 0);
    }

    #[test]
    fn test_failing_barrier_fails_batch() {
        let mut entry_errnos = HashMap::new();
        entry_errnos.insert(Entry::Barrier, libc::EIO);
        let exec = executor(MemoryFacility::new().with_faults(Faults {
            entry_errnos,
            ..Faults::default()
        }));
        let file = exec.facility().create_file(b"").unwrap();

        let err = exec.batch_write(&[], file.as_fd()).unwrap_err();
        assert!(matches!(
            err,
            BatchError::Operation {
                entry: Entry::Barrier,
                ..
            }
        ));
    }

    #[test]
    fn test_invalid_handle_write() {
        let exec = executor(MemoryFacility::new());
        let unregistered = MemoryFacility::new().create_file(b"").unwrap();

        let err = exec
            .batch_write(&[WriteRequest::new(b"a", 0)], unregistered.as_fd())
            .unwrap_err();
        assert!(matches!(
            err,
            BatchError::Submission { .. } | BatchError::Operation { .. }
        ));
        assert_eq!(err.code(), Some(libc::EBADF));
        assert_eq!(exec.facility().counters().opened(), 1);
        assert_eq!(exec.facility().counters().closed(), 1);
    }

    #[test]
    fn test_release_is_idempotent() {
        let facility = MemoryFacility::new();
        let queue = facility.open(1).unwrap();
        let mut guard = QueueGuard::new(queue);

        guard.release();
        assert!(guard.is_released());
        guard.release();
        drop(guard);

        assert_eq!(facility.counters().opened(), 1);
        assert_eq!(facility.counters().closed(), 1);
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let facility = MemoryFacility::new();
        {
            let _guard = QueueGuard::new(facility.open(1).unwrap());
            assert_eq!(facility.counters().live(), 1);
        }
        assert_eq!(facility.counters().live(), 0);
    }

    #[test]
    fn test_errors_carry_batch_kind() {
        let exec = executor(MemoryFacility::new().with_faults(Faults {
            submit_errno: Some(libc::EAGAIN),
            ..Faults::default()
        }));
        let file = exec.facility().create_file(b"abcd").unwrap();

        let write_err = exec
            .batch_write(&[WriteRequest::new(b"a", 0)], file.as_fd())
            .unwrap_err();
        let mut buf = [0u8; 1];
        let read_err = exec
            .batch_read(&mut [ReadRequest::new(&mut buf, 0)], file.as_fd())
            .unwrap_err();

        assert_eq!(write_err.kind(), BatchKind::Write);
        assert_eq!(read_err.kind(), BatchKind::Read);
    }
}
