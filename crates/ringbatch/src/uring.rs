//! io_uring-backed facility (Linux-only).
//!
//! Each queue owns one kernel ring sized to its batch. Dropping a queue waits
//! for every submitted operation to complete before the ring is released, so
//! a buffer is never written or read by the kernel after its borrow ends.

use crate::facility::{Completion, Facility, QueueCounters, QueueFull, SubmissionQueue};
use crate::request::MAX_REQUEST_LEN;
use io_uring::{IoUring, Probe, opcode, squeue, types};
use std::io;
use std::marker::PhantomData;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::sync::Arc;
use tracing::{debug, warn};

/// Kernel limit on submission queue entries per ring
pub const MAX_RING_ENTRIES: u32 = 32768;

/// Facility that opens one io_uring instance per queue.
#[derive(Debug, Clone, Default)]
pub struct UringFacility {
    counters: Arc<QueueCounters>,
}

impl UringFacility {
    /// Create a new facility
    ///
    /// # Examples
    /// ```no_run
    /// # #[cfg(target_os = "linux")]
    /// # {
    /// use ringbatch::facility::Facility;
    /// use ringbatch::uring::UringFacility;
    ///
    /// let facility = UringFacility::new();
    /// let queue = facility.open(8).unwrap();
    /// # }
    /// ```
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue allocation counters
    #[must_use]
    pub fn counters(&self) -> &Arc<QueueCounters> {
        &self.counters
    }

    /// Check whether this process can create an io_uring instance.
    ///
    /// Seccomp policies in containers commonly block `io_uring_setup`.
    #[must_use]
    pub fn is_available() -> bool {
        IoUring::new(1).is_ok()
    }
}

impl Facility for UringFacility {
    type Queue<'buf> = UringQueue<'buf>;

    fn open<'buf>(&self, capacity: u32) -> io::Result<UringQueue<'buf>> {
        let ring = IoUring::new(capacity)?;

        // Probe for supported operations
        let mut probe = Probe::new();
        ring.submitter().register_probe(&mut probe)?;

        for (code, name) in [
            (opcode::Read::CODE, "read"),
            (opcode::Write::CODE, "write"),
            (opcode::Fsync::CODE, "fsync"),
        ] {
            if !probe.is_supported(code) {
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    format!("io_uring opcode {name} not supported by kernel"),
                ));
            }
        }

        self.counters.record_open();
        Ok(UringQueue {
            ring,
            queued: 0,
            in_flight: 0,
            counters: Arc::clone(&self.counters),
            _buffers: PhantomData,
        })
    }
}

/// One io_uring instance holding the entries of a single batch.
pub struct UringQueue<'buf> {
    ring: IoUring,
    queued: usize,
    in_flight: usize,
    counters: Arc<QueueCounters>,
    _buffers: PhantomData<&'buf mut [u8]>,
}

impl UringQueue<'_> {
    /// Capacity of the submission ring
    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.ring.params().sq_entries()
    }

    fn push(&mut self, entry: &squeue::Entry) -> Result<(), QueueFull> {
        // SAFETY: Every pointer inside `entry` borrows for `'buf`, and the
        // queue drains all submitted operations before it is dropped.
        unsafe {
            self.ring.submission().push(entry).map_err(|_| QueueFull)?;
        }
        self.queued += 1;
        Ok(())
    }
}

impl<'buf> SubmissionQueue<'buf> for UringQueue<'buf> {
    unsafe fn prepare_write(
        &mut self,
        fd: BorrowedFd<'buf>,
        buf: &'buf [u8],
        offset: i64,
        token: u64,
    ) -> Result<(), QueueFull> {
        // Longer buffers become a short write; the executor rejects them first.
        let len = buf.len().min(MAX_REQUEST_LEN) as u32;
        let write_op = opcode::Write::new(types::Fd(fd.as_raw_fd()), buf.as_ptr(), len)
            .offset(offset as u64)
            .build()
            .user_data(token);
        self.push(&write_op)
    }

    unsafe fn prepare_read(
        &mut self,
        fd: BorrowedFd<'buf>,
        buf: &'buf mut [u8],
        offset: i64,
        token: u64,
    ) -> Result<(), QueueFull> {
        let len = buf.len().min(MAX_REQUEST_LEN) as u32;
        let read_op = opcode::Read::new(types::Fd(fd.as_raw_fd()), buf.as_mut_ptr(), len)
            .offset(offset as u64)
            .build()
            .user_data(token);
        self.push(&read_op)
    }

    fn prepare_barrier(&mut self, fd: BorrowedFd<'buf>, token: u64) -> Result<(), QueueFull> {
        let fsync_op = opcode::Fsync::new(types::Fd(fd.as_raw_fd()))
            .build()
            .user_data(token);
        self.push(&fsync_op)
    }

    fn submit(&mut self) -> io::Result<usize> {
        let submitted = self.ring.submit()?;
        self.queued = self.queued.saturating_sub(submitted);
        self.in_flight += submitted;
        Ok(submitted)
    }

    fn wait_one(&mut self) -> io::Result<Completion> {
        loop {
            if let Some(cqe) = self.ring.completion().next() {
                self.in_flight = self.in_flight.saturating_sub(1);
                return Ok(Completion {
                    token: cqe.user_data(),
                    result: cqe.result(),
                });
            }

            if self.in_flight == 0 {
                return Err(io::Error::other("no submitted operations to wait for"));
            }

            // Also submits anything still queued; those entries are in flight too
            let submitted = self.ring.submit_and_wait(1)?;
            self.queued = self.queued.saturating_sub(submitted);
            self.in_flight += submitted;
        }
    }

    fn in_flight(&self) -> usize {
        self.in_flight
    }
}

impl Drop for UringQueue<'_> {
    fn drop(&mut self) {
        if self.in_flight > 0 {
            debug!(
                outstanding = self.in_flight,
                "discarding outstanding completions before ring teardown"
            );
        }

        while self.in_flight > 0 {
            match self.wait_one() {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!(
                        outstanding = self.in_flight,
                        "failed to drain ring before teardown: {}", e
                    );
                    break;
                }
            }
        }

        self.counters.record_close();
    }
}
