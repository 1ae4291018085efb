//! In-memory facility for exercising batch logic without a kernel ring.
//!
//! Files live in memory and are identified by the descriptor of a
//! `/dev/null` handle, so callers can hand the executor a real
//! [`BorrowedFd`]. Operations run when the queue is submitted; their
//! completions are then handed out one per [`SubmissionQueue::wait_one`]
//! call in the configured [`CompletionOrder`].
//!
//! [`Faults`] injects failures at every stage of a batch.

use crate::error::Entry;
use crate::facility::{Completion, Facility, QueueCounters, QueueFull, SubmissionQueue};
use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::trace;

/// Order in which submitted operations complete
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompletionOrder {
    /// Same order as submission
    #[default]
    Submission,
    /// Reverse of submission, so the barrier completes first
    Reversed,
}

/// Failure injection for an in-memory facility
#[derive(Debug, Clone, Default)]
pub struct Faults {
    /// `open` fails with this errno
    pub open_errno: Option<i32>,
    /// Queues hand out at most this many slots regardless of capacity
    pub slot_limit: Option<usize>,
    /// `submit` fails with this errno
    pub submit_errno: Option<i32>,
    /// `submit` accepts at most this many entries
    pub submit_limit: Option<usize>,
    /// `wait_one` fails with `EINTR` after this many successful waits
    pub wait_fails_after: Option<usize>,
    /// Entries that complete with the given errno instead of running
    pub entry_errnos: HashMap<Entry, i32>,
    /// Data operations transfer at most this many bytes
    pub transfer_limit: Option<usize>,
}

/// Kind of a prepared operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    /// Positional write
    Write,
    /// Positional read
    Read,
    /// Whole-file fsync
    Barrier,
}

/// Record of one prepared entry, in preparation order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreparedOp {
    /// Operation kind
    pub kind: OpKind,
    /// Target descriptor
    pub fd: RawFd,
    /// File offset (zero for barriers)
    pub offset: i64,
    /// Buffer length (zero for barriers)
    pub len: usize,
    /// Entry the operation was prepared for
    pub entry: Entry,
}

/// Activity counters of an in-memory facility
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    /// Number of `submit` calls that succeeded
    pub submit_calls: usize,
    /// Entries accepted by `submit`
    pub submitted: usize,
    /// Completions returned by `wait_one`
    pub awaited: usize,
    /// Completions dropped at queue teardown
    pub discarded: usize,
}

#[derive(Debug, Default)]
struct FileState {
    data: Vec<u8>,
    writable: bool,
    syncs: usize,
}

#[derive(Debug, Default)]
struct State {
    files: HashMap<RawFd, FileState>,
    prepared: Vec<PreparedOp>,
    stats: MemoryStats,
}

/// Largest size an in-memory file may grow to; writes past it fail with `EFBIG`
pub const MAX_FILE_SIZE: usize = 1 << 30;

/// Per-operation transfer cap, matching the kernel's `MAX_RW_COUNT`
pub const MAX_RW_COUNT: usize = 0x7fff_f000;

fn transfer_len(requested: usize, limit: usize) -> usize {
    requested.min(limit).min(MAX_RW_COUNT)
}

fn completion_result(len: usize) -> i32 {
    i32::try_from(len).unwrap_or(i32::MAX)
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory facility
#[derive(Debug, Clone, Default)]
pub struct MemoryFacility {
    state: Arc<Mutex<State>>,
    counters: Arc<QueueCounters>,
    faults: Faults,
    order: CompletionOrder,
}

impl MemoryFacility {
    /// Create a facility with no files and no faults
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the completion order
    #[must_use]
    pub fn with_order(mut self, order: CompletionOrder) -> Self {
        self.order = order;
        self
    }

    /// Set the injected faults
    #[must_use]
    pub fn with_faults(mut self, faults: Faults) -> Self {
        self.faults = faults;
        self
    }

    /// Queue allocation counters
    #[must_use]
    pub fn counters(&self) -> &Arc<QueueCounters> {
        &self.counters
    }

    /// Register a read-write file with the given contents.
    ///
    /// # Errors
    ///
    /// Returns an error if `/dev/null` cannot be opened for the handle.
    pub fn create_file(&self, contents: &[u8]) -> io::Result<MemoryFile> {
        self.register(contents, true)
    }

    /// Register a file that rejects writes with `EBADF`.
    ///
    /// # Errors
    ///
    /// Returns an error if `/dev/null` cannot be opened for the handle.
    pub fn create_read_only(&self, contents: &[u8]) -> io::Result<MemoryFile> {
        self.register(contents, false)
    }

    fn register(&self, contents: &[u8], writable: bool) -> io::Result<MemoryFile> {
        let handle = File::open("/dev/null")?;
        lock(&self.state).files.insert(
            handle.as_raw_fd(),
            FileState {
                data: contents.to_vec(),
                writable,
                syncs: 0,
            },
        );
        Ok(MemoryFile {
            handle,
            state: Arc::clone(&self.state),
        })
    }

    /// Current contents of `file`
    #[must_use]
    pub fn contents(&self, file: &MemoryFile) -> Vec<u8> {
        lock(&self.state)
            .files
            .get(&file.handle.as_raw_fd())
            .map(|f| f.data.clone())
            .unwrap_or_default()
    }

    /// Number of barriers that have completed against `file`
    #[must_use]
    pub fn syncs(&self, file: &MemoryFile) -> usize {
        lock(&self.state)
            .files
            .get(&file.handle.as_raw_fd())
            .map_or(0, |f| f.syncs)
    }

    /// Prepared entries in preparation order across all queues
    #[must_use]
    pub fn prepared(&self) -> Vec<PreparedOp> {
        lock(&self.state).prepared.clone()
    }

    /// Activity counters
    #[must_use]
    pub fn stats(&self) -> MemoryStats {
        lock(&self.state).stats
    }
}

impl Facility for MemoryFacility {
    type Queue<'buf> = MemoryQueue<'buf>;

    fn open<'buf>(&self, capacity: u32) -> io::Result<MemoryQueue<'buf>> {
        if let Some(errno) = self.faults.open_errno {
            return Err(io::Error::from_raw_os_error(errno));
        }
        if capacity == 0 {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }

        let slots = self
            .faults
            .slot_limit
            .map_or(capacity as usize, |limit| limit.min(capacity as usize));

        self.counters.record_open();
        Ok(MemoryQueue {
            state: Arc::clone(&self.state),
            counters: Arc::clone(&self.counters),
            faults: self.faults.clone(),
            order: self.order,
            slots,
            pending: Vec::new(),
            ready: VecDeque::new(),
            waits: 0,
        })
    }
}

/// A file registered with a [`MemoryFacility`].
///
/// Dropping it unregisters the file.
#[derive(Debug)]
pub struct MemoryFile {
    handle: File,
    state: Arc<Mutex<State>>,
}

impl AsFd for MemoryFile {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.handle.as_fd()
    }
}

impl Drop for MemoryFile {
    fn drop(&mut self) {
        lock(&self.state).files.remove(&self.handle.as_raw_fd());
    }
}

enum PendingOp<'buf> {
    Write {
        fd: RawFd,
        buf: &'buf [u8],
        offset: i64,
        token: u64,
    },
    Read {
        fd: RawFd,
        buf: &'buf mut [u8],
        offset: i64,
        token: u64,
    },
    Barrier {
        fd: RawFd,
        token: u64,
    },
}

impl PendingOp<'_> {
    fn token(&self) -> u64 {
        match self {
            PendingOp::Write { token, .. }
            | PendingOp::Read { token, .. }
            | PendingOp::Barrier { token, .. } => *token,
        }
    }
}

/// Queue handed out by [`MemoryFacility`]
pub struct MemoryQueue<'buf> {
    state: Arc<Mutex<State>>,
    counters: Arc<QueueCounters>,
    faults: Faults,
    order: CompletionOrder,
    slots: usize,
    pending: Vec<PendingOp<'buf>>,
    ready: VecDeque<Completion>,
    waits: usize,
}

impl<'buf> MemoryQueue<'buf> {
    fn push(&mut self, op: PendingOp<'buf>, record: PreparedOp) -> Result<(), QueueFull> {
        if self.pending.len() >= self.slots {
            return Err(QueueFull);
        }
        lock(&self.state).prepared.push(record);
        self.pending.push(op);
        Ok(())
    }

    fn execute(&self, state: &mut State, op: PendingOp<'buf>) -> i32 {
        let token = op.token();
        if let Some(errno) = self.faults.entry_errnos.get(&Entry::from_token(token)) {
            return -errno;
        }

        let limit = self.faults.transfer_limit.unwrap_or(usize::MAX);
        match op {
            PendingOp::Write {
                fd, buf, offset, ..
            } => {
                let Some(file) = state.files.get_mut(&fd) else {
                    return -libc::EBADF;
                };
                if !file.writable {
                    return -libc::EBADF;
                }
                let Ok(start) = usize::try_from(offset) else {
                    return -libc::EINVAL;
                };
                let len = transfer_len(buf.len(), limit);
                let end = match start.checked_add(len) {
                    Some(end) if end <= MAX_FILE_SIZE => end,
                    _ => return -libc::EFBIG,
                };
                if file.data.len() < end {
                    file.data.resize(end, 0);
                }
                file.data[start..end].copy_from_slice(&buf[..len]);
                completion_result(len)
            }
            PendingOp::Read {
                fd, buf, offset, ..
            } => {
                let Some(file) = state.files.get(&fd) else {
                    return -libc::EBADF;
                };
                let Ok(start) = usize::try_from(offset) else {
                    return -libc::EINVAL;
                };
                let available = file.data.len().saturating_sub(start);
                let len = transfer_len(buf.len(), limit).min(available);
                if len > 0 {
                    buf[..len].copy_from_slice(&file.data[start..start + len]);
                }
                completion_result(len)
            }
            PendingOp::Barrier { fd, .. } => match state.files.get_mut(&fd) {
                Some(file) => {
                    file.syncs += 1;
                    0
                }
                None => -libc::EBADF,
            },
        }
    }
}

impl<'buf> SubmissionQueue<'buf> for MemoryQueue<'buf> {
    unsafe fn prepare_write(
        &mut self,
        fd: BorrowedFd<'buf>,
        buf: &'buf [u8],
        offset: i64,
        token: u64,
    ) -> Result<(), QueueFull> {
        let fd = fd.as_raw_fd();
        let record = PreparedOp {
            kind: OpKind::Write,
            fd,
            offset,
            len: buf.len(),
            entry: Entry::from_token(token),
        };
        self.push(
            PendingOp::Write {
                fd,
                buf,
                offset,
                token,
            },
            record,
        )
    }

    unsafe fn prepare_read(
        &mut self,
        fd: BorrowedFd<'buf>,
        buf: &'buf mut [u8],
        offset: i64,
        token: u64,
    ) -> Result<(), QueueFull> {
        let fd = fd.as_raw_fd();
        let record = PreparedOp {
            kind: OpKind::Read,
            fd,
            offset,
            len: buf.len(),
            entry: Entry::from_token(token),
        };
        self.push(
            PendingOp::Read {
                fd,
                buf,
                offset,
                token,
            },
            record,
        )
    }

    fn prepare_barrier(&mut self, fd: BorrowedFd<'buf>, token: u64) -> Result<(), QueueFull> {
        let fd = fd.as_raw_fd();
        let record = PreparedOp {
            kind: OpKind::Barrier,
            fd,
            offset: 0,
            len: 0,
            entry: Entry::from_token(token),
        };
        self.push(PendingOp::Barrier { fd, token }, record)
    }

    fn submit(&mut self) -> io::Result<usize> {
        if let Some(errno) = self.faults.submit_errno {
            return Err(io::Error::from_raw_os_error(errno));
        }

        let count = self
            .faults
            .submit_limit
            .map_or(self.pending.len(), |limit| limit.min(self.pending.len()));
        let batch: Vec<_> = self.pending.drain(..count).collect();

        let state = Arc::clone(&self.state);
        let mut state = lock(&state);
        let mut completions: Vec<Completion> = batch
            .into_iter()
            .map(|op| {
                let token = op.token();
                let result = self.execute(&mut state, op);
                Completion { token, result }
            })
            .collect();
        if self.order == CompletionOrder::Reversed {
            completions.reverse();
        }
        self.ready.extend(completions);

        state.stats.submit_calls += 1;
        state.stats.submitted += count;
        Ok(count)
    }

    fn wait_one(&mut self) -> io::Result<Completion> {
        if self
            .faults
            .wait_fails_after
            .is_some_and(|after| self.waits >= after)
        {
            return Err(io::Error::from_raw_os_error(libc::EINTR));
        }

        let completion = self
            .ready
            .pop_front()
            .ok_or_else(|| io::Error::other("no submitted operations to wait for"))?;
        self.waits += 1;
        lock(&self.state).stats.awaited += 1;
        trace!(token = completion.token, result = completion.result, "memory completion");
        Ok(completion)
    }

    fn in_flight(&self) -> usize {
        self.ready.len()
    }
}

impl Drop for MemoryQueue<'_> {
    fn drop(&mut self) {
        lock(&self.state).stats.discarded += self.ready.len();
        self.counters.record_close();
    }
}
