//! Request records and batch outcomes.

/// Largest byte count a single submission entry can describe.
pub const MAX_REQUEST_LEN: usize = u32::MAX as usize;

/// A write of `buffer` at `offset`.
///
/// The buffer is borrowed for the duration of the batch call. Offset `-1`
/// writes at the file's current position, as the kernel interprets it.
#[derive(Debug, Clone, Copy)]
pub struct WriteRequest<'a> {
    /// Bytes to write
    pub buffer: &'a [u8],
    /// File offset
    pub offset: i64,
}

impl<'a> WriteRequest<'a> {
    /// Create a write request
    #[must_use]
    pub fn new(buffer: &'a [u8], offset: i64) -> Self {
        Self { buffer, offset }
    }

    /// Number of bytes to write
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Whether the request writes nothing
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

/// A read into `buffer` from `offset`.
///
/// The capacity is the buffer's length. The buffer is mutably borrowed for
/// the duration of the batch call.
#[derive(Debug)]
pub struct ReadRequest<'a> {
    /// Destination buffer
    pub buffer: &'a mut [u8],
    /// File offset
    pub offset: i64,
}

impl<'a> ReadRequest<'a> {
    /// Create a read request
    #[must_use]
    pub fn new(buffer: &'a mut [u8], offset: i64) -> Self {
        Self { buffer, offset }
    }

    /// Maximum number of bytes to read
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }
}

/// Result of a successful batch.
///
/// Holds the byte count each data entry reported, in request order. Short
/// transfers are not errors; use [`BatchOutcome::short_requests`] to find
/// them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    transferred: Vec<usize>,
}

impl BatchOutcome {
    pub(crate) fn with_len(len: usize) -> Self {
        Self {
            transferred: vec![0; len],
        }
    }

    pub(crate) fn record(&mut self, index: usize, bytes: usize) {
        if let Some(slot) = self.transferred.get_mut(index) {
            *slot = bytes;
        }
    }

    pub(crate) fn extend(&mut self, other: BatchOutcome) {
        self.transferred.extend(other.transferred);
    }

    /// Number of requests covered
    #[must_use]
    pub fn len(&self) -> usize {
        self.transferred.len()
    }

    /// Whether the batch had no data requests
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.transferred.is_empty()
    }

    /// Bytes transferred for the request at `index`
    #[must_use]
    pub fn bytes(&self, index: usize) -> Option<usize> {
        self.transferred.get(index).copied()
    }

    /// Per-request byte counts in request order
    #[must_use]
    pub fn transferred(&self) -> &[usize] {
        &self.transferred
    }

    /// Total bytes transferred across the batch
    #[must_use]
    pub fn total(&self) -> u64 {
        self.transferred.iter().map(|&n| n as u64).sum()
    }

    /// Indices whose transfer was shorter than `expected[index]`.
    ///
    /// `expected` is usually the request lengths (writes) or capacities
    /// (reads) in request order.
    #[must_use]
    pub fn short_requests(&self, expected: &[usize]) -> Vec<usize> {
        self.transferred
            .iter()
            .zip(expected)
            .enumerate()
            .filter(|(_, (got, want))| got < want)
            .map(|(index, _)| index)
            .collect()
    }
}
