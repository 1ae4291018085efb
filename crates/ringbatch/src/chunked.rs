//! Splitting long request lists into consecutive batches.
//!
//! A ring has a bounded size, so a long list of requests is submitted as a
//! series of independent batches of at most
//! [`BatchConfig::max_entries`](crate::config::BatchConfig) requests. Each
//! write chunk carries its own barrier. Chunks run one after another and the
//! first failing chunk stops the sequence.

use crate::config::BatchConfig;
use crate::error::BatchError;
use crate::executor::BatchExecutor;
use crate::facility::Facility;
use crate::request::{BatchOutcome, ReadRequest, WriteRequest};
use std::os::fd::BorrowedFd;
use thiserror::Error;
use tracing::debug;

/// A chunk failed after earlier chunks had completed
#[derive(Debug, Error)]
#[error("chunk {failed_chunk} failed after {completed_requests} requests completed: {source}")]
pub struct ChunkedError {
    /// Index of the failing chunk (number of chunks that completed)
    pub failed_chunk: usize,
    /// Requests covered by the completed chunks
    pub completed_requests: usize,
    /// The failing chunk's error
    #[source]
    pub source: BatchError,
}

impl<F: Facility> BatchExecutor<F> {
    /// Write `requests` as consecutive batches of at most
    /// `config.max_entries` requests, each followed by its own fsync.
    ///
    /// An empty slice still runs one barrier-only batch.
    ///
    /// # Errors
    ///
    /// Returns [`ChunkedError`] for the first chunk that fails. Earlier
    /// chunks are durable at that point; later chunks are never submitted.
    pub fn write_chunked(
        &self,
        requests: &[WriteRequest<'_>],
        fd: BorrowedFd<'_>,
        config: &BatchConfig,
    ) -> Result<BatchOutcome, ChunkedError> {
        self.write_chunked_with(requests, fd, config, |_, _, _| {})
    }

    /// [`write_chunked`](Self::write_chunked), calling `on_chunk` with the
    /// chunk index, its requests and its outcome after each chunk is durable.
    ///
    /// A barrier-only batch for an empty slice does not call `on_chunk`.
    ///
    /// # Errors
    ///
    /// As for [`write_chunked`](Self::write_chunked).
    pub fn write_chunked_with<P>(
        &self,
        requests: &[WriteRequest<'_>],
        fd: BorrowedFd<'_>,
        config: &BatchConfig,
        mut on_chunk: P,
    ) -> Result<BatchOutcome, ChunkedError>
    where
        P: FnMut(usize, &[WriteRequest<'_>], &BatchOutcome),
    {
        if requests.is_empty() {
            return self.batch_write(requests, fd).map_err(|source| ChunkedError {
                failed_chunk: 0,
                completed_requests: 0,
                source,
            });
        }

        let chunk_size = config.effective_max_entries();
        let mut outcome = BatchOutcome::default();
        for (chunk_index, chunk) in requests.chunks(chunk_size).enumerate() {
            debug!(chunk_index, requests = chunk.len(), "writing chunk");
            let chunk_outcome = self.batch_write(chunk, fd).map_err(|source| ChunkedError {
                failed_chunk: chunk_index,
                completed_requests: outcome.len(),
                source,
            })?;
            on_chunk(chunk_index, chunk, &chunk_outcome);
            outcome.extend(chunk_outcome);
        }
        Ok(outcome)
    }

    /// Read `requests` as consecutive batches of at most
    /// `config.max_entries` requests.
    ///
    /// # Errors
    ///
    /// Returns [`ChunkedError`] for the first chunk that fails. Buffers of
    /// earlier chunks are filled; later buffers are untouched.
    pub fn read_chunked(
        &self,
        requests: &mut [ReadRequest<'_>],
        fd: BorrowedFd<'_>,
        config: &BatchConfig,
    ) -> Result<BatchOutcome, ChunkedError> {
        let chunk_size = config.effective_max_entries();
        let mut outcome = BatchOutcome::default();
        for (chunk_index, chunk) in requests.chunks_mut(chunk_size).enumerate() {
            debug!(chunk_index, requests = chunk.len(), "reading chunk");
            let chunk_outcome = self.batch_read(chunk, fd).map_err(|source| ChunkedError {
                failed_chunk: chunk_index,
                completed_requests: outcome.len(),
                source,
            })?;
            outcome.extend(chunk_outcome);
        }
        Ok(outcome)
    }
}
