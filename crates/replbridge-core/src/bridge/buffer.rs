//! Bounded byte buffer between the serial reader and the frame sender
//!
//! Pushing never blocks: bytes that do not fit are dropped. The single
//! consumer waits asynchronously with a timeout.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;

/// Bounded FIFO of serial bytes with an async consumer
pub struct StreamBuffer {
    bytes: Mutex<VecDeque<u8>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
}

impl StreamBuffer {
    /// Empty buffer holding at most `capacity` bytes
    pub fn new(capacity: usize) -> Self {
        Self {
            bytes: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    fn bytes(&self) -> MutexGuard<'_, VecDeque<u8>> {
        self.bytes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Maximum bytes held
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes currently buffered
    pub fn len(&self) -> usize {
        self.bytes().len()
    }

    /// Whether nothing is buffered
    pub fn is_empty(&self) -> bool {
        self.bytes().is_empty()
    }

    /// Total bytes discarded because the buffer was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Append as much of `data` as fits and return how many bytes were kept
    pub fn push(&self, data: &[u8]) -> usize {
        let accepted = {
            let mut bytes = self.bytes();
            let room = self.capacity.saturating_sub(bytes.len());
            let n = room.min(data.len());
            bytes.extend(data[..n].iter().copied());
            n
        };
        if accepted < data.len() {
            let lost = (data.len() - accepted) as u64;
            self.dropped.fetch_add(lost, Ordering::Relaxed);
            tracing::trace!("stream buffer full, dropped {} bytes", lost);
        }
        if accepted > 0 {
            self.notify.notify_one();
        }
        accepted
    }

    /// Take up to `max` buffered bytes without waiting
    pub fn take(&self, max: usize) -> Vec<u8> {
        let mut bytes = self.bytes();
        let n = max.min(bytes.len());
        bytes.drain(..n).collect()
    }

    /// Discard everything buffered
    pub fn clear(&self) {
        self.bytes().clear();
    }

    /// Wait up to `wait` for data, then take everything already buffered up to `max`.
    ///
    /// Returns an empty vector on timeout.
    pub async fn recv(&self, max: usize, wait: Duration) -> Vec<u8> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let chunk = self.take(max);
            if !chunk.is_empty() {
                return chunk;
            }
            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                return self.take(max);
            }
        }
    }
}
