//! Bounded chunk queue that evicts the oldest entry on overflow.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use tracing::debug;

use crate::chunk::AudioChunk;

/// Single producer, single consumer. The producer keeps a receiver clone so
/// it can pop the stalest chunk itself when the channel is full.
pub struct ChunkQueue {
    tx: Sender<AudioChunk>,
    rx: Receiver<AudioChunk>,
    capacity: usize,
    overflows: AtomicU64,
}

impl ChunkQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = bounded(capacity);
        Self {
            tx,
            rx,
            capacity,
            overflows: AtomicU64::new(0),
        }
    }

    /// Enqueue, evicting the oldest chunk(s) if full. Returns the number evicted.
    pub fn push(&self, chunk: AudioChunk) -> usize {
        let mut chunk = chunk;
        let mut evicted = 0;
        loop {
            match self.tx.try_send(chunk) {
                Ok(()) => return evicted,
                Err(TrySendError::Full(c)) => {
                    if let Ok(stale) = self.rx.try_recv() {
                        evicted += 1;
                        self.overflows.fetch_add(1, Ordering::Relaxed);
                        debug!(dropped_seq = stale.seq(), "queue full; evicted oldest chunk");
                    }
                    chunk = c;
                }
                // both ends live in self
                Err(TrySendError::Disconnected(_)) => return evicted,
            }
        }
    }

    pub fn pop_timeout(&self, timeout: Duration) -> Option<AudioChunk> {
        self.rx.recv_timeout(timeout).ok()
    }

    pub fn try_pop(&self) -> Option<AudioChunk> {
        self.rx.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn overflow_count(&self) -> u64 {
        self.overflows.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(seq: u64) -> AudioChunk {
        AudioChunk::new(seq, vec![0.0; 4], None)
    }

    #[test]
    fn fifo_when_not_full() {
        let q = ChunkQueue::new(4);
        for s in 0..3 {
            assert_eq!(q.push(chunk(s)), 0);
        }
        let order: Vec<u64> = std::iter::from_fn(|| q.try_pop()).map(|c| c.seq()).collect();
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[test]
    fn overflow_evicts_oldest() {
        let q = ChunkQueue::new(3);
        for s in 0..10 {
            q.push(chunk(s));
            assert!(q.len() <= q.capacity());
        }
        assert_eq!(q.overflow_count(), 7);
        let order: Vec<u64> = std::iter::from_fn(|| q.try_pop()).map(|c| c.seq()).collect();
        assert_eq!(order, vec![7, 8, 9]);
    }

    #[test]
    fn pop_times_out_when_empty() {
        let q = ChunkQueue::new(2);
        assert!(q.pop_timeout(Duration::from_millis(5)).is_none());
    }
}
