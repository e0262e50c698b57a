use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::buf::DatagramBuf;

/// Recommended capacity from the data model: `MAX_QUEUED_HANDSHAKES`.
pub const MAX_QUEUED_HANDSHAKES: usize = 4096;
/// Per-invocation burst size for the handshake worker.
pub const MAX_BURST_HANDSHAKES: usize = 8;

/// Bounded FIFO of handshake datagrams plus an idempotent wake signal for
/// the worker. The canonical shape from the design notes: a
/// `parking_lot::Mutex<VecDeque<_>>` for the bounded queue, and a
/// `tokio::sync::Notify` for the "poke" — `Notify::notify_one` coalesces
/// multiple pokes into a single pending wakeup, so concurrent producers
/// never pile up redundant worker runs.
pub struct HandshakeQueue {
    items: Mutex<VecDeque<DatagramBuf>>,
    capacity: usize,
    notify: Arc<Notify>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Overflow;

impl HandshakeQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity.min(256))),
            capacity,
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn notify_handle(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `true` once the queue is at least half full, the trigger for MAC2
    /// enforcement. Callers evaluate this at *processing* time (inside the
    /// worker, after dequeue), not at enqueue time — see the data model's
    /// resolved open question.
    pub fn is_at_or_above(&self, len: usize) -> bool {
        len >= self.capacity / 2
    }

    /// Append `buf` if there is room, signalling the worker. Returns
    /// `Overflow` (and hands `buf` back) if the queue is full; the caller
    /// drops it.
    pub fn enqueue(&self, buf: DatagramBuf) -> Result<(), Overflow> {
        let mut items = self.items.lock();
        if items.len() >= self.capacity {
            return Err(Overflow);
        }
        items.push_back(buf);
        drop(items);
        self.notify.notify_one();
        Ok(())
    }

    /// Dequeue up to `k` buffers, returning the length of the queue
    /// *before* this drain (the `under_load` basis) alongside the batch.
    /// If work remains after taking `k`, re-signal so the worker loops.
    pub fn drain_burst(&self, k: usize) -> (usize, Vec<DatagramBuf>) {
        let mut items = self.items.lock();
        let len_before = items.len();
        let take = k.min(len_before);
        let batch = items.drain(..take).collect();
        let remaining = items.len();
        drop(items);
        if remaining > 0 {
            self.notify.notify_one();
        }
        (len_before, batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buf() -> DatagramBuf {
        DatagramBuf::from_vec(vec![1, 0, 0, 0], None)
    }

    #[test]
    fn enqueue_respects_capacity() {
        let q = HandshakeQueue::new(2);
        assert!(q.enqueue(buf()).is_ok());
        assert!(q.enqueue(buf()).is_ok());
        assert_eq!(q.enqueue(buf()), Err(Overflow));
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn drain_burst_respects_k_and_resignals() {
        let q = HandshakeQueue::new(10);
        for _ in 0..5 {
            q.enqueue(buf()).unwrap();
        }
        let (len_before, batch) = q.drain_burst(3);
        assert_eq!(len_before, 5);
        assert_eq!(batch.len(), 3);
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn under_load_threshold_is_half_capacity() {
        let q = HandshakeQueue::new(100);
        assert!(!q.is_at_or_above(49));
        assert!(q.is_at_or_above(50));
    }
}
