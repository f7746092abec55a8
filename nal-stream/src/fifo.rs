//! Sender FIFO (§4.2): a fixed-capacity queue of NAL descriptors, one
//! mutex guarding the queue and the free-slot count, one condvar signalled
//! on enqueue and on shutdown.

use crate::error::{Result, StreamError};
use crate::nal::{CallbackStatus, NalDescriptor};
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

struct FifoState<T> {
    queue: VecDeque<NalDescriptor<T>>,
    capacity: usize,
    shutdown: bool,
}

pub struct NalFifo<T> {
    state: Mutex<FifoState<T>>,
    not_empty: Condvar,
}

impl<T> NalFifo<T> {
    pub fn new(capacity: usize) -> Self {
        NalFifo {
            state: Mutex::new(FifoState {
                queue: VecDeque::with_capacity(capacity),
                capacity,
                shutdown: false,
            }),
            not_empty: Condvar::new(),
        }
    }

    /// Copies the descriptor into a free slot and signals the condvar.
    /// Errors with `QueueFull` if no slot is free.
    pub fn enqueue(&self, descriptor: NalDescriptor<T>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.queue.len() >= state.capacity {
            return Err(StreamError::QueueFull);
        }
        state.queue.push_back(descriptor);
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Blocks on the condvar until a descriptor is available or shutdown
    /// is requested. Returns `None` only once shutdown has drained the
    /// queue — matching the packetizer loop's exit condition.
    pub fn dequeue_blocking(&self) -> Option<NalDescriptor<T>> {
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(desc) = state.queue.pop_front() {
                return Some(desc);
            }
            if state.shutdown {
                return None;
            }
            state = self.not_empty.wait(state).unwrap();
        }
    }

    /// Backs off for up to `timeout` before the governor's retry of an
    /// unwritable socket — used specifically when there IS a backlog, so
    /// it must not skip the wait just because the queue is non-empty. Woken
    /// early by `shutdown`, but not by a plain `enqueue`.
    pub fn wait_timeout(&self, timeout: Duration) {
        let state = self.state.lock().unwrap();
        if !state.shutdown {
            let _ = self.not_empty.wait_timeout(state, timeout).unwrap();
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of queued bytes, used by the bitrate governor to decide how
    /// many tail descriptors to mark for drop. Each entry is
    /// `(queue_index, byte_length)`, oldest first within its NRI tier.
    pub fn snapshot_sizes_by_nri(&self) -> [Vec<(usize, usize)>; 4] {
        let state = self.state.lock().unwrap();
        let mut by_nri: [Vec<(usize, usize)>; 4] = Default::default();
        for (idx, desc) in state.queue.iter().enumerate() {
            if desc.force_drop {
                continue;
            }
            by_nri[desc.nri() as usize].push((idx, desc.len()));
        }
        by_nri
    }

    /// Marks descriptors at the given queue indices for drop (used by the
    /// governor after `snapshot_sizes_by_nri`).
    pub fn mark_drop(&self, indices: &[usize]) {
        let mut state = self.state.lock().unwrap();
        for &idx in indices {
            if let Some(desc) = state.queue.get_mut(idx) {
                desc.force_drop = true;
            }
        }
    }

    pub fn total_bytes(&self) -> usize {
        self.state.lock().unwrap().queue.iter().map(|d| d.len()).sum()
    }

    /// Drains every slot, invoking `on_nal` for each descriptor's NAL
    /// callback and `on_au` once per distinct AU timestamp among them.
    pub fn flush(
        &self,
        mut on_nal: impl FnMut(&NalDescriptor<T>, CallbackStatus),
        mut on_au: impl FnMut(&NalDescriptor<T>, CallbackStatus),
    ) {
        let mut state = self.state.lock().unwrap();
        let drained: Vec<_> = state.queue.drain(..).collect();
        drop(state);

        let mut last_au_ts: Option<u64> = None;
        for desc in &drained {
            on_nal(desc, CallbackStatus::Cancelled);
            if last_au_ts != Some(desc.au_timestamp_us) {
                on_au(desc, CallbackStatus::Cancelled);
                last_au_ts = Some(desc.au_timestamp_us);
            }
        }
    }

    /// Signals shutdown and wakes any blocked `dequeue_blocking` caller.
    pub fn shutdown(&self) {
        let mut state = self.state.lock().unwrap();
        state.shutdown = true;
        drop(state);
        self.not_empty.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn desc(au_ts: u64, last_in_au: bool) -> NalDescriptor<u32> {
        NalDescriptor::new(Arc::from(&[0x65u8, 1, 2][..]), au_ts, au_ts, last_in_au, 0, 0)
    }

    #[test]
    fn enqueue_dequeue_fifo_order() {
        let fifo = NalFifo::new(4);
        fifo.enqueue(desc(1, false)).unwrap();
        fifo.enqueue(desc(2, true)).unwrap();

        let first = fifo.dequeue_blocking().unwrap();
        assert_eq!(first.au_timestamp_us, 1);
        let second = fifo.dequeue_blocking().unwrap();
        assert_eq!(second.au_timestamp_us, 2);
    }

    #[test]
    fn enqueue_errors_when_full() {
        let fifo = NalFifo::new(1);
        fifo.enqueue(desc(1, false)).unwrap();
        assert!(matches!(fifo.enqueue(desc(2, false)), Err(StreamError::QueueFull)));
    }

    #[test]
    fn shutdown_wakes_blocked_dequeue() {
        let fifo = Arc::new(NalFifo::<u32>::new(4));
        let fifo2 = fifo.clone();
        let handle = std::thread::spawn(move || fifo2.dequeue_blocking());
        std::thread::sleep(Duration::from_millis(20));
        fifo.shutdown();
        assert!(handle.join().unwrap().is_none());
    }

    #[test]
    fn flush_invokes_callbacks_once_per_au() {
        let fifo = NalFifo::new(4);
        fifo.enqueue(desc(1, false)).unwrap();
        fifo.enqueue(desc(1, true)).unwrap();
        fifo.enqueue(desc(2, true)).unwrap();

        let mut nal_calls = 0;
        let mut au_calls = 0;
        fifo.flush(
            |_, status| {
                assert_eq!(status, CallbackStatus::Cancelled);
                nal_calls += 1;
            },
            |_, _| au_calls += 1,
        );

        assert_eq!(nal_calls, 3);
        assert_eq!(au_calls, 2);
        assert!(fifo.is_empty());
    }

    #[test]
    fn mark_drop_sets_force_drop_flag() {
        let fifo = NalFifo::new(4);
        fifo.enqueue(desc(1, false)).unwrap();
        fifo.mark_drop(&[0]);
        let desc = fifo.dequeue_blocking().unwrap();
        assert!(desc.force_drop);
    }
}
