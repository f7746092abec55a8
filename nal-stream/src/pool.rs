//! NAL buffer pool (§4.5): a reference-counted, size-class-growing arena
//! shared between a receiver and its resenders.
//!
//! Resenders hold a [`PoolHandle`] — an index into the arena, not a raw
//! pointer — per the "manual pointer graphs → pool + handles" design note.
//! `PoolHandle` behaves like a little `Arc`: cloning it bumps the entry's
//! reference count (one clone per resender the payload fans out to),
//! dropping it releases one reference. An entry is only reused by
//! `acquire` once its count has fallen back to zero.

use crate::error::{Result, StreamError};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

struct PoolEntry {
    buffer: Vec<u8>,
    capacity: usize,
    payload_len: usize,
    au_timestamp_us: u64,
    last_in_au: bool,
    use_count: AtomicI64,
}

pub struct NalBufferPool {
    entries: Mutex<Vec<PoolEntry>>,
    max_entries: usize,
    granule: usize,
}

impl NalBufferPool {
    pub fn new(max_entries: usize, granule: usize) -> Arc<Self> {
        Arc::new(NalBufferPool {
            entries: Mutex::new(Vec::new()),
            max_entries,
            granule,
        })
    }

    fn round_up(&self, min_size: usize) -> usize {
        min_size.div_ceil(self.granule) * self.granule
    }

    /// Copies `payload` into a reused, grown, or newly-appended entry.
    /// Errors with `QueueFull` when the pool is at capacity and every
    /// entry is still referenced.
    pub fn acquire(
        self: &Arc<Self>,
        payload: &[u8],
        au_timestamp_us: u64,
        last_in_au: bool,
    ) -> Result<PoolHandle> {
        let mut entries = self.entries.lock().unwrap();
        let min_size = payload.len();

        let idx = entries
            .iter()
            .position(|e| e.use_count.load(Ordering::Acquire) <= 0 && e.capacity >= min_size)
            .or_else(|| {
                entries
                    .iter()
                    .position(|e| e.use_count.load(Ordering::Acquire) <= 0)
            });

        let idx = match idx {
            Some(idx) => {
                let entry = &mut entries[idx];
                if entry.capacity < min_size {
                    let new_capacity = self.round_up(min_size);
                    entry.buffer.resize(new_capacity, 0);
                    entry.capacity = new_capacity;
                }
                idx
            }
            None => {
                if entries.len() >= self.max_entries {
                    return Err(StreamError::QueueFull);
                }
                let capacity = self.round_up(min_size);
                entries.push(PoolEntry {
                    buffer: vec![0u8; capacity],
                    capacity,
                    payload_len: 0,
                    au_timestamp_us: 0,
                    last_in_au: false,
                    use_count: AtomicI64::new(0),
                });
                entries.len() - 1
            }
        };

        let entry = &mut entries[idx];
        entry.buffer[..min_size].copy_from_slice(payload);
        entry.payload_len = min_size;
        entry.au_timestamp_us = au_timestamp_us;
        entry.last_in_au = last_in_au;
        entry.use_count.store(1, Ordering::Release);

        Ok(PoolHandle {
            pool: self.clone(),
            index: idx,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A reference into one pool arena entry. Clone to hand a resender its own
/// reference; the entry is freed for reuse once every clone has dropped.
pub struct PoolHandle {
    pool: Arc<NalBufferPool>,
    index: usize,
}

impl PoolHandle {
    pub fn payload(&self) -> Vec<u8> {
        let entries = self.pool.entries.lock().unwrap();
        let entry = &entries[self.index];
        entry.buffer[..entry.payload_len].to_vec()
    }

    pub fn au_timestamp_us(&self) -> u64 {
        self.pool.entries.lock().unwrap()[self.index].au_timestamp_us
    }

    pub fn last_in_au(&self) -> bool {
        self.pool.entries.lock().unwrap()[self.index].last_in_au
    }

    pub fn use_count(&self) -> i64 {
        self.pool.entries.lock().unwrap()[self.index]
            .use_count
            .load(Ordering::Acquire)
    }
}

impl Clone for PoolHandle {
    fn clone(&self) -> Self {
        let entries = self.pool.entries.lock().unwrap();
        entries[self.index].use_count.fetch_add(1, Ordering::AcqRel);
        PoolHandle {
            pool: self.pool.clone(),
            index: self.index,
        }
    }
}

impl Drop for PoolHandle {
    fn drop(&mut self) {
        let entries = self.pool.entries.lock().unwrap();
        entries[self.index].use_count.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_copies_payload() {
        let pool = NalBufferPool::new(4, 64);
        let handle = pool.acquire(&[1, 2, 3], 1000, true).unwrap();
        assert_eq!(handle.payload(), vec![1, 2, 3]);
        assert_eq!(handle.au_timestamp_us(), 1000);
        assert!(handle.last_in_au());
    }

    #[test]
    fn clone_increments_and_drop_decrements_use_count() {
        let pool = NalBufferPool::new(4, 64);
        let handle = pool.acquire(&[1, 2, 3], 1000, true).unwrap();
        assert_eq!(handle.use_count(), 1);
        let clone = handle.clone();
        assert_eq!(handle.use_count(), 2);
        drop(clone);
        assert_eq!(handle.use_count(), 1);
    }

    #[test]
    fn acquire_reuses_idle_entry_of_sufficient_capacity() {
        let pool = NalBufferPool::new(1, 64);
        let handle = pool.acquire(&[1, 2, 3], 1000, true).unwrap();
        drop(handle);
        let handle2 = pool.acquire(&[4, 5], 2000, false).unwrap();
        assert_eq!(pool.len(), 1);
        assert_eq!(handle2.payload(), vec![4, 5]);
    }

    #[test]
    fn acquire_grows_entry_when_undersized() {
        let pool = NalBufferPool::new(1, 8);
        let handle = pool.acquire(&[1u8; 4], 1, true).unwrap();
        drop(handle);
        let handle2 = pool.acquire(&[2u8; 20], 2, true).unwrap();
        assert_eq!(handle2.payload().len(), 20);
    }

    #[test]
    fn acquire_fails_when_pool_exhausted() {
        let pool = NalBufferPool::new(1, 64);
        let _handle = pool.acquire(&[1, 2, 3], 1000, true).unwrap();
        let result = pool.acquire(&[4, 5, 6], 2000, true);
        assert!(matches!(result, Err(StreamError::QueueFull)));
    }

    #[test]
    fn acquire_never_reuses_entry_still_in_use() {
        let pool = NalBufferPool::new(2, 64);
        let handle1 = pool.acquire(&[1, 2, 3], 1000, true).unwrap();
        let _handle2 = pool.acquire(&[4, 5], 2000, true).unwrap();
        assert_eq!(pool.len(), 2);
        drop(handle1);
        let handle3 = pool.acquire(&[9], 3000, true).unwrap();
        assert_eq!(pool.len(), 2);
        assert_eq!(handle3.payload(), vec![9]);
    }
}
