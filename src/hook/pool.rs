// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
Reusable device resources for hooks.

Copy buffers and query slots are handed out for one submission and returned when it
finishes (or is invalidated), so steady-state hooking allocates nothing.  The pool
lives inside the device state and is only touched with the device lock held.

Copy buffers are host-visible: whatever executes the hooked sequence writes the copied
bytes into them, and readback simply reads them back.
*/

use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::CapacityError;
use crate::lock_recover;

/// A host-visible staging buffer.
#[derive(Clone)]
pub struct CopyBuffer {
    id: u64,
    capacity: u64,
    len: u64,
    data: Arc<Mutex<Vec<u8>>>,
}

impl CopyBuffer {
    pub fn id(&self) -> u64 {
        self.id
    }
    /// Bytes requested for the current use.
    pub fn len(&self) -> u64 {
        self.len
    }
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Writes `bytes` at `offset`, clamped to the buffer's current length.
    pub fn write(&self, offset: u64, bytes: &[u8]) {
        let mut data = lock_recover(&self.data);
        let start = offset.min(self.len) as usize;
        let end = (offset + bytes.len() as u64).min(self.len) as usize;
        data[start..end].copy_from_slice(&bytes[..end - start]);
    }

    pub fn read(&self) -> Vec<u8> {
        lock_recover(&self.data)[..self.len as usize].to_vec()
    }

    fn reset(&mut self, len: u64) {
        self.len = len;
        let mut data = lock_recover(&self.data);
        data.clear();
        data.resize(len as usize, 0);
    }
}

impl Debug for CopyBuffer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CopyBuffer")
            .field("id", &self.id)
            .field("len", &self.len)
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// One timestamp/query result slot.
#[derive(Clone)]
pub struct QuerySlot {
    index: u32,
    storage: Arc<Mutex<Vec<Option<u64>>>>,
}

impl QuerySlot {
    pub fn index(&self) -> u32 {
        self.index
    }
    pub fn write(&self, value: u64) {
        if let Some(slot) = lock_recover(&self.storage).get_mut(self.index as usize) {
            *slot = Some(value);
        }
    }
    pub fn read(&self) -> Option<u64> {
        lock_recover(&self.storage)
            .get(self.index as usize)
            .copied()
            .flatten()
    }
}

impl Debug for QuerySlot {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("QuerySlot").field(&self.index).finish()
    }
}

/// Occupancy of a [`HookResourcePool`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Buffers waiting for reuse.
    pub buffers_pooled: usize,
    /// Buffers handed out and not yet returned.
    pub buffers_in_use: usize,
    /// Capacity of every buffer the pool owns, pooled or in use.
    pub bytes_held: u64,
    pub queries_in_use: u32,
    pub query_capacity: u32,
}

pub struct HookResourcePool {
    budget: u64,
    free: Vec<CopyBuffer>,
    bytes_held: u64,
    buffers_in_use: usize,
    free_queries: Vec<u32>,
    query_capacity: u32,
    queries: Arc<Mutex<Vec<Option<u64>>>>,
}

impl Debug for HookResourcePool {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookResourcePool")
            .field("budget", &self.budget)
            .field("stats", &self.stats())
            .finish()
    }
}

static NEXT_BUFFER: AtomicU64 = AtomicU64::new(1);

impl HookResourcePool {
    pub fn new(budget: u64, query_capacity: u32) -> Self {
        HookResourcePool {
            budget,
            free: Vec::new(),
            bytes_held: 0,
            buffers_in_use: 0,
            free_queries: (0..query_capacity).rev().collect(),
            query_capacity,
            queries: Arc::new(Mutex::new(vec![None; query_capacity as usize])),
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            buffers_pooled: self.free.len(),
            buffers_in_use: self.buffers_in_use,
            bytes_held: self.bytes_held,
            queries_in_use: self.query_capacity - self.free_queries.len() as u32,
            query_capacity: self.query_capacity,
        }
    }

    /// A buffer of at least `size` bytes, reusing a pooled one when possible.
    pub fn acquire_buffer(&mut self, size: u64) -> Result<CopyBuffer, CapacityError> {
        let best = self
            .free
            .iter()
            .enumerate()
            .filter(|(_, b)| b.capacity >= size)
            .min_by_key(|(_, b)| b.capacity)
            .map(|(i, _)| i);
        if let Some(index) = best {
            let mut buffer = self.free.swap_remove(index);
            buffer.reset(size);
            self.buffers_in_use += 1;
            return Ok(buffer);
        }
        //make room by dropping pooled buffers that are too small to reuse
        while self.bytes_held + size > self.budget {
            let Some(evicted) = self.free.pop() else {
                break;
            };
            self.bytes_held -= evicted.capacity;
        }
        if self.bytes_held + size > self.budget {
            return Err(CapacityError::CopyBudget {
                requested: size,
                available: self.budget.saturating_sub(self.bytes_held),
            });
        }
        let mut buffer = CopyBuffer {
            id: NEXT_BUFFER.fetch_add(1, Ordering::Relaxed),
            capacity: size,
            len: 0,
            data: Arc::new(Mutex::new(Vec::new())),
        };
        buffer.reset(size);
        self.bytes_held += size;
        self.buffers_in_use += 1;
        Ok(buffer)
    }

    /// Returns a buffer for reuse.
    pub fn release_buffer(&mut self, buffer: CopyBuffer) {
        self.buffers_in_use = self.buffers_in_use.saturating_sub(1);
        self.free.push(buffer);
    }

    /// Forgets a buffer whose device memory can no longer be touched.
    pub fn discard_buffer(&mut self, buffer: CopyBuffer) {
        self.buffers_in_use = self.buffers_in_use.saturating_sub(1);
        self.bytes_held = self.bytes_held.saturating_sub(buffer.capacity);
    }

    pub fn acquire_queries(&mut self, count: u32) -> Result<Vec<QuerySlot>, CapacityError> {
        if (self.free_queries.len() as u32) < count {
            return Err(CapacityError::QueryPoolExhausted {
                capacity: self.query_capacity,
            });
        }
        let mut storage = lock_recover(&self.queries);
        let mut slots = Vec::with_capacity(count as usize);
        for _ in 0..count {
            if let Some(index) = self.free_queries.pop() {
                storage[index as usize] = None;
                slots.push(QuerySlot {
                    index,
                    storage: Arc::clone(&self.queries),
                });
            }
        }
        Ok(slots)
    }

    pub fn release_queries(&mut self, slots: Vec<QuerySlot>) {
        for slot in slots {
            self.free_queries.push(slot.index);
        }
    }

    /// Drops every pooled buffer; used once the device is lost.
    pub fn clear(&mut self) {
        for buffer in self.free.drain(..) {
            self.bytes_held = self.bytes_held.saturating_sub(buffer.capacity);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_are_reused_best_fit() {
        let mut pool = HookResourcePool::new(1024, 4);
        let small = pool.acquire_buffer(64).expect("fits");
        let large = pool.acquire_buffer(256).expect("fits");
        let small_id = small.id();
        pool.release_buffer(large);
        pool.release_buffer(small);

        let again = pool.acquire_buffer(32).expect("fits");
        assert_eq!(again.id(), small_id);
        assert_eq!(again.len(), 32);
        assert_eq!(again.read(), vec![0; 32]);
        let stats = pool.stats();
        assert_eq!(stats.buffers_in_use, 1);
        assert_eq!(stats.buffers_pooled, 1);
        assert_eq!(stats.bytes_held, 320);
    }

    #[test]
    fn over_budget_requests_fail_without_side_effects() {
        let mut pool = HookResourcePool::new(100, 1);
        let held = pool.acquire_buffer(80).expect("fits");
        assert_eq!(
            pool.acquire_buffer(40).map(|b| b.id()),
            Err(CapacityError::CopyBudget {
                requested: 40,
                available: 20
            })
        );
        assert_eq!(pool.stats().buffers_in_use, 1);
        pool.discard_buffer(held);
        assert_eq!(pool.stats().bytes_held, 0);
    }

    #[test]
    fn queries_run_out_and_come_back() {
        let mut pool = HookResourcePool::new(0, 2);
        let slots = pool.acquire_queries(2).expect("two slots");
        slots[0].write(7);
        assert_eq!(slots[0].read(), Some(7));
        assert!(pool.acquire_queries(1).is_err());
        pool.release_queries(slots);
        let again = pool.acquire_queries(1).expect("returned");
        assert_eq!(again[0].read(), None);
        assert_eq!(pool.stats().queries_in_use, 1);
    }

    #[test]
    fn writes_are_clamped() {
        let mut pool = HookResourcePool::new(16, 0);
        let buffer = pool.acquire_buffer(4).expect("fits");
        buffer.write(2, &[1, 2, 3, 4]);
        assert_eq!(buffer.read(), vec![0, 0, 1, 2]);
    }
}
