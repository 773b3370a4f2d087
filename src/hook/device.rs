// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
The device-wide exclusivity lock.

Submission bookkeeping and every hook-internal mutation (pool, activation order,
in-flight hooks) happen under one coarse lock.  Code that needs it takes a
`&mut DeviceGuard`, which can only be obtained through [`Device::with_lock`].
*/

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};

use wasm_safe_mutex::Mutex;

use crate::hook::config::HookConfig;
use crate::hook::handle::{HookShared, InvalidReason};
use crate::hook::pool::{HookResourcePool, PoolStats};
use crate::hook::submission::OrphanQueue;
use crate::lock_recover;

/// A device queue submissions are made to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueId(pub u32);

/// Device-assigned order of a hooked submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubmissionId(pub(crate) u64);

/// Device state reachable only with the device lock held.
#[derive(Debug)]
pub struct DeviceGuard {
    pool: HookResourcePool,
    lost: bool,
    next_submission: u64,
    pending: HashMap<QueueId, VecDeque<SubmissionId>>,
    out_of_order: u64,
    in_flight: Vec<Weak<HookShared>>,
    orphans: OrphanQueue,
}

impl DeviceGuard {
    pub fn pool(&self) -> &HookResourcePool {
        &self.pool
    }

    pub(crate) fn pool_mut(&mut self) -> &mut HookResourcePool {
        &mut self.pool
    }

    pub fn is_lost(&self) -> bool {
        self.lost
    }

    /**
    Records that the device was lost.

    Every hook still in flight is invalidated at once, and pooled device memory is
    forgotten.  Nothing touches the device afterwards.
    */
    pub fn mark_lost(&mut self) {
        if self.lost {
            return;
        }
        self.lost = true;
        let mut invalidated = 0;
        for hook in self.in_flight.drain(..).filter_map(|weak| weak.upgrade()) {
            if hook.invalidate(InvalidReason::DeviceLost) {
                invalidated += 1;
            }
        }
        self.pool.clear();
        self.pending.clear();
        logwise::error_sync!(
            "device lost; {n} pending hook(s) invalidated",
            n = invalidated
        );
    }

    /// Activations that arrived out of submission order on their queue.
    pub fn out_of_order_activations(&self) -> u64 {
        self.out_of_order
    }

    pub(crate) fn submit(&mut self, queue: QueueId, hooks: &[Weak<HookShared>]) -> SubmissionId {
        let id = SubmissionId(self.next_submission);
        self.next_submission += 1;
        self.pending.entry(queue).or_default().push_back(id);
        self.in_flight.retain(|weak| weak.strong_count() > 0);
        self.in_flight.extend(hooks.iter().cloned());
        id
    }

    /**
    Notes that `id` was activated on `queue`.

    Activation is expected FIFO per queue.  Anything else is logged and counted but
    still accepted: with timeline semaphores the device may legitimately reorder.
    */
    pub(crate) fn activate(&mut self, queue: QueueId, id: SubmissionId) -> bool {
        let Some(pending) = self.pending.get_mut(&queue) else {
            return false;
        };
        if pending.front() == Some(&id) {
            pending.pop_front();
            return true;
        }
        if let Some(position) = pending.iter().position(|p| *p == id) {
            pending.remove(position);
            self.out_of_order += 1;
            logwise::warn_sync!(
                "submission {id} activated out of order on queue {queue}",
                id = logwise::privacy::LogIt(&id),
                queue = logwise::privacy::LogIt(&queue)
            );
        }
        false
    }

    pub(crate) fn orphans(&self) -> OrphanQueue {
        Arc::clone(&self.orphans)
    }

    /// Returns the resources of submissions dropped without `finish` to the pool.
    pub(crate) fn reclaim_orphans(&mut self) {
        let orphans = std::mem::take(&mut *lock_recover(&self.orphans));
        for orphan in orphans {
            orphan.reclaim(self);
        }
    }

    /// Forgets a submission that finished without being activated.
    pub(crate) fn retire(&mut self, queue: QueueId, id: SubmissionId) {
        if let Some(pending) = self.pending.get_mut(&queue) {
            pending.retain(|p| *p != id);
        }
    }
}

/// A device, as far as hooks are concerned.
pub struct Device {
    inner: Mutex<DeviceGuard>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device").finish_non_exhaustive()
    }
}

impl Device {
    pub fn new(config: &HookConfig) -> Self {
        Device {
            inner: Mutex::new(DeviceGuard {
                pool: HookResourcePool::new(config.copy_budget_bytes, config.query_capacity),
                lost: false,
                next_submission: 0,
                pending: HashMap::new(),
                out_of_order: 0,
                in_flight: Vec::new(),
                orphans: OrphanQueue::default(),
            }),
        }
    }

    /// Runs `f` with the device lock held.  Submissions dropped since the last call
    /// are reclaimed first.
    pub fn with_lock<R>(&self, f: impl FnOnce(&mut DeviceGuard) -> R) -> R {
        let mut guard = self.inner.lock_sync();
        guard.reclaim_orphans();
        f(&mut guard)
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.with_lock(|guard| guard.pool().stats())
    }

    pub fn is_lost(&self) -> bool {
        self.with_lock(|guard| guard.is_lost())
    }

    pub fn out_of_order_activations(&self) -> u64 {
        self.with_lock(|guard| guard.out_of_order_activations())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn activation_order_is_checked_per_queue() {
        let device = Device::new(&HookConfig::default());
        device.with_lock(|guard| {
            let first = guard.submit(QueueId(0), &[]);
            let second = guard.submit(QueueId(0), &[]);
            let other = guard.submit(QueueId(1), &[]);
            assert!(guard.activate(QueueId(1), other));
            assert!(!guard.activate(QueueId(0), second));
            assert!(guard.activate(QueueId(0), first));
            assert_eq!(guard.out_of_order_activations(), 1);
        });
        assert_eq!(device.out_of_order_activations(), 1);
    }
}
