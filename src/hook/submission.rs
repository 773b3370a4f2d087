// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
Hooked submissions.

A [`HookSubmission`] is what [`CommandHook::hook_submission`](crate::hook::CommandHook::hook_submission)
hands back when at least one hook applies to a batch.  For each hooked record it carries
the hook record to execute in place of the application's record, together with the
copy buffers and query slots bound for this submission.

The layer then reports progress: [`HookSubmission::activate`] once the device starts
the submission, [`HookSubmission::finish`] once it completed (or the device was lost).
Both must be called with the device lock held.
*/

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::error::{CapacityError, ObservationError};
use crate::hook::device::{DeviceGuard, QueueId, SubmissionId};
use crate::hook::handle::{
    AccelBuildResult, CopiedResource, DroppedObservation, HookShared, HookState, IndirectCommands,
    IndirectReadback, InvalidReason, ObservationKind, StateSnapshot,
};
use crate::hook::hook_record::{HookOp, HookRecord, InsertedOp};
use crate::hook::pool::{CopyBuffer, HookResourcePool, QuerySlot};
use crate::lock_recover;
use crate::record::resources::TrackedResource;
use crate::record::{CommandId, CommandPath, RecordId};

/// One operation of a hooked record, with this submission's resources bound.
#[derive(Debug, Clone, Copy)]
pub enum ExecOp<'a> {
    /// A command of the application's record, unchanged.
    Original(CommandId),
    /// Copy `size` bytes at `offset` of `source` into `dst`.
    Copy {
        source: &'a Arc<TrackedResource>,
        offset: u64,
        size: u64,
        dst: &'a CopyBuffer,
    },
    WriteTimestamp {
        slot: &'a QuerySlot,
    },
    /// Write the compacted size of `structure` into `slot`.
    QueryAccelBuild {
        structure: &'a Arc<TrackedResource>,
        slot: &'a QuerySlot,
    },
}

/// How the device left a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceOutcome {
    Completed,
    Lost,
}

/// A hook record bound to one submission's resources.
#[derive(Debug)]
pub struct SubmittedHook {
    shared: Weak<HookShared>,
    record: Arc<HookRecord>,
    buffers: Vec<Option<CopyBuffer>>,
    queries: Vec<QuerySlot>,
    dropped: Vec<DroppedObservation>,
}

impl SubmittedHook {
    /// Acquires what `record` needs from `pool`.  Observations that do not fit are
    /// dropped; the others proceed.
    pub(crate) fn bind(shared: &Arc<HookShared>, record: Arc<HookRecord>, pool: &mut HookResourcePool) -> Self {
        let plan = &record.plan;
        let mut dropped = plan.unresolved();
        let mut failures: Vec<Option<CapacityError>> = Vec::with_capacity(plan.buffer_sizes.len());
        let mut buffers = Vec::with_capacity(plan.buffer_sizes.len());
        for &size in &plan.buffer_sizes {
            match pool.acquire_buffer(size) {
                Ok(buffer) => {
                    buffers.push(Some(buffer));
                    failures.push(None);
                }
                Err(error) => {
                    buffers.push(None);
                    failures.push(Some(error));
                }
            }
        }
        let capacity = |buffer: u32| failures.get(buffer as usize).copied().flatten();
        for copy in &plan.copies {
            if let Ok((buffer, _, _)) = copy.resolved {
                if let Some(error) = capacity(buffer) {
                    dropped.push(DroppedObservation {
                        observation: ObservationKind::Copy(copy.request),
                        error: error.into(),
                    });
                }
            }
        }
        if let Some(Ok(indirect)) = &plan.indirect {
            if let Some(error) = capacity(indirect.buffer) {
                dropped.push(DroppedObservation {
                    observation: ObservationKind::IndirectArgs,
                    error: error.into(),
                });
            }
        }
        let queries = match pool.acquire_queries(plan.query_count) {
            Ok(queries) => queries,
            Err(error) => {
                if matches!(plan.timing, Some(Ok(_))) {
                    dropped.push(DroppedObservation {
                        observation: ObservationKind::Timing,
                        error: error.into(),
                    });
                }
                if matches!(plan.accel, Some(Ok(_))) {
                    dropped.push(DroppedObservation {
                        observation: ObservationKind::AccelBuild,
                        error: error.into(),
                    });
                }
                Vec::new()
            }
        };
        if !dropped.is_empty() {
            logwise::warn_sync!(
                "hook {id} dropped {n} observation(s)",
                id = shared.id(),
                n = dropped.len()
            );
        }
        record.set_in_flight(true);
        SubmittedHook {
            shared: Arc::downgrade(shared),
            record,
            buffers,
            queries,
            dropped,
        }
    }

    pub fn record(&self) -> &Arc<HookRecord> {
        &self.record
    }

    pub fn record_id(&self) -> RecordId {
        self.record.record_id()
    }

    pub fn path(&self) -> &CommandPath {
        self.record.path()
    }

    /// Observations already known to be dropped for this submission.
    pub fn dropped(&self) -> &[DroppedObservation] {
        &self.dropped
    }

    /// The sequence to execute in place of the application's record.  Inserted ops
    /// whose resources could not be acquired are left out.
    pub fn ops(&self) -> impl Iterator<Item = ExecOp<'_>> + '_ {
        self.record.ops().iter().filter_map(move |op| match op {
            HookOp::Original(id) => Some(ExecOp::Original(*id)),
            HookOp::Inserted(InsertedOp::Copy {
                buffer,
                source,
                offset,
                size,
            }) => self
                .buffers
                .get(*buffer as usize)
                .and_then(Option::as_ref)
                .map(|dst| ExecOp::Copy {
                    source,
                    offset: *offset,
                    size: *size,
                    dst,
                }),
            HookOp::Inserted(InsertedOp::WriteTimestamp { query }) => self
                .queries
                .get(*query as usize)
                .map(|slot| ExecOp::WriteTimestamp { slot }),
            HookOp::Inserted(InsertedOp::QueryAccelBuild { query, structure }) => self
                .queries
                .get(*query as usize)
                .map(|slot| ExecOp::QueryAccelBuild { structure, slot }),
        })
    }

    fn release(self, pool: &mut HookResourcePool, device_memory_lost: bool) {
        self.record.set_in_flight(false);
        for buffer in self.buffers.into_iter().flatten() {
            if device_memory_lost {
                pool.discard_buffer(buffer);
            } else {
                pool.release_buffer(buffer);
            }
        }
        pool.release_queries(self.queries);
    }

    fn read_back(&self, timestamp_period_ns: f64) -> StateSnapshot {
        let plan = &self.record.plan;
        let mut dropped = self.dropped.clone();
        let buffer = |index: u32| self.buffers.get(index as usize).and_then(Option::as_ref);
        let query = |index: u32| self.queries.get(index as usize);

        let mut copies = Vec::new();
        for copy in &plan.copies {
            if let Ok((index, resource, offset)) = copy.resolved {
                if let Some(buffer) = buffer(index) {
                    copies.push(CopiedResource {
                        request: copy.request,
                        resource,
                        offset,
                        bytes: buffer.read(),
                    });
                }
            }
        }

        let mut timing = None;
        //no slots means the query pool ran out, already recorded as dropped
        if let (Some(Ok((start, end))), false) = (&plan.timing, self.queries.is_empty()) {
            match (query(*start).and_then(QuerySlot::read), query(*end).and_then(QuerySlot::read)) {
                (Some(start), Some(end)) => {
                    let ticks = end.saturating_sub(start) as f64;
                    timing = Some(Duration::from_nanos((ticks * timestamp_period_ns) as u64));
                }
                _ => dropped.push(DroppedObservation {
                    observation: ObservationKind::Timing,
                    error: ObservationError::Unavailable { observation: "timestamp" },
                }),
            }
        }

        let indirect = match &plan.indirect {
            Some(Ok(indirect)) => buffer(indirect.buffer).map(|copy| {
                let bytes = copy.read();
                let commands = IndirectCommands::parse(indirect.layout, &bytes, indirect.args.count, indirect.args.stride);
                IndirectReadback {
                    buffer: indirect.args.buffer,
                    offset: indirect.args.offset,
                    bytes,
                    commands,
                }
            }),
            _ => None,
        };

        let mut accel_build = None;
        if let Some(Ok((index, structure))) = plan.accel {
            if let Some(slot) = query(index) {
                match slot.read() {
                    Some(compacted_size) => {
                        accel_build = Some(AccelBuildResult {
                            structure,
                            compacted_size,
                        })
                    }
                    None => dropped.push(DroppedObservation {
                        observation: ObservationKind::AccelBuild,
                        error: ObservationError::Unavailable {
                            observation: "acceleration structure size",
                        },
                    }),
                }
            }
        }

        StateSnapshot {
            record: self.record.record_id(),
            path: self.record.path().clone(),
            copies,
            timing,
            indirect,
            accel_build,
            dropped,
        }
    }
}

/// Submissions dropped before `finish`, waiting for the device lock.
pub(crate) type OrphanQueue = Arc<Mutex<Vec<Orphaned>>>;

/// The hooks of a submission dropped before [`HookSubmission::finish`].
#[derive(Debug)]
pub(crate) struct Orphaned {
    queue: QueueId,
    id: SubmissionId,
    hooks: Vec<SubmittedHook>,
}

impl Orphaned {
    /// Finishes the submission without reading anything back.
    pub(crate) fn reclaim(self, guard: &mut DeviceGuard) {
        guard.retire(self.queue, self.id);
        let lost = guard.is_lost();
        let mut invalidated = 0;
        for hook in self.hooks {
            if let Some(shared) = hook.shared.upgrade() {
                if shared.invalidate(InvalidReason::SubmissionDropped) {
                    invalidated += 1;
                }
            }
            hook.release(guard.pool_mut(), lost);
        }
        logwise::trace_sync!(
            "reclaimed dropped submission {id}; {n} hook(s) invalidated",
            id = logwise::privacy::LogIt(&self.id),
            n = invalidated
        );
    }
}

/**
The hooks applied to one submission.

Meant to be consumed by [`HookSubmission::finish`].  A submission dropped instead
invalidates its hooks, and its copy buffers and query slots go back to the pool the
next time the device lock is taken.
*/
#[derive(Debug)]
pub struct HookSubmission {
    queue: QueueId,
    id: SubmissionId,
    hooks: Vec<SubmittedHook>,
    timestamp_period_ns: f64,
    orphans: OrphanQueue,
}

impl HookSubmission {
    pub(crate) fn new(
        queue: QueueId,
        id: SubmissionId,
        hooks: Vec<SubmittedHook>,
        timestamp_period_ns: f64,
        orphans: OrphanQueue,
    ) -> Self {
        HookSubmission {
            queue,
            id,
            hooks,
            timestamp_period_ns,
            orphans,
        }
    }

    pub fn queue(&self) -> QueueId {
        self.queue
    }

    pub fn id(&self) -> SubmissionId {
        self.id
    }

    pub fn hooks(&self) -> &[SubmittedHook] {
        &self.hooks
    }

    /// The hook record to execute instead of `record`, if `record` is hooked.
    pub fn replacement(&self, record: RecordId) -> Option<&SubmittedHook> {
        self.hooks.iter().find(|hook| hook.record_id() == record)
    }

    /**
    The device started executing this submission.

    Returns whether it was the oldest pending submission on its queue.  Out-of-order
    activation is logged and counted but otherwise tolerated.
    */
    pub fn activate(&mut self, guard: &mut DeviceGuard) -> bool {
        let in_order = guard.activate(self.queue, self.id);
        for hook in &self.hooks {
            if let Some(shared) = hook.shared.upgrade() {
                shared.advance(HookState::Activated);
            }
        }
        in_order
    }

    /**
    The device is done with this submission.

    On [`DeviceOutcome::Completed`] every live hook reads back its buffers and queries
    and moves to `Finished`.  Hooks whose record was released meanwhile are
    invalidated, and hooks whose handle was dropped are discarded.  On
    [`DeviceOutcome::Lost`] (or a device already marked lost) every hook is
    invalidated and its device memory forgotten.  Resources always return to the pool.
    */
    pub fn finish(mut self, guard: &mut DeviceGuard, outcome: DeviceOutcome) {
        guard.retire(self.queue, self.id);
        if outcome == DeviceOutcome::Lost {
            guard.mark_lost();
        }
        let lost = guard.is_lost();
        let mut completed = 0;
        for hook in std::mem::take(&mut self.hooks) {
            let shared = hook.shared.upgrade();
            match shared {
                _ if lost => {
                    if let Some(shared) = &shared {
                        shared.invalidate(InvalidReason::DeviceLost);
                    }
                    hook.release(guard.pool_mut(), true);
                }
                None => {
                    logwise::trace_sync!("hook handle dropped; discarding its result");
                    hook.release(guard.pool_mut(), false);
                }
                Some(shared) if shared.state().is_terminal() => {
                    hook.release(guard.pool_mut(), false);
                }
                Some(shared) if hook.record.origin().is_released() => {
                    shared.invalidate(InvalidReason::RecordReleased);
                    hook.release(guard.pool_mut(), false);
                }
                Some(shared) => {
                    let snapshot = hook.read_back(self.timestamp_period_ns);
                    hook.release(guard.pool_mut(), false);
                    if shared.finish(snapshot) {
                        completed += 1;
                    }
                }
            }
        }
        logwise::debuginternal_sync!(
            "submission {id} finished, {completed} hook(s) completed",
            id = logwise::privacy::LogIt(&self.id),
            completed = completed
        );
    }
}

impl Drop for HookSubmission {
    fn drop(&mut self) {
        if self.hooks.is_empty() {
            return;
        }
        logwise::warn_sync!(
            "hook submission {id} dropped without finish; {n} hook(s) will be reclaimed",
            id = logwise::privacy::LogIt(&self.id),
            n = self.hooks.len()
        );
        //the device lock may be held by our caller, so only queue here
        lock_recover(&self.orphans).push(Orphaned {
            queue: self.queue,
            id: self.id,
            hooks: std::mem::take(&mut self.hooks),
        });
    }
}
