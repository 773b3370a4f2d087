// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
Hook records.

A [`HookRecord`] is the instrumented stand-in for an application record: every original
command in recording order, with copy and query operations inserted right before
and/or right after the target (after its whole subtree, when the target is a section).
Synchronization commands are never added, removed or reordered.

Observations are resolved against the record's descriptor snapshots when the hook
record is built.  Device resources are *not* part of a hook record: buffers and query
slots are bound per submission, so one hook record can be reused frame after frame.
*/

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::ObservationError;
use crate::hook::handle::{DroppedObservation, ObservationKind};
use crate::hook::{CopyPoint, CopyTarget, Observations, ResourceCopy};
use crate::record::command::{Command, CommandKind, IndirectArgs, IndirectLayout};
use crate::record::resources::{ResourceId, ResourceTable, TrackedResource};
use crate::record::{CommandId, CommandPath, CommandRecord, RecordHandle, RecordId, WeakRecord};

/// An operation inserted by a hook.  Buffer and query indices refer to the
/// resources bound for one submission.
#[derive(Debug, Clone)]
pub enum InsertedOp {
    Copy {
        buffer: u32,
        source: Arc<TrackedResource>,
        offset: u64,
        size: u64,
    },
    WriteTimestamp {
        query: u32,
    },
    QueryAccelBuild {
        query: u32,
        structure: Arc<TrackedResource>,
    },
}

#[derive(Debug, Clone)]
pub enum HookOp {
    Original(CommandId),
    Inserted(InsertedOp),
}

#[derive(Debug, Clone)]
pub(crate) struct CopyPlan {
    pub(crate) request: ResourceCopy,
    /// `(buffer, resource, offset)`
    pub(crate) resolved: Result<(u32, ResourceId, u64), ObservationError>,
}

#[derive(Debug, Clone)]
pub(crate) struct IndirectPlan {
    pub(crate) buffer: u32,
    pub(crate) args: IndirectArgs,
    pub(crate) layout: IndirectLayout,
}

/// Where each requested observation will land.
#[derive(Debug, Clone, Default)]
pub(crate) struct ObservationPlan {
    pub(crate) copies: Vec<CopyPlan>,
    pub(crate) timing: Option<Result<(u32, u32), ObservationError>>,
    pub(crate) indirect: Option<Result<IndirectPlan, ObservationError>>,
    pub(crate) accel: Option<Result<(u32, ResourceId), ObservationError>>,
    pub(crate) buffer_sizes: Vec<u64>,
    pub(crate) query_count: u32,
}

impl ObservationPlan {
    /// Observations that could not be resolved at build time.
    pub(crate) fn unresolved(&self) -> Vec<DroppedObservation> {
        let mut dropped = Vec::new();
        for copy in &self.copies {
            if let Err(error) = &copy.resolved {
                dropped.push(DroppedObservation {
                    observation: ObservationKind::Copy(copy.request),
                    error: error.clone(),
                });
            }
        }
        let mut note = |observation, result: Option<Result<(), &ObservationError>>| {
            if let Some(Err(error)) = result {
                dropped.push(DroppedObservation {
                    observation,
                    error: error.clone(),
                });
            }
        };
        note(ObservationKind::Timing, self.timing.as_ref().map(|r| r.as_ref().map(|_| ())));
        note(ObservationKind::IndirectArgs, self.indirect.as_ref().map(|r| r.as_ref().map(|_| ())));
        note(ObservationKind::AccelBuild, self.accel.as_ref().map(|r| r.as_ref().map(|_| ())));
        dropped
    }
}

/// An instrumented copy of one record.
#[derive(Debug)]
pub struct HookRecord {
    origin: WeakRecord,
    target: CommandId,
    path: CommandPath,
    ops: Vec<HookOp>,
    pub(crate) plan: ObservationPlan,
    in_flight: AtomicBool,
}

fn live(table: &dyn ResourceTable, id: ResourceId) -> Result<Arc<TrackedResource>, ObservationError> {
    match table.resolve(id) {
        Some(resource) if !resource.is_destroyed() => Ok(resource),
        _ => Err(ObservationError::ResourceDestroyed(id)),
    }
}

fn clamp(resource: &TrackedResource, offset: u64, size: u64) -> u64 {
    size.min(resource.size().saturating_sub(offset))
}

fn resolve_copy(
    record: &CommandRecord,
    target: CommandId,
    request: &ResourceCopy,
    table: &dyn ResourceTable,
) -> Result<(Arc<TrackedResource>, u64, u64), ObservationError> {
    let command = record.command(target);
    let kind = command.kind();
    let not_applicable = |observation| ObservationError::NotApplicable { kind, observation };
    match request.target {
        CopyTarget::Descriptor { set, binding } => {
            if !kind.uses_descriptors() {
                return Err(not_applicable("descriptor copy"));
            }
            let snapshot = record
                .snapshot(target)
                .ok_or(ObservationError::Unbound { set, binding })?;
            let resource = snapshot.resource(set, binding)?;
            Ok((Arc::clone(resource), 0, resource.size()))
        }
        CopyTarget::VertexBuffer { binding } => {
            if !matches!(
                kind,
                CommandKind::Draw
                    | CommandKind::DrawIndexed
                    | CommandKind::DrawIndirect
                    | CommandKind::DrawIndexedIndirect
            ) {
                return Err(not_applicable("vertex buffer copy"));
            }
            let snapshot = record
                .snapshot(target)
                .ok_or(ObservationError::UnboundVertexBuffer { binding })?;
            let bound = snapshot.vertex_buffer(binding)?;
            let resource = bound.buffer.live()?;
            let size = clamp(resource, bound.offset, u64::MAX);
            Ok((Arc::clone(resource), bound.offset, size))
        }
        CopyTarget::IndexBuffer => {
            if !matches!(kind, CommandKind::DrawIndexed | CommandKind::DrawIndexedIndirect) {
                return Err(not_applicable("index buffer copy"));
            }
            let bound = record
                .snapshot(target)
                .and_then(|s| s.index_buffer())
                .ok_or(ObservationError::UnboundIndexBuffer)?;
            let resource = bound.buffer.live()?;
            let size = clamp(resource, bound.offset, u64::MAX);
            Ok((Arc::clone(resource), bound.offset, size))
        }
        CopyTarget::TransferSrc => {
            let (id, offset, size) = match *command {
                Command::CopyBuffer(a) => (a.src, a.src_offset, a.size),
                Command::CopyImage(a) => (a.src, 0, u64::MAX),
                _ => return Err(not_applicable("transfer source copy")),
            };
            let resource = live(table, id)?;
            let size = clamp(&resource, offset, size);
            Ok((resource, offset, size))
        }
        CopyTarget::TransferDst => {
            let (id, offset, size) = match *command {
                Command::CopyBuffer(a) => (a.dst, a.dst_offset, a.size),
                Command::CopyImage(a) => (a.dst, 0, u64::MAX),
                Command::FillBuffer(a) => (a.dst, a.offset, a.size),
                _ => return Err(not_applicable("transfer destination copy")),
            };
            let resource = live(table, id)?;
            let size = clamp(&resource, offset, size);
            Ok((resource, offset, size))
        }
    }
}

impl HookRecord {
    /// Builds the instrumented sequence for `target` in `record`.
    pub(crate) fn build(
        record: &RecordHandle,
        target: CommandId,
        observations: &Observations,
        table: &dyn ResourceTable,
    ) -> Self {
        let _interval = logwise::perfwarn_begin!("HookRecord::build");
        let command = *record.command(target);
        let kind = command.kind();
        let mut plan = ObservationPlan::default();
        let mut before = Vec::new();
        let mut after = Vec::new();

        for request in &observations.copies {
            let resolved = resolve_copy(record, target, request, table).map(|(source, offset, size)| {
                let buffer = plan.buffer_sizes.len() as u32;
                plan.buffer_sizes.push(size);
                let id = source.id();
                let op = HookOp::Inserted(InsertedOp::Copy {
                    buffer,
                    source,
                    offset,
                    size,
                });
                match request.point {
                    CopyPoint::Before => before.push(op),
                    CopyPoint::After => after.push(op),
                }
                (buffer, id, offset)
            });
            plan.copies.push(CopyPlan {
                request: *request,
                resolved,
            });
        }

        if observations.indirect_args {
            plan.indirect = Some(match command.indirect() {
                Some((args, layout)) => live(table, args.buffer).map(|source| {
                    let stride = if args.stride == 0 {
                        layout.element_size()
                    } else {
                        args.stride as u64
                    };
                    let wanted = match args.count {
                        0 => 0,
                        n => (n as u64 - 1) * stride + layout.element_size(),
                    };
                    let size = clamp(&source, args.offset, wanted);
                    let buffer = plan.buffer_sizes.len() as u32;
                    plan.buffer_sizes.push(size);
                    before.push(HookOp::Inserted(InsertedOp::Copy {
                        buffer,
                        source,
                        offset: args.offset,
                        size,
                    }));
                    IndirectPlan {
                        buffer,
                        args,
                        layout,
                    }
                }),
                None => Err(ObservationError::NotApplicable {
                    kind,
                    observation: "indirect argument readback",
                }),
            });
        }

        if observations.timing {
            let (start, end) = (plan.query_count, plan.query_count + 1);
            plan.query_count += 2;
            before.push(HookOp::Inserted(InsertedOp::WriteTimestamp { query: start }));
            after.insert(0, HookOp::Inserted(InsertedOp::WriteTimestamp { query: end }));
            plan.timing = Some(Ok((start, end)));
        }

        if observations.accel_build {
            plan.accel = Some(match command {
                Command::BuildAccelerationStructure(args) => live(table, args.dst).map(|structure| {
                    let query = plan.query_count;
                    plan.query_count += 1;
                    let id = structure.id();
                    after.push(HookOp::Inserted(InsertedOp::QueryAccelBuild { query, structure }));
                    (query, id)
                }),
                _ => Err(ObservationError::NotApplicable {
                    kind,
                    observation: "acceleration structure build result",
                }),
            });
        }

        let mut order = Vec::with_capacity(record.len());
        record.walk(|id, _| order.push(id));
        let start = order.iter().position(|id| *id == target).unwrap_or(order.len());
        let end = (start + 1 + record.descendants(target) as usize).min(order.len());
        let mut ops = Vec::with_capacity(order.len() + before.len() + after.len());
        ops.extend(order[..start].iter().map(|id| HookOp::Original(*id)));
        ops.extend(before);
        ops.extend(order[start..end].iter().map(|id| HookOp::Original(*id)));
        ops.extend(after);
        ops.extend(order[end..].iter().map(|id| HookOp::Original(*id)));

        let path = record.path_of(target);
        logwise::info_sync!(
            "built hook record for {path} with {inserted} inserted ops",
            path = logwise::privacy::LogIt(&path),
            inserted = ops.len() - order.len()
        );
        HookRecord {
            origin: record.downgrade(),
            target,
            path,
            ops,
            plan,
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn origin(&self) -> &WeakRecord {
        &self.origin
    }

    pub fn record_id(&self) -> RecordId {
        self.origin.id()
    }

    pub fn target(&self) -> CommandId {
        self.target
    }

    pub fn path(&self) -> &CommandPath {
        &self.path
    }

    pub fn ops(&self) -> &[HookOp] {
        &self.ops
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    pub(crate) fn set_in_flight(&self, in_flight: bool) {
        self.in_flight.store(in_flight, Ordering::Release);
    }

    /// Whether a resource the inserted ops read has been destroyed since the build.
    pub fn is_stale(&self) -> bool {
        self.ops.iter().any(|op| match op {
            HookOp::Inserted(InsertedOp::Copy { source, .. }) => source.is_destroyed(),
            HookOp::Inserted(InsertedOp::QueryAccelBuild { structure, .. }) => structure.is_destroyed(),
            _ => false,
        })
    }
}

/// Record, target path and the observations requested.
pub(crate) type CacheKey = (RecordId, CommandPath, Observations);

/// Recently built hook records, least recently used first.
#[derive(Debug, Default)]
pub(crate) struct HookCache {
    entries: VecDeque<(CacheKey, Arc<HookRecord>)>,
}

impl HookCache {
    /// A cached record for `key` that is free to submit again.
    pub(crate) fn take_reusable(&mut self, key: &CacheKey) -> Option<Arc<HookRecord>> {
        let index = self.entries.iter().position(|(k, _)| k == key)?;
        let usable = {
            let record = &self.entries[index].1;
            !record.is_in_flight() && !record.is_stale() && !record.origin().is_released()
        };
        if !usable {
            return None;
        }
        let entry = self.entries.remove(index)?;
        let record = Arc::clone(&entry.1);
        self.entries.push_back(entry);
        Some(record)
    }

    pub(crate) fn insert(&mut self, key: CacheKey, record: Arc<HookRecord>, capacity: usize) {
        self.entries.retain(|(k, _)| *k != key);
        self.entries.push_back((key, record));
        while self.entries.len() > capacity {
            self.entries.pop_front();
        }
    }

    /// Drops entries whose record is gone.
    pub(crate) fn purge_released(&mut self) {
        self.entries.retain(|(_, r)| !r.origin().is_released());
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
