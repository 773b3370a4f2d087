// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
Descriptor snapshots.

A [`DescriptorSnapshot`] freezes the *identities* of the resources bound at one bind
point at the moment a draw/dispatch was recorded.  It holds an `Arc` to every entry it
names, so a resource destroyed afterwards is still identifiable; asking the snapshot for
it reports [`ObservationError::ResourceDestroyed`] instead of handing out a dead handle.

Snapshots are immutable once taken and are shared between every command recorded
under the same bound state.
*/

use std::sync::Arc;

use crate::error::ObservationError;
use crate::record::command::BindPoint;
use crate::record::resources::{ResourceId, ResourceTable, TrackedResource};

/// Index of a snapshot inside one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SnapshotId(pub(crate) u32);

/// One descriptor set as bound by the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundSet {
    pub set: ResourceId,
    pub dynamic_offsets: Vec<u32>,
}

impl BoundSet {
    pub fn new(set: ResourceId) -> Self {
        BoundSet {
            set,
            dynamic_offsets: Vec::new(),
        }
    }
    pub fn with_dynamic_offsets(set: ResourceId, dynamic_offsets: Vec<u32>) -> Self {
        BoundSet {
            set,
            dynamic_offsets,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BoundBuffer {
    pub(crate) buffer: ResourceId,
    pub(crate) offset: u64,
}

/// The live binding state of a recording in progress.
#[derive(Debug, Clone, Default)]
pub(crate) struct BoundState {
    sets: [Vec<Option<BoundSet>>; BindPoint::COUNT],
    pipelines: [Option<ResourceId>; BindPoint::COUNT],
    vertex_buffers: Vec<Option<BoundBuffer>>,
    index_buffer: Option<BoundBuffer>,
    /// Bumped whenever something visible through a bind point changes.
    generation: [u64; BindPoint::COUNT],
}

impl BoundState {
    pub(crate) fn bind_sets(&mut self, bind_point: BindPoint, first_set: u32, sets: &[BoundSet]) {
        let slots = &mut self.sets[bind_point.index()];
        let end = first_set as usize + sets.len();
        if slots.len() < end {
            slots.resize(end, None);
        }
        for (i, set) in sets.iter().enumerate() {
            slots[first_set as usize + i] = Some(set.clone());
        }
        self.generation[bind_point.index()] += 1;
    }

    pub(crate) fn bind_pipeline(&mut self, bind_point: BindPoint, pipeline: ResourceId) {
        self.pipelines[bind_point.index()] = Some(pipeline);
        self.generation[bind_point.index()] += 1;
    }

    pub(crate) fn bind_vertex_buffer(&mut self, binding: u32, buffer: ResourceId, offset: u64) {
        let binding = binding as usize;
        if self.vertex_buffers.len() <= binding {
            self.vertex_buffers.resize(binding + 1, None);
        }
        self.vertex_buffers[binding] = Some(BoundBuffer { buffer, offset });
        self.generation[BindPoint::Graphics.index()] += 1;
    }

    pub(crate) fn bind_index_buffer(&mut self, buffer: ResourceId, offset: u64) {
        self.index_buffer = Some(BoundBuffer { buffer, offset });
        self.generation[BindPoint::Graphics.index()] += 1;
    }

    pub(crate) fn generation(&self, bind_point: BindPoint) -> u64 {
        self.generation[bind_point.index()]
    }
}

/// A resource named by a snapshot.
#[derive(Debug, Clone)]
pub enum Captured {
    Resource(Arc<TrackedResource>),
    /// The id did not resolve at capture time.
    Missing(ResourceId),
}

impl Captured {
    fn capture(id: ResourceId, table: &dyn ResourceTable) -> Self {
        match table.resolve(id) {
            Some(resource) => Captured::Resource(resource),
            None => Captured::Missing(id),
        }
    }

    pub fn id(&self) -> ResourceId {
        match self {
            Captured::Resource(r) => r.id(),
            Captured::Missing(id) => *id,
        }
    }

    /// The live entry, or the reason it cannot be used.
    pub fn live(&self) -> Result<&Arc<TrackedResource>, ObservationError> {
        match self {
            Captured::Resource(r) if !r.is_destroyed() => Ok(r),
            Captured::Resource(r) => Err(ObservationError::ResourceDestroyed(r.id())),
            Captured::Missing(id) => Err(ObservationError::ResourceDestroyed(*id)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CapturedSet {
    pub set: ResourceId,
    pub bindings: Vec<Option<Captured>>,
    pub dynamic_offsets: Vec<u32>,
}

#[derive(Debug, Clone)]
pub struct CapturedBuffer {
    pub buffer: Captured,
    pub offset: u64,
}

/// Frozen, identity-only copy of the bindings visible at one bind point.
#[derive(Debug, Clone)]
pub struct DescriptorSnapshot {
    bind_point: BindPoint,
    pipeline: Option<ResourceId>,
    sets: Vec<Option<CapturedSet>>,
    vertex_buffers: Vec<Option<CapturedBuffer>>,
    index_buffer: Option<CapturedBuffer>,
}

impl DescriptorSnapshot {
    /// Captures `bound` as seen from `bind_point`, resolving identities through `table`.
    pub(crate) fn capture(
        bound: &BoundState,
        bind_point: BindPoint,
        table: &dyn ResourceTable,
    ) -> Self {
        let sets = bound.sets[bind_point.index()]
            .iter()
            .map(|slot| {
                slot.as_ref().map(|bound_set| {
                    let bindings = match table.descriptor_set_bindings(bound_set.set) {
                        Some(slots) => slots
                            .into_iter()
                            .map(|b| b.map(|id| Captured::capture(id, table)))
                            .collect(),
                        None => {
                            logwise::warn_sync!(
                                "descriptor set {set} did not resolve at capture",
                                set = logwise::privacy::LogIt(&bound_set.set)
                            );
                            Vec::new()
                        }
                    };
                    CapturedSet {
                        set: bound_set.set,
                        bindings,
                        dynamic_offsets: bound_set.dynamic_offsets.clone(),
                    }
                })
            })
            .collect();
        let capture_buffer = |b: &BoundBuffer| CapturedBuffer {
            buffer: Captured::capture(b.buffer, table),
            offset: b.offset,
        };
        let (vertex_buffers, index_buffer) = if bind_point == BindPoint::Graphics {
            (
                bound
                    .vertex_buffers
                    .iter()
                    .map(|slot| slot.as_ref().map(capture_buffer))
                    .collect(),
                bound.index_buffer.as_ref().map(capture_buffer),
            )
        } else {
            (Vec::new(), None)
        };
        DescriptorSnapshot {
            bind_point,
            pipeline: bound.pipelines[bind_point.index()],
            sets,
            vertex_buffers,
            index_buffer,
        }
    }

    pub fn bind_point(&self) -> BindPoint {
        self.bind_point
    }

    pub fn pipeline(&self) -> Option<ResourceId> {
        self.pipeline
    }

    pub fn set(&self, set: u32) -> Option<&CapturedSet> {
        self.sets.get(set as usize).and_then(Option::as_ref)
    }

    /// The resource bound at `set`/`binding`, reporting destruction instead of returning it.
    pub fn resource(&self, set: u32, binding: u32) -> Result<&Arc<TrackedResource>, ObservationError> {
        self.set(set)
            .and_then(|s| s.bindings.get(binding as usize))
            .and_then(Option::as_ref)
            .ok_or(ObservationError::Unbound { set, binding })?
            .live()
    }

    pub fn vertex_buffer(&self, binding: u32) -> Result<&CapturedBuffer, ObservationError> {
        self.vertex_buffers
            .get(binding as usize)
            .and_then(Option::as_ref)
            .ok_or(ObservationError::UnboundVertexBuffer { binding })
    }

    pub fn index_buffer(&self) -> Option<&CapturedBuffer> {
        self.index_buffer.as_ref()
    }

    /// Every resource id the snapshot names, sets included.
    pub fn resource_ids(&self) -> impl Iterator<Item = ResourceId> + '_ {
        let sets = self.sets.iter().flatten().flat_map(|s| {
            std::iter::once(s.set).chain(s.bindings.iter().flatten().map(Captured::id))
        });
        let buffers = self
            .vertex_buffers
            .iter()
            .flatten()
            .chain(self.index_buffer.iter())
            .map(|b| b.buffer.id());
        self.pipeline.into_iter().chain(sets).chain(buffers)
    }

    /**
    Fraction of binding slots that name the same identity (and offsets) in both, in `[0,1]`.

    A slot whose resource was destroyed (or never resolved) scores zero even against
    itself.
    */
    pub fn similarity(&self, other: &DescriptorSnapshot) -> f32 {
        let mut equal = 0usize;
        let mut total = 0usize;
        let mut tally = |same: bool| {
            total += 1;
            if same {
                equal += 1;
            }
        };
        let dead = |c: Option<&Captured>| c.is_some_and(|c| c.live().is_err());
        tally(self.pipeline == other.pipeline);
        for i in 0..self.sets.len().max(other.sets.len()) {
            let a = self.sets.get(i).and_then(Option::as_ref);
            let b = other.sets.get(i).and_then(Option::as_ref);
            match (a, b) {
                (None, None) => {}
                (Some(a), Some(b)) => {
                    tally(a.dynamic_offsets == b.dynamic_offsets);
                    for j in 0..a.bindings.len().max(b.bindings.len()) {
                        let x = a.bindings.get(j).and_then(Option::as_ref);
                        let y = b.bindings.get(j).and_then(Option::as_ref);
                        tally(x.map(Captured::id) == y.map(Captured::id) && !dead(x) && !dead(y));
                    }
                }
                _ => tally(false),
            }
        }
        let same_buffer = |x: Option<&CapturedBuffer>, y: Option<&CapturedBuffer>| {
            x.map(|b| (b.buffer.id(), b.offset)) == y.map(|b| (b.buffer.id(), b.offset))
                && !dead(x.map(|b| &b.buffer))
                && !dead(y.map(|b| &b.buffer))
        };
        for i in 0..self.vertex_buffers.len().max(other.vertex_buffers.len()) {
            tally(same_buffer(
                self.vertex_buffers.get(i).and_then(Option::as_ref),
                other.vertex_buffers.get(i).and_then(Option::as_ref),
            ));
        }
        tally(same_buffer(self.index_buffer.as_ref(), other.index_buffer.as_ref()));
        equal as f32 / total as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::resources::ResourceRegistry;

    #[test]
    fn snapshot_reports_destruction_after_capture() {
        let registry = ResourceRegistry::new();
        let ubo = registry.create_buffer(64, "ubo");
        let set = registry.create_descriptor_set(vec![Some(ubo)], "set0");
        let mut bound = BoundState::default();
        bound.bind_sets(BindPoint::Compute, 0, &[BoundSet::with_dynamic_offsets(set, vec![16])]);

        let snapshot = DescriptorSnapshot::capture(&bound, BindPoint::Compute, &registry);
        assert_eq!(snapshot.resource(0, 0).map(|r| r.id()), Ok(ubo));

        //rebinding after capture does not leak into the snapshot
        registry.update_descriptor_set(set, 0, None);
        assert_eq!(snapshot.resource(0, 0).map(|r| r.id()), Ok(ubo));

        registry.destroy(ubo);
        assert_eq!(
            snapshot.resource(0, 0).map(|r| r.id()),
            Err(ObservationError::ResourceDestroyed(ubo))
        );
        assert_eq!(
            snapshot.resource(1, 0).map(|r| r.id()),
            Err(ObservationError::Unbound { set: 1, binding: 0 })
        );
        assert_eq!(snapshot.set(0).map(|s| s.dynamic_offsets.clone()), Some(vec![16]));
    }

    #[test]
    fn similarity_tracks_rebinding() {
        let registry = ResourceRegistry::new();
        let a = registry.create_buffer(64, "a");
        let b = registry.create_buffer(64, "b");
        let set_a = registry.create_descriptor_set(vec![Some(a)], "set_a");
        let set_b = registry.create_descriptor_set(vec![Some(b)], "set_b");

        let mut bound = BoundState::default();
        bound.bind_sets(BindPoint::Graphics, 0, &[BoundSet::new(set_a)]);
        let first = DescriptorSnapshot::capture(&bound, BindPoint::Graphics, &registry);
        assert_eq!(first.similarity(&first), 1.0);

        bound.bind_sets(BindPoint::Graphics, 0, &[BoundSet::new(set_b)]);
        let second = DescriptorSnapshot::capture(&bound, BindPoint::Graphics, &registry);
        let s = first.similarity(&second);
        assert!(s < 1.0 && s > 0.0, "similarity was {s}");
    }

    #[test]
    fn destroyed_bindings_no_longer_agree() {
        let registry = ResourceRegistry::new();
        let ubo = registry.create_buffer(64, "ubo");
        let kept = registry.create_buffer(64, "kept");
        let set = registry.create_descriptor_set(vec![Some(ubo), Some(kept)], "set");
        let mut bound = BoundState::default();
        bound.bind_sets(BindPoint::Compute, 0, &[BoundSet::new(set)]);
        let first = DescriptorSnapshot::capture(&bound, BindPoint::Compute, &registry);
        let second = DescriptorSnapshot::capture(&bound, BindPoint::Compute, &registry);
        assert_eq!(first.similarity(&second), 1.0);

        registry.destroy(ubo);
        let s = first.similarity(&second);
        //only the slot holding `ubo` stops agreeing
        assert_eq!(s, 4.0 / 5.0);
        assert_eq!(first.similarity(&first), s);
    }
}
