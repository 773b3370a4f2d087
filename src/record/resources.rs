// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Resource identities and the table that resolves them.
//!
//! Commands name resources only by [`ResourceId`].  Anything that must keep a
//! resource identifiable past its destruction (descriptor snapshots, hook copies)
//! holds an `Arc<TrackedResource>` obtained from a [`ResourceTable`]; destruction flips
//! a flag on the shared entry instead of freeing it, so holders observe it rather than
//! dangle.

use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::lock_recover;

/// Opaque identity of an application resource.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(pub u64);

impl ResourceId {
    /// Placeholder for "no resource" inside POD command arguments.
    pub const NULL: ResourceId = ResourceId(0);

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl Debug for ResourceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ResourceId({:#x})", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Buffer,
    Image,
    AccelerationStructure,
    DescriptorSet,
    Pipeline,
    QueryPool,
    RenderPass,
    Framebuffer,
}

/// A resource as seen by the engine: identity, kind, byte size, and whether it has been destroyed.
pub struct TrackedResource {
    id: ResourceId,
    kind: ResourceKind,
    size: u64,
    name: String,
    destroyed: AtomicBool,
}

impl TrackedResource {
    pub fn new(id: ResourceId, kind: ResourceKind, size: u64, name: impl Into<String>) -> Self {
        TrackedResource {
            id,
            kind,
            size,
            name: name.into(),
            destroyed: AtomicBool::new(false),
        }
    }
    pub fn id(&self) -> ResourceId {
        self.id
    }
    pub fn kind(&self) -> ResourceKind {
        self.kind
    }
    /// Size in bytes of the resource's backing memory; what a full copy reads.
    pub fn size(&self) -> u64 {
        self.size
    }
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }
    pub fn mark_destroyed(&self) {
        self.destroyed.store(true, Ordering::Release);
    }
}

impl Debug for TrackedResource {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackedResource")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("size", &self.size)
            .field("name", &self.name)
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

/**
Resolves resource identities to live entries.

This is the seam to the layer's handle tables.  [`ResourceRegistry`] is a complete
in-process implementation.
*/
pub trait ResourceTable: Send + Sync {
    /// Returns the entry for `id`, or `None` if it was never known or has been destroyed.
    fn resolve(&self, id: ResourceId) -> Option<Arc<TrackedResource>>;

    /// Current contents of a descriptor set, one slot per binding.
    fn descriptor_set_bindings(&self, set: ResourceId) -> Option<Vec<Option<ResourceId>>>;
}

/// A thread-safe, in-process [`ResourceTable`].
#[derive(Debug)]
pub struct ResourceRegistry {
    next_id: AtomicU64,
    live: Mutex<HashMap<ResourceId, Arc<TrackedResource>>>,
    sets: Mutex<HashMap<ResourceId, Vec<Option<ResourceId>>>>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        ResourceRegistry {
            //0 is ResourceId::NULL
            next_id: AtomicU64::new(1),
            live: Mutex::new(HashMap::new()),
            sets: Mutex::new(HashMap::new()),
        }
    }

    pub fn create(&self, kind: ResourceKind, size: u64, name: &str) -> ResourceId {
        let id = ResourceId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let resource = Arc::new(TrackedResource::new(id, kind, size, name));
        lock_recover(&self.live).insert(id, resource);
        id
    }

    pub fn create_buffer(&self, size: u64, name: &str) -> ResourceId {
        self.create(ResourceKind::Buffer, size, name)
    }

    pub fn create_image(&self, size: u64, name: &str) -> ResourceId {
        self.create(ResourceKind::Image, size, name)
    }

    pub fn create_descriptor_set(&self, bindings: Vec<Option<ResourceId>>, name: &str) -> ResourceId {
        let id = self.create(ResourceKind::DescriptorSet, 0, name);
        lock_recover(&self.sets).insert(id, bindings);
        id
    }

    /// Rewrites one binding of a descriptor set.  Snapshots taken earlier are unaffected.
    pub fn update_descriptor_set(&self, set: ResourceId, binding: u32, resource: Option<ResourceId>) {
        let mut sets = lock_recover(&self.sets);
        match sets.get_mut(&set) {
            Some(slots) => {
                let binding = binding as usize;
                if slots.len() <= binding {
                    slots.resize(binding + 1, None);
                }
                slots[binding] = resource;
            }
            None => {
                logwise::warn_sync!(
                    "update of unknown descriptor set {set}",
                    set = logwise::privacy::LogIt(&set)
                );
            }
        }
    }

    /// Destroys a resource.  Holders of its entry see [`TrackedResource::is_destroyed`].
    pub fn destroy(&self, id: ResourceId) {
        let removed = lock_recover(&self.live).remove(&id);
        lock_recover(&self.sets).remove(&id);
        match removed {
            Some(resource) => resource.mark_destroyed(),
            None => {
                logwise::warn_sync!(
                    "destroy of unknown resource {id}",
                    id = logwise::privacy::LogIt(&id)
                );
            }
        }
    }

    pub fn live_count(&self) -> usize {
        lock_recover(&self.live).len()
    }
}

impl Default for ResourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceTable for ResourceRegistry {
    fn resolve(&self, id: ResourceId) -> Option<Arc<TrackedResource>> {
        lock_recover(&self.live).get(&id).cloned()
    }

    fn descriptor_set_bindings(&self, set: ResourceId) -> Option<Vec<Option<ResourceId>>> {
        lock_recover(&self.sets).get(&set).cloned()
    }
}
