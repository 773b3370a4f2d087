// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
Recorded command trees.

A [`CommandRecord`] is one complete recorded sequence: an arena of [`Command`] nodes
forming a tree under an implicit root section, plus the side tables those nodes index
into (interned label names, descriptor payload words, descriptor snapshots) and a few
auxiliary indices (referenced handles, per-section statistics, structural diagnostics).

Records are built by a [`RecordBuilder`](builder::RecordBuilder) on one thread and are
immutable afterwards, so any number of readers (the matcher, the hook builder, a
front-end) may share them through a [`RecordHandle`].  The arena is freed in one piece
when the last handle drops.

# Tree shape

```text
Root
├── BeginLabel "shadow"          (section)
│   ├── BindPipeline
│   ├── BeginRenderPass           (section)
│   │   └── Subpass 0             (section)
│   │       ├── Draw
│   │       └── Draw
│   └── EndRenderPass             (appended after the pass, inside the label)
└── EndLabel                      (appended after the label, in the root)
```
*/

pub mod builder;
pub mod command;
pub mod resources;
pub mod snapshot;

use std::fmt::{Debug, Formatter};
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::arena::{ArenaIndex, LinAllocator};
use crate::error::StructuralError;
use command::{Category, Command, CommandKind, NameId, PayloadSpan, SectionKind};
use resources::ResourceId;
use snapshot::{BoundSet, DescriptorSnapshot, SnapshotId};

/// Process-unique identity of a record.  Re-recording always yields a new id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordId(u64);

impl RecordId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        RecordId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// A command inside one record.  Meaningless for any other record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommandId(pub(crate) ArenaIndex);

/**
Position of a command as child indices from the root.

The last element is the command's index among its siblings; everything before it is
the section path.  Paths are comparable across records, which is what makes them
useful for selections and hook-record cache keys.
*/
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct CommandPath(Vec<u32>);

impl CommandPath {
    pub fn new(indices: Vec<u32>) -> Self {
        CommandPath(indices)
    }
    pub fn indices(&self) -> &[u32] {
        &self.0
    }
    pub fn section_path(&self) -> &[u32] {
        self.0.split_last().map(|(_, rest)| rest).unwrap_or(&[])
    }
    pub fn command_index(&self) -> Option<u32> {
        self.0.last().copied()
    }
    pub fn depth(&self) -> usize {
        self.0.len()
    }
}

/// Counts accumulated over a section's whole subtree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SectionStats {
    pub draws: u32,
    pub dispatches: u32,
    pub trace_rays: u32,
    pub transfers: u32,
    pub syncs: u32,
    pub queries: u32,
    pub accel_builds: u32,
    /// `EndLabel` commands below the section.
    pub end_labels: u32,
    /// Every node below the section, sections included.
    pub descendants: u32,
}

impl SectionStats {
    pub(crate) fn count(&mut self, kind: CommandKind) {
        self.descendants += 1;
        if kind == CommandKind::EndLabel {
            self.end_labels += 1;
        }
        match kind.category() {
            Category::Draw => self.draws += 1,
            Category::Dispatch => self.dispatches += 1,
            Category::TraceRays => self.trace_rays += 1,
            Category::Transfer => self.transfers += 1,
            Category::Sync => self.syncs += 1,
            Category::Query => self.queries += 1,
            Category::AccelBuild => self.accel_builds += 1,
            Category::Bind | Category::Label | Category::Structure => {}
        }
    }

    pub(crate) fn merge(&mut self, child: &SectionStats) {
        self.draws += child.draws;
        self.dispatches += child.dispatches;
        self.trace_rays += child.trace_rays;
        self.transfers += child.transfers;
        self.syncs += child.syncs;
        self.queries += child.queries;
        self.accel_builds += child.accel_builds;
        self.end_labels += child.end_labels;
        self.descendants += child.descendants;
    }

    /// Descendants that take part in structural matching.  `EndLabel`s are implied by
    /// their label section, or close a label from another record.
    pub(crate) fn match_weight(&self) -> u32 {
        self.descendants - self.end_labels
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct SectionLinks {
    pub(crate) first_child: Option<CommandId>,
    pub(crate) last_child: Option<CommandId>,
    pub(crate) child_count: u32,
    pub(crate) stats: SectionStats,
}

pub(crate) const FLAG_CROSS_SCOPE: u8 = 1 << 0;
pub(crate) const FLAG_FORCED_CLOSE: u8 = 1 << 1;

#[derive(Debug, Clone, Copy)]
pub(crate) struct CommandNode {
    pub(crate) command: Command,
    pub(crate) parent: Option<CommandId>,
    /// Set once, when the next sibling is appended.
    pub(crate) next: Option<CommandId>,
    pub(crate) section: Option<SectionLinks>,
    pub(crate) state: Option<SnapshotId>,
    pub(crate) flags: u8,
}

/// One complete recorded command sequence.
pub struct CommandRecord {
    pub(crate) id: RecordId,
    pub(crate) nodes: LinAllocator<CommandNode>,
    pub(crate) payload: LinAllocator<u64>,
    pub(crate) names: Vec<Box<str>>,
    pub(crate) snapshots: Vec<Arc<DescriptorSnapshot>>,
    pub(crate) root: CommandId,
    pub(crate) handles: Vec<ResourceId>,
    pub(crate) diagnostics: Vec<StructuralError>,
    pub(crate) unmatched_label_pops: u32,
}

impl Debug for CommandRecord {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRecord")
            .field("id", &self.id)
            .field("nodes", &self.nodes.len())
            .field("handles", &self.handles.len())
            .field("diagnostics", &self.diagnostics)
            .finish()
    }
}

/// Iterator over the direct children of a section.
#[derive(Debug, Clone)]
pub struct Children<'a> {
    record: &'a CommandRecord,
    next: Option<CommandId>,
}

impl Iterator for Children<'_> {
    type Item = CommandId;
    fn next(&mut self) -> Option<CommandId> {
        let current = self.next?;
        self.next = self.record.node(current).next;
        Some(current)
    }
}

impl CommandRecord {
    pub fn id(&self) -> RecordId {
        self.id
    }

    pub fn root(&self) -> CommandId {
        self.root
    }

    pub(crate) fn node(&self, id: CommandId) -> &CommandNode {
        self.nodes.get(id.0)
    }

    pub fn command(&self, id: CommandId) -> &Command {
        &self.node(id).command
    }

    pub fn kind(&self, id: CommandId) -> CommandKind {
        self.node(id).command.kind()
    }

    pub fn parent(&self, id: CommandId) -> Option<CommandId> {
        self.node(id).parent
    }

    pub fn next_sibling(&self, id: CommandId) -> Option<CommandId> {
        self.node(id).next
    }

    /// Children of `section`; empty for plain commands.
    pub fn children(&self, section: CommandId) -> Children<'_> {
        Children {
            record: self,
            next: self.node(section).section.and_then(|s| s.first_child),
        }
    }

    pub fn child_count(&self, section: CommandId) -> u32 {
        self.node(section).section.map_or(0, |s| s.child_count)
    }

    pub fn is_section(&self, id: CommandId) -> bool {
        self.node(id).section.is_some()
    }

    pub fn section_kind(&self, id: CommandId) -> Option<SectionKind> {
        self.node(id).section.and(self.kind(id).section_kind())
    }

    /// Subtree statistics of a section.
    pub fn section_stats(&self, id: CommandId) -> Option<SectionStats> {
        self.node(id).section.map(|s| s.stats)
    }

    /// Statistics of the whole record.
    pub fn stats(&self) -> SectionStats {
        self.section_stats(self.root).unwrap_or_default()
    }

    /// Number of nodes below `id` (0 for plain commands).
    pub fn descendants(&self, id: CommandId) -> u32 {
        self.node(id).section.map_or(0, |s| s.stats.descendants)
    }

    /// Total number of commands, root excluded.
    pub fn len(&self) -> usize {
        self.nodes.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `id` names a command of this record.  The root is not a command.
    pub fn contains(&self, id: CommandId) -> bool {
        (id.0.0 as usize) < self.nodes.len() && id != self.root
    }

    /// Whether a label section was opened here but closed by a later record.
    pub fn is_cross_scope(&self, id: CommandId) -> bool {
        self.node(id).flags & FLAG_CROSS_SCOPE != 0
    }

    /// Whether a non-label section had to be closed when the record was finished.
    pub fn was_force_closed(&self, id: CommandId) -> bool {
        self.node(id).flags & FLAG_FORCED_CLOSE != 0
    }

    pub(crate) fn name(&self, name: NameId) -> &str {
        &self.names[name.0 as usize]
    }

    /// Name of a label command (`BeginLabel` or `InsertLabel`).
    pub fn label_name(&self, id: CommandId) -> Option<&str> {
        match self.command(id) {
            Command::BeginLabel(args) | Command::InsertLabel(args) => Some(self.name(args.name)),
            _ => None,
        }
    }

    /// Descriptor snapshot visible to a draw/dispatch/trace command.
    pub fn snapshot(&self, id: CommandId) -> Option<&Arc<DescriptorSnapshot>> {
        self.node(id)
            .state
            .map(|state| &self.snapshots[state.0 as usize])
    }

    pub(crate) fn snapshot_by_id(&self, id: SnapshotId) -> &Arc<DescriptorSnapshot> {
        &self.snapshots[id.0 as usize]
    }

    pub fn snapshot_count(&self) -> usize {
        self.snapshots.len()
    }

    pub(crate) fn payload(&self, span: PayloadSpan) -> &[u64] {
        let start = span.start as usize;
        self.payload.slice(start..start + span.len())
    }

    /// The sets bound by a `BindDescriptorSets` command.
    pub fn bound_sets(&self, id: CommandId) -> Vec<BoundSet> {
        match self.command(id) {
            Command::BindDescriptorSets(args) => {
                builder::decode_sets(self.payload(args.payload), args.set_count)
            }
            _ => Vec::new(),
        }
    }

    /// Every resource referenced by the record, sorted and de-duplicated.
    pub fn handles(&self) -> &[ResourceId] {
        &self.handles
    }

    pub fn references(&self, id: ResourceId) -> bool {
        self.handles.binary_search(&id).is_ok()
    }

    /// Structural problems found (and recovered from) while recording.
    pub fn diagnostics(&self) -> &[StructuralError] {
        &self.diagnostics
    }

    /// `EndLabel`s that closed a label opened by an earlier record.
    pub fn unmatched_label_pops(&self) -> u32 {
        self.unmatched_label_pops
    }

    /// Sections enclosing `id`, outermost (root) first, `id` excluded.
    pub fn ancestors(&self, id: CommandId) -> Vec<CommandId> {
        let mut chain = Vec::new();
        let mut current = self.parent(id);
        while let Some(section) = current {
            chain.push(section);
            current = self.parent(section);
        }
        chain.reverse();
        chain
    }

    /// Index of `id` among its siblings.
    pub fn sibling_index(&self, id: CommandId) -> Option<u32> {
        let parent = self.parent(id)?;
        self.children(parent)
            .position(|c| c == id)
            .map(|i| i as u32)
    }

    pub fn path_of(&self, id: CommandId) -> CommandPath {
        let mut indices = Vec::new();
        let mut current = id;
        while let Some(index) = self.sibling_index(current) {
            indices.push(index);
            match self.parent(current) {
                Some(parent) => current = parent,
                None => break,
            }
        }
        indices.reverse();
        CommandPath(indices)
    }

    pub fn command_at(&self, path: &CommandPath) -> Option<CommandId> {
        let mut current = self.root;
        for &index in path.indices() {
            current = self.children(current).nth(index as usize)?;
        }
        if current == self.root && path.depth() > 0 {
            return None;
        }
        Some(current)
    }

    /// Visits every command below the root in recording order.
    pub fn walk(&self, mut visit: impl FnMut(CommandId, usize)) {
        fn go(record: &CommandRecord, section: CommandId, depth: usize, visit: &mut dyn FnMut(CommandId, usize)) {
            for child in record.children(section) {
                visit(child, depth);
                if record.is_section(child) {
                    go(record, child, depth + 1, visit);
                }
            }
        }
        go(self, self.root, 0, &mut visit);
    }

    /// The first command of `kind`, in recording order.
    pub fn find(&self, kind: CommandKind) -> Option<CommandId> {
        let mut found = None;
        self.walk(|id, _| {
            if found.is_none() && self.kind(id) == kind {
                found = Some(id);
            }
        });
        found
    }
}

/**
Shared ownership of a finished [`CommandRecord`].

Cloning adds an owner; dropping releases one.  The record (and its arena) is freed
when the last handle drops.  Hooks keep only a [`WeakRecord`], so they never extend a
record's life.
*/
#[derive(Debug)]
pub struct RecordHandle(Arc<CommandRecord>);

impl RecordHandle {
    pub(crate) fn new(record: CommandRecord) -> Self {
        RecordHandle(Arc::new(record))
    }

    pub fn downgrade(&self) -> WeakRecord {
        WeakRecord {
            id: self.0.id,
            record: Arc::downgrade(&self.0),
        }
    }

    /// Number of live handles to this record.
    pub fn owners(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    pub fn ptr_eq(&self, other: &RecordHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Clone for RecordHandle {
    fn clone(&self) -> Self {
        RecordHandle(Arc::clone(&self.0))
    }
}

impl Deref for RecordHandle {
    type Target = CommandRecord;
    fn deref(&self) -> &CommandRecord {
        &self.0
    }
}

/// A non-owning reference to a record.
#[derive(Debug, Clone)]
pub struct WeakRecord {
    id: RecordId,
    record: Weak<CommandRecord>,
}

impl WeakRecord {
    pub fn id(&self) -> RecordId {
        self.id
    }

    pub fn upgrade(&self) -> Option<RecordHandle> {
        self.record.upgrade().map(RecordHandle)
    }

    pub fn is_released(&self) -> bool {
        self.record.strong_count() == 0
    }
}
