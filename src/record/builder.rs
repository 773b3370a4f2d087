// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
Builds a [`CommandRecord`] from a stream of commands.

A builder is owned by one recording thread.  It appends nodes into the record's arena,
maintains the section stack, and tracks the bound state so every draw, dispatch and
trace command gets a [`DescriptorSnapshot`] of what it could see.

Recording never fails.  Malformed streams (an end with nothing open, sections left
open at [`RecordBuilder::finish`]) are repaired locally and reported through
[`CommandRecord::diagnostics`].
*/

use std::collections::HashMap;
use std::sync::Arc;

use crate::arena::LinAllocator;
use crate::error::StructuralError;
use crate::record::command::{
    BindDescriptorSetsArgs, BindIndexBufferArgs, BindPipelineArgs, BindPoint,
    BindVertexBufferArgs, Command, CommandKind, ExecuteChildArgs, ExecuteCommandsArgs,
    LabelArgs, NameId, PayloadSpan, RenderPassArgs, SectionKind, SubpassArgs,
};
use crate::record::resources::{ResourceId, ResourceTable};
use crate::record::snapshot::{BoundSet, BoundState, DescriptorSnapshot, SnapshotId};
use crate::record::{
    CommandId, CommandNode, CommandRecord, FLAG_CROSS_SCOPE, FLAG_FORCED_CLOSE, RecordHandle,
    RecordId, SectionLinks,
};

#[derive(Debug, Clone, Copy)]
struct Frame {
    section: CommandId,
    last: Option<CommandId>,
}

/// Records one command sequence.
pub struct RecordBuilder {
    id: RecordId,
    table: Arc<dyn ResourceTable>,
    nodes: LinAllocator<CommandNode>,
    payload: LinAllocator<u64>,
    names: Vec<Box<str>>,
    name_lookup: HashMap<Box<str>, NameId>,
    snapshots: Vec<Arc<DescriptorSnapshot>>,
    //(bound generation, snapshot) last captured per bind point
    last_snapshot: [Option<(u64, SnapshotId)>; BindPoint::COUNT],
    bound: BoundState,
    stack: Vec<Frame>,
    handles: Vec<ResourceId>,
    diagnostics: Vec<StructuralError>,
    unmatched_label_pops: u32,
}

impl std::fmt::Debug for RecordBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordBuilder")
            .field("id", &self.id)
            .field("nodes", &self.nodes.len())
            .field("depth", &self.depth())
            .finish()
    }
}

impl RecordBuilder {
    pub fn new(table: Arc<dyn ResourceTable>) -> Self {
        let mut nodes = LinAllocator::with_capacity(64);
        let root = CommandId(nodes.alloc(CommandNode {
            command: Command::Root,
            parent: None,
            next: None,
            section: Some(SectionLinks::default()),
            state: None,
            flags: 0,
        }));
        RecordBuilder {
            id: RecordId::next(),
            table,
            nodes,
            payload: LinAllocator::new(),
            names: Vec::new(),
            name_lookup: HashMap::new(),
            snapshots: Vec::new(),
            last_snapshot: [None; BindPoint::COUNT],
            bound: BoundState::default(),
            stack: vec![Frame {
                section: root,
                last: None,
            }],
            handles: Vec::new(),
            diagnostics: Vec::new(),
            unmatched_label_pops: 0,
        }
    }

    /// Id the finished record will carry.
    pub fn id(&self) -> RecordId {
        self.id
    }

    /// Number of open sections, root excluded.
    pub fn depth(&self) -> usize {
        self.stack.len() - 1
    }

    fn top(&self) -> Frame {
        //the root frame is never popped
        self.stack[self.stack.len() - 1]
    }

    fn top_kind(&self) -> Option<SectionKind> {
        self.nodes.get(self.top().section.0).command.section_kind()
    }

    fn intern(&mut self, name: &str) -> NameId {
        if let Some(id) = self.name_lookup.get(name) {
            return *id;
        }
        let id = NameId(self.names.len() as u32);
        self.names.push(name.into());
        self.name_lookup.insert(name.into(), id);
        id
    }

    /// Links a node after the current cursor and counts it in the enclosing section.
    fn link(&mut self, command: Command, state: Option<SnapshotId>, flags: u8) -> CommandId {
        let frame = self.top();
        let kind = command.kind();
        let id = CommandId(self.nodes.alloc(CommandNode {
            command,
            parent: Some(frame.section),
            next: None,
            section: kind.is_section().then(SectionLinks::default),
            state,
            flags,
        }));
        if let Some(last) = frame.last {
            let prev = self.nodes.get_mut(last.0);
            debug_assert!(prev.next.is_none());
            prev.next = Some(id);
        }
        if let Some(links) = self.nodes.get_mut(frame.section.0).section.as_mut() {
            if links.first_child.is_none() {
                links.first_child = Some(id);
            }
            links.last_child = Some(id);
            links.child_count += 1;
            links.stats.count(kind);
        }
        let top = self.stack.len() - 1;
        self.stack[top].last = Some(id);
        id
    }

    fn push(&mut self, section: CommandId) {
        self.stack.push(Frame {
            section,
            last: None,
        });
    }

    /// Closes the innermost open section and folds its statistics into the parent.
    fn pop(&mut self) -> Option<CommandId> {
        if self.stack.len() <= 1 {
            return None;
        }
        let frame = self.stack.pop()?;
        let stats = self
            .nodes
            .get(frame.section.0)
            .section
            .map(|s| s.stats)
            .unwrap_or_default();
        let parent = self.top().section;
        if let Some(links) = self.nodes.get_mut(parent.0).section.as_mut() {
            links.stats.merge(&stats);
        }
        Some(frame.section)
    }

    fn track(&mut self, command: &Command) {
        match *command {
            Command::BindPipeline(a) => self.bound.bind_pipeline(a.bind_point, a.pipeline),
            Command::BindVertexBuffer(a) => {
                self.bound.bind_vertex_buffer(a.binding, a.buffer, a.offset)
            }
            Command::BindIndexBuffer(a) => self.bound.bind_index_buffer(a.buffer, a.offset),
            _ => {}
        }
        command.for_each_resource(|id| self.handles.push(id));
    }

    fn snapshot_for(&mut self, kind: CommandKind) -> Option<SnapshotId> {
        let bind_point = match kind {
            CommandKind::Draw
            | CommandKind::DrawIndexed
            | CommandKind::DrawIndirect
            | CommandKind::DrawIndexedIndirect => BindPoint::Graphics,
            CommandKind::Dispatch | CommandKind::DispatchIndirect => BindPoint::Compute,
            CommandKind::TraceRays => BindPoint::RayTracing,
            _ => return None,
        };
        let generation = self.bound.generation(bind_point);
        if let Some((seen, id)) = self.last_snapshot[bind_point.index()] {
            if seen == generation {
                return Some(id);
            }
        }
        let snapshot = DescriptorSnapshot::capture(&self.bound, bind_point, self.table.as_ref());
        self.handles.extend(snapshot.resource_ids());
        let id = SnapshotId(self.snapshots.len() as u32);
        self.snapshots.push(Arc::new(snapshot));
        self.last_snapshot[bind_point.index()] = Some((generation, id));
        Some(id)
    }

    /**
    Appends one command at the current position.

    Section-opening commands open a section, `EndLabel`/`EndRenderPass` close one.
    Everything else becomes a plain child of the innermost open section.
    */
    pub fn record(&mut self, command: Command) -> CommandId {
        match command {
            Command::Root => {
                logwise::warn_sync!("Root cannot be recorded; ignoring");
                self.top().section
            }
            Command::EndLabel => self.end_label(),
            Command::EndRenderPass => self.end_render_pass(),
            _ if command.kind().is_section() => self.begin_section(command),
            _ => {
                self.track(&command);
                let state = self.snapshot_for(command.kind());
                self.link(command, state, 0)
            }
        }
    }

    /// Appends `command` and makes it the innermost open section.
    pub fn begin_section(&mut self, command: Command) -> CommandId {
        if !command.kind().is_section() {
            logwise::warn_sync!(
                "begin_section with non-section {kind}; recording as a plain command",
                kind = logwise::privacy::LogIt(&command.kind())
            );
            return self.record(command);
        }
        self.track(&command);
        let id = self.link(command, None, 0);
        self.push(id);
        id
    }

    /**
    Closes the innermost open section, then appends `end` (if any) after it.

    With nothing open, the end command is kept at the current level and the underflow
    is reported, except for `EndLabel`, which may legally close a label opened by an
    earlier record.
    */
    pub fn end_section(&mut self, end: Option<Command>) -> Option<CommandId> {
        if self.pop().is_none() {
            match end {
                Some(Command::EndLabel) => {
                    self.unmatched_label_pops += 1;
                    logwise::trace_sync!("EndLabel closes a label from another record");
                }
                _ => {
                    let end_kind = end.map(|c| c.kind());
                    logwise::warn_sync!(
                        "section end {end} with no open section",
                        end = logwise::privacy::LogIt(&end_kind)
                    );
                    self.diagnostics
                        .push(StructuralError::Underflow { end: end_kind });
                }
            }
        }
        end.map(|end| {
            self.track(&end);
            self.link(end, None, 0)
        })
    }

    /// Closes sections until one of `kind` has been closed, reporting each one passed over.
    fn close_through(&mut self, kind: SectionKind) {
        while self.stack.len() > 1 {
            let section = self.top().section;
            let open = self.top_kind().unwrap_or(SectionKind::Root);
            if open == kind {
                self.pop();
                return;
            }
            self.diagnostics.push(StructuralError::SectionMismatch {
                depth: self.depth(),
                expected: kind,
                found: open,
            });
            self.nodes.get_mut(section.0).flags |= FLAG_FORCED_CLOSE;
            self.pop();
        }
    }

    fn is_open(&self, kind: SectionKind) -> bool {
        self.stack[1..]
            .iter()
            .any(|f| self.nodes.get(f.section.0).command.section_kind() == Some(kind))
    }

    pub fn begin_label(&mut self, name: &str, color: [u8; 4]) -> CommandId {
        let name = self.intern(name);
        self.begin_section(Command::BeginLabel(LabelArgs { name, color }))
    }

    /// Closes the innermost open label and appends an `EndLabel` after it.
    pub fn end_label(&mut self) -> CommandId {
        if self.is_open(SectionKind::Label) {
            self.close_through(SectionKind::Label);
        } else {
            //pushed by an earlier record
            self.unmatched_label_pops += 1;
        }
        self.link(Command::EndLabel, None, 0)
    }

    pub fn insert_label(&mut self, name: &str, color: [u8; 4]) -> CommandId {
        let name = self.intern(name);
        self.link(Command::InsertLabel(LabelArgs { name, color }), None, 0)
    }

    /// Opens a render pass and its first subpass.
    pub fn begin_render_pass(&mut self, args: RenderPassArgs) -> CommandId {
        let pass = self.begin_section(Command::BeginRenderPass(args));
        self.begin_section(Command::Subpass(SubpassArgs { index: 0 }));
        pass
    }

    /// Closes the current subpass and opens the next one.
    pub fn next_subpass(&mut self) -> CommandId {
        match self.nodes.get(self.top().section.0).command {
            Command::Subpass(SubpassArgs { index }) => {
                self.pop();
                self.begin_section(Command::Subpass(SubpassArgs { index: index + 1 }))
            }
            _ => {
                logwise::warn_sync!("next_subpass outside of a render pass");
                self.diagnostics
                    .push(StructuralError::SubpassOutsideRenderPass);
                self.begin_section(Command::Subpass(SubpassArgs { index: 0 }))
            }
        }
    }

    /// Closes the open subpass and render pass, then appends `EndRenderPass`.
    pub fn end_render_pass(&mut self) -> CommandId {
        if !self.is_open(SectionKind::RenderPass) {
            logwise::warn_sync!("EndRenderPass with no open render pass");
            self.diagnostics.push(StructuralError::Underflow {
                end: Some(CommandKind::EndRenderPass),
            });
            return self.link(Command::EndRenderPass, None, 0);
        }
        if self.is_open(SectionKind::Subpass) {
            self.close_through(SectionKind::Subpass);
        }
        self.close_through(SectionKind::RenderPass);
        self.link(Command::EndRenderPass, None, 0)
    }

    pub fn bind_pipeline(&mut self, bind_point: BindPoint, pipeline: ResourceId) -> CommandId {
        self.record(Command::BindPipeline(BindPipelineArgs {
            bind_point,
            pipeline,
        }))
    }

    pub fn bind_vertex_buffer(&mut self, binding: u32, buffer: ResourceId, offset: u64) -> CommandId {
        self.record(Command::BindVertexBuffer(BindVertexBufferArgs {
            binding,
            buffer,
            offset,
        }))
    }

    pub fn bind_index_buffer(&mut self, args: BindIndexBufferArgs) -> CommandId {
        self.record(Command::BindIndexBuffer(args))
    }

    fn encode_sets(&mut self, sets: &[BoundSet]) -> PayloadSpan {
        let start = self.payload.len();
        for set in sets {
            self.payload.alloc(set.set.0);
            self.payload.alloc(set.dynamic_offsets.len() as u64);
            for offset in &set.dynamic_offsets {
                self.payload.alloc(*offset as u64);
            }
        }
        PayloadSpan {
            start: start as u32,
            len: (self.payload.len() - start) as u32,
        }
    }

    /// Binds descriptor sets `first_set..first_set + sets.len()` at `bind_point`.
    pub fn bind_descriptor_sets(
        &mut self,
        bind_point: BindPoint,
        first_set: u32,
        sets: &[BoundSet],
    ) -> CommandId {
        let payload = self.encode_sets(sets);
        self.bound.bind_sets(bind_point, first_set, sets);
        self.handles.extend(sets.iter().map(|s| s.set));
        self.link(
            Command::BindDescriptorSets(BindDescriptorSetsArgs {
                bind_point,
                first_set,
                set_count: sets.len() as u32,
                payload,
            }),
            None,
            0,
        )
    }

    /**
    Executes secondary records.

    Each secondary is deep-copied under its own `ExecuteCommandsChild` section, so the
    primary stays valid however long the secondaries live.
    */
    pub fn execute_commands(&mut self, secondaries: &[&CommandRecord]) -> CommandId {
        let section = self.begin_section(Command::ExecuteCommands(ExecuteCommandsArgs {
            count: secondaries.len() as u32,
        }));
        for (index, secondary) in secondaries.iter().enumerate() {
            self.begin_section(Command::ExecuteCommandsChild(ExecuteChildArgs {
                index: index as u32,
                record: secondary.id(),
            }));
            let mut snapshot_map = HashMap::new();
            self.copy_children(secondary, secondary.root(), &mut snapshot_map);
            self.handles.extend_from_slice(secondary.handles());
            self.unmatched_label_pops += secondary.unmatched_label_pops();
            self.pop();
        }
        self.pop();
        section
    }

    fn copy_children(
        &mut self,
        source: &CommandRecord,
        section: CommandId,
        snapshot_map: &mut HashMap<SnapshotId, SnapshotId>,
    ) {
        for child in source.children(section) {
            let node = source.node(child);
            let command = match node.command {
                Command::BeginLabel(args) => Command::BeginLabel(LabelArgs {
                    name: self.intern(source.name(args.name)),
                    color: args.color,
                }),
                Command::InsertLabel(args) => Command::InsertLabel(LabelArgs {
                    name: self.intern(source.name(args.name)),
                    color: args.color,
                }),
                Command::BindDescriptorSets(args) => {
                    let sets = decode_sets(source.payload(args.payload), args.set_count);
                    Command::BindDescriptorSets(BindDescriptorSetsArgs {
                        payload: self.encode_sets(&sets),
                        ..args
                    })
                }
                other => other,
            };
            let state = node.state.map(|source_state| {
                *snapshot_map.entry(source_state).or_insert_with(|| {
                    let id = SnapshotId(self.snapshots.len() as u32);
                    self.snapshots
                        .push(Arc::clone(source.snapshot_by_id(source_state)));
                    id
                })
            });
            let id = self.link(command, state, node.flags);
            if node.section.is_some() {
                self.push(id);
                self.copy_children(source, child, snapshot_map);
                self.pop();
            }
        }
    }

    /**
    Finishes the record.

    Sections still open are closed.  Open labels are legal (a later record may pop
    them) and are flagged as cross-scope; they are reported as
    [`StructuralError::LabelsLeftOpen`].  Any other open section is reported as
    [`StructuralError::Unterminated`].
    */
    pub fn finish(mut self) -> RecordHandle {
        let (mut unterminated, mut labels) = (0, 0);
        while self.stack.len() > 1 {
            let section = self.top().section;
            let node = self.nodes.get_mut(section.0);
            if node.command.kind() == CommandKind::BeginLabel {
                node.flags |= FLAG_CROSS_SCOPE;
                labels += 1;
            } else {
                node.flags |= FLAG_FORCED_CLOSE;
                unterminated += 1;
            }
            self.pop();
        }
        if unterminated > 0 {
            logwise::warn_sync!(
                "record finished with {n} open section(s)",
                n = unterminated
            );
            self.diagnostics
                .push(StructuralError::Unterminated { open: unterminated });
        }
        if labels > 0 {
            logwise::trace_sync!(
                "record finished with {n} open label(s), kept as cross-scope",
                n = labels
            );
            self.diagnostics
                .push(StructuralError::LabelsLeftOpen { open: labels });
        }
        self.handles.sort_unstable();
        self.handles.dedup();
        logwise::trace_sync!(
            "finished record {id} with {nodes} nodes, {snapshots} snapshots",
            id = logwise::privacy::LogIt(&self.id),
            nodes = self.nodes.len(),
            snapshots = self.snapshots.len()
        );
        RecordHandle::new(CommandRecord {
            id: self.id,
            root: CommandId(crate::arena::ArenaIndex(0)),
            nodes: self.nodes,
            payload: self.payload,
            names: self.names,
            snapshots: self.snapshots,
            handles: self.handles,
            diagnostics: self.diagnostics,
            unmatched_label_pops: self.unmatched_label_pops,
        })
    }
}

/// Decodes the payload written for a `BindDescriptorSets` command.
pub(crate) fn decode_sets(words: &[u64], set_count: u32) -> Vec<BoundSet> {
    let mut sets = Vec::with_capacity(set_count as usize);
    let mut cursor = 0;
    for _ in 0..set_count {
        let (Some(&set), Some(&count)) = (words.get(cursor), words.get(cursor + 1)) else {
            break;
        };
        let offsets_start = cursor + 2;
        let offsets_end = (offsets_start + count as usize).min(words.len());
        let dynamic_offsets = words[offsets_start..offsets_end]
            .iter()
            .map(|w| *w as u32)
            .collect();
        sets.push(BoundSet::with_dynamic_offsets(ResourceId(set), dynamic_offsets));
        cursor = offsets_end;
    }
    sets
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::command::{DispatchArgs, DrawArgs};
    use crate::record::resources::ResourceRegistry;

    fn builder() -> (Arc<ResourceRegistry>, RecordBuilder) {
        let registry = Arc::new(ResourceRegistry::new());
        let builder = RecordBuilder::new(registry.clone());
        (registry, builder)
    }

    fn draw(vertex_count: u32) -> Command {
        Command::Draw(DrawArgs {
            vertex_count,
            instance_count: 1,
            first_vertex: 0,
            first_instance: 0,
        })
    }

    #[test]
    fn stats_accumulate_into_ancestors() {
        let (_, mut b) = builder();
        b.begin_label("outer", [0; 4]);
        b.record(draw(3));
        b.begin_label("inner", [0; 4]);
        b.record(Command::Dispatch(DispatchArgs { x: 1, y: 1, z: 1 }));
        b.record(draw(6));
        b.end_label();
        b.end_label();
        let record = b.finish();

        let stats = record.stats();
        assert_eq!(stats.draws, 2);
        assert_eq!(stats.dispatches, 1);
        // 2 labels, 2 EndLabels, 3 plain
        assert_eq!(stats.descendants, 7);
        assert!(record.diagnostics().is_empty());
    }

    #[test]
    fn payload_round_trips_through_the_record() {
        let (registry, mut b) = builder();
        let set = registry.create_descriptor_set(vec![None], "set");
        let sets = [
            BoundSet::with_dynamic_offsets(set, vec![4, 8]),
            BoundSet::new(set),
        ];
        let bind = b.bind_descriptor_sets(BindPoint::Compute, 1, &sets);
        let record = b.finish();
        assert_eq!(record.bound_sets(bind), sets.to_vec());
        assert!(record.references(set));
    }

    #[test]
    fn unchanged_state_shares_one_snapshot() {
        let (_, mut b) = builder();
        b.record(draw(1));
        b.record(draw(2));
        b.bind_pipeline(BindPoint::Graphics, ResourceId(99));
        b.record(draw(3));
        let record = b.finish();
        assert_eq!(record.snapshot_count(), 2);
    }

    #[test]
    fn decode_tolerates_truncation() {
        assert_eq!(decode_sets(&[5, 3, 1], 2), vec![BoundSet::with_dynamic_offsets(ResourceId(5), vec![1])]);
        assert!(decode_sets(&[], 1).is_empty());
    }
}
