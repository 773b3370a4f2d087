// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
The closed set of recordable commands.

A [`Command`] is plain data: every argument is `Copy`, and anything variable-length
(descriptor set lists, dynamic offsets) or record-local (label names) is stored in the
owning [`CommandRecord`](crate::record::CommandRecord) and referenced by index.

Sections are commands too.  Which kinds own children is decided by
[`CommandKind::section_kind`], so the matcher and the hook builder can enumerate kinds
exhaustively.
*/

use crate::record::RecordId;
use crate::record::resources::ResourceId;

/// Index of an interned string inside one record.  Only meaningful within that record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NameId(pub(crate) u32);

/// A range in a record's payload words.  Only meaningful within that record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PayloadSpan {
    pub(crate) start: u32,
    pub(crate) len: u32,
}

impl PayloadSpan {
    pub const EMPTY: PayloadSpan = PayloadSpan { start: 0, len: 0 };

    pub fn len(self) -> usize {
        self.len as usize
    }
    pub fn is_empty(self) -> bool {
        self.len == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindPoint {
    Graphics,
    Compute,
    RayTracing,
}

impl BindPoint {
    pub const COUNT: usize = 3;

    pub const fn index(self) -> usize {
        match self {
            BindPoint::Graphics => 0,
            BindPoint::Compute => 1,
            BindPoint::RayTracing => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexType {
    U16,
    U32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DrawArgs {
    pub vertex_count: u32,
    pub instance_count: u32,
    pub first_vertex: u32,
    pub first_instance: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DrawIndexedArgs {
    pub index_count: u32,
    pub instance_count: u32,
    pub first_index: u32,
    pub vertex_offset: i32,
    pub first_instance: u32,
}

/// Arguments of the indirect draw/dispatch family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndirectArgs {
    pub buffer: ResourceId,
    pub offset: u64,
    pub count: u32,
    pub stride: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DispatchArgs {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TraceRaysArgs {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyBufferArgs {
    pub src: ResourceId,
    pub dst: ResourceId,
    pub src_offset: u64,
    pub dst_offset: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyImageArgs {
    pub src: ResourceId,
    pub dst: ResourceId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FillBufferArgs {
    pub dst: ResourceId,
    pub offset: u64,
    pub size: u64,
    pub data: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindPipelineArgs {
    pub bind_point: BindPoint,
    pub pipeline: ResourceId,
}

/// Filled in by [`RecordBuilder::bind_descriptor_sets`](crate::record::builder::RecordBuilder::bind_descriptor_sets).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindDescriptorSetsArgs {
    pub bind_point: BindPoint,
    pub first_set: u32,
    pub set_count: u32,
    /// Per set: the set id, its dynamic offset count, then the offsets.
    pub(crate) payload: PayloadSpan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindVertexBufferArgs {
    pub binding: u32,
    pub buffer: ResourceId,
    pub offset: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindIndexBufferArgs {
    pub buffer: ResourceId,
    pub offset: u64,
    pub index_type: IndexType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PushConstantsArgs {
    pub offset: u32,
    pub size: u32,
    /// Hash of the pushed bytes; the bytes themselves are not kept.
    pub content_hash: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BarrierArgs {
    pub src_stages: u32,
    pub dst_stages: u32,
    pub memory_barriers: u32,
    pub buffer_barriers: u32,
    pub image_barriers: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryArgs {
    pub query_pool: ResourceId,
    pub query: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildAccelArgs {
    pub dst: ResourceId,
    /// Source structure for an update build, `ResourceId::NULL` otherwise.
    pub src: ResourceId,
    pub primitive_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LabelArgs {
    pub(crate) name: NameId,
    pub color: [u8; 4],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderPassArgs {
    pub render_pass: ResourceId,
    pub framebuffer: ResourceId,
    pub subpass_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubpassArgs {
    pub index: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecuteCommandsArgs {
    pub count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecuteChildArgs {
    pub index: u32,
    /// The secondary record this section was copied from.
    pub record: RecordId,
}

/// One recorded command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// The implicit outermost section of every record.
    Root,
    Draw(DrawArgs),
    DrawIndexed(DrawIndexedArgs),
    DrawIndirect(IndirectArgs),
    DrawIndexedIndirect(IndirectArgs),
    Dispatch(DispatchArgs),
    DispatchIndirect(IndirectArgs),
    TraceRays(TraceRaysArgs),
    CopyBuffer(CopyBufferArgs),
    CopyImage(CopyImageArgs),
    FillBuffer(FillBufferArgs),
    BindPipeline(BindPipelineArgs),
    BindDescriptorSets(BindDescriptorSetsArgs),
    BindVertexBuffer(BindVertexBufferArgs),
    BindIndexBuffer(BindIndexBufferArgs),
    PushConstants(PushConstantsArgs),
    Barrier(BarrierArgs),
    WriteTimestamp(QueryArgs),
    BeginQuery(QueryArgs),
    EndQuery(QueryArgs),
    BuildAccelerationStructure(BuildAccelArgs),
    InsertLabel(LabelArgs),
    BeginLabel(LabelArgs),
    EndLabel,
    BeginRenderPass(RenderPassArgs),
    Subpass(SubpassArgs),
    EndRenderPass,
    ExecuteCommands(ExecuteCommandsArgs),
    ExecuteCommandsChild(ExecuteChildArgs),
}

/// The type tag of a [`Command`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CommandKind {
    Root,
    Draw,
    DrawIndexed,
    DrawIndirect,
    DrawIndexedIndirect,
    Dispatch,
    DispatchIndirect,
    TraceRays,
    CopyBuffer,
    CopyImage,
    FillBuffer,
    BindPipeline,
    BindDescriptorSets,
    BindVertexBuffer,
    BindIndexBuffer,
    PushConstants,
    Barrier,
    WriteTimestamp,
    BeginQuery,
    EndQuery,
    BuildAccelerationStructure,
    InsertLabel,
    BeginLabel,
    EndLabel,
    BeginRenderPass,
    Subpass,
    EndRenderPass,
    ExecuteCommands,
    ExecuteCommandsChild,
}

/// Kinds of command that own children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SectionKind {
    Root,
    Label,
    RenderPass,
    Subpass,
    ExecuteCommands,
    ExecuteCommandsChild,
}

/// Coarse grouping of command kinds, used for per-section statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Draw,
    Dispatch,
    TraceRays,
    Transfer,
    Bind,
    Sync,
    Query,
    AccelBuild,
    Label,
    Structure,
}

impl CommandKind {
    pub const COUNT: usize = CommandKind::ExecuteCommandsChild as usize + 1;

    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn section_kind(self) -> Option<SectionKind> {
        match self {
            CommandKind::Root => Some(SectionKind::Root),
            CommandKind::BeginLabel => Some(SectionKind::Label),
            CommandKind::BeginRenderPass => Some(SectionKind::RenderPass),
            CommandKind::Subpass => Some(SectionKind::Subpass),
            CommandKind::ExecuteCommands => Some(SectionKind::ExecuteCommands),
            CommandKind::ExecuteCommandsChild => Some(SectionKind::ExecuteCommandsChild),
            _ => None,
        }
    }

    pub const fn is_section(self) -> bool {
        self.section_kind().is_some()
    }

    pub const fn category(self) -> Category {
        match self {
            CommandKind::Draw
            | CommandKind::DrawIndexed
            | CommandKind::DrawIndirect
            | CommandKind::DrawIndexedIndirect => Category::Draw,
            CommandKind::Dispatch | CommandKind::DispatchIndirect => Category::Dispatch,
            CommandKind::TraceRays => Category::TraceRays,
            CommandKind::CopyBuffer | CommandKind::CopyImage | CommandKind::FillBuffer => {
                Category::Transfer
            }
            CommandKind::BindPipeline
            | CommandKind::BindDescriptorSets
            | CommandKind::BindVertexBuffer
            | CommandKind::BindIndexBuffer
            | CommandKind::PushConstants => Category::Bind,
            CommandKind::Barrier => Category::Sync,
            CommandKind::WriteTimestamp | CommandKind::BeginQuery | CommandKind::EndQuery => {
                Category::Query
            }
            CommandKind::BuildAccelerationStructure => Category::AccelBuild,
            CommandKind::InsertLabel | CommandKind::BeginLabel | CommandKind::EndLabel => {
                Category::Label
            }
            CommandKind::Root
            | CommandKind::BeginRenderPass
            | CommandKind::Subpass
            | CommandKind::EndRenderPass
            | CommandKind::ExecuteCommands
            | CommandKind::ExecuteCommandsChild => Category::Structure,
        }
    }

    /// Whether the command reads the descriptor state bound at its bind point.
    pub const fn uses_descriptors(self) -> bool {
        matches!(
            self.category(),
            Category::Draw | Category::Dispatch | Category::TraceRays
        )
    }
}

/// Which indirect layout a buffer read by an indirect command holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndirectLayout {
    Draw,
    DrawIndexed,
    Dispatch,
}

impl IndirectLayout {
    /// Bytes of one tightly packed element.
    pub const fn element_size(self) -> u64 {
        match self {
            IndirectLayout::Draw => 16,
            IndirectLayout::DrawIndexed => 20,
            IndirectLayout::Dispatch => 12,
        }
    }
}

/// Comparable argument words of a command, excluding anything record-local.
pub(crate) struct ArgWords {
    words: [u64; 6],
    len: usize,
}

impl ArgWords {
    fn new(values: &[u64]) -> Self {
        let mut words = [0; 6];
        words[..values.len()].copy_from_slice(values);
        ArgWords {
            words,
            len: values.len(),
        }
    }
    pub(crate) fn as_slice(&self) -> &[u64] {
        &self.words[..self.len]
    }
}

impl Command {
    pub const fn kind(&self) -> CommandKind {
        match self {
            Command::Root => CommandKind::Root,
            Command::Draw(_) => CommandKind::Draw,
            Command::DrawIndexed(_) => CommandKind::DrawIndexed,
            Command::DrawIndirect(_) => CommandKind::DrawIndirect,
            Command::DrawIndexedIndirect(_) => CommandKind::DrawIndexedIndirect,
            Command::Dispatch(_) => CommandKind::Dispatch,
            Command::DispatchIndirect(_) => CommandKind::DispatchIndirect,
            Command::TraceRays(_) => CommandKind::TraceRays,
            Command::CopyBuffer(_) => CommandKind::CopyBuffer,
            Command::CopyImage(_) => CommandKind::CopyImage,
            Command::FillBuffer(_) => CommandKind::FillBuffer,
            Command::BindPipeline(_) => CommandKind::BindPipeline,
            Command::BindDescriptorSets(_) => CommandKind::BindDescriptorSets,
            Command::BindVertexBuffer(_) => CommandKind::BindVertexBuffer,
            Command::BindIndexBuffer(_) => CommandKind::BindIndexBuffer,
            Command::PushConstants(_) => CommandKind::PushConstants,
            Command::Barrier(_) => CommandKind::Barrier,
            Command::WriteTimestamp(_) => CommandKind::WriteTimestamp,
            Command::BeginQuery(_) => CommandKind::BeginQuery,
            Command::EndQuery(_) => CommandKind::EndQuery,
            Command::BuildAccelerationStructure(_) => CommandKind::BuildAccelerationStructure,
            Command::InsertLabel(_) => CommandKind::InsertLabel,
            Command::BeginLabel(_) => CommandKind::BeginLabel,
            Command::EndLabel => CommandKind::EndLabel,
            Command::BeginRenderPass(_) => CommandKind::BeginRenderPass,
            Command::Subpass(_) => CommandKind::Subpass,
            Command::EndRenderPass => CommandKind::EndRenderPass,
            Command::ExecuteCommands(_) => CommandKind::ExecuteCommands,
            Command::ExecuteCommandsChild(_) => CommandKind::ExecuteCommandsChild,
        }
    }

    pub fn section_kind(&self) -> Option<SectionKind> {
        self.kind().section_kind()
    }

    /// The indirect argument buffer this command reads, if any.
    pub fn indirect(&self) -> Option<(IndirectArgs, IndirectLayout)> {
        match *self {
            Command::DrawIndirect(args) => Some((args, IndirectLayout::Draw)),
            Command::DrawIndexedIndirect(args) => Some((args, IndirectLayout::DrawIndexed)),
            Command::DispatchIndirect(args) => Some((args, IndirectLayout::Dispatch)),
            _ => None,
        }
    }

    /// Calls `f` for every resource named directly by the arguments.
    pub fn for_each_resource(&self, mut f: impl FnMut(ResourceId)) {
        let mut visit = |id: ResourceId| {
            if !id.is_null() {
                f(id)
            }
        };
        match *self {
            Command::DrawIndirect(a)
            | Command::DrawIndexedIndirect(a)
            | Command::DispatchIndirect(a) => visit(a.buffer),
            Command::CopyBuffer(a) => {
                visit(a.src);
                visit(a.dst);
            }
            Command::CopyImage(a) => {
                visit(a.src);
                visit(a.dst);
            }
            Command::FillBuffer(a) => visit(a.dst),
            Command::BindPipeline(a) => visit(a.pipeline),
            Command::BindVertexBuffer(a) => visit(a.buffer),
            Command::BindIndexBuffer(a) => visit(a.buffer),
            Command::WriteTimestamp(a) | Command::BeginQuery(a) | Command::EndQuery(a) => {
                visit(a.query_pool)
            }
            Command::BuildAccelerationStructure(a) => {
                visit(a.dst);
                visit(a.src);
            }
            Command::BeginRenderPass(a) => {
                visit(a.render_pass);
                visit(a.framebuffer);
            }
            //descriptor sets live in the record payload; the record indexes them
            Command::Root
            | Command::Draw(_)
            | Command::DrawIndexed(_)
            | Command::Dispatch(_)
            | Command::TraceRays(_)
            | Command::BindDescriptorSets(_)
            | Command::PushConstants(_)
            | Command::Barrier(_)
            | Command::InsertLabel(_)
            | Command::BeginLabel(_)
            | Command::EndLabel
            | Command::Subpass(_)
            | Command::EndRenderPass
            | Command::ExecuteCommands(_)
            | Command::ExecuteCommandsChild(_) => {}
        }
    }

    pub(crate) fn arg_words(&self) -> ArgWords {
        let id = |r: ResourceId| r.0;
        match *self {
            Command::Root | Command::EndLabel | Command::EndRenderPass => ArgWords::new(&[]),
            Command::Draw(a) => ArgWords::new(&[
                a.vertex_count as u64,
                a.instance_count as u64,
                a.first_vertex as u64,
                a.first_instance as u64,
            ]),
            Command::DrawIndexed(a) => ArgWords::new(&[
                a.index_count as u64,
                a.instance_count as u64,
                a.first_index as u64,
                a.vertex_offset as u32 as u64,
                a.first_instance as u64,
            ]),
            Command::DrawIndirect(a)
            | Command::DrawIndexedIndirect(a)
            | Command::DispatchIndirect(a) => {
                ArgWords::new(&[id(a.buffer), a.offset, a.count as u64, a.stride as u64])
            }
            Command::Dispatch(a) => ArgWords::new(&[a.x as u64, a.y as u64, a.z as u64]),
            Command::TraceRays(a) => {
                ArgWords::new(&[a.width as u64, a.height as u64, a.depth as u64])
            }
            Command::CopyBuffer(a) => ArgWords::new(&[
                id(a.src),
                id(a.dst),
                a.src_offset,
                a.dst_offset,
                a.size,
            ]),
            Command::CopyImage(a) => ArgWords::new(&[id(a.src), id(a.dst)]),
            Command::FillBuffer(a) => {
                ArgWords::new(&[id(a.dst), a.offset, a.size, a.data as u64])
            }
            Command::BindPipeline(a) => {
                ArgWords::new(&[a.bind_point.index() as u64, id(a.pipeline)])
            }
            Command::BindDescriptorSets(a) => ArgWords::new(&[
                a.bind_point.index() as u64,
                a.first_set as u64,
                a.set_count as u64,
                a.payload.len as u64,
            ]),
            Command::BindVertexBuffer(a) => {
                ArgWords::new(&[a.binding as u64, id(a.buffer), a.offset])
            }
            Command::BindIndexBuffer(a) => ArgWords::new(&[
                id(a.buffer),
                a.offset,
                matches!(a.index_type, IndexType::U32) as u64,
            ]),
            Command::PushConstants(a) => {
                ArgWords::new(&[a.offset as u64, a.size as u64, a.content_hash])
            }
            Command::Barrier(a) => ArgWords::new(&[
                a.src_stages as u64,
                a.dst_stages as u64,
                a.memory_barriers as u64,
                a.buffer_barriers as u64,
                a.image_barriers as u64,
            ]),
            Command::WriteTimestamp(a) | Command::BeginQuery(a) | Command::EndQuery(a) => {
                ArgWords::new(&[id(a.query_pool), a.query as u64])
            }
            Command::BuildAccelerationStructure(a) => {
                ArgWords::new(&[id(a.dst), id(a.src), a.primitive_count as u64])
            }
            Command::InsertLabel(a) | Command::BeginLabel(a) => {
                ArgWords::new(&[u32::from_le_bytes(a.color) as u64])
            }
            Command::BeginRenderPass(a) => ArgWords::new(&[
                id(a.render_pass),
                id(a.framebuffer),
                a.subpass_count as u64,
            ]),
            Command::Subpass(a) => ArgWords::new(&[a.index as u64]),
            Command::ExecuteCommands(a) => ArgWords::new(&[a.count as u64]),
            Command::ExecuteCommandsChild(a) => ArgWords::new(&[a.index as u64]),
        }
    }

    /**
    Fraction of directly comparable arguments that agree, in `[0,1]`.

    Commands of different kinds score 0.  Record-local arguments (label names,
    descriptor payloads, source record ids) are not compared here; see
    [`crate::matching::match_leaves`] for the record-aware comparison.
    */
    pub fn argument_similarity(&self, other: &Command) -> f32 {
        if self.kind() != other.kind() {
            return 0.0;
        }
        let a = self.arg_words();
        let b = other.arg_words();
        let (a, b) = (a.as_slice(), b.as_slice());
        if a.is_empty() {
            return 1.0;
        }
        let equal = a.iter().zip(b).filter(|(x, y)| x == y).count();
        equal as f32 / a.len() as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_count_covers_every_variant() {
        assert_eq!(CommandKind::COUNT, 29);
        assert_eq!(CommandKind::ExecuteCommandsChild.index(), CommandKind::COUNT - 1);
    }

    #[test]
    fn similarity_counts_equal_fields() {
        let a = Command::Draw(DrawArgs {
            vertex_count: 3,
            instance_count: 1,
            first_vertex: 0,
            first_instance: 0,
        });
        let b = Command::Draw(DrawArgs {
            vertex_count: 6,
            ..DrawArgs {
                vertex_count: 3,
                instance_count: 1,
                first_vertex: 0,
                first_instance: 0,
            }
        });
        assert_eq!(a.argument_similarity(&a), 1.0);
        assert_eq!(a.argument_similarity(&b), 0.75);
        assert_eq!(a.argument_similarity(&Command::Dispatch(DispatchArgs::default())), 0.0);
        assert_eq!(Command::EndLabel.argument_similarity(&Command::EndLabel), 1.0);
    }

    #[test]
    fn sections_and_categories() {
        assert_eq!(CommandKind::BeginLabel.section_kind(), Some(SectionKind::Label));
        assert!(!CommandKind::EndLabel.is_section());
        assert_eq!(CommandKind::DrawIndexedIndirect.category(), Category::Draw);
        assert!(CommandKind::DispatchIndirect.uses_descriptors());
        assert!(!CommandKind::CopyBuffer.uses_descriptors());
    }
}
