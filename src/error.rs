// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
Error types.

Most of these are *reported* rather than returned: recording never fails, matching
never fails, and a hook that cannot serve one observation still serves the rest.
*/

use crate::hook::handle::{HookState, InvalidReason};
use crate::record::command::{CommandKind, SectionKind};
use crate::record::resources::ResourceId;

/// A malformed recording, recovered locally by forcing a consistent tree.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StructuralError {
    #[error("section end {end:?} with no open section")]
    Underflow { end: Option<CommandKind> },
    #[error("{open} section(s) still open when the record was finished")]
    Unterminated { open: usize },
    /// Labels may be closed by a later record, so these are kept as cross-scope.
    #[error("{open} label(s) still open when the record was finished")]
    LabelsLeftOpen { open: usize },
    #[error("section at depth {depth} is {found:?}, expected {expected:?}")]
    SectionMismatch {
        depth: usize,
        expected: SectionKind,
        found: SectionKind,
    },
    #[error("subpass advanced outside of a render pass")]
    SubpassOutsideRenderPass,
}

/// Why a single observation could not be served.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ObservationError {
    #[error("nothing bound at set {set} binding {binding}")]
    Unbound { set: u32, binding: u32 },
    #[error("no vertex buffer bound at binding {binding}")]
    UnboundVertexBuffer { binding: u32 },
    #[error("no index buffer bound")]
    UnboundIndexBuffer,
    #[error("resource {0:?} was destroyed")]
    ResourceDestroyed(ResourceId),
    #[error("{observation} is not applicable to a {kind:?} command")]
    NotApplicable {
        kind: CommandKind,
        observation: &'static str,
    },
    #[error("no {observation} value was written by the device")]
    Unavailable { observation: &'static str },
    #[error(transparent)]
    Capacity(#[from] CapacityError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CapacityError {
    #[error("copy buffer of {requested} bytes exceeds the remaining budget of {available} bytes")]
    CopyBudget { requested: u64, available: u64 },
    #[error("query pool exhausted ({capacity} slots)")]
    QueryPoolExhausted { capacity: u32 },
}

/// Reading a hook that cannot (yet, or ever) produce a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HookError {
    #[error("hook has not finished; current state is {0:?}")]
    NotFinished(HookState),
    #[error("hook was invalidated: {0}")]
    Invalidated(InvalidReason),
    #[error("device lost")]
    DeviceLost,
}

/// Failure to re-find a selected command inside another record.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ResolveError {
    #[error("best match {score} is below the threshold {threshold}")]
    BelowThreshold { score: f32, threshold: f32 },
    #[error("no counterpart for the selected command")]
    TargetUnmatched,
    #[error("selection path does not name a command")]
    InvalidPath,
    #[error(transparent)]
    Structural(#[from] StructuralError),
}
