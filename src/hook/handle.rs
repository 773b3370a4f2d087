// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
Hook handles and their lifecycle.

```text
Idle ─▶ Built ─▶ Submitted ─▶ Activated ─▶ Finished
  └───────┴──────────┴────────────┴──────▶ Invalidated(reason)
```

`Finished` and `Invalidated` are terminal.  A handle is one-shot: once terminal it
never moves again; [`CommandHook::rearm`](crate::hook::CommandHook::rearm) issues a
fresh handle for the same selection.
*/

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{HookError, ObservationError};
use crate::hook::{Observations, ResourceCopy};
use crate::lock_recover;
use crate::record::command::{DispatchArgs, DrawArgs, DrawIndexedArgs, IndirectLayout};
use crate::record::resources::ResourceId;
use crate::record::{CommandPath, RecordId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum InvalidReason {
    #[error("the hooked record was released before the hook finished")]
    RecordReleased,
    #[error("a newer hook replaced this one")]
    Superseded,
    #[error("the hook was unset")]
    Unset,
    #[error("the device was lost")]
    DeviceLost,
    #[error("the submission carrying the hook was dropped before it finished")]
    SubmissionDropped,
    #[error("the hooked command does not belong to the record")]
    UnknownCommand,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookState {
    Idle,
    Built,
    Submitted,
    Activated,
    Finished,
    Invalidated(InvalidReason),
}

impl HookState {
    pub fn is_terminal(self) -> bool {
        matches!(self, HookState::Finished | HookState::Invalidated(_))
    }

    fn can_advance_to(self, next: HookState) -> bool {
        match (self, next) {
            (from, HookState::Invalidated(_)) => !from.is_terminal(),
            (HookState::Idle, HookState::Built)
            | (HookState::Built, HookState::Submitted)
            | (HookState::Submitted, HookState::Activated)
            | (HookState::Activated, HookState::Finished) => true,
            //the tracker may report completion without a separate activation
            (HookState::Submitted, HookState::Finished) => true,
            _ => false,
        }
    }
}

/// Which observation a result or a drop refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservationKind {
    Copy(ResourceCopy),
    Timing,
    IndirectArgs,
    AccelBuild,
}

/// An observation that was requested but could not be served.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DroppedObservation {
    pub observation: ObservationKind,
    pub error: ObservationError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopiedResource {
    pub request: ResourceCopy,
    pub resource: ResourceId,
    /// Offset into the resource the bytes start at.
    pub offset: u64,
    pub bytes: Vec<u8>,
}

/// Indirect arguments as read back, decoded by layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndirectCommands {
    Draw(Vec<DrawArgs>),
    DrawIndexed(Vec<DrawIndexedArgs>),
    Dispatch(Vec<DispatchArgs>),
}

impl IndirectCommands {
    /// Decodes `count` little-endian elements spaced `stride` bytes apart.
    pub fn parse(layout: IndirectLayout, bytes: &[u8], count: u32, stride: u32) -> Self {
        let stride = if stride == 0 {
            layout.element_size() as usize
        } else {
            stride as usize
        };
        let words = |index: usize| -> Option<Vec<u32>> {
            let start = index * stride;
            let element = bytes.get(start..start + layout.element_size() as usize)?;
            Some(
                element
                    .chunks_exact(4)
                    .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            )
        };
        let elements = (0..count as usize).map_while(words);
        match layout {
            IndirectLayout::Draw => IndirectCommands::Draw(
                elements
                    .map(|w| DrawArgs {
                        vertex_count: w[0],
                        instance_count: w[1],
                        first_vertex: w[2],
                        first_instance: w[3],
                    })
                    .collect(),
            ),
            IndirectLayout::DrawIndexed => IndirectCommands::DrawIndexed(
                elements
                    .map(|w| DrawIndexedArgs {
                        index_count: w[0],
                        instance_count: w[1],
                        first_index: w[2],
                        vertex_offset: w[3] as i32,
                        first_instance: w[4],
                    })
                    .collect(),
            ),
            IndirectLayout::Dispatch => IndirectCommands::Dispatch(
                elements
                    .map(|w| DispatchArgs {
                        x: w[0],
                        y: w[1],
                        z: w[2],
                    })
                    .collect(),
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndirectReadback {
    pub buffer: ResourceId,
    pub offset: u64,
    pub bytes: Vec<u8>,
    pub commands: IndirectCommands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccelBuildResult {
    pub structure: ResourceId,
    /// Size the built structure reports for compaction.
    pub compacted_size: u64,
}

/// Everything a finished hook observed.  Fields are empty when not requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateSnapshot {
    pub record: RecordId,
    pub path: CommandPath,
    pub copies: Vec<CopiedResource>,
    pub timing: Option<Duration>,
    pub indirect: Option<IndirectReadback>,
    pub accel_build: Option<AccelBuildResult>,
    pub dropped: Vec<DroppedObservation>,
}

impl StateSnapshot {
    pub fn copy(&self, request: ResourceCopy) -> Option<&CopiedResource> {
        self.copies.iter().find(|c| c.request == request)
    }

    /// Whether every observation field is empty.
    pub fn is_empty(&self) -> bool {
        self.copies.is_empty()
            && self.timing.is_none()
            && self.indirect.is_none()
            && self.accel_build.is_none()
    }
}

struct Cell {
    state: HookState,
    history: Vec<HookState>,
    snapshot: Option<StateSnapshot>,
    waiters: Vec<r#continue::Sender<()>>,
}

pub(crate) struct HookShared {
    id: u64,
    observations: Observations,
    cell: Mutex<Cell>,
}

impl std::fmt::Debug for HookShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookShared")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

static NEXT_HOOK: AtomicU64 = AtomicU64::new(1);

impl HookShared {
    pub(crate) fn new(observations: Observations) -> Arc<Self> {
        Arc::new(HookShared {
            id: NEXT_HOOK.fetch_add(1, Ordering::Relaxed),
            observations,
            cell: Mutex::new(Cell {
                state: HookState::Idle,
                history: vec![HookState::Idle],
                snapshot: None,
                waiters: Vec::new(),
            }),
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn observations(&self) -> &Observations {
        &self.observations
    }

    pub(crate) fn state(&self) -> HookState {
        lock_recover(&self.cell).state
    }

    /// Moves to `next` if that is a legal transition; returns whether it moved.
    pub(crate) fn advance(&self, next: HookState) -> bool {
        self.transition(next, None)
    }

    pub(crate) fn invalidate(&self, reason: InvalidReason) -> bool {
        let moved = self.transition(HookState::Invalidated(reason), None);
        if moved {
            logwise::info_sync!(
                "hook {id} invalidated: {reason}",
                id = self.id,
                reason = logwise::privacy::LogIt(&reason)
            );
        }
        moved
    }

    pub(crate) fn finish(&self, snapshot: StateSnapshot) -> bool {
        self.transition(HookState::Finished, Some(snapshot))
    }

    fn transition(&self, next: HookState, snapshot: Option<StateSnapshot>) -> bool {
        let waiters = {
            let mut cell = lock_recover(&self.cell);
            if !cell.state.can_advance_to(next) {
                logwise::trace_sync!(
                    "hook {id} ignores {from} -> {to}",
                    id = self.id,
                    from = logwise::privacy::LogIt(&cell.state),
                    to = logwise::privacy::LogIt(&next)
                );
                return false;
            }
            cell.state = next;
            cell.history.push(next);
            if snapshot.is_some() {
                cell.snapshot = snapshot;
            }
            if next.is_terminal() {
                std::mem::take(&mut cell.waiters)
            } else {
                Vec::new()
            }
        };
        for waiter in waiters {
            waiter.send(());
        }
        true
    }
}

/**
The front-end's view of one hook.

Dropping every clone of a handle cancels the hook: it is not served by later
submissions, and an in-flight result is discarded when its submission finishes.
*/
#[derive(Debug, Clone)]
pub struct HookHandle {
    pub(crate) shared: Arc<HookShared>,
}

impl HookHandle {
    pub fn id(&self) -> u64 {
        self.shared.id()
    }

    pub fn state(&self) -> HookState {
        self.shared.state()
    }

    /// Every state the hook has been in, oldest first.
    pub fn history(&self) -> Vec<HookState> {
        lock_recover(&self.shared.cell).history.clone()
    }

    pub fn observations(&self) -> &Observations {
        self.shared.observations()
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    /// The observed state, once the hook has finished.
    pub fn read_state(&self) -> Result<StateSnapshot, HookError> {
        let cell = lock_recover(&self.shared.cell);
        match (cell.state, &cell.snapshot) {
            (HookState::Finished, Some(snapshot)) => Ok(snapshot.clone()),
            (HookState::Invalidated(InvalidReason::DeviceLost), _) => Err(HookError::DeviceLost),
            (HookState::Invalidated(reason), _) => Err(HookError::Invalidated(reason)),
            (state, _) => Err(HookError::NotFinished(state)),
        }
    }

    /// Resolves once the hook is finished or invalidated.
    pub async fn finished(&self) {
        let future = {
            let mut cell = lock_recover(&self.shared.cell);
            if cell.state.is_terminal() {
                return;
            }
            let (sender, future) = r#continue::continuation();
            cell.waiters.push(sender);
            future
        };
        future.await
    }
}
