// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*! records_and_hooks is the command-record core of a GPU debugging layer.

A debugging layer sits between an application and its GPU driver.  It needs to answer
questions like "what did this draw call read?" or "how long did this dispatch take?"
without disturbing the application.  This crate provides the three pieces that make it
possible:

| Piece                          | Module       | What it does                                                                  |
|--------------------------------|--------------|-------------------------------------------------------------------------------|
| Command records                | [`record`]   | Arena-backed command trees with descriptor snapshots and section statistics   |
| Structural matching            | [`matching`] | Scores how alike two records are and re-finds a command in a re-recording     |
| Command hooks                  | [`hook`]     | Inserts copies and queries around a selected command, without touching the app |

# Records

Applications record command buffers every frame.  A [`RecordBuilder`](record::builder::RecordBuilder)
turns a stream of commands into a [`CommandRecord`](record::CommandRecord): a tree whose
sections are debug labels, render passes, subpasses and secondary command buffer
executions.  Malformed nesting is repaired on the spot and reported as a diagnostic;
recording never fails.

# Matching

Every frame brings new records with new ids.  [`matching::match_records`] scores two
trees by structure alone, and [`matching::resolve_target`] refines that with command
arguments to decide which command of a new record is "the same" as a selected one.

# Hooks

A [`CommandHook`](hook::CommandHook) keeps selections.  When a submission contains a
hooked command, [`CommandHook::hook_submission`](hook::CommandHook::hook_submission)
produces a hook record with the extra operations inserted, and the layer executes it
instead of the application's record.  Results arrive through a
[`HookHandle`](hook::handle::HookHandle).

# Configuration

[`HookConfig::from_env`](hook::config::HookConfig::from_env) reads `RAH_*` environment
variables over the defaults.
*/

logwise::declare_logging_domain!();

pub mod arena;
pub mod error;
pub mod hook;
pub mod matching;
pub mod record;

pub use error::{CapacityError, HookError, ObservationError, ResolveError, StructuralError};
pub use hook::config::HookConfig;
pub use hook::device::{Device, DeviceGuard, QueueId};
pub use hook::handle::{HookHandle, HookState, StateSnapshot};
pub use hook::submission::{DeviceOutcome, ExecOp, HookSubmission};
pub use hook::{CommandHook, CopyPoint, CopyTarget, HookTarget, Observations};
pub use matching::{MatchOptions, MatchScratch, RecordBatch};
pub use record::builder::RecordBuilder;
pub use record::command::Command;
pub use record::resources::{ResourceId, ResourceRegistry, ResourceTable};
pub use record::{CommandId, CommandPath, CommandRecord, RecordHandle, RecordId};

/// Locks a std mutex, continuing past poisoning.
pub(crate) fn lock_recover<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
