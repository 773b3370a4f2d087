// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
Non-intrusive command hooks.

A hook selects one command of a recorded [`CommandRecord`](crate::record::CommandRecord)
and asks for observations of it: resource copies before and/or after it, GPU timing,
indirect arguments, acceleration structure build results.  The application's records
are never modified.  Instead, when a later submission contains the selected command
(or its structural counterpart in a re-recorded record), [`CommandHook::hook_submission`]
builds a [`HookRecord`](hook_record::HookRecord) with the extra operations inserted,
and the layer executes that in place of the application's record.

```text
CommandHook::hook ──▶ HookHandle (Idle)
        │
        ▼
hook_submission ──▶ HookSubmission ──activate──▶ finish ──▶ StateSnapshot
```

All device-side bookkeeping happens under the device lock ([`device::Device`]).
*/

pub mod config;
pub mod device;
pub mod handle;
pub mod hook_record;
pub mod pool;
pub mod submission;

use std::collections::HashSet;
use std::sync::{Arc, Mutex, Weak};

use crate::lock_recover;
use crate::matching::{MatchOptions, MatchScratch, RecordBatch, resolve_target};
use crate::record::command::CommandKind;
use crate::record::resources::ResourceTable;
use crate::record::{CommandId, CommandPath, RecordHandle, WeakRecord};
use config::HookConfig;
use device::{DeviceGuard, QueueId};
use handle::{HookHandle, HookShared, HookState, InvalidReason};
use hook_record::{HookCache, HookRecord};
use submission::{HookSubmission, SubmittedHook};

/// What a copy observation reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CopyTarget {
    /// A resource bound through a descriptor set.
    Descriptor { set: u32, binding: u32 },
    VertexBuffer { binding: u32 },
    IndexBuffer,
    /// Source of a copy command.
    TransferSrc,
    /// Destination of a copy or fill command.
    TransferDst,
}

/// Whether a copy happens before the hooked command or after it (and its subtree).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CopyPoint {
    Before,
    After,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceCopy {
    pub target: CopyTarget,
    pub point: CopyPoint,
}

/// Observations requested of one hook.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Observations {
    pub copies: Vec<ResourceCopy>,
    pub timing: bool,
    pub indirect_args: bool,
    pub accel_build: bool,
}

impl Observations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn copy(mut self, target: CopyTarget, point: CopyPoint) -> Self {
        self.copies.push(ResourceCopy { target, point });
        self
    }

    pub fn timing(mut self) -> Self {
        self.timing = true;
        self
    }

    pub fn indirect_args(mut self) -> Self {
        self.indirect_args = true;
        self
    }

    pub fn accel_build(mut self) -> Self {
        self.accel_build = true;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.copies.is_empty() && !self.timing && !self.indirect_args && !self.accel_build
    }
}

/// A command selected in a live record.
#[derive(Debug, Clone)]
pub struct HookTarget {
    pub record: RecordHandle,
    pub command: CommandId,
}

impl HookTarget {
    pub fn new(record: &RecordHandle, command: CommandId) -> Self {
        HookTarget {
            record: record.clone(),
            command,
        }
    }
}

/// Where a selection was last seen.  `path` and `kind` stay usable after the
/// reference record is released.
#[derive(Debug)]
struct Selection {
    shared: Weak<HookShared>,
    reference: WeakRecord,
    command: CommandId,
    path: CommandPath,
    kind: CommandKind,
    /// Set once the selection was rearmed after finishing.  Only then may it be
    /// found by path in a re-recording after its reference record is released.
    following: bool,
}

impl Selection {
    /// Invalidates an unsubmitted hook whose record was released before it could be
    /// followed.  Returns whether the selection should be dropped.
    fn cancel_if_released(&self) -> bool {
        let Some(shared) = self.shared.upgrade() else {
            return true;
        };
        if self.following || !self.reference.is_released() || shared.state() != HookState::Idle {
            return false;
        }
        shared.invalidate(InvalidReason::RecordReleased);
        logwise::info_sync!(
            "hook {id} cancelled: its record was released",
            id = shared.id()
        );
        true
    }
}

#[derive(Debug, Default)]
struct Registry {
    selections: Vec<Selection>,
    cache: HookCache,
}

/**
The hook front end.

Holds selections and the hook-record cache.  It never owns a record: selections
keep a [`WeakRecord`], so releasing a record is never delayed by a hook.
*/
pub struct CommandHook {
    table: Arc<dyn ResourceTable>,
    config: HookConfig,
    registry: Mutex<Registry>,
}

impl std::fmt::Debug for CommandHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandHook")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl CommandHook {
    pub fn new(table: Arc<dyn ResourceTable>, config: HookConfig) -> Self {
        CommandHook {
            table,
            config,
            registry: Mutex::new(Registry::default()),
        }
    }

    pub fn config(&self) -> &HookConfig {
        &self.config
    }

    /**
    Selects `target` and returns a handle in `Idle`.

    An earlier hook on the same command of the same record is superseded.  A command
    that is not part of `target.record` yields a handle already invalidated.
    */
    pub fn hook(&self, target: &HookTarget, observations: Observations) -> HookHandle {
        let shared = HookShared::new(observations);
        if !target.record.contains(target.command) {
            logwise::warn_sync!(
                "hook {id} refused: command {command} is not in record {record}",
                id = shared.id(),
                command = logwise::privacy::LogIt(&target.command),
                record = logwise::privacy::LogIt(&target.record.id())
            );
            shared.invalidate(InvalidReason::UnknownCommand);
            return HookHandle { shared };
        }
        let mut registry = lock_recover(&self.registry);
        let record_id = target.record.id();
        registry.selections.retain(|selection| {
            let same = selection.reference.id() == record_id && selection.command == target.command;
            if same {
                if let Some(old) = selection.shared.upgrade() {
                    old.invalidate(InvalidReason::Superseded);
                }
            }
            !same && selection.shared.strong_count() > 0
        });
        registry.selections.push(Selection {
            shared: Arc::downgrade(&shared),
            reference: target.record.downgrade(),
            command: target.command,
            path: target.record.path_of(target.command),
            kind: target.record.kind(target.command),
            following: false,
        });
        logwise::info_sync!(
            "hook {id} set on {kind}",
            id = shared.id(),
            kind = logwise::privacy::LogIt(&target.record.kind(target.command))
        );
        HookHandle { shared }
    }

    /**
    A fresh handle for the selection behind `handle`, following the command from
    wherever it was last seen.

    `handle` is superseded if it has not reached a terminal state.  Returns `None`
    if the selection was unset.
    */
    pub fn rearm(&self, handle: &HookHandle) -> Option<HookHandle> {
        let mut registry = lock_recover(&self.registry);
        let selection = registry
            .selections
            .iter_mut()
            .find(|s| std::ptr::eq(s.shared.as_ptr(), Arc::as_ptr(&handle.shared)))?;
        let shared = HookShared::new(handle.observations().clone());
        if handle.state() == HookState::Finished {
            selection.following = true;
        }
        handle.shared.invalidate(InvalidReason::Superseded);
        selection.shared = Arc::downgrade(&shared);
        Some(HookHandle { shared })
    }

    /// Removes the selection behind `handle` and invalidates it.
    pub fn unset(&self, handle: &HookHandle) -> bool {
        let mut registry = lock_recover(&self.registry);
        let before = registry.selections.len();
        registry
            .selections
            .retain(|s| !std::ptr::eq(s.shared.as_ptr(), Arc::as_ptr(&handle.shared)));
        let removed = registry.selections.len() != before;
        if removed {
            handle.shared.invalidate(InvalidReason::Unset);
        }
        removed
    }

    /// Selections still armed or awaiting a rearm.
    pub fn selection_count(&self) -> usize {
        let mut registry = lock_recover(&self.registry);
        registry.selections.retain(|s| !s.cancel_if_released());
        registry.selections.len()
    }

    pub fn cached_hook_records(&self) -> usize {
        lock_recover(&self.registry).cache.len()
    }

    /**
    Applies every armed hook to a submission of `batch` on `queue`.

    Each selection is located in the batch (the same record, its structural
    counterpart in a re-recording, or, once the reference record is gone, the
    command at the same path with the same kind).  At most one hook applies per
    record.  Returns `None` if no hook applies, in which case the batch is submitted
    unchanged.
    */
    pub fn hook_submission(
        &self,
        guard: &mut DeviceGuard,
        queue: QueueId,
        batch: &RecordBatch,
        scratch: &mut MatchScratch,
    ) -> Option<HookSubmission> {
        if guard.is_lost() {
            return None;
        }
        let _interval = logwise::perfwarn_begin!("CommandHook::hook_submission");
        let options = self.config.match_options();
        let mut registry = lock_recover(&self.registry);
        let registry = &mut *registry;
        registry.selections.retain(|s| !s.cancel_if_released());
        registry.cache.purge_released();

        let mut hooks = Vec::new();
        let mut armed = Vec::new();
        let mut hooked = HashSet::new();
        for selection in registry.selections.iter_mut() {
            let Some(shared) = selection.shared.upgrade() else {
                continue;
            };
            if shared.state() != HookState::Idle {
                continue;
            }
            let Some((record, command)) = locate(selection, batch, &options, scratch) else {
                continue;
            };
            if !hooked.insert(record.id()) {
                logwise::trace_sync!(
                    "hook {id} skipped: record already hooked in this submission",
                    id = shared.id()
                );
                continue;
            }
            selection.reference = record.downgrade();
            selection.command = command;
            selection.path = record.path_of(command);

            let key = (record.id(), selection.path.clone(), shared.observations().clone());
            let hook_record = match registry.cache.take_reusable(&key) {
                Some(cached) => cached,
                None => {
                    let built = Arc::new(HookRecord::build(&record, command, shared.observations(), &*self.table));
                    registry
                        .cache
                        .insert(key, Arc::clone(&built), self.config.max_cached_hook_records);
                    built
                }
            };
            shared.advance(HookState::Built);
            hooks.push(SubmittedHook::bind(&shared, hook_record, guard.pool_mut()));
            armed.push(shared);
        }
        if hooks.is_empty() {
            return None;
        }

        let weak: Vec<_> = armed.iter().map(Arc::downgrade).collect();
        let id = guard.submit(queue, &weak);
        for shared in &armed {
            shared.advance(HookState::Submitted);
        }
        logwise::info_sync!(
            "hooked submission {id} with {n} hook(s)",
            id = logwise::privacy::LogIt(&id),
            n = hooks.len()
        );
        Some(HookSubmission::new(
            queue,
            id,
            hooks,
            self.config.timestamp_period_ns,
            guard.orphans(),
        ))
    }
}

/// Finds the selection in `batch`.
fn locate(
    selection: &Selection,
    batch: &RecordBatch,
    options: &MatchOptions,
    scratch: &mut MatchScratch,
) -> Option<(RecordHandle, CommandId)> {
    if let Some(record) = batch.records.iter().find(|r| r.id() == selection.reference.id()) {
        return Some((record.clone(), selection.command));
    }
    if let Some(previous) = selection.reference.upgrade() {
        let mut best: Option<(RecordHandle, CommandId, f32)> = None;
        for record in &batch.records {
            match resolve_target(&previous, selection.command, record, options, scratch) {
                Ok(resolved) => {
                    if best.as_ref().is_none_or(|(_, _, score)| resolved.score > *score) {
                        best = Some((record.clone(), resolved.command, resolved.score));
                    }
                }
                Err(error) => {
                    logwise::trace_sync!(
                        "selection not found in record: {error}",
                        error = logwise::privacy::LogIt(&error)
                    );
                }
            }
        }
        return best.map(|(record, command, _)| (record, command));
    }
    batch.records.iter().find_map(|record| {
        let command = record.command_at(&selection.path)?;
        (record.kind(command) == selection.kind).then(|| (record.clone(), command))
    })
}
