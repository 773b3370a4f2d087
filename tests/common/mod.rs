// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! A pretend device that executes hooked submissions against host memory.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use records_and_hooks::hook::submission::{DeviceOutcome, ExecOp, HookSubmission};
use records_and_hooks::matching::{MatchScratch, RecordBatch};
use records_and_hooks::record::command::{Command, CommandKind};
use records_and_hooks::record::resources::{ResourceId, ResourceRegistry};
use records_and_hooks::record::{CommandId, CommandRecord};
use records_and_hooks::{CommandHook, Device, HookConfig, QueueId};

/// Ticks the clock advances per executed command.
pub const TICKS_PER_COMMAND: u64 = 100;

#[derive(Debug, Default)]
pub struct FakeGpu {
    memory: HashMap<ResourceId, Vec<u8>>,
    clock: u64,
    /// Kinds of the application's commands, in execution order.
    pub executed: Vec<CommandKind>,
}

impl FakeGpu {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fill(&mut self, id: ResourceId, bytes: Vec<u8>) {
        self.memory.insert(id, bytes);
    }

    pub fn read(&self, id: ResourceId, offset: u64, size: u64) -> Vec<u8> {
        let mut bytes = vec![0; size as usize];
        if let Some(memory) = self.memory.get(&id) {
            for (i, byte) in bytes.iter_mut().enumerate() {
                if let Some(value) = memory.get(offset as usize + i) {
                    *byte = *value;
                }
            }
        }
        bytes
    }

    fn write(&mut self, id: ResourceId, offset: u64, bytes: &[u8]) {
        let memory = self.memory.entry(id).or_default();
        let end = offset as usize + bytes.len();
        if memory.len() < end {
            memory.resize(end, 0);
        }
        memory[offset as usize..end].copy_from_slice(bytes);
    }

    /// Executes `batch`, replacing hooked records by their hook record.
    pub fn execute(&mut self, batch: &RecordBatch, submission: Option<&HookSubmission>) {
        for record in &batch.records {
            match submission.and_then(|s| s.replacement(record.id())) {
                Some(hook) => {
                    for op in hook.ops() {
                        self.run(record, op);
                    }
                }
                None => {
                    let mut ids = Vec::new();
                    record.walk(|id, _| ids.push(id));
                    for id in ids {
                        self.original(record, id);
                    }
                }
            }
        }
    }

    fn run(&mut self, record: &CommandRecord, op: ExecOp<'_>) {
        match op {
            ExecOp::Original(id) => self.original(record, id),
            ExecOp::Copy {
                source,
                offset,
                size,
                dst,
            } => dst.write(0, &self.read(source.id(), offset, size)),
            ExecOp::WriteTimestamp { slot } => slot.write(self.clock),
            ExecOp::QueryAccelBuild { structure, slot } => slot.write(structure.size() / 2),
        }
    }

    fn original(&mut self, record: &CommandRecord, id: CommandId) {
        self.clock += TICKS_PER_COMMAND;
        self.executed.push(record.kind(id));
        match *record.command(id) {
            Command::FillBuffer(args) => {
                let pattern = args.data.to_le_bytes();
                let bytes: Vec<u8> = (0..args.size as usize).map(|i| pattern[i % 4]).collect();
                self.write(args.dst, args.offset, &bytes);
            }
            Command::CopyBuffer(args) => {
                let bytes = self.read(args.src, args.src_offset, args.size);
                self.write(args.dst, args.dst_offset, &bytes);
            }
            _ => {}
        }
    }
}

/// Everything a hooking test needs, wired together.
pub struct Rig {
    pub registry: Arc<ResourceRegistry>,
    pub device: Device,
    pub hook: CommandHook,
    pub gpu: FakeGpu,
    pub scratch: MatchScratch,
}

impl Rig {
    pub fn new() -> Self {
        Self::with_config(HookConfig::default())
    }

    pub fn with_config(config: HookConfig) -> Self {
        let registry = Arc::new(ResourceRegistry::new());
        Rig {
            device: Device::new(&config),
            hook: CommandHook::new(registry.clone(), config),
            registry,
            gpu: FakeGpu::new(),
            scratch: MatchScratch::new(),
        }
    }

    /// Builds the hooked submission for `batch`, if any hook applies.
    pub fn submit(&mut self, batch: &RecordBatch) -> Option<HookSubmission> {
        let Rig {
            device,
            hook,
            scratch,
            ..
        } = self;
        device.with_lock(|guard| hook.hook_submission(guard, QueueId(0), batch, scratch))
    }

    /// Submits, executes, activates and finishes `batch`.  Returns whether a hook applied.
    pub fn run_frame(&mut self, batch: &RecordBatch) -> bool {
        let submission = self.submit(batch);
        self.gpu.execute(batch, submission.as_ref());
        match submission {
            Some(submission) => {
                self.complete(submission, DeviceOutcome::Completed);
                true
            }
            None => false,
        }
    }

    pub fn complete(&self, mut submission: HookSubmission, outcome: DeviceOutcome) {
        self.device.with_lock(move |guard| {
            submission.activate(guard);
            submission.finish(guard, outcome);
        });
    }
}
