// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

use common::FakeGpu;
use records_and_hooks::hook::submission::DeviceOutcome;
use records_and_hooks::matching::{MatchOptions, MatchScratch, RecordBatch, match_records};
use records_and_hooks::record::builder::RecordBuilder;
use records_and_hooks::record::command::{BindPoint, Command, DispatchArgs, DrawArgs};
use records_and_hooks::record::resources::ResourceRegistry;
use records_and_hooks::record::snapshot::BoundSet;
use records_and_hooks::record::{CommandId, RecordHandle};
use records_and_hooks::{
    CommandHook, Device, HookConfig, HookHandle, HookState, HookTarget, Observations, QueueId,
};

const THREADS: usize = 4;

/// What one recording thread produces every frame.
fn record_frame(registry: &Arc<ResourceRegistry>, thread: usize) -> (RecordHandle, CommandId) {
    let ubo = registry.create_buffer(64, "ubo");
    let set = registry.create_descriptor_set(vec![Some(ubo)], "set");
    let mut builder = RecordBuilder::new(registry.clone());
    builder.begin_label("worker", [thread as u8, 0, 0, 255]);
    builder.bind_descriptor_sets(BindPoint::Compute, 0, &[BoundSet::new(set)]);
    let target = builder.record(Command::Dispatch(DispatchArgs {
        x: thread as u32 + 1,
        y: 1,
        z: 1,
    }));
    for _ in 0..thread {
        builder.record(Command::Draw(DrawArgs {
            vertex_count: 3,
            instance_count: 1,
            first_vertex: 0,
            first_instance: 0,
        }));
    }
    builder.end_label();
    (builder.finish(), target)
}

#[test]
fn records_built_on_many_threads_share_one_registry() {
    let registry = Arc::new(ResourceRegistry::new());
    let workers: Vec<_> = (0..THREADS)
        .map(|t| {
            let registry = registry.clone();
            thread::spawn(move || {
                let (first, _) = record_frame(&registry, t);
                let (second, _) = record_frame(&registry, t);
                let mut scratch = MatchScratch::new();
                let value = match_records(&first, &second, &MatchOptions::default(), &mut scratch).value();
                (first, value)
            })
        })
        .collect();
    let results: Vec<_> = workers
        .into_iter()
        .map(|w| w.join().expect("worker thread"))
        .collect();

    let ids: HashSet<_> = results.iter().map(|(record, _)| record.id()).collect();
    assert_eq!(ids.len(), THREADS);
    for (_, value) in &results {
        assert_eq!(*value, 1.0);
    }
    // two buffers and two sets per thread
    assert_eq!(registry.live_count(), THREADS * 4);
}

#[test]
fn hooks_set_from_many_threads_finish_together() {
    let registry = Arc::new(ResourceRegistry::new());
    let config = HookConfig::default();
    let hook = Arc::new(CommandHook::new(registry.clone(), config));
    let device = Device::new(&config);

    let workers: Vec<_> = (0..THREADS)
        .map(|t| {
            let registry = registry.clone();
            let hook = hook.clone();
            thread::spawn(move || -> (RecordHandle, HookHandle) {
                let (record, target) = record_frame(&registry, t);
                let handle = hook.hook(&HookTarget::new(&record, target), Observations::new().timing());
                (record, handle)
            })
        })
        .collect();
    let (records, handles): (Vec<_>, Vec<_>) = workers
        .into_iter()
        .map(|w| w.join().expect("worker thread"))
        .unzip();
    assert_eq!(hook.selection_count(), THREADS);

    let waiters: Vec<_> = handles
        .iter()
        .cloned()
        .map(|handle| thread::spawn(move || test_executors::spin_on(handle.finished())))
        .collect();

    let batch = RecordBatch::new(records);
    let mut scratch = MatchScratch::new();
    let mut submission = device
        .with_lock(|guard| hook.hook_submission(guard, QueueId(0), &batch, &mut scratch))
        .expect("hooked");
    assert_eq!(submission.hooks().len(), THREADS);
    FakeGpu::new().execute(&batch, Some(&submission));
    device.with_lock(|guard| {
        assert!(submission.activate(guard));
        submission.finish(guard, DeviceOutcome::Completed);
    });

    for waiter in waiters {
        waiter.join().expect("waiter thread");
    }
    for (handle, record) in handles.iter().zip(&batch.records) {
        assert_eq!(handle.state(), HookState::Finished);
        let snapshot = handle.read_state().expect("finished");
        assert_eq!(snapshot.record, record.id());
        assert!(snapshot.timing.is_some());
    }
}
