// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{FakeGpu, Rig, TICKS_PER_COMMAND};
use records_and_hooks::error::{CapacityError, HookError, ObservationError};
use records_and_hooks::hook::handle::{IndirectCommands, InvalidReason, ObservationKind};
use records_and_hooks::hook::pool::PoolStats;
use records_and_hooks::hook::submission::DeviceOutcome;
use records_and_hooks::matching::RecordBatch;
use records_and_hooks::record::builder::RecordBuilder;
use records_and_hooks::record::command::{
    BindPoint, BuildAccelArgs, Command, CommandKind, DrawArgs, DrawIndexedArgs, FillBufferArgs,
    IndirectArgs,
};
use records_and_hooks::record::resources::{ResourceId, ResourceKind};
use records_and_hooks::record::snapshot::BoundSet;
use records_and_hooks::record::{CommandId, RecordHandle};
use records_and_hooks::{CopyPoint, CopyTarget, HookConfig, HookState, HookTarget, Observations};

use test_executors::async_test;

fn draw() -> Command {
    Command::Draw(DrawArgs {
        vertex_count: 3,
        instance_count: 1,
        first_vertex: 0,
        first_instance: 0,
    })
}

/// `[label "pass" [fill, draw], EndLabel]`, returning the fill.
fn fill_record(rig: &Rig, buffer: ResourceId) -> (RecordHandle, CommandId) {
    let mut builder = RecordBuilder::new(rig.registry.clone());
    builder.begin_label("pass", [0; 4]);
    let fill = builder.record(Command::FillBuffer(FillBufferArgs {
        dst: buffer,
        offset: 0,
        size: 16,
        data: 7,
    }));
    builder.record(draw());
    builder.end_label();
    (builder.finish(), fill)
}

fn idle_pool(rig: &Rig) -> PoolStats {
    let stats = rig.device.pool_stats();
    assert_eq!(stats.buffers_in_use, 0);
    assert_eq!(stats.queries_in_use, 0);
    stats
}

#[test]
fn a_hook_without_observations_still_finishes() {
    let mut rig = Rig::new();
    let buffer = rig.registry.create_buffer(16, "target");
    let (record, fill) = fill_record(&rig, buffer);
    let handle = rig.hook.hook(&HookTarget::new(&record, fill), Observations::new());
    assert_eq!(handle.read_state(), Err(HookError::NotFinished(HookState::Idle)));

    let batch = RecordBatch::new(vec![record.clone()]);
    assert!(rig.run_frame(&batch));

    assert_eq!(
        handle.history(),
        vec![
            HookState::Idle,
            HookState::Built,
            HookState::Submitted,
            HookState::Activated,
            HookState::Finished,
        ]
    );
    let snapshot = handle.read_state().expect("finished");
    assert!(snapshot.is_empty());
    assert!(snapshot.dropped.is_empty());
    assert_eq!(snapshot.record, record.id());
    assert_eq!(snapshot.path, record.path_of(fill));
    assert_eq!(idle_pool(&rig), PoolStats {
        query_capacity: HookConfig::default().query_capacity,
        ..PoolStats::default()
    });
}

#[test]
fn hooked_execution_keeps_the_application_commands() {
    let mut rig = Rig::new();
    let buffer = rig.registry.create_buffer(16, "target");
    let (record, fill) = fill_record(&rig, buffer);
    let batch = RecordBatch::new(vec![record.clone()]);

    let mut plain = FakeGpu::new();
    plain.execute(&batch, None);

    let _handle = rig.hook.hook(
        &HookTarget::new(&record, fill),
        Observations::new()
            .copy(CopyTarget::TransferDst, CopyPoint::Before)
            .copy(CopyTarget::TransferDst, CopyPoint::After)
            .timing(),
    );
    assert!(rig.run_frame(&batch));
    assert_eq!(rig.gpu.executed, plain.executed);
}

#[test]
fn copies_and_timing_bracket_the_target() {
    let mut rig = Rig::new();
    let buffer = rig.registry.create_buffer(16, "target");
    rig.gpu.fill(buffer, vec![1; 16]);
    let (record, fill) = fill_record(&rig, buffer);
    let before = Observations::new().copy(CopyTarget::TransferDst, CopyPoint::Before);
    let observations = before
        .copy(CopyTarget::TransferDst, CopyPoint::After)
        .timing();
    let requests = observations.copies.clone();
    let handle = rig.hook.hook(&HookTarget::new(&record, fill), observations);

    let pool = idle_pool(&rig);
    assert!(rig.run_frame(&RecordBatch::new(vec![record.clone()])));

    let snapshot = handle.read_state().expect("finished");
    assert!(snapshot.dropped.is_empty());
    let copied_before = snapshot.copy(requests[0]).expect("before copy");
    assert_eq!(copied_before.resource, buffer);
    assert_eq!(copied_before.bytes, vec![1; 16]);
    let copied_after = snapshot.copy(requests[1]).expect("after copy");
    assert_eq!(copied_after.bytes, [7, 0, 0, 0].repeat(4));
    assert_eq!(snapshot.timing, Some(Duration::from_nanos(TICKS_PER_COMMAND)));

    // resources went back to the pool for the next frame
    let after = idle_pool(&rig);
    assert_eq!(after.buffers_pooled, pool.buffers_pooled + 2);
    assert_eq!(after.bytes_held, pool.bytes_held + 32);
}

#[test]
fn descriptor_copies_use_the_recorded_bindings() {
    let mut rig = Rig::new();
    let ubo = rig.registry.create_buffer(8, "ubo");
    let replacement = rig.registry.create_buffer(8, "replacement");
    let set = rig.registry.create_descriptor_set(vec![Some(ubo)], "set0");
    rig.gpu.fill(ubo, vec![9; 8]);
    rig.gpu.fill(replacement, vec![4; 8]);

    let mut builder = RecordBuilder::new(rig.registry.clone());
    builder.bind_descriptor_sets(BindPoint::Graphics, 0, &[BoundSet::new(set)]);
    let target = builder.record(Command::DrawIndexed(DrawIndexedArgs {
        index_count: 6,
        instance_count: 1,
        ..Default::default()
    }));
    let record = builder.finish();
    // rebinding after recording does not change what the hook reads
    rig.registry.update_descriptor_set(set, 0, Some(replacement));

    let observations = Observations::new()
        .copy(CopyTarget::Descriptor { set: 0, binding: 0 }, CopyPoint::Before)
        .copy(CopyTarget::IndexBuffer, CopyPoint::Before)
        .copy(CopyTarget::TransferSrc, CopyPoint::Before);
    let requests = observations.copies.clone();
    let handle = rig.hook.hook(&HookTarget::new(&record, target), observations);
    assert!(rig.run_frame(&RecordBatch::new(vec![record.clone()])));

    let snapshot = handle.read_state().expect("finished");
    assert_eq!(snapshot.copy(requests[0]).map(|c| c.bytes.clone()), Some(vec![9; 8]));
    assert_eq!(snapshot.copies.len(), 1);
    let errors: Vec<_> = snapshot.dropped.iter().map(|d| (d.observation, d.error.clone())).collect();
    assert_eq!(
        errors,
        vec![
            (ObservationKind::Copy(requests[1]), ObservationError::UnboundIndexBuffer),
            (
                ObservationKind::Copy(requests[2]),
                ObservationError::NotApplicable {
                    kind: CommandKind::DrawIndexed,
                    observation: "transfer source copy",
                }
            ),
        ]
    );
}

#[test]
fn releasing_the_record_invalidates_and_returns_resources() {
    let mut rig = Rig::new();
    let buffer = rig.registry.create_buffer(16, "target");
    let (record, fill) = fill_record(&rig, buffer);
    let handle = rig.hook.hook(
        &HookTarget::new(&record, fill),
        Observations::new()
            .copy(CopyTarget::TransferDst, CopyPoint::After)
            .timing(),
    );
    let before = idle_pool(&rig);

    let batch = RecordBatch::new(vec![record]);
    let submission = rig.submit(&batch).expect("hooked");
    rig.gpu.execute(&batch, Some(&submission));
    let in_use = rig.device.pool_stats();
    assert_eq!(in_use.buffers_in_use, 1);
    assert_eq!(in_use.queries_in_use, 2);

    // the application frees its command buffer while the GPU is still busy
    drop(batch);
    rig.complete(submission, DeviceOutcome::Completed);

    assert_eq!(handle.state(), HookState::Invalidated(InvalidReason::RecordReleased));
    assert_eq!(handle.read_state(), Err(HookError::Invalidated(InvalidReason::RecordReleased)));
    let after = idle_pool(&rig);
    assert_eq!(after.buffers_pooled, before.buffers_pooled + 1);
}

#[test]
fn over_budget_copies_are_dropped_and_the_rest_proceeds() {
    let mut rig = Rig::with_config(HookConfig {
        copy_budget_bytes: 8,
        ..HookConfig::default()
    });
    let buffer = rig.registry.create_buffer(16, "target");
    let (record, fill) = fill_record(&rig, buffer);
    let observations = Observations::new()
        .copy(CopyTarget::TransferDst, CopyPoint::After)
        .timing();
    let request = observations.copies[0];
    let handle = rig.hook.hook(&HookTarget::new(&record, fill), observations);
    assert!(rig.run_frame(&RecordBatch::new(vec![record.clone()])));

    let snapshot = handle.read_state().expect("finished");
    assert!(snapshot.copies.is_empty());
    assert!(snapshot.timing.is_some());
    assert_eq!(snapshot.dropped.len(), 1);
    assert_eq!(snapshot.dropped[0].observation, ObservationKind::Copy(request));
    assert_eq!(
        snapshot.dropped[0].error,
        ObservationError::Capacity(CapacityError::CopyBudget {
            requested: 16,
            available: 8
        })
    );
}

#[test]
fn exhausted_query_pool_drops_timing() {
    let mut rig = Rig::with_config(HookConfig {
        query_capacity: 1,
        ..HookConfig::default()
    });
    let buffer = rig.registry.create_buffer(16, "target");
    let (record, fill) = fill_record(&rig, buffer);
    let handle = rig.hook.hook(&HookTarget::new(&record, fill), Observations::new().timing());
    assert!(rig.run_frame(&RecordBatch::new(vec![record.clone()])));

    let snapshot = handle.read_state().expect("finished");
    assert_eq!(snapshot.timing, None);
    assert_eq!(
        snapshot.dropped[0].error,
        ObservationError::Capacity(CapacityError::QueryPoolExhausted { capacity: 1 })
    );
}

#[test]
fn device_loss_invalidates_everything_in_flight() {
    let mut rig = Rig::new();
    let buffer = rig.registry.create_buffer(16, "target");
    let (record, fill) = fill_record(&rig, buffer);
    let handle = rig.hook.hook(
        &HookTarget::new(&record, fill),
        Observations::new().copy(CopyTarget::TransferDst, CopyPoint::Before),
    );
    let batch = RecordBatch::new(vec![record.clone()]);
    let mut submission = rig.submit(&batch).expect("hooked");
    rig.device.with_lock(|guard| {
        submission.activate(guard);
        guard.mark_lost();
    });
    // invalidated as soon as the loss is known, before finish
    assert_eq!(handle.state(), HookState::Invalidated(InvalidReason::DeviceLost));
    assert_eq!(handle.read_state(), Err(HookError::DeviceLost));

    rig.complete(submission, DeviceOutcome::Lost);
    assert!(rig.device.is_lost());
    let stats = rig.device.pool_stats();
    assert_eq!(stats.buffers_in_use, 0);
    assert_eq!(stats.bytes_held, 0);

    let again = rig.hook.hook(&HookTarget::new(&record, fill), Observations::new());
    assert!(rig.submit(&batch).is_none());
    assert_eq!(again.state(), HookState::Idle);
}

#[test]
fn out_of_order_activation_is_tolerated_and_counted() {
    let mut rig = Rig::new();
    let buffer = rig.registry.create_buffer(16, "target");
    let (first, fill) = fill_record(&rig, buffer);
    let mut builder = RecordBuilder::new(rig.registry.clone());
    builder.begin_label("compute", [0; 4]);
    let dispatch = builder.record(Command::Dispatch(Default::default()));
    builder.end_label();
    let second = builder.finish();

    let a = rig.hook.hook(&HookTarget::new(&first, fill), Observations::new());
    let b = rig.hook.hook(&HookTarget::new(&second, dispatch), Observations::new());
    let mut earlier = rig.submit(&RecordBatch::new(vec![first.clone()])).expect("first hooked");
    let mut later = rig.submit(&RecordBatch::new(vec![second.clone()])).expect("second hooked");
    assert_eq!(earlier.hooks().len(), 1);
    assert_eq!(later.hooks().len(), 1);

    let (later_in_order, earlier_in_order) = rig.device.with_lock(|guard| {
        let later_in_order = later.activate(guard);
        let earlier_in_order = earlier.activate(guard);
        (later_in_order, earlier_in_order)
    });
    assert!(!later_in_order);
    assert!(earlier_in_order);
    assert_eq!(rig.device.out_of_order_activations(), 1);

    rig.device.with_lock(|guard| {
        later.finish(guard, DeviceOutcome::Completed);
        earlier.finish(guard, DeviceOutcome::Completed);
    });
    assert_eq!(a.state(), HookState::Finished);
    assert_eq!(b.state(), HookState::Finished);
}

#[test]
fn dropped_handles_are_discarded_but_still_finished() {
    let mut rig = Rig::new();
    let buffer = rig.registry.create_buffer(16, "target");
    let (record, fill) = fill_record(&rig, buffer);
    let handle = rig.hook.hook(
        &HookTarget::new(&record, fill),
        Observations::new().copy(CopyTarget::TransferDst, CopyPoint::After),
    );
    let batch = RecordBatch::new(vec![record.clone()]);
    let submission = rig.submit(&batch).expect("hooked");
    drop(handle);
    rig.gpu.execute(&batch, Some(&submission));
    rig.complete(submission, DeviceOutcome::Completed);

    idle_pool(&rig);
    assert_eq!(rig.hook.selection_count(), 0);
    assert!(rig.submit(&batch).is_none());
}

#[test]
fn unset_and_superseded_handles_are_invalidated() {
    let mut rig = Rig::new();
    let buffer = rig.registry.create_buffer(16, "target");
    let (record, fill) = fill_record(&rig, buffer);
    let target = HookTarget::new(&record, fill);

    let first = rig.hook.hook(&target, Observations::new());
    let second = rig.hook.hook(&target, Observations::new().timing());
    assert_eq!(first.state(), HookState::Invalidated(InvalidReason::Superseded));
    assert_eq!(rig.hook.selection_count(), 1);

    assert!(rig.hook.unset(&second));
    assert!(!rig.hook.unset(&second));
    assert_eq!(second.state(), HookState::Invalidated(InvalidReason::Unset));
    assert!(rig.submit(&RecordBatch::new(vec![record.clone()])).is_none());
}

#[test]
fn indirect_arguments_and_accel_builds_are_read_back() {
    let mut rig = Rig::new();
    let args = rig.registry.create_buffer(64, "indirect");
    let structure = rig.registry.create(ResourceKind::AccelerationStructure, 4096, "tlas");
    let mut words = Vec::new();
    for element in [[3u32, 1, 0, 0], [6, 2, 0, 0]] {
        for word in element {
            words.extend_from_slice(&word.to_le_bytes());
        }
    }
    rig.gpu.fill(args, words);

    let mut builder = RecordBuilder::new(rig.registry.clone());
    let indirect = builder.record(Command::DrawIndirect(IndirectArgs {
        buffer: args,
        offset: 0,
        count: 2,
        stride: 16,
    }));
    let build = builder.record(Command::BuildAccelerationStructure(BuildAccelArgs {
        dst: structure,
        src: ResourceId::NULL,
        primitive_count: 128,
    }));
    let first = builder.finish();
    let mut builder = RecordBuilder::new(rig.registry.clone());
    builder.record(Command::Dispatch(Default::default()));
    let second = builder.finish();

    let draws = rig.hook.hook(&HookTarget::new(&first, indirect), Observations::new().indirect_args());
    let batch = RecordBatch::new(vec![first.clone()]);
    assert!(rig.run_frame(&batch));
    let readback = draws.read_state().expect("finished").indirect.expect("indirect readback");
    assert_eq!(readback.buffer, args);
    assert_eq!(readback.bytes.len(), 32);
    match readback.commands {
        IndirectCommands::Draw(commands) => {
            assert_eq!(commands.len(), 2);
            assert_eq!(commands[1].vertex_count, 6);
            assert_eq!(commands[1].instance_count, 2);
        }
        other => panic!("unexpected {other:?}"),
    }

    let accel = rig.hook.hook(&HookTarget::new(&first, build), Observations::new().accel_build());
    assert!(rig.run_frame(&RecordBatch::new(vec![first.clone(), second])));
    let result = accel.read_state().expect("finished").accel_build.expect("build result");
    assert_eq!(result.structure, structure);
    assert_eq!(result.compacted_size, 2048);
}

#[async_test]
async fn finished_resolves_for_waiters() {
    let mut rig = Rig::new();
    let buffer = rig.registry.create_buffer(16, "target");
    let (record, fill) = fill_record(&rig, buffer);
    let handle = rig.hook.hook(&HookTarget::new(&record, fill), Observations::new().timing());
    assert!(rig.run_frame(&RecordBatch::new(vec![record.clone()])));
    handle.finished().await;
    assert!(handle.is_terminal());
}

#[test]
fn dropped_submissions_return_their_resources() {
    let mut rig = Rig::new();
    let buffer = rig.registry.create_buffer(16, "target");
    let (record, fill) = fill_record(&rig, buffer);
    let handle = rig.hook.hook(
        &HookTarget::new(&record, fill),
        Observations::new()
            .copy(CopyTarget::TransferDst, CopyPoint::After)
            .timing(),
    );
    let before = idle_pool(&rig);

    let batch = RecordBatch::new(vec![record.clone()]);
    let submission = rig.submit(&batch).expect("hooked");
    let built = Arc::clone(submission.hooks()[0].record());
    rig.gpu.execute(&batch, Some(&submission));
    drop(submission);

    let after = idle_pool(&rig);
    assert_eq!(after.buffers_pooled, before.buffers_pooled + 1);
    assert_eq!(handle.state(), HookState::Invalidated(InvalidReason::SubmissionDropped));
    assert!(!built.is_in_flight());

    // the hook record is free for the next frame
    let handle = rig.hook.rearm(&handle).expect("selected");
    let submission = rig.submit(&batch).expect("hooked again");
    assert!(Arc::ptr_eq(submission.hooks()[0].record(), &built));
    rig.gpu.execute(&batch, Some(&submission));
    rig.complete(submission, DeviceOutcome::Completed);
    assert_eq!(handle.read_state().map(|s| s.copies.len()), Ok(1));
    idle_pool(&rig);
    assert_eq!(rig.device.out_of_order_activations(), 0);
}

#[test]
fn releasing_the_record_cancels_an_idle_hook() {
    let mut rig = Rig::new();
    let buffer = rig.registry.create_buffer(16, "target");
    let (record, fill) = fill_record(&rig, buffer);
    let handle = rig.hook.hook(
        &HookTarget::new(&record, fill),
        Observations::new().copy(CopyTarget::TransferDst, CopyPoint::After),
    );
    drop(record);

    // a fill at the same place in an unrelated record is left alone
    let (other, _) = fill_record(&rig, rig.registry.create_buffer(16, "other"));
    assert!(!rig.run_frame(&RecordBatch::new(vec![other])));
    assert_eq!(handle.state(), HookState::Invalidated(InvalidReason::RecordReleased));
    assert_eq!(
        handle.history(),
        vec![HookState::Idle, HookState::Invalidated(InvalidReason::RecordReleased)]
    );
    assert_eq!(rig.hook.selection_count(), 0);
    assert!(rig.hook.rearm(&handle).is_none());
    idle_pool(&rig);
}

#[test]
fn commands_outside_the_record_are_refused() {
    let rig = Rig::new();
    let mut builder = RecordBuilder::new(rig.registry.clone());
    let mut last = builder.record(draw());
    for _ in 0..4 {
        last = builder.record(draw());
    }
    let large = builder.finish();
    let mut builder = RecordBuilder::new(rig.registry.clone());
    builder.record(draw());
    let small = builder.finish();

    let handle = rig.hook.hook(&HookTarget::new(&small, last), Observations::new().timing());
    assert_eq!(handle.state(), HookState::Invalidated(InvalidReason::UnknownCommand));
    let root = rig.hook.hook(&HookTarget::new(&small, small.root()), Observations::new());
    assert_eq!(root.state(), HookState::Invalidated(InvalidReason::UnknownCommand));
    assert_eq!(rig.hook.selection_count(), 0);

    let valid = rig.hook.hook(&HookTarget::new(&large, last), Observations::new());
    assert_eq!(valid.state(), HookState::Idle);
}
