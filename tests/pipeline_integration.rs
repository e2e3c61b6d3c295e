//! Integration tests for pipeline execution
//!
//! These tests run complete pipelines on real threads:
//! - Row delivery through one-to-one and meshed hops
//! - Distribution modes
//! - Listener notification
//! - Stop and failure propagation
//! - Sub-pipeline shutdown and server hosting

mod common;

use common::builders::int_row;
use common::mock_helpers::{CollectStep, CountingListener, EmitStep, EndlessStep, FailingStep, PassThrough};
use common::{first_int, test_engine};
use parking_lot::Mutex;
use rowflow::pipeline::{RowDistribution, RowListener, Step};
use rowflow::registry::SubPipelineState;
use rowflow::server::{ExecutionStatus, HostedKey, HostedPipeline};
use rowflow::{EngineConfig, ExecutionServer, PipelineBuilder, RemoteServerConfig, Row};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn rows(n: i64) -> Vec<Row> {
    (0..n).map(int_row).collect()
}

#[test]
fn test_meshed_copies_deliver_every_row_once() {
    let sink = Arc::new(Mutex::new(Vec::new()));
    let collected = Arc::clone(&sink);

    let mut pipeline = PipelineBuilder::new("mesh", test_engine())
        .channel_capacity(16)
        .add_step("source", 1, |_| EmitStep::boxed(rows(1_000)))
        .add_step("work", 3, |_| Box::new(PassThrough) as Box<dyn Step>)
        .add_step("sink", 2, move |_| CollectStep::boxed(&collected))
        .add_hop("source", "work")
        .add_hop("work", "sink")
        .build()
        .unwrap();

    let result = pipeline.run().unwrap();
    assert!(result.is_success(), "{result:?}");

    let mut seen: Vec<i64> = sink.lock().iter().map(first_int).collect();
    seen.sort_unstable();
    assert_eq!(seen, (0..1_000).collect::<Vec<_>>());
    // source writes 1000, work reads+writes 1000, sink reads 1000
    assert_eq!(result.rows_read, 2_000);
    assert_eq!(result.rows_written, 2_000);
}

#[test]
fn test_copy_to_all_duplicates_rows() {
    let a = Arc::new(Mutex::new(Vec::new()));
    let b = Arc::new(Mutex::new(Vec::new()));
    let (sink_a, sink_b) = (Arc::clone(&a), Arc::clone(&b));

    let mut pipeline = PipelineBuilder::new("fan-out", test_engine())
        .add_step_with_distribution("source", 1, RowDistribution::CopyToAll, |_| {
            EmitStep::boxed(rows(50))
        })
        .add_step("a", 1, move |_| CollectStep::boxed(&sink_a))
        .add_step("b", 1, move |_| CollectStep::boxed(&sink_b))
        .add_hop("source", "a")
        .add_hop("source", "b")
        .build()
        .unwrap();
    pipeline.run().unwrap();

    assert_eq!(a.lock().len(), 50);
    assert_eq!(*a.lock(), *b.lock());
}

#[test]
fn test_multiple_inputs_are_merged() {
    let sink = Arc::new(Mutex::new(Vec::new()));
    let collected = Arc::clone(&sink);

    let mut pipeline = PipelineBuilder::new("merge", test_engine())
        .channel_capacity(4)
        .add_step("left", 1, |_| EmitStep::boxed((0..100).map(int_row).collect()))
        .add_step("right", 1, |_| EmitStep::boxed((100..200).map(int_row).collect()))
        .add_step("sink", 1, move |_| CollectStep::boxed(&collected))
        .add_hop("left", "sink")
        .add_hop("right", "sink")
        .build()
        .unwrap();
    pipeline.run().unwrap();

    let seen: Vec<i64> = sink.lock().iter().map(first_int).collect();
    assert_eq!(seen.len(), 200);
    // FIFO holds per input channel.
    let left: Vec<i64> = seen.iter().copied().filter(|v| *v < 100).collect();
    assert_eq!(left, (0..100).collect::<Vec<_>>());
    let right: Vec<i64> = seen.iter().copied().filter(|v| *v >= 100).collect();
    assert_eq!(right, (100..200).collect::<Vec<_>>());
}

#[test]
fn test_listeners_see_rows() {
    let listener = Arc::new(CountingListener::default());
    let mut pipeline = PipelineBuilder::new("listened", test_engine())
        .add_step("source", 1, |_| EmitStep::boxed(rows(25)))
        .add_step("sink", 1, |_| Box::new(PassThrough) as Box<dyn Step>)
        .add_hop("source", "sink")
        .build()
        .unwrap();

    let as_listener: Arc<dyn RowListener> = listener.clone();
    pipeline
        .step_endpoints("sink", 0)
        .unwrap()
        .add_listener(as_listener);
    pipeline.run().unwrap();

    assert_eq!(listener.read(), 25);
    assert_eq!(listener.written(), 25);
}

#[test]
fn test_stop_unblocks_every_thread() {
    let mut pipeline = PipelineBuilder::new("endless", test_engine())
        .channel_capacity(2)
        .add_step("source", 2, |_| Box::new(EndlessStep) as Box<dyn Step>)
        .add_step("slow", 1, |_| FailingStep::boxed(u64::MAX))
        .add_hop("source", "slow")
        .build()
        .unwrap();
    let control = pipeline.control();
    pipeline.start().unwrap();

    thread::sleep(Duration::from_millis(50));
    assert!(control.stop());
    assert!(!control.stop());

    let result = pipeline.wait_until_finished().unwrap();
    assert!(result.stopped);
    assert_eq!(result.errors, 0);
    assert!(pipeline.channels().iter().all(|c| c.is_done()));
}

#[test]
fn test_step_failure_stops_pipeline() {
    let mut pipeline = PipelineBuilder::new("failing", test_engine())
        .channel_capacity(8)
        .add_step("source", 1, |_| Box::new(EndlessStep) as Box<dyn Step>)
        .add_step("check", 1, |_| FailingStep::boxed(10))
        .add_hop("source", "check")
        .build()
        .unwrap();
    let listener = Arc::new(CountingListener::default());
    let as_listener: Arc<dyn RowListener> = listener.clone();
    pipeline
        .step_endpoints("source", 0)
        .unwrap()
        .add_listener(as_listener);

    let result = pipeline.run().unwrap();
    // Rows refused by the closed channel are not counted as written.
    let pushed = pipeline.channels()[0].stats().pushed;
    assert_eq!(result.rows_written, pushed);
    assert_eq!(listener.written(), pushed);
    assert_eq!(result.errors, 1);
    assert!(result.stopped);
    assert!(!result.is_success());
    assert_eq!(result.failures[0].step, "check");
    assert!(result.failures[0].message.contains("bad row"));
}

#[test]
fn test_stop_reaches_sub_pipelines() {
    let engine = test_engine();
    let mut parent = PipelineBuilder::new("parent", Arc::clone(&engine))
        .add_step("source", 1, |_| Box::new(EndlessStep) as Box<dyn Step>)
        .add_step("sink", 1, |_| Box::new(PassThrough) as Box<dyn Step>)
        .add_hop("source", "sink")
        .build()
        .unwrap();
    let mut child = PipelineBuilder::new("child", Arc::clone(&engine))
        .parent_log_channel(parent.log_channel_id())
        .add_step("source", 1, |_| Box::new(EndlessStep) as Box<dyn Step>)
        .add_step("sink", 1, |_| Box::new(PassThrough) as Box<dyn Step>)
        .add_hop("source", "sink")
        .build()
        .unwrap();

    let handle = child.sub_pipeline_handle();
    parent.sub_pipelines().register(Arc::clone(&handle));
    assert!(engine
        .log_channels()
        .descendants_of(parent.log_channel_id())
        .contains(&child.log_channel_id()));

    parent.start().unwrap();
    child.start().unwrap();
    thread::sleep(Duration::from_millis(20));
    parent.stop();

    assert!(child.wait_until_finished().unwrap().stopped);
    assert!(parent.wait_until_finished().unwrap().stopped);
    assert_eq!(handle.state(), SubPipelineState::Stopped);
}

#[test]
fn test_server_hosts_running_pipeline() {
    let config = EngineConfig::default();
    let engine = test_engine();
    let server = ExecutionServer::new(
        Arc::clone(&engine),
        RemoteServerConfig::new("master", "localhost", 8080).as_master(),
        &config.cluster,
    );

    let mut pipeline = PipelineBuilder::new("hosted", Arc::clone(&engine))
        .parent_log_channel(server.log_channel_id())
        .add_step("source", 1, |_| Box::new(EndlessStep) as Box<dyn Step>)
        .add_step("sink", 1, |_| Box::new(PassThrough) as Box<dyn Step>)
        .add_hop("source", "sink")
        .build()
        .unwrap();
    let key = HostedKey::new(pipeline.name(), pipeline.run_id());
    server.add_pipeline(Arc::new(
        HostedPipeline::new(key.clone(), pipeline.log_channel_id()).with_control(pipeline.control()),
    ));

    pipeline.start().unwrap();
    server.get_pipeline(&key).unwrap().set_status(ExecutionStatus::Running);
    assert_eq!(server.status().pipelines[0].status, ExecutionStatus::Running);

    // A remote "stop" request.
    assert_eq!(server.stop_all(), 1);
    assert!(pipeline.wait_until_finished().unwrap().stopped);
    assert_eq!(server.find_pipeline("hosted").unwrap().status(), ExecutionStatus::Stopped);

    let steps = engine.log_channels().descendants_of(pipeline.log_channel_id());
    assert_eq!(steps.len(), 2);
    server.remove_pipeline(&key);
    assert!(engine.log_channels().get(pipeline.log_channel_id()).is_none());
    assert!(steps.iter().all(|id| engine.log_channels().get(*id).is_none()));
}
