//! Integration tests against real forked workers: preload traces,
//! record streams, and the kill/resync protocol.

use assay::protocol::{FailKind, ModuleName, Response};
use assay::runtime::RuntimeFactory;
use assay::samples::sample_world;
use assay::worker::{Chunk, Worker, WorkerState};
use std::path::PathBuf;

fn factory() -> RuntimeFactory {
    Box::new(|| Box::new(sample_world()))
}

/// Read records until EndOfStream, then consume the sync byte.
fn collect_stream(worker: &mut Worker) -> (Vec<Response>, Vec<(ModuleName, PathBuf)>) {
    let mut records = Vec::new();
    let mut paths = Vec::new();
    loop {
        match worker.read_chunk().unwrap() {
            Chunk::PreloaderGone => panic!("preloader died mid-stream"),
            Chunk::Records(batch) => {
                for record in batch {
                    match record {
                        Response::Paths(p) => paths.extend(p),
                        Response::EndOfStream => {
                            worker.finish_stream().unwrap();
                            return (records, paths);
                        }
                        other => records.push(other),
                    }
                }
            }
        }
    }
}

#[test]
fn single_passing_test_streams_pass_then_end() {
    let factory = factory();
    let mut worker = Worker::spawn(&factory).unwrap();
    worker.push().unwrap();
    worker.preload(&["quartz".to_string()]).unwrap();

    worker.dispatch("quartz", false).unwrap();
    assert_eq!(worker.state(), WorkerState::Running);
    let (records, paths) = collect_stream(&mut worker);
    assert_eq!(records, vec![Response::Pass]);
    assert!(paths.iter().any(|(name, _)| name == "quartz"));
    assert_eq!(worker.state(), WorkerState::Idle);
}

#[test]
fn preload_trace_reports_transitive_loads() {
    let factory = factory();
    let mut worker = Worker::spawn(&factory).unwrap();
    worker.push().unwrap();
    let (events, paths) = worker
        .preload(&[
            "omega".to_string(),
            "alpha".to_string(),
            "broken_import".to_string(),
        ])
        .unwrap();

    assert_eq!(events.len(), 3);
    assert_eq!(events[0].requested, "omega");
    let loaded: Vec<&str> = events[0].loaded.iter().map(|s| s.as_str()).collect();
    assert_eq!(loaded, ["alpha", "beta", "omega"]);
    // alpha became warm through omega, so its own delta is empty
    assert!(events[1].loaded.is_empty());
    // import failures are non-fatal empty events
    assert!(events[2].loaded.is_empty());

    let names: Vec<&str> = paths.iter().map(|(n, _)| n.as_str()).collect();
    assert!(names.contains(&"alpha"));
    assert!(names.contains(&"omega"));
}

#[test]
fn preloader_state_survives_a_child_dispatch() {
    let factory = factory();
    let mut worker = Worker::spawn(&factory).unwrap();
    worker.push().unwrap();
    worker.preload(&["quartz".to_string()]).unwrap();

    worker.dispatch("failing", false).unwrap();
    let (records, _) = collect_stream(&mut worker);
    assert_eq!(records.len(), 1);

    // the cycle child is intact and can keep dispatching
    worker.dispatch("quartz", false).unwrap();
    let (records, _) = collect_stream(&mut worker);
    assert_eq!(records, vec![Response::Pass]);
    assert_eq!(worker.pid_stack().len(), 2);
}

#[test]
fn fixture_cross_product_streams_in_order() {
    let factory = factory();
    let mut worker = Worker::spawn(&factory).unwrap();
    worker.push().unwrap();
    worker.dispatch("fixtures", false).unwrap();
    let (records, _) = collect_stream(&mut worker);

    // test_fix2 over [0,1,2,3] fails only on 2
    let fix2: Vec<bool> = records[..4]
        .iter()
        .map(|r| matches!(r, Response::Pass))
        .collect();
    assert_eq!(fix2, [true, true, false, true]);
    match &records[2] {
        Response::Fail(failure) => {
            assert_eq!(failure.kind, FailKind::Assertion);
            assert_eq!(failure.frames.last().unwrap().function, "test_fix2(2)");
        }
        other => panic!("expected Fail, got {other:?}"),
    }
    // then test_pairs: two letters times two numbers
    assert_eq!(records.len(), 8);
}

#[test]
fn captured_output_rides_on_the_failure() {
    let factory = factory();
    let mut worker = Worker::spawn(&factory).unwrap();
    worker.push().unwrap();
    worker.dispatch("printing", false).unwrap();
    let (records, _) = collect_stream(&mut worker);
    match &records[0] {
        Response::Fail(failure) => {
            assert!(failure.stdout.contains("ker-pow"));
            assert!(failure.stderr.contains("kaboom"));
        }
        other => panic!("expected Fail, got {other:?}"),
    }
}

#[test]
fn import_error_synthesizes_one_failure_for_the_module() {
    let factory = factory();
    let mut worker = Worker::spawn(&factory).unwrap();
    worker.push().unwrap();
    worker.dispatch("broken_import", false).unwrap();
    let (records, _) = collect_stream(&mut worker);
    assert_eq!(records.len(), 1);
    match &records[0] {
        Response::Fail(failure) => {
            assert_eq!(failure.kind, FailKind::Setup);
            assert_eq!(failure.name, "SyntaxError");
        }
        other => panic!("expected Fail, got {other:?}"),
    }
}

/// Kill a child mid-stream; after the sync byte the next dispatch
/// must decode cleanly from its first byte.
#[test]
fn abort_mid_stream_resynchronises() {
    let factory = factory();
    let mut worker = Worker::spawn(&factory).unwrap();
    worker.push().unwrap();
    worker.preload(&["hanging".to_string(), "quartz".to_string()]).unwrap();

    worker.dispatch("hanging", false).unwrap();
    // wait for the first record, proving the child is mid-stream
    let mut got_first = false;
    while !got_first {
        match worker.read_chunk().unwrap() {
            Chunk::Records(batch) => {
                got_first = batch.iter().any(|r| matches!(r, Response::Pass));
            }
            Chunk::PreloaderGone => panic!("preloader died"),
        }
    }

    worker.abort().unwrap();
    assert_eq!(worker.state(), WorkerState::Idle);
    assert_eq!(worker.pid_stack().len(), 2);

    // the stream of the next module decodes from its first byte
    worker.dispatch("quartz", false).unwrap();
    let (records, _) = collect_stream(&mut worker);
    assert_eq!(records, vec![Response::Pass]);
}

#[test]
fn repeated_abort_cycles_stay_clean() {
    let factory = factory();
    let mut worker = Worker::spawn(&factory).unwrap();
    worker.push().unwrap();
    for _ in 0..3 {
        worker.dispatch("hanging", false).unwrap();
        loop {
            if let Chunk::Records(batch) = worker.read_chunk().unwrap() {
                if batch.iter().any(|r| matches!(r, Response::Pass)) {
                    break;
                }
            } else {
                panic!("preloader died");
            }
        }
        worker.abort().unwrap();
    }
    worker.dispatch("quartz", false).unwrap();
    let (records, _) = collect_stream(&mut worker);
    assert_eq!(records, vec![Response::Pass]);
}

#[test]
fn exactly_one_serving_process_at_every_quiescent_moment() {
    let factory = factory();
    let mut worker = Worker::spawn(&factory).unwrap();
    assert_eq!(worker.pid_stack().len(), 1);
    worker.push().unwrap();
    assert_eq!(worker.pid_stack().len(), 2);

    worker.dispatch("quartz", false).unwrap();
    assert_eq!(worker.pid_stack().len(), 3);
    let _ = collect_stream(&mut worker);
    assert_eq!(worker.pid_stack().len(), 2);

    worker.abort().unwrap(); // drop the cycle child
    assert_eq!(worker.pid_stack().len(), 1);
    worker.abort().unwrap_err(); // the preloader is not abortable
}

#[test]
fn close_tears_down_the_whole_stack() {
    let factory = factory();
    let mut worker = Worker::spawn(&factory).unwrap();
    worker.push().unwrap();
    worker.dispatch("hanging", false).unwrap();
    worker.close();
    assert_eq!(worker.state(), WorkerState::Dead);
    assert!(worker.pid_stack().is_empty());
}
