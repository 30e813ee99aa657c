//! Multi-worker runs on an in-process `LocalGroup`.

mod common;

use common::{Batches, Linear, init_tracing, stage};
use stagewise_engine::abstraction::Value;
use stagewise_engine::{Communicator, DistOptimizerHook, Engine, EvalHook, LocalGroup};
use std::thread;

struct WorkerResult {
    rank: usize,
    weight: f64,
    count: Option<Value>,
}

fn run_worker(comm: stagewise_engine::LocalCommunicator) -> WorkerResult {
    let rank = comm.rank();
    let mut engine = Engine::builder()
        .model(Linear::new())
        // Different data per worker; the same number of batches keeps collectives aligned.
        .train_data(Batches::new(2, rank as f64))
        .val_data(Batches::new(rank + 1, 0.0))
        .stage(stage(2, 0.01))
        .hook(DistOptimizerHook::new())
        .hook(EvalHook::new())
        .communicator(comm)
        .build()
        .unwrap();
    engine.launch().unwrap();

    let ctx = engine.context();
    WorkerResult {
        rank,
        weight: ctx.model().parameters()[0].data[0],
        count: ctx.buffer().latest("count").ok().cloned(),
    }
}

#[test]
fn test_only_the_coordinator_reports_metrics() {
    init_tracing();
    let handles: Vec<_> = LocalGroup::new(2)
        .into_members()
        .into_iter()
        .map(|comm| thread::spawn(move || run_worker(comm)))
        .collect();
    let mut results: Vec<WorkerResult> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    results.sort_by_key(|r| r.rank);

    // Rank 0 sees one val batch of two predictions, rank 1 two batches.
    assert_eq!(results[0].count, Some(Value::Int(6)));
    assert_eq!(results[1].count, None);
}

#[test]
fn test_gradients_are_averaged_across_workers() {
    init_tracing();
    let handles: Vec<_> = LocalGroup::new(2)
        .into_members()
        .into_iter()
        .map(|comm| thread::spawn(move || run_worker(comm)))
        .collect();
    let results: Vec<WorkerResult> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert!(results[0].weight > 0.0);
    assert_eq!(results[0].weight, results[1].weight);
}
