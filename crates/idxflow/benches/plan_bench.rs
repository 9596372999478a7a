//! Benchmarks for plan reduction and end-to-end execution against the in-memory backend.
//!
//! Run with: cargo bench -p idxflow --bench plan_bench

use criterion::{
    BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main,
};
use idxflow::backends::InMemoryBackend;
use idxflow::{
    BackendHandle, DocumentContributor, DocumentReference, IndexingEngine, PipelineConfig,
    SynchronizationStrategy, WorkPlan,
};
use serde_json::json;

// =============================================================================
// Helpers
// =============================================================================

/// A noisy unit of work: `operations` changes spread over `operations / 4` documents,
/// cycling add → update → update → delete → add ...
fn noisy_plan(operations: usize) -> WorkPlan {
    let documents = (operations / 4).max(1);
    let mut plan = WorkPlan::new("bench");
    for step in 0..operations {
        let id = (step % documents).to_string();
        let reference = DocumentReference::new(id.clone(), None, "Doc", json!(id));
        let contributor = DocumentContributor::new(move |doc| {
            doc.add_value("step", step as u64).add_value("tag", "bench");
            Ok(())
        });
        match (step / documents) % 4 {
            0 => plan.add(&reference, contributor),
            1 | 2 => plan.update(&reference, contributor),
            _ => plan.delete(&reference),
        }
    }
    plan
}

// =============================================================================
// Benchmarks
// =============================================================================

fn bench_reduction(c: &mut Criterion) {
    let mut group = c.benchmark_group("plan_reduction");
    for operations in [100usize, 1_000, 10_000] {
        group.throughput(Throughput::Elements(operations as u64));
        let id = BenchmarkId::new("enqueue_and_process", operations);
        group.bench_with_input(id, &operations, |b, &n| {
            b.iter(|| {
                let mut plan = noisy_plan(n);
                black_box(plan.process());
                black_box(plan.len())
            })
        });
    }
    group.finish();
}

fn bench_execute(c: &mut Criterion) {
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => panic!("failed to build a tokio runtime for the benchmark: {err}"),
    };
    let engine = runtime.block_on(async {
        IndexingEngine::new(
            BackendHandle::InMemory(InMemoryBackend::default()),
            PipelineConfig::default(),
        )
    });

    let mut group = c.benchmark_group("plan_execute_in_memory");
    for operations in [100usize, 1_000] {
        group.throughput(Throughput::Elements(operations as u64));
        group.bench_with_input(BenchmarkId::new("write_sync", operations), &operations, |b, &n| {
            b.to_async(&runtime).iter(|| async {
                let plan = noisy_plan(n);
                let executor = engine.executor("bench");
                black_box(plan.execute(&executor, SynchronizationStrategy::WriteSync).await)
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_reduction, bench_execute);
criterion_main!(benches);
