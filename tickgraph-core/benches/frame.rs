//! Scheduler benchmarks: raw task throughput and full frames.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use tickgraph_core::config::{TaskGraphConfig, TickConfig};
use tickgraph_core::task::{CompletionHandle, DesiredThread, TaskGraph};
use tickgraph_core::tick::{TickFunctionSpec, TickGroup, TickTaskManager, WorldId};

fn launch_and_wait(c: &mut Criterion) {
    let graph = TaskGraph::new(TaskGraphConfig::default()).expect("task graph");
    let counter = Arc::new(AtomicUsize::new(0));

    let mut group = c.benchmark_group("launch_and_wait");
    for tasks in [100usize, 1_000, 10_000] {
        group.bench_with_input(BenchmarkId::from_parameter(tasks), &tasks, |b, &tasks| {
            b.iter(|| {
                let handles: Vec<CompletionHandle> = (0..tasks)
                    .map(|_| {
                        let counter = counter.clone();
                        graph.launch(
                            move |_| {
                                counter.fetch_add(1, Ordering::Relaxed);
                            },
                            &[],
                            DesiredThread::any(),
                        )
                    })
                    .collect();
                graph.wait_until_tasks_complete(&handles);
            });
        });
    }
    group.finish();
    black_box(counter.load(Ordering::Relaxed));
}

fn build_frame(functions: usize, graph: Arc<TaskGraph>) -> TickTaskManager {
    let mut ticks = TickTaskManager::new(graph, TickConfig::default()).expect("tick manager");
    let level = ticks.add_level();
    let groups = [TickGroup::PrePhysics, TickGroup::StartPhysics, TickGroup::PostPhysics];
    let mut previous = None;
    for index in 0..functions {
        let spec = TickFunctionSpec::new(format!("f{index}"), |args| {
            black_box(args.delta_seconds * 2.0);
        })
        .in_group(groups[index % groups.len()])
        .run_on_any_thread();
        let id = ticks.add_and_register(level, spec).expect("register");
        // every eighth function waits on its predecessor
        if index % 8 == 0 {
            if let Some(previous) = previous {
                ticks.add_prerequisite(id, previous).expect("prerequisite");
            }
        }
        previous = Some(id);
    }
    ticks
}

fn full_frame(c: &mut Criterion) {
    let threaded = Arc::new(TaskGraph::new(TaskGraphConfig::default()).expect("task graph"));
    let single = Arc::new(TaskGraph::single_threaded());

    let mut group = c.benchmark_group("full_frame");
    for functions in [64usize, 512, 4_096] {
        let mut ticks = build_frame(functions, threaded.clone());
        group.bench_with_input(BenchmarkId::new("threaded", functions), &functions, |b, _| {
            b.iter(|| ticks.run_frame(WorldId::new(1), 1.0 / 60.0).expect("frame"));
        });

        let mut ticks = build_frame(functions, single.clone());
        group.bench_with_input(BenchmarkId::new("single_threaded", functions), &functions, |b, _| {
            b.iter(|| ticks.run_frame(WorldId::new(1), 1.0 / 60.0).expect("frame"));
        });
    }
    group.finish();
}

criterion_group!(benches, launch_and_wait, full_frame);
criterion_main!(benches);
