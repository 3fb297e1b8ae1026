//! Property tests for frame ordering and interval cadence.

mod common;

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use proptest::prelude::*;

use tickgraph_core::config::TickConfig;
use tickgraph_core::task::TaskGraph;
use tickgraph_core::tick::{TickFunctionSpec, TickGroup, TickTaskManager, WorldId};

const WORLD: WorldId = WorldId(1);

/// Groups that complete before the next one starts.
const BLOCKING: [TickGroup; 6] = [
    TickGroup::PrePhysics,
    TickGroup::StartPhysics,
    TickGroup::EndPhysics,
    TickGroup::PostPhysics,
    TickGroup::PostUpdateWork,
    TickGroup::LastDemotable,
];

/// A random DAG: node `i` may only depend on nodes `0..i`.
fn dag_strategy(max_nodes: usize) -> impl Strategy<Value = Vec<(TickGroup, Vec<usize>)>> {
    (1..=max_nodes).prop_flat_map(|nodes| {
        proptest::collection::vec(
            (
                proptest::sample::select(BLOCKING.to_vec()),
                proptest::collection::vec(any::<usize>(), 0..4),
            ),
            nodes,
        )
        .prop_map(|raw| {
            raw.into_iter()
                .enumerate()
                .map(|(i, (group, picks))| {
                    let deps: HashSet<usize> = if i == 0 {
                        HashSet::new()
                    } else {
                        picks.into_iter().map(|p| p % i).collect()
                    };
                    (group, deps.into_iter().collect())
                })
                .collect()
        })
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prerequisites_always_finish_first(
        dag in dag_strategy(24),
        optimized in any::<bool>(),
        reverse_registration in any::<bool>(),
    ) {
        common::init_tracing();
        let config = TickConfig {
            allow_optimized_prerequisites: optimized,
            ..TickConfig::default()
        };
        let mut ticks = TickTaskManager::new(Arc::new(TaskGraph::single_threaded()), config).unwrap();
        let level = ticks.add_level();
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut order: Vec<usize> = (0..dag.len()).collect();
        if reverse_registration {
            order.reverse();
        }
        let mut ids = vec![None; dag.len()];
        for &node in &order {
            let log = log.clone();
            let spec = TickFunctionSpec::new(format!("node{node}"), move |_| log.lock().push(node))
                .in_group(dag[node].0);
            ids[node] = Some(ticks.add_and_register(level, spec).unwrap());
        }
        let ids: Vec<_> = ids.into_iter().map(Option::unwrap).collect();
        for (node, (_, deps)) in dag.iter().enumerate() {
            for &dep in deps {
                ticks.add_prerequisite(ids[node], ids[dep]).unwrap();
            }
        }

        ticks.run_frame(WORLD, 0.016).unwrap();

        let log = log.lock();
        prop_assert_eq!(log.len(), dag.len());
        let position: Vec<usize> = {
            let mut position = vec![usize::MAX; dag.len()];
            for (at, &node) in log.iter().enumerate() {
                position[node] = at;
            }
            position
        };
        for (node, (_, deps)) in dag.iter().enumerate() {
            let (start, _) = ticks.actual_groups(ids[node]).unwrap();
            for &dep in deps {
                prop_assert!(position[dep] < position[node], "node{} ran before its prerequisite node{}", node, dep);
                let (_, dep_end) = ticks.actual_groups(ids[dep]).unwrap();
                prop_assert!(start >= dep_end, "node{} starts in {} before node{} ends in {}", node, start, dep, dep_end);
            }
        }
    }

    #[test]
    fn interval_gaps_stay_within_one_frame_of_the_interval(
        interval_sixteenths in 1u32..=48,
        delta_sixteenths in 1u32..=16,
    ) {
        common::init_tracing();
        let interval = interval_sixteenths as f32 / 16.0;
        let delta = delta_sixteenths as f32 / 16.0;

        let mut ticks = TickTaskManager::new(Arc::new(TaskGraph::single_threaded()), TickConfig::default()).unwrap();
        let level = ticks.add_level();
        let frames = Arc::new(Mutex::new(Vec::new()));
        let seen = frames.clone();
        ticks
            .add_and_register(
                level,
                TickFunctionSpec::new("interval", move |args| seen.lock().push(args.frame)).with_interval(interval),
            )
            .unwrap();
        for _ in 0..48 {
            ticks.run_frame(WORLD, delta).unwrap();
        }

        let frames = frames.lock();
        prop_assert_eq!(frames.first().copied(), Some(1));
        for pair in frames.windows(2) {
            let gap = (pair[1] - pair[0]) as f32;
            prop_assert!(gap >= 1.0);
            prop_assert!(gap * delta <= interval + delta, "gap {} frames at {}s exceeds {}s", gap, delta, interval);
            prop_assert!(gap * delta > interval - delta, "gap {} frames at {}s undercuts {}s", gap, delta, interval);
        }
    }
}
