//! Property tests over graphs, budgets, commitment and spiral detection.

use proptest::prelude::*;
use std::collections::HashMap;

use keel::core::dag::DependencyGraph;
use keel::core::iteration::IterationRecord;
use keel::core::task::{Complexity, TaskId, TaskSpec};
use keel::orchestration::{Ledger, SpiralDetector};
use keel::planning::BudgetAllocator;
use keel::Error;

/// A random DAG: task `i` may depend on any task `j < i`. Names are a
/// shuffled numbering so lexical order does not follow construction order.
fn arb_dag(max_tasks: usize) -> impl Strategy<Value = Vec<TaskSpec>> {
    (1..=max_tasks).prop_flat_map(|n| {
        (
            prop::collection::vec(prop::collection::vec(any::<bool>(), n), n),
            Just((0..n).collect::<Vec<_>>()).prop_shuffle(),
            prop::collection::vec(arb_complexity(), n),
        )
            .prop_map(move |(edges, names, complexities)| {
                let name = |i: usize| format!("t{:02}", names[i]);
                (0..n)
                    .map(|i| {
                        let mut spec = TaskSpec::new(&name(i)).with_complexity(complexities[i]);
                        for j in (0..i).filter(|j| edges[i][*j]) {
                            spec = spec.depends_on(&name(j));
                        }
                        spec
                    })
                    .collect::<Vec<TaskSpec>>()
            })
    })
}

fn arb_complexity() -> impl Strategy<Value = Complexity> {
    prop_oneof![
        Just(Complexity::Low),
        Just(Complexity::Medium),
        Just(Complexity::High),
    ]
}

fn arb_record() -> impl Strategy<Value = (Vec<&'static str>, f64, u64, bool, bool)> {
    (
        prop::sample::subsequence(vec!["a", "b", "c", "d", "e"], 0..=5),
        0.0f64..=1.0,
        0u64..1_000,
        any::<bool>(),
        any::<bool>(),
    )
}

fn arb_history(max_len: usize) -> impl Strategy<Value = Vec<IterationRecord>> {
    prop::collection::vec(arb_record(), 0..=max_len).prop_map(|raw| {
        raw.into_iter()
            .enumerate()
            .map(|(i, (touched, ratio, duration, out_of_scope, regression))| {
                IterationRecord::new(i as u32 + 1, touched, ratio, duration)
                    .with_out_of_scope(out_of_scope)
                    .with_regression(regression)
            })
            .collect()
    })
}

/// Either a deduction amount or a spiral-driven raise.
#[derive(Debug, Clone)]
enum LedgerOp {
    Deduct(f64),
    Raise,
}

fn arb_ledger_op() -> impl Strategy<Value = LedgerOp> {
    prop_oneof![
        4 => (0.0f64..40.0).prop_map(LedgerOp::Deduct),
        1 => Just(LedgerOp::Raise),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_topological_order_respects_dependencies(specs in arb_dag(12)) {
        let graph = DependencyGraph::build(&specs).unwrap();
        let order = graph.topological_order();
        prop_assert_eq!(order.len(), specs.len());

        let position: HashMap<&TaskId, usize> =
            order.iter().enumerate().map(|(i, id)| (id, i)).collect();
        for spec in &specs {
            for dependency in &spec.depends_on {
                prop_assert!(position[dependency] < position[&spec.name]);
            }
        }
    }

    #[test]
    fn prop_graph_build_is_deterministic(specs in arb_dag(12)) {
        let first = DependencyGraph::build(&specs).unwrap();
        let mut reversed = specs.clone();
        reversed.reverse();
        let second = DependencyGraph::build(&reversed).unwrap();
        prop_assert_eq!(first.topological_order(), second.topological_order());
        prop_assert_eq!(first.depths(), second.depths());
    }

    #[test]
    fn prop_independent_tasks_run_in_lexical_order(n in 1usize..16) {
        let specs: Vec<TaskSpec> = (0..n).rev().map(|i| TaskSpec::new(&format!("task-{:02}", i))).collect();
        let order = DependencyGraph::build(&specs).unwrap().topological_order();
        let mut sorted = order.clone();
        sorted.sort();
        prop_assert_eq!(order, sorted);
    }

    #[test]
    fn prop_allocation_fits_budget(
        specs in arb_dag(12),
        total in 1.0f64..500.0,
        base in 0.5f64..50.0,
    ) {
        let graph = DependencyGraph::build(&specs).unwrap();
        let allocation = BudgetAllocator::new(total, base).unwrap().allocate(&specs, &graph);
        prop_assert_eq!(allocation.per_task.len(), specs.len());
        prop_assert!(allocation.total() <= total);
        for amount in allocation.per_task.values() {
            prop_assert!(*amount > 0.0);
        }
        prop_assert!(allocation.rescale_factor > 0.0 && allocation.rescale_factor <= 1.0);
    }

    #[test]
    fn prop_commitment_is_monotonic(
        total in 1.0f64..200.0,
        ops in prop::collection::vec(arb_ledger_op(), 0..40),
    ) {
        let mut ledger = Ledger::new(total, &[0.5, 0.75, 0.9]);
        let mut level = ledger.commitment();
        let mut remaining = ledger.remaining();
        for op in ops {
            match op {
                LedgerOp::Deduct(amount) => {
                    let deduction = ledger.deduct(amount);
                    prop_assert!(deduction.deducted <= amount);
                    prop_assert!(deduction.remaining >= 0.0);
                }
                LedgerOp::Raise => {
                    ledger.raise_commitment();
                }
            }
            prop_assert!(ledger.commitment() >= level);
            prop_assert!(ledger.commitment().value() <= 5);
            prop_assert!(ledger.remaining() <= remaining);
            prop_assert!(ledger.remaining() >= 0.0);
            if ledger.is_exhausted() {
                prop_assert!(ledger.commitment().is_max());
            }
            level = ledger.commitment();
            remaining = ledger.remaining();
        }
    }

    #[test]
    fn prop_spiral_classification_reads_only_the_window(history in arb_history(8)) {
        let detector = SpiralDetector::default();
        let signal = detector.classify(&history);
        prop_assert_eq!(signal, detector.classify(&history));

        let start = history.len().saturating_sub(3);
        prop_assert_eq!(signal, detector.classify(&history[start..]));
    }

    #[test]
    fn prop_ring_is_rejected_with_its_path(n in 2usize..10) {
        let specs: Vec<TaskSpec> = (0..n)
            .map(|i| TaskSpec::new(&format!("r{}", i)).depends_on(&format!("r{}", (i + 1) % n)))
            .collect();
        match DependencyGraph::build(&specs) {
            Err(Error::CyclicDependency { path }) => {
                prop_assert_eq!(path.len(), n + 1);
                prop_assert_eq!(path.first(), path.last());
            }
            Err(other) => prop_assert!(false, "unexpected error: {}", other),
            Ok(_) => prop_assert!(false, "ring was accepted"),
        }
    }
}
