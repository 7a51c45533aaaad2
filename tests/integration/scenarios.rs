//! End-to-end sessions driven by scripted executors.

use std::sync::Arc;
use std::time::Duration;

use keel::config::Config;
use keel::core::task::{ReasonCode, TaskId, TaskSpec, TaskStatus};
use keel::orchestration::{SpiralSignal, Verdict};
use keel::report;
use keel::state::MemoryStore;
use keel::{Error, Orchestrator, OrchestratorEvent, SessionOutcome};

use crate::fixtures::{collect_events, config, independent, state_with_allocations, ScriptedExecutor, Step};

fn spirals(events: &[OrchestratorEvent]) -> Vec<(SpiralSignal, u8)> {
    events
        .iter()
        .filter_map(|e| match e {
            OrchestratorEvent::SpiralDetected {
                signal, commitment, ..
            } => Some((*signal, *commitment)),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_independent_tasks_complete_within_budget() {
    let executor = ScriptedExecutor::new().completing(&["a", "b", "c"]).build();
    let mut orchestrator = Orchestrator::new(
        &independent(&["c", "a", "b"]),
        Config {
            total_budget: 90.0,
            base_unit: 10.0,
            ..Config::default()
        },
        executor.clone(),
        Arc::new(MemoryStore::new()),
    )
    .unwrap();

    for id in ["a", "b", "c"] {
        let task = orchestrator.state().task(&TaskId::from(id)).unwrap();
        assert!((task.allocation() - 10.0).abs() < 1e-9);
    }

    let report = orchestrator.run().await.unwrap();
    assert_eq!(report.outcome, SessionOutcome::Success);
    assert_eq!(report.exit_code(), report::OK);
    assert_eq!(executor.tasks_started(), vec!["a", "b", "c"]);
    for task in &report.tasks {
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.iterations, 1);
    }
    assert!((report.remaining_budget - 80.0).abs() < 1e-9);
    assert_eq!(report.commitment, 0);
}

#[tokio::test]
async fn test_executor_failure_skips_dependents() {
    let executor = ScriptedExecutor::new()
        .script("y", vec![Step::fail("compiler crashed")])
        .script("x", vec![Step::ok(1.0, &["x.rs"])])
        .build();
    let specs = vec![TaskSpec::new("x").depends_on("y"), TaskSpec::new("y")];
    let mut orchestrator =
        Orchestrator::new(&specs, Config::default(), executor.clone(), Arc::new(MemoryStore::new())).unwrap();
    let report = orchestrator.run().await.unwrap();

    let y = report.task("y").unwrap();
    assert_eq!(y.status, TaskStatus::Failed);
    assert_eq!(y.reason, Some(ReasonCode::ExecutorFailure));
    // One call plus one retry, both for the first iteration.
    assert_eq!(executor.calls(), vec![("y".to_string(), 1), ("y".to_string(), 1)]);
    assert_eq!(y.consumed, 0.0);

    let x = report.task("x").unwrap();
    assert_eq!(x.status, TaskStatus::Skipped);
    assert_eq!(x.reason, Some(ReasonCode::DependencyFailed));
    assert_eq!(executor.calls_for("x"), 0);

    assert_eq!(report.outcome, SessionOutcome::Failure);
    assert_eq!(report.exit_code(), report::DEGRADED);
}

#[tokio::test]
async fn test_shifting_artifacts_are_not_oscillation() {
    let executor = ScriptedExecutor::new()
        .script(
            "t",
            vec![
                Step::ok(0.2, &["a", "b", "c"]),
                Step::ok(0.4, &["a", "b", "d"]),
                Step::ok(0.6, &["a", "b", "e"]),
                Step::ok(0.7, &["a", "b", "f"]),
            ],
        )
        .build();
    let (tx, events) = collect_events();
    let mut orchestrator = Orchestrator::new(
        &independent(&["t"]),
        Config::default(),
        executor.clone(),
        Arc::new(MemoryStore::new()),
    )
    .unwrap()
    .with_events(tx);
    let report = orchestrator.run().await.unwrap();
    drop(orchestrator);
    let events = events.await.unwrap();

    assert!(spirals(&events).is_empty());
    // The panel grants one extra pass, then accepts.
    let t = report.task("t").unwrap();
    assert_eq!(t.iterations, 4);
    assert_eq!(t.status, TaskStatus::Partial);
    assert_eq!(t.reason, Some(ReasonCode::IterationLimit));
    assert_eq!(report.commitment, 0);
}

#[tokio::test]
async fn test_repeated_artifacts_raise_commitment() {
    let executor = ScriptedExecutor::new()
        .script(
            "t",
            vec![
                Step::ok(0.2, &["x", "y", "z"]),
                Step::ok(0.4, &["x", "y", "z"]),
                Step::ok(0.6, &["x", "y", "z", "w"]),
                Step::ok(0.7, &["x", "y", "z"]),
            ],
        )
        .build();
    let (tx, events) = collect_events();
    let mut orchestrator = Orchestrator::new(
        &independent(&["t"]),
        Config::default(),
        executor,
        Arc::new(MemoryStore::new()),
    )
    .unwrap()
    .with_events(tx);
    let report = orchestrator.run().await.unwrap();
    drop(orchestrator);
    let events = events.await.unwrap();

    assert_eq!(
        spirals(&events),
        vec![(SpiralSignal::Oscillation, 1), (SpiralSignal::Oscillation, 2)]
    );
    let t = report.task("t").unwrap();
    assert_eq!(t.iterations, 4);
    assert_eq!(t.status, TaskStatus::Partial);
    assert_eq!(report.commitment, 2);
}

#[tokio::test]
async fn test_budget_exhaustion_forces_completion() {
    let specs = independent(&["t1", "t2", "t3"]);
    let state = state_with_allocations(&specs, 15.0, config(20.0));
    let executor = ScriptedExecutor::new()
        .script(
            "t1",
            vec![
                Step::ok(0.2, &["t1-1"]),
                Step::ok(0.4, &["t1-2"]),
                Step::regression(0.6, &["t1-3"]),
            ],
        )
        .script(
            "t2",
            vec![
                Step::ok(0.2, &["t2-1"]),
                Step::ok(0.4, &["t2-2"]),
                Step::regression(0.6, &["t2-3"]),
            ],
        )
        .script("t3", vec![Step::ok(0.35, &["t3-1"])])
        .build();
    let (tx, events) = collect_events();
    let mut orchestrator = Orchestrator::from_state(state, executor.clone(), Arc::new(MemoryStore::new()))
        .unwrap()
        .with_events(tx);
    let report = orchestrator.run().await.unwrap();
    drop(orchestrator);
    let events = events.await.unwrap();

    let t1 = report.task("t1").unwrap();
    assert_eq!(t1.status, TaskStatus::Partial);
    assert_eq!(t1.reason, Some(ReasonCode::IterationLimit));
    assert!((t1.consumed - 15.0).abs() < 1e-9);

    // Only the 5 left could be deducted.
    let t2 = report.task("t2").unwrap();
    assert_eq!(t2.status, TaskStatus::Partial);
    assert!((t2.consumed - 5.0).abs() < 1e-9);

    // Force mode: a single iteration, then lenient acceptance.
    let t3 = report.task("t3").unwrap();
    assert_eq!(t3.iterations, 1);
    assert_eq!(t3.status, TaskStatus::Partial);
    assert_eq!(t3.reason, Some(ReasonCode::BudgetExhausted));
    assert_eq!(executor.calls_for("t3"), 1);

    assert_eq!(report.remaining_budget, 0.0);
    assert_eq!(report.commitment, 5);
    assert_eq!(report.outcome, SessionOutcome::DegradedSuccess);

    let exhausted = events
        .iter()
        .position(|e| matches!(e, OrchestratorEvent::BudgetExhausted))
        .unwrap();
    let t2_finished = events
        .iter()
        .position(|e| matches!(e, OrchestratorEvent::TaskFinished { task, .. } if task.as_str() == "t2"))
        .unwrap();
    assert_eq!(exhausted, t2_finished + 1);
    assert!(events.iter().any(|e| matches!(
        e,
        OrchestratorEvent::PanelDecided { task, verdict: Verdict::AcceptPartial, forced: true }
            if task.as_str() == "t3"
    )));
}

#[tokio::test]
async fn test_parallelism_bounds_concurrent_tasks() {
    let executor = ScriptedExecutor::new()
        .completing(&["a", "b", "c", "d"])
        .with_delay(Duration::from_millis(30))
        .build();
    let mut orchestrator = Orchestrator::new(
        &independent(&["a", "b", "c", "d"]),
        Config {
            parallelism: 2,
            ..Config::default()
        },
        executor.clone(),
        Arc::new(MemoryStore::new()),
    )
    .unwrap();
    let report = orchestrator.run().await.unwrap();

    assert_eq!(report.outcome, SessionOutcome::Success);
    assert_eq!(executor.max_concurrency(), 2);
    assert_eq!(executor.tasks_started().len(), 4);
}

#[tokio::test]
async fn test_sequential_by_default() {
    let executor = ScriptedExecutor::new()
        .completing(&["a", "b", "c"])
        .with_delay(Duration::from_millis(10))
        .build();
    let mut orchestrator = Orchestrator::new(
        &independent(&["a", "b", "c"]),
        Config::default(),
        executor.clone(),
        Arc::new(MemoryStore::new()),
    )
    .unwrap();
    orchestrator.run().await.unwrap();
    assert_eq!(executor.max_concurrency(), 1);
}

#[tokio::test]
async fn test_cycle_never_starts() {
    let executor = ScriptedExecutor::new().completing(&["a", "b", "c", "d"]).build();
    let specs = vec![
        TaskSpec::new("d"),
        TaskSpec::new("a").depends_on("c"),
        TaskSpec::new("b").depends_on("a"),
        TaskSpec::new("c").depends_on("b"),
    ];
    let result = Orchestrator::new(&specs, Config::default(), executor.clone(), Arc::new(MemoryStore::new()));

    match result {
        Err(Error::CyclicDependency { path }) => {
            assert!(path.len() >= 4);
            assert_eq!(path.first(), path.last());
            assert!(!path.contains(&TaskId::from("d")));
        }
        Err(other) => panic!("unexpected error: {}", other),
        Ok(_) => panic!("cyclic input was accepted"),
    }
    assert!(executor.calls().is_empty());
}

#[tokio::test]
async fn test_unknown_dependency_is_structural() {
    let executor = ScriptedExecutor::new().build();
    let specs = vec![TaskSpec::new("a").depends_on("ghost")];
    let err = Orchestrator::new(&specs, Config::default(), executor, Arc::new(MemoryStore::new()))
        .err()
        .unwrap();
    assert!(err.is_structural());
    assert!(matches!(err, Error::UnknownDependency { .. }));
}
