//! Session planning: task definitions, dependency ordering and budget.
//!
//! Planning runs before anything executes. Structural errors (cycles,
//! unknown or duplicate tasks) surface here, before any budget is spent.

pub mod budget;
pub mod definitions;

pub use budget::{Allocation, BudgetAllocator};
pub use definitions::{load_task_dir, parse_task};

use serde::Serialize;
use std::collections::BTreeMap;

use crate::core::dag::DependencyGraph;
use crate::core::task::{TaskId, TaskSpec};
use crate::error::Result;

/// The outcome of a planning pass.
#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    /// Deterministic execution order.
    pub order: Vec<TaskId>,
    /// Longest dependency chain per task.
    pub depths: BTreeMap<TaskId, usize>,
    pub allocation: Allocation,
    pub total_budget: f64,
}

/// Build the graph and allocate the budget.
///
/// # Errors
/// Returns a structural error for invalid graphs or budget parameters.
pub fn plan(specs: &[TaskSpec], total_budget: f64, base_unit: f64) -> Result<(DependencyGraph, Plan)> {
    let graph = DependencyGraph::build(specs)?;
    let allocator = BudgetAllocator::new(total_budget, base_unit)?;
    let allocation = allocator.allocate(specs, &graph);
    let plan = Plan {
        order: graph.topological_order(),
        depths: graph.depths(),
        allocation,
        total_budget,
    };
    Ok((graph, plan))
}
