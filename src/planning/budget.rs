//! Budget allocation across tasks.
//!
//! Each task receives `base_unit * complexity multiplier * (1 + 0.1 * depth)`.
//! If the raw allocations exceed the total budget they are rescaled
//! proportionally so the sum never exceeds it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use crate::core::dag::DependencyGraph;
use crate::core::task::{TaskId, TaskSpec};
use crate::error::{Error, Result};

/// Extra weight per level of dependency depth.
pub const DEPTH_WEIGHT: f64 = 0.1;

/// Result of a planning pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    /// Budget per task.
    pub per_task: BTreeMap<TaskId, f64>,
    /// Factor applied to the raw allocations (1.0 when no rescale happened).
    pub rescale_factor: f64,
}

impl Allocation {
    pub fn total(&self) -> f64 {
        self.per_task.values().sum()
    }

    pub fn get(&self, id: &TaskId) -> Option<f64> {
        self.per_task.get(id).copied()
    }
}

/// Distributes a finite budget across the tasks of a graph.
#[derive(Debug, Clone, Copy)]
pub struct BudgetAllocator {
    total_budget: f64,
    base_unit: f64,
}

impl BudgetAllocator {
    /// Create an allocator.
    ///
    /// # Errors
    /// Returns `InvalidInput` unless both values are finite and positive.
    pub fn new(total_budget: f64, base_unit: f64) -> Result<Self> {
        if !(total_budget.is_finite() && total_budget > 0.0) {
            return Err(Error::InvalidInput(format!(
                "total budget must be a positive number, got {}",
                total_budget
            )));
        }
        if !(base_unit.is_finite() && base_unit > 0.0) {
            return Err(Error::InvalidInput(format!(
                "base unit must be a positive number, got {}",
                base_unit
            )));
        }
        Ok(Self {
            total_budget,
            base_unit,
        })
    }

    /// Raw allocation for one task before any rescale.
    pub fn raw_allocation(&self, spec: &TaskSpec, depth: usize) -> f64 {
        self.base_unit * spec.complexity.multiplier() * (1.0 + DEPTH_WEIGHT * depth as f64)
    }

    /// Allocate the budget over every task in the graph.
    pub fn allocate(&self, specs: &[TaskSpec], graph: &DependencyGraph) -> Allocation {
        let depths = graph.depths();
        let mut per_task: BTreeMap<TaskId, f64> = specs
            .iter()
            .map(|spec| {
                let depth = depths.get(&spec.name).copied().unwrap_or(0);
                (spec.name.clone(), self.raw_allocation(spec, depth))
            })
            .collect();

        let raw_sum: f64 = per_task.values().sum();
        let mut rescale_factor = 1.0;
        if raw_sum > self.total_budget {
            rescale_factor = self.total_budget / raw_sum;
            for amount in per_task.values_mut() {
                *amount *= rescale_factor;
            }
            // Floating point rounding can leave the sum a hair above the total.
            let mut guard = 0;
            while per_task.values().sum::<f64>() > self.total_budget && guard < 8 {
                let correction = self.total_budget / per_task.values().sum::<f64>() * (1.0 - 1e-12);
                rescale_factor *= correction;
                for amount in per_task.values_mut() {
                    *amount *= correction;
                }
                guard += 1;
            }
        }

        debug!(
            tasks = per_task.len(),
            raw_sum,
            rescale_factor,
            total_budget = self.total_budget,
            "budget allocated"
        );

        Allocation {
            per_task,
            rescale_factor,
        }
    }
}
