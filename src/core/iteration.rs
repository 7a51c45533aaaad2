//! Iteration records: one immutable snapshot per refinement pass.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Number of trailing records the spiral detector looks at.
pub const WINDOW_SIZE: usize = 3;

/// Snapshot of a single iteration of one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    /// 1-based iteration index within the task.
    pub index: u32,
    /// Artifact identifiers touched during this iteration.
    pub touched: BTreeSet<String>,
    /// Completion ratio in [0, 1].
    pub completion_ratio: f64,
    /// Wall-clock duration of the iteration.
    pub duration_ms: u64,
    /// Whether any touched artifact lies outside the task's scope baseline.
    pub out_of_scope: bool,
    /// Whether the executor flagged a regression or test failure.
    pub regression: bool,
}

impl IterationRecord {
    /// Create a record. The ratio is clamped into [0, 1].
    pub fn new<I, S>(index: u32, touched: I, completion_ratio: f64, duration_ms: u64) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            index,
            touched: touched.into_iter().map(Into::into).collect(),
            completion_ratio: clamp_ratio(completion_ratio),
            duration_ms,
            out_of_scope: false,
            regression: false,
        }
    }

    pub fn with_out_of_scope(mut self, out_of_scope: bool) -> Self {
        self.out_of_scope = out_of_scope;
        self
    }

    pub fn with_regression(mut self, regression: bool) -> Self {
        self.regression = regression;
        self
    }
}

/// Clamp a reported ratio into [0, 1]; NaN counts as no progress.
pub fn clamp_ratio(ratio: f64) -> f64 {
    if ratio.is_nan() {
        0.0
    } else {
        ratio.clamp(0.0, 1.0)
    }
}

/// The last (up to) `WINDOW_SIZE` records of a history.
pub fn trailing_window(history: &[IterationRecord]) -> &[IterationRecord] {
    let start = history.len().saturating_sub(WINDOW_SIZE);
    &history[start..]
}
