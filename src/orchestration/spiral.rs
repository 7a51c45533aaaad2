//! Spiral detection for iterating tasks.
//!
//! The `SpiralDetector` looks at the trailing window of iteration records of
//! one task and classifies unproductive patterns. Rules are checked in
//! priority order and the first match wins:
//!
//! 1. **Thrashing**: the latest iteration took more than twice the mean
//!    duration of the earlier records in the window and made no progress.
//! 2. **Oscillation**: the last three iterations keep touching the same
//!    artifacts (at least three in common).
//! 3. **Scope creep**: the latest iteration touched something outside the
//!    task's declared scope.
//! 4. **Diminishing returns**: from iteration 2 on, each of the last two
//!    iterations improved the completion ratio by less than 0.10.
//!
//! Classification is a pure function of the window.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::core::iteration::{trailing_window, IterationRecord};
use crate::core::task::ReasonCode;

/// Default multiple of the mean duration that counts as thrashing.
pub const DEFAULT_THRASH_FACTOR: f64 = 2.0;

/// Default number of shared artifacts that counts as oscillation.
pub const DEFAULT_OSCILLATION_OVERLAP: usize = 3;

/// Default minimum per-iteration ratio gain.
pub const DEFAULT_MIN_PROGRESS: f64 = 0.10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpiralSignal {
    #[default]
    None,
    Oscillation,
    ScopeCreep,
    DiminishingReturns,
    Thrashing,
}

impl SpiralSignal {
    pub fn is_spiral(&self) -> bool {
        !matches!(self, SpiralSignal::None)
    }

    /// Reason code reported when this signal ends a task.
    pub fn reason(&self) -> Option<ReasonCode> {
        match self {
            SpiralSignal::None => None,
            SpiralSignal::Oscillation => Some(ReasonCode::Oscillation),
            SpiralSignal::ScopeCreep => Some(ReasonCode::ScopeCreep),
            SpiralSignal::DiminishingReturns => Some(ReasonCode::DiminishingReturns),
            SpiralSignal::Thrashing => Some(ReasonCode::Thrashing),
        }
    }
}

impl std::fmt::Display for SpiralSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SpiralSignal::None => write!(f, "none"),
            SpiralSignal::Oscillation => write!(f, "oscillation"),
            SpiralSignal::ScopeCreep => write!(f, "scope_creep"),
            SpiralSignal::DiminishingReturns => write!(f, "diminishing_returns"),
            SpiralSignal::Thrashing => write!(f, "thrashing"),
        }
    }
}

/// Thresholds for spiral classification. Configured through the `[spiral]`
/// table.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SpiralDetector {
    pub thrash_factor: f64,
    pub oscillation_overlap: usize,
    pub min_progress: f64,
}

impl Default for SpiralDetector {
    fn default() -> Self {
        Self {
            thrash_factor: DEFAULT_THRASH_FACTOR,
            oscillation_overlap: DEFAULT_OSCILLATION_OVERLAP,
            min_progress: DEFAULT_MIN_PROGRESS,
        }
    }
}

impl SpiralDetector {
    /// Classify a task's recent iterations.
    ///
    /// `history` may be the full history; only the trailing window is read.
    pub fn classify(&self, history: &[IterationRecord]) -> SpiralSignal {
        let window = trailing_window(history);
        if window.is_empty() {
            return SpiralSignal::None;
        }

        if self.is_thrashing(window) {
            SpiralSignal::Thrashing
        } else if self.is_oscillating(window) {
            SpiralSignal::Oscillation
        } else if is_scope_creep(window) {
            SpiralSignal::ScopeCreep
        } else if self.is_diminishing(window) {
            SpiralSignal::DiminishingReturns
        } else {
            SpiralSignal::None
        }
    }

    fn is_thrashing(&self, window: &[IterationRecord]) -> bool {
        let Some((current, prior)) = window.split_last() else {
            return false;
        };
        let Some(previous) = prior.last() else {
            return false;
        };
        let mean = prior.iter().map(|r| r.duration_ms as f64).sum::<f64>() / prior.len() as f64;
        current.duration_ms as f64 > self.thrash_factor * mean
            && current.completion_ratio <= previous.completion_ratio
    }

    fn is_oscillating(&self, window: &[IterationRecord]) -> bool {
        if window.len() < 3 {
            return false;
        }
        let mut common: BTreeSet<&String> = window[0].touched.iter().collect();
        for record in &window[1..] {
            common.retain(|artifact| record.touched.contains(*artifact));
        }
        common.len() >= self.oscillation_overlap
    }

    fn is_diminishing(&self, window: &[IterationRecord]) -> bool {
        let Some(current) = window.last() else {
            return false;
        };
        if current.index < 2 {
            return false;
        }
        let deltas = progress_deltas(window);
        deltas.len() >= 2
            && deltas[deltas.len() - 2..]
                .iter()
                .all(|delta| *delta < self.min_progress)
    }
}

fn is_scope_creep(window: &[IterationRecord]) -> bool {
    window.last().is_some_and(|r| r.out_of_scope)
}

/// Ratio gain of each record over its predecessor.
///
/// The first iteration of a task is measured against a ratio of 0.0.
fn progress_deltas(window: &[IterationRecord]) -> Vec<f64> {
    let mut deltas = Vec::with_capacity(window.len());
    if let Some(first) = window.first() {
        if first.index == 1 {
            deltas.push(first.completion_ratio);
        }
    }
    for pair in window.windows(2) {
        deltas.push(pair[1].completion_ratio - pair[0].completion_ratio);
    }
    deltas
}
