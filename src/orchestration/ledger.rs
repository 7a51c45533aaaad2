//! Process-wide budget and commitment state.
//!
//! The `Ledger` is the only place that budget and commitment level change.
//! `SharedLedger` wraps it in a single async mutex so concurrently running
//! task loops serialize every write through one point.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::orchestration::commitment::CommitmentLevel;

/// Default consumed-budget fractions that each raise the commitment level.
pub const DEFAULT_COMMITMENT_THRESHOLDS: [f64; 3] = [0.5, 0.75, 0.9];

/// Effect of a single budget deduction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Deduction {
    /// Amount actually taken from the remaining budget.
    pub deducted: f64,
    /// Remaining budget after the deduction.
    pub remaining: f64,
    /// Whether this deduction drove the budget to zero.
    pub exhausted_now: bool,
    /// Commitment level after the deduction.
    pub commitment: CommitmentLevel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ledger {
    total: f64,
    remaining: f64,
    commitment: CommitmentLevel,
    /// Consumed fractions that raise the level, ascending.
    thresholds: Vec<f64>,
    /// How many of `thresholds` have been crossed.
    thresholds_crossed: usize,
}

impl Ledger {
    /// Create a ledger with the full budget available.
    pub fn new(total: f64, thresholds: &[f64]) -> Self {
        let mut thresholds = thresholds.to_vec();
        thresholds.sort_by(|a, b| a.total_cmp(b));
        Self {
            total,
            remaining: total,
            commitment: CommitmentLevel::ZERO,
            thresholds,
            thresholds_crossed: 0,
        }
    }

    pub fn total(&self) -> f64 {
        self.total
    }

    pub fn remaining(&self) -> f64 {
        self.remaining
    }

    pub fn commitment(&self) -> CommitmentLevel {
        self.commitment
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining <= 0.0
    }

    /// Raise the commitment level by one step.
    pub fn raise_commitment(&mut self) -> CommitmentLevel {
        self.commitment = self.commitment.raised();
        self.commitment
    }

    /// Deduct consumed budget, clamping at zero.
    ///
    /// Each threshold crossed raises the commitment level by one; reaching
    /// zero saturates it.
    pub fn deduct(&mut self, amount: f64) -> Deduction {
        let was_exhausted = self.is_exhausted();
        let amount = if amount.is_finite() { amount.max(0.0) } else { 0.0 };
        let deducted = amount.min(self.remaining);
        self.remaining = (self.remaining - amount).max(0.0);

        let consumed_fraction = if self.total > 0.0 {
            (self.total - self.remaining) / self.total
        } else {
            1.0
        };
        while self.thresholds_crossed < self.thresholds.len()
            && consumed_fraction >= self.thresholds[self.thresholds_crossed]
        {
            self.thresholds_crossed += 1;
            self.raise_commitment();
            debug!(
                consumed_fraction,
                commitment = %self.commitment,
                "budget threshold crossed"
            );
        }

        let exhausted_now = !was_exhausted && self.is_exhausted();
        if self.is_exhausted() {
            while !self.commitment.is_max() {
                self.raise_commitment();
            }
        }
        if exhausted_now {
            info!(total = self.total, "budget exhausted, commitment saturated");
        }

        Deduction {
            deducted,
            remaining: self.remaining,
            exhausted_now,
            commitment: self.commitment,
        }
    }
}

/// Cloneable handle to the session ledger.
#[derive(Debug, Clone)]
pub struct SharedLedger(Arc<Mutex<Ledger>>);

impl SharedLedger {
    pub fn new(ledger: Ledger) -> Self {
        Self(Arc::new(Mutex::new(ledger)))
    }

    pub async fn commitment(&self) -> CommitmentLevel {
        self.0.lock().await.commitment()
    }

    pub async fn remaining(&self) -> f64 {
        self.0.lock().await.remaining()
    }

    pub async fn raise_commitment(&self) -> CommitmentLevel {
        self.0.lock().await.raise_commitment()
    }

    pub async fn deduct(&self, amount: f64) -> Deduction {
        self.0.lock().await.deduct(amount)
    }

    /// Consistent copy of the ledger for checkpointing.
    pub async fn snapshot(&self) -> Ledger {
        self.0.lock().await.clone()
    }
}
