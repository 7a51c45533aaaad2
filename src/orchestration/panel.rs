//! Decision panel for tasks stuck at their iteration limit.
//!
//! Four independent perspectives each answer one question: "is another
//! iteration justified?" Their weighted votes decide between granting one
//! more pass, accepting the partial result, or escalating to an operator.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::orchestration::commitment::CommitmentLevel;

/// Ratio below which the completionist still wants more work.
pub const COMPLETIONIST_CEILING: f64 = 0.95;

/// Ratio from which partial progress is usable.
pub const ACCEPT_FLOOR: f64 = 0.5;

/// Ratio from which force mode accepts a partial result.
pub const FORCE_ACCEPT_FLOOR: f64 = 0.3;

/// Snapshot of everything the voters look at.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PanelInput {
    pub completion_ratio: f64,
    pub remaining_budget: f64,
    /// The task's original allocation.
    pub allocation: f64,
    /// Some dependent task has already started.
    pub dependents_waiting: bool,
    /// The last executor report flagged a regression.
    pub regression: bool,
    pub commitment: CommitmentLevel,
    /// The task has not yet used its one extra pass.
    pub extra_pass_available: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Grant one more iteration beyond the limit.
    Continue,
    AcceptPartial,
    /// Surface to an operator with the full history.
    Escalate,
    /// Force mode only: too little progress to keep.
    Skip,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Verdict::Continue => write!(f, "continue"),
            Verdict::AcceptPartial => write!(f, "accept_partial"),
            Verdict::Escalate => write!(f, "escalate"),
            Verdict::Skip => write!(f, "skip"),
        }
    }
}

/// Each field is that voter's "continue is justified" answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Votes {
    pub completionist: bool,
    pub integrator: bool,
    pub shipper: bool,
    pub quality_guardian: bool,
}

impl Votes {
    pub fn cast(input: &PanelInput) -> Self {
        Self {
            completionist: completionist(input),
            integrator: integrator(input),
            shipper: shipper(input),
            quality_guardian: quality_guardian(input),
        }
    }

    pub fn count(&self) -> usize {
        [
            self.completionist,
            self.integrator,
            self.shipper,
            self.quality_guardian,
        ]
        .iter()
        .filter(|v| **v)
        .count()
    }
}

/// More work is wanted and a full extra pass is affordable.
pub fn completionist(input: &PanelInput) -> bool {
    input.completion_ratio < COMPLETIONIST_CEILING && input.remaining_budget >= input.allocation
}

/// Nobody downstream is waiting, so delay is cheap.
pub fn integrator(input: &PanelInput) -> bool {
    !input.dependents_waiting
}

/// The shipper would rather ship usable progress; it only backs another
/// pass when the result is not yet usable.
pub fn shipper(input: &PanelInput) -> bool {
    input.completion_ratio < ACCEPT_FLOOR
}

pub fn quality_guardian(input: &PanelInput) -> bool {
    !input.regression
}

/// What the panel decided and why.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub verdict: Verdict,
    pub votes: Votes,
    /// Weighted sum of continue votes.
    pub score: f64,
    /// The decision was taken in force mode.
    pub forced: bool,
}

/// Voter weights, in the order completionist, integrator, shipper,
/// quality guardian. Configured through the `[panel]` table.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DecisionPanel {
    pub weights: [f64; 4],
    /// Weighted score needed to grant CONTINUE.
    pub quorum: f64,
}

impl Default for DecisionPanel {
    fn default() -> Self {
        Self {
            weights: [1.0; 4],
            quorum: 3.0,
        }
    }
}

impl DecisionPanel {
    pub fn score(&self, votes: &Votes) -> f64 {
        [
            votes.completionist,
            votes.integrator,
            votes.shipper,
            votes.quality_guardian,
        ]
        .iter()
        .zip(self.weights.iter())
        .filter(|(vote, _)| **vote)
        .map(|(_, weight)| weight)
        .sum()
    }

    pub fn decide(&self, input: &PanelInput) -> Decision {
        let votes = Votes::cast(input);
        let score = self.score(&votes);

        if input.commitment.forces_completion() {
            let verdict = if input.completion_ratio >= FORCE_ACCEPT_FLOOR {
                Verdict::AcceptPartial
            } else {
                Verdict::Skip
            };
            debug!(%verdict, ratio = input.completion_ratio, "panel in force mode");
            return Decision {
                verdict,
                votes,
                score,
                forced: true,
            };
        }

        let may_continue = input.extra_pass_available && input.commitment.allows_continue();
        let verdict = if score >= self.quorum && may_continue {
            Verdict::Continue
        } else if input.completion_ratio >= ACCEPT_FLOOR {
            Verdict::AcceptPartial
        } else {
            Verdict::Escalate
        };

        debug!(
            %verdict,
            score,
            continue_votes = votes.count(),
            ratio = input.completion_ratio,
            commitment = %input.commitment,
            "panel decided"
        );

        Decision {
            verdict,
            votes,
            score,
            forced: false,
        }
    }
}
