//! Commitment level: the escalating constraint counter.
//!
//! The level starts at 0 for every session and only ever moves up, one step
//! at a time, until it saturates at 5. Higher levels narrow what the
//! iteration controller and decision panel may do:
//!
//! | level | effect                                                     |
//! |-------|------------------------------------------------------------|
//! | 0-2   | unrestricted                                               |
//! | >= 3  | a spiral signal force-exits the iteration loop             |
//! | >= 4  | the decision panel can no longer grant an extra iteration  |
//! | 5     | force mode: one iteration per task, lenient acceptance     |

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Highest commitment level.
pub const MAX_COMMITMENT: u8 = 5;

/// Level from which a spiral signal ends the iteration loop.
pub const SPIRAL_EXIT_LEVEL: u8 = 3;

/// Level from which CONTINUE verdicts are suppressed.
pub const NO_CONTINUE_LEVEL: u8 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct CommitmentLevel(u8);

impl CommitmentLevel {
    pub const ZERO: CommitmentLevel = CommitmentLevel(0);
    pub const MAX: CommitmentLevel = CommitmentLevel(MAX_COMMITMENT);

    pub fn value(&self) -> u8 {
        self.0
    }

    /// One step up, capped at the maximum.
    pub fn raised(&self) -> Self {
        Self((self.0 + 1).min(MAX_COMMITMENT))
    }

    pub fn is_max(&self) -> bool {
        self.0 >= MAX_COMMITMENT
    }

    pub fn exits_on_spiral(&self) -> bool {
        self.0 >= SPIRAL_EXIT_LEVEL
    }

    pub fn allows_continue(&self) -> bool {
        self.0 < NO_CONTINUE_LEVEL
    }

    /// Force mode: budget is gone and every task is completed best-effort.
    pub fn forces_completion(&self) -> bool {
        self.is_max()
    }
}

impl TryFrom<u8> for CommitmentLevel {
    type Error = Error;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        if value > MAX_COMMITMENT {
            return Err(Error::InvalidInput(format!(
                "commitment level {} exceeds {}",
                value, MAX_COMMITMENT
            )));
        }
        Ok(Self(value))
    }
}

impl From<CommitmentLevel> for u8 {
    fn from(level: CommitmentLevel) -> Self {
        level.0
    }
}

impl std::fmt::Display for CommitmentLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.0, MAX_COMMITMENT)
    }
}
