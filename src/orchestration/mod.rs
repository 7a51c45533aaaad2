//! Orchestration layer.
//!
//! The orchestrator schedules tasks and owns the budget ledger. Each task is
//! driven by an iteration controller, which consults the spiral detector
//! after every iteration and the decision panel when it hits its limit.

pub mod commitment;
pub mod controller;
pub mod escalation;
pub mod ledger;
pub mod orchestrator;
pub mod panel;
pub mod spiral;

pub use commitment::CommitmentLevel;
pub use controller::{ControllerConfig, ControllerState, IterationController, TaskOutcome};
pub use escalation::{AcceptAbove, Escalation, NoOperator, Operator, OperatorDecision};
pub use ledger::{Deduction, Ledger, SharedLedger};
pub use orchestrator::{Orchestrator, OrchestratorEvent};
pub use panel::{Decision, DecisionPanel, PanelInput, Verdict, Votes};
pub use spiral::{SpiralDetector, SpiralSignal};
