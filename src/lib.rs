pub mod config;
pub mod core;
pub mod error;
pub mod executor;
pub mod log;
pub mod orchestration;
pub mod planning;
pub mod report;
pub mod state;
pub mod util;

pub use error::{Error, Result};
pub use orchestration::{Orchestrator, OrchestratorEvent};
pub use report::{SessionOutcome, SessionReport};
pub use state::{OrchestrationState, SessionId};
