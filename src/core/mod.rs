//! Core domain models: tasks, iteration records and the dependency graph.

pub mod dag;
pub mod iteration;
pub mod task;

pub use dag::DependencyGraph;
pub use iteration::IterationRecord;
pub use task::{Complexity, ReasonCode, Task, TaskId, TaskSpec, TaskStatus};
