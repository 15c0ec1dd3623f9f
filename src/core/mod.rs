//! Core domain models: tasks and the dependency graph they live in.

pub mod graph;
pub mod task;

pub use graph::TaskGraph;
pub use task::{Priority, Task, TaskId, TaskKind, TaskStatus};
