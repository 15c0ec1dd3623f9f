//! Work distribution: the queue view, the synchronized task board, the
//! worker registry, the executor delegate and the swarm coordinator.

pub mod board;
pub mod executor;
pub mod pool;
pub mod queue;
pub mod swarm;

pub use board::{RetryOutcome, TaskBoard, MAX_WORKER_RETRIES};
pub use executor::{CommandExecutor, ExecutionResult, TaskExecutor};
pub use pool::{WorkerEvent, WorkerHandle, WorkerId, WorkerPool, WorkerStatus};
pub use queue::{QueueState, TieBreak, WorkQueue};
pub use swarm::{
    clamp_worker_count, NoObserver, Swarm, SwarmAssessment, SwarmObserver, SwarmSummary,
    WorkerContext, MAX_SWARM_WORKERS, MIN_SWARM_WORKERS,
};
