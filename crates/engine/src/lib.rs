pub mod engine;
pub mod task;

pub use engine::{EngineError, ExecutionEngine, TaskState};
pub use task::{EngineMetrics, TaskConfig, TaskKind, TaskResult, TaskSpec};
