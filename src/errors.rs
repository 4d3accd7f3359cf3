use thiserror::Error;

/// Ошибки операций пула
#[derive(Error, Debug, PartialEq, Eq, Clone)]
pub enum PoolError {
    #[error("invalid pool configuration: {0}")]
    InvalidConfig(String),
    #[error("failed to spawn thread: {0}")]
    SpawnFailure(String),
    #[error("pool is saturated: all {max} workers are busy")]
    PoolSaturated { max: usize },
    #[error("no idle worker available")]
    NoIdleWorker,
    #[error("pool is already at its minimum of {min} workers")]
    AtMinimum { min: usize },
    #[error("pool is closed")]
    PoolClosed,
}

/// Ошибки ожидания результата через [`crate::handle::TaskHandle`]
#[derive(Error, Debug, PartialEq, Eq, Clone)]
pub enum TaskError {
    #[error("task panicked: {0}")]
    Panicked(String),
    #[error("result channel closed")]
    Closed,
    #[error("timed out waiting for task")]
    Timeout,
}
