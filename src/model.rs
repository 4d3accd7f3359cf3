use std::fmt;

/// Идентификатор воркера, уникальный в пределах пула и никогда не переиспользуемый
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkerId(pub(crate) usize);

impl WorkerId {
    pub fn as_usize(&self) -> usize {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Жизненный цикл воркера
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    Waiting,
    Running,
    Exiting,
    Terminated,
}

impl WorkerState {
    #[inline]
    pub fn is_alive(&self) -> bool {
        !matches!(self, WorkerState::Exiting | WorkerState::Terminated)
    }
}

/// Отчет о панике внутри задачи, перехваченной на границе воркера
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerPanic {
    pub worker: WorkerId,
    pub message: String,
}

/// Снимок состояния пула, снятый под блокировкой пула
#[derive(Debug, Clone, PartialEq)]
pub struct PoolStatus {
    pub current_count: usize,
    pub busy_count: usize,
    pub min_count: usize,
    pub max_count: usize,
    pub completed_jobs: usize,
    pub panicked_jobs: usize,
    pub closed: bool,
}

impl PoolStatus {
    pub fn utilization(&self) -> f64 {
        if self.current_count == 0 {
            return 0.0;
        }
        self.busy_count as f64 / self.current_count as f64
    }

    pub fn idle_count(&self) -> usize {
        self.current_count.saturating_sub(self.busy_count)
    }

    pub fn is_saturated(&self) -> bool {
        self.current_count == self.max_count && self.busy_count == self.current_count
    }

    pub fn success_rate(&self) -> f64 {
        let total = self.completed_jobs + self.panicked_jobs;
        if total == 0 {
            return 1.0;
        }
        self.completed_jobs as f64 / total as f64
    }
}
