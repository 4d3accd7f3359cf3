use super::{
    errors::PoolError,
    pool::{Config, PoolInner},
};
use std::{
    io,
    sync::Arc,
    thread::{self, JoinHandle},
};
use crossbeam::channel::{Receiver, RecvTimeoutError};
use tracing::{debug, trace, warn};


/// Решение менеджера на одном тике
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDecision {
    Grow,
    Shrink,
    Hold,
}

impl ScaleDecision {
    /// Чистая функция решения по утилизации `busy / current`
    pub fn evaluate(busy: usize, current: usize, config: &Config) -> Self {
        if current == 0 {
            return ScaleDecision::Hold;
        }

        let utilization = busy as f64 / current as f64;
        if utilization > config.busy_threshold && current < config.max_threads {
            ScaleDecision::Grow
        } else if utilization < config.busy_threshold && current > config.min_threads {
            ScaleDecision::Shrink
        } else {
            ScaleDecision::Hold
        }
    }
}


pub(crate) fn spawn(pool: Arc<PoolInner>, shutdown: Receiver<()>) -> io::Result<JoinHandle<()>> {
    let name = format!("{}-manager", pool.config().thread_name);
    thread::Builder::new()
        .name(name)
        .spawn(move || manager_loop(pool, shutdown))
}

fn manager_loop(pool: Arc<PoolInner>, shutdown: Receiver<()>) {
    let interval = pool.config().manage_interval;
    debug!(?interval, "manager started");

    loop {
        match shutdown.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {
                tick(&pool);
            }
            // Отправитель дропнут в close()
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    debug!("manager stopped");
}

/// Один тик менеджера: снимок под блокировкой пула и не более одного шага изменения размера
pub(crate) fn tick(pool: &Arc<PoolInner>) -> ScaleDecision {
    let mut state = pool.lock_state();
    if state.is_closed() {
        return ScaleDecision::Hold;
    }

    let busy = state.busy_count();
    let current = state.current_count();
    let decision = ScaleDecision::evaluate(busy, current, pool.config());
    trace!(busy, current, ?decision, "manager tick");

    match decision {
        ScaleDecision::Grow => match pool.add_worker(&mut state) {
            Ok(id) => debug!(worker = %id, busy, current, "pool grown"),
            Err(e) => warn!(error = %e, "failed to grow pool"),
        },
        ScaleDecision::Shrink => match pool.retire_worker(&mut state) {
            Ok(id) => debug!(worker = %id, busy, current, "pool shrunk"),
            Err(PoolError::NoIdleWorker) => {
                debug!("no idle worker to retire, retrying next tick");
            }
            Err(e) => warn!(error = %e, "failed to shrink pool"),
        },
        ScaleDecision::Hold => {}
    }

    decision
}
