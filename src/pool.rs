use super::{
    errors::PoolError,
    handle::{self, Job, TaskHandle},
    manager,
    model::{PoolStatus, WorkerId, WorkerPanic, WorkerState},
    slot::WorkerSlot,
    worker,
};
use std::{
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use crossbeam::{channel::Sender, sync::WaitGroup};
use parking_lot::{Condvar, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};


/// Поведение `submit`, когда все `max_threads` воркеров заняты
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SaturationPolicy {
    /// Сразу вернуть `PoolSaturated`
    #[default]
    Reject,
    /// Ждать освобождения воркера; `None` означает ждать без ограничения
    Block { timeout: Option<Duration> },
}

impl SaturationPolicy {
    #[inline]
    pub fn is_blocking(&self) -> bool {
        matches!(self, SaturationPolicy::Block { .. })
    }
}


/// Хук для отчетов о паниках внутри задач
#[derive(Clone)]
pub struct PanicHandler(Arc<dyn Fn(&WorkerPanic) + Send + Sync>);

impl PanicHandler {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&WorkerPanic) + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub(crate) fn call(&self, report: &WorkerPanic) {
        (self.0)(report)
    }
}

impl fmt::Debug for PanicHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PanicHandler(..)")
    }
}


/// Конфигурация пула потоков
#[derive(Debug, Clone)]
pub struct Config {
    pub min_threads: usize,
    pub max_threads: usize,
    /// Порог утилизации, выше которого менеджер добавляет воркер, ниже которого убирает
    pub busy_threshold: f64,
    /// Период тиков менеджера
    pub manage_interval: Duration,
    pub saturation: SaturationPolicy,
    /// Префикс имени потоков: `<thread_name>-<id>`
    pub thread_name: String,
    pub stack_size: Option<usize>,
    pub panic_handler: Option<PanicHandler>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            min_threads: 1,
            max_threads: num_cpus::get(),
            busy_threshold: 0.5,
            manage_interval: Duration::from_secs(5),
            saturation: SaturationPolicy::Reject,
            thread_name: "elastic-worker".to_string(),
            stack_size: None,
            panic_handler: None,
        }
    }
}

impl Config {
    pub fn cpu_bound() -> Self {
        let num_cpus = num_cpus::get();
        Self {
            min_threads: (num_cpus / 2).max(1),
            max_threads: num_cpus,
            ..Default::default()
        }
    }

    pub fn io_bound() -> Self {
        let num_cpus = num_cpus::get();
        Self {
            min_threads: num_cpus,
            max_threads: num_cpus * 4, // Для I/O-bound задач
            saturation: SaturationPolicy::Block {
                timeout: Some(Duration::from_secs(1)),
            },
            ..Default::default()
        }
    }

    pub fn with_panic_handler<F>(mut self, f: F) -> Self
    where
        F: Fn(&WorkerPanic) + Send + Sync + 'static,
    {
        self.panic_handler = Some(PanicHandler::new(f));
        self
    }

    pub fn validate(&self) -> Result<(), PoolError> {
        if self.min_threads == 0 {
            return Err(PoolError::InvalidConfig(
                "min_threads must be greater than zero".into(),
            ));
        }
        if self.min_threads > self.max_threads {
            return Err(PoolError::InvalidConfig(format!(
                "min_threads ({}) exceeds max_threads ({})",
                self.min_threads, self.max_threads
            )));
        }
        if !self.busy_threshold.is_finite() || !(0.0..=1.0).contains(&self.busy_threshold) {
            return Err(PoolError::InvalidConfig(format!(
                "busy_threshold must be within [0, 1], got {}",
                self.busy_threshold
            )));
        }
        if self.manage_interval.is_zero() {
            return Err(PoolError::InvalidConfig(
                "manage_interval must be non-zero".into(),
            ));
        }
        Ok(())
    }
}


pub(crate) struct SlotEntry {
    slot: Arc<WorkerSlot>,
    handle: Option<JoinHandle<()>>,
}

/// Все, что защищено блокировкой пула
pub(crate) struct PoolState {
    slots: Vec<SlotEntry>,
    current_count: usize,
    closed: bool,
    manager: Option<JoinHandle<()>>,
    // Drop отправителя будит менеджер и завершает его цикл
    manager_signal: Option<Sender<()>>,
}

impl PoolState {
    pub(crate) fn busy_count(&self) -> usize {
        self.slots.iter().filter(|e| e.slot.is_busy()).count()
    }

    #[inline]
    pub(crate) fn current_count(&self) -> usize {
        self.current_count
    }

    #[inline]
    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }
}


/// Разделяемое ядро пула: его держат сам `ThreadPool`, воркеры и менеджер
pub(crate) struct PoolInner {
    config: Config,
    state: Mutex<PoolState>,
    slot_freed: Condvar,
    next_worker_id: AtomicUsize,
    completed_jobs: AtomicUsize,
    panicked_jobs: AtomicUsize,
}

impl PoolInner {
    fn new(config: Config) -> Self {
        Self {
            config,
            state: Mutex::new(PoolState {
                slots: Vec::new(),
                current_count: 0,
                closed: false,
                manager: None,
                manager_signal: None,
            }),
            slot_freed: Condvar::new(),
            next_worker_id: AtomicUsize::new(0),
            completed_jobs: AtomicUsize::new(0),
            panicked_jobs: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub(crate) fn config(&self) -> &Config {
        &self.config
    }

    #[inline]
    pub(crate) fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock()
    }

    /// Синхронно добавляет воркер: возвращается только когда он дошел до `Waiting`.
    /// Вызывается под блокировкой пула.
    pub(crate) fn add_worker(self: &Arc<Self>, state: &mut PoolState) -> Result<WorkerId, PoolError> {
        if state.closed {
            return Err(PoolError::PoolClosed);
        }
        if state.current_count >= self.config.max_threads {
            return Err(PoolError::PoolSaturated { max: self.config.max_threads });
        }

        let id = WorkerId(self.next_worker_id.fetch_add(1, Ordering::Relaxed));
        let slot = Arc::new(WorkerSlot::new(id));
        let ready = WaitGroup::new();

        let handle = worker::spawn(Arc::clone(self), Arc::clone(&slot), ready.clone())
            .map_err(|e| {
                warn!(worker = %id, error = %e, "failed to spawn worker thread");
                PoolError::SpawnFailure(e.to_string())
            })?;
        ready.wait();

        state.slots.push(SlotEntry { slot, handle: Some(handle) });
        state.current_count += 1;
        debug!(worker = %id, current = state.current_count, "worker added");
        Ok(id)
    }

    /// Останавливает один простаивающий воркер и ждет его завершения.
    /// Счетчик уменьшается только после join, занятые воркеры не трогаются.
    pub(crate) fn retire_worker(&self, state: &mut PoolState) -> Result<WorkerId, PoolError> {
        if state.closed {
            return Err(PoolError::PoolClosed);
        }
        if state.current_count <= self.config.min_threads {
            return Err(PoolError::AtMinimum { min: self.config.min_threads });
        }

        // Сначала самые новые воркеры
        let index = state
            .slots
            .iter()
            .rposition(|entry| entry.slot.try_retire())
            .ok_or(PoolError::NoIdleWorker)?;

        let mut entry = state.slots.remove(index);
        let id = entry.slot.id();
        if let Some(handle) = entry.handle.take() {
            if handle.join().is_err() {
                warn!(worker = %id, "worker thread panicked during exit");
            }
        }
        state.current_count -= 1;
        debug!(worker = %id, current = state.current_count, "worker removed");
        Ok(id)
    }

    fn submit_job(self: &Arc<Self>, mut job: Job) -> Result<(), PoolError> {
        let max = self.config.max_threads;
        let deadline = match self.config.saturation {
            SaturationPolicy::Block { timeout: Some(timeout) } => Some(Instant::now() + timeout),
            _ => None,
        };
        let mut timed_out = false;

        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(PoolError::PoolClosed);
            }

            for entry in &state.slots {
                match entry.slot.try_assign(job) {
                    Ok(()) => {
                        trace!(worker = %entry.slot.id(), "job assigned");
                        return Ok(());
                    }
                    Err(rejected) => job = rejected,
                }
            }

            if state.current_count < max {
                let id = self.add_worker(&mut state)?;
                trace!(worker = %id, "pool grown for submitted job");
                continue;
            }

            match self.config.saturation {
                SaturationPolicy::Reject => return Err(PoolError::PoolSaturated { max }),
                SaturationPolicy::Block { .. } => {
                    if timed_out {
                        return Err(PoolError::PoolSaturated { max });
                    }
                    match deadline {
                        Some(deadline) => {
                            timed_out = self.slot_freed.wait_until(&mut state, deadline).timed_out();
                        }
                        None => self.slot_freed.wait(&mut state),
                    }
                }
            }
        }
    }

    /// Вызывается воркером после задачи: освобождает слот и обновляет счетчики
    pub(crate) fn job_finished(&self, slot: &WorkerSlot, panicked: bool) {
        if !self.config.saturation.is_blocking() {
            slot.finish_job();
            self.count_finished(panicked);
            return;
        }

        // Слот освобождается под блокировкой пула. retire_worker не может выбрать
        // воркер, которому эта блокировка еще нужна, а ожидающий submit
        // либо еще сканирует слоты, либо уже спит на condvar.
        let state = self.state.lock();
        slot.finish_job();
        self.count_finished(panicked);
        drop(state);
        self.slot_freed.notify_all();
    }

    fn count_finished(&self, panicked: bool) {
        if panicked {
            self.panicked_jobs.fetch_add(1, Ordering::Release);
        } else {
            self.completed_jobs.fetch_add(1, Ordering::Release);
        }
    }

    pub(crate) fn report_panic(&self, report: WorkerPanic) {
        error!(worker = %report.worker, panic = %report.message, "job panicked");
        if let Some(handler) = &self.config.panic_handler {
            if panic::catch_unwind(AssertUnwindSafe(|| handler.call(&report))).is_err() {
                warn!(worker = %report.worker, "panic handler itself panicked");
            }
        }
    }

    pub(crate) fn status_locked(&self, state: &PoolState) -> PoolStatus {
        PoolStatus {
            current_count: state.current_count,
            busy_count: state.busy_count(),
            min_count: self.config.min_threads,
            max_count: self.config.max_threads,
            completed_jobs: self.completed_jobs.load(Ordering::Acquire),
            panicked_jobs: self.panicked_jobs.load(Ordering::Acquire),
            closed: state.closed,
        }
    }

    pub(crate) fn status(&self) -> PoolStatus {
        let state = self.state.lock();
        self.status_locked(&state)
    }

    fn close(&self) {
        let (manager, workers) = {
            let mut state = self.state.lock();
            if state.closed {
                debug!("pool already closed");
                return;
            }
            state.closed = true;
            drop(state.manager_signal.take());

            for entry in &state.slots {
                entry.slot.request_exit();
            }
            let workers: Vec<_> = state
                .slots
                .iter_mut()
                .filter_map(|entry| entry.handle.take().map(|h| (entry.slot.id(), h)))
                .collect();
            (state.manager.take(), workers)
        };
        self.slot_freed.notify_all();

        let current = thread::current().id();
        if let Some(manager) = manager {
            if manager.join().is_err() {
                warn!("manager thread panicked");
            }
        }
        for (id, handle) in workers {
            // close() из задачи собственного воркера: себя не join-им
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                warn!(worker = %id, "worker thread panicked");
            }
        }

        let mut state = self.state.lock();
        state.slots.clear();
        state.current_count = 0;
        info!(
            completed = self.completed_jobs.load(Ordering::Acquire),
            panicked = self.panicked_jobs.load(Ordering::Acquire),
            "thread pool closed"
        );
    }
}


/// Пул OS-потоков с автомасштабированием между `min_threads` и `max_threads`.
///
/// Каждая задача назначается свободному воркеру напрямую, очереди на уровне пула нет.
/// Фоновый менеджер раз в `manage_interval` смотрит на долю занятых воркеров
/// и добавляет или убирает по одному воркеру.
///
/// Drop пула вызывает [`ThreadPool::close`].
pub struct ThreadPool {
    pub(crate) inner: Arc<PoolInner>,
}

impl ThreadPool {
    pub fn new(min_threads: usize, max_threads: usize) -> Result<Self, PoolError> {
        let config = Config {
            min_threads,
            max_threads,
            ..Default::default()
        };
        Self::with_config(config)
    }

    pub fn with_config(config: Config) -> Result<Self, PoolError> {
        config.validate()?;
        let min_threads = config.min_threads;
        let max_threads = config.max_threads;
        let pool = Self { inner: Arc::new(PoolInner::new(config)) };

        {
            let mut state = pool.inner.state.lock();
            for _ in 0..min_threads {
                if let Err(e) = pool.inner.add_worker(&mut state) {
                    drop(state);
                    pool.inner.close();
                    return Err(e);
                }
            }

            let (signal, shutdown) = crossbeam::channel::bounded::<()>(0);
            match manager::spawn(Arc::clone(&pool.inner), shutdown) {
                Ok(handle) => {
                    state.manager = Some(handle);
                    state.manager_signal = Some(signal);
                }
                Err(e) => {
                    drop(state);
                    pool.inner.close();
                    return Err(PoolError::SpawnFailure(e.to_string()));
                }
            }
        }

        info!(min = min_threads, max = max_threads, "thread pool created");
        Ok(pool)
    }

    /// Отдать задачу свободному воркеру. Не ждет выполнения.
    #[inline]
    pub fn submit<F>(&self, f: F) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.submit_job(Box::new(f))
    }

    /// Как `submit`, но с handle на результат
    pub fn spawn<T, F>(&self, f: F) -> Result<TaskHandle<T>, PoolError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (job, handle) = handle::with_handle(f);
        self.inner.submit_job(job)?;
        Ok(handle)
    }

    pub fn add_thread(&self) -> Result<WorkerId, PoolError> {
        let mut state = self.inner.state.lock();
        self.inner.add_worker(&mut state)
    }

    #[inline]
    pub fn get_status(&self) -> PoolStatus {
        self.inner.status()
    }

    /// Живые воркеры в порядке добавления
    pub fn workers(&self) -> Vec<(WorkerId, WorkerState)> {
        let state = self.inner.state.lock();
        state
            .slots
            .iter()
            .map(|entry| (entry.slot.id(), entry.slot.state()))
            .collect()
    }

    pub fn config(&self) -> &Config {
        self.inner.config()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Останавливает менеджер и все воркеры и ждет их завершения.
    /// Задачи, уже назначенные воркерам, доделываются. Повторный вызов ничего не делает.
    pub fn close(&self) {
        self.inner.close();
    }

    /// Мониторинг статуса с callback. Требует контекст tokio runtime.
    /// ВАЖНО: мониторинг живет до `token.cancel()` или закрытия пула
    pub fn start_monitoring<F>(&self, interval: Duration, callback: F) -> CancellationToken
    where
        F: Fn(PoolStatus) + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let token = CancellationToken::new();
        let token_clone = token.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        let status = inner.status();
                        let closed = status.closed;
                        callback(status);
                        if closed {
                            break;
                        }
                    }
                    _ = token_clone.cancelled() => {
                        break;
                    }
                }
            }
        });

        token
    }

    pub fn stop_monitoring(token: CancellationToken) {
        token.cancel();
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.inner.close();
    }
}

impl fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPool")
            .field("status", &self.get_status())
            .finish()
    }
}

/// Создать пул с `min..=max` воркерами и настройками по умолчанию
pub fn create_pool(min_threads: usize, max_threads: usize) -> Result<ThreadPool, PoolError> {
    ThreadPool::new(min_threads, max_threads)
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    // Ручное удаление воркера: то же, что делает тик менеджера при сжатии
    impl ThreadPool {
        fn delete_thread(&self) -> Result<WorkerId, PoolError> {
            let mut state = self.inner.lock_state();
            self.inner.retire_worker(&mut state)
        }
    }

    fn quiet_config(min: usize, max: usize) -> Config {
        Config {
            min_threads: min,
            max_threads: max,
            manage_interval: Duration::from_secs(3600),
            ..Default::default()
        }
    }

    fn quiet_pool(min: usize, max: usize) -> ThreadPool {
        ThreadPool::with_config(quiet_config(min, max)).expect("valid config")
    }

    // Такой стек не выделит ни одна система
    const HUGE_STACK: usize = usize::MAX / 2;

    #[test]
    fn delete_thread_refuses_at_minimum() {
        let pool = quiet_pool(2, 4);
        assert_eq!(pool.delete_thread(), Err(PoolError::AtMinimum { min: 2 }));
    }

    #[test]
    fn delete_thread_never_picks_busy_worker() {
        let pool = quiet_pool(1, 2);
        pool.add_thread().unwrap();

        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (release_tx2, release_rx2) = mpsc::channel::<()>();
        pool.submit(move || { let _ = release_rx.recv(); }).unwrap();
        pool.submit(move || { let _ = release_rx2.recv(); }).unwrap();
        assert_eq!(pool.get_status().busy_count, 2);

        assert_eq!(pool.delete_thread(), Err(PoolError::NoIdleWorker));
        assert_eq!(pool.get_status().current_count, 2);

        release_tx.send(()).unwrap();
        while pool.get_status().busy_count > 1 {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(pool.delete_thread().is_ok());

        let status = pool.get_status();
        assert_eq!(status.current_count, 1);
        assert_eq!(status.busy_count, 1);
        assert_eq!(pool.inner.lock_state().slots.len(), 1);

        release_tx2.send(()).unwrap();
    }

    #[test]
    fn retired_worker_ids_are_not_reused() {
        let pool = quiet_pool(1, 3);
        let added = pool.add_thread().unwrap();
        let removed = pool.delete_thread().unwrap();
        assert_eq!(added, removed);

        let next = pool.add_thread().unwrap();
        assert!(next > added);
    }

    #[test]
    fn close_terminates_every_worker() {
        let pool = quiet_pool(2, 4);
        pool.add_thread().unwrap();
        let slots: Vec<Arc<WorkerSlot>> = pool
            .inner
            .lock_state()
            .slots
            .iter()
            .map(|entry| Arc::clone(&entry.slot))
            .collect();
        assert_eq!(slots.len(), 3);
        assert!(pool
            .workers()
            .iter()
            .all(|(_, state)| *state == WorkerState::Waiting));

        pool.close();
        for slot in &slots {
            assert_eq!(slot.state(), WorkerState::Terminated);
        }
        assert!(pool.workers().is_empty());
        assert!(pool.inner.lock_state().manager.is_none());
    }

    #[test]
    fn close_from_inside_a_job_does_not_deadlock() {
        let pool = Arc::new(quiet_pool(1, 1));
        let (done_tx, done_rx) = mpsc::channel();

        let inner = Arc::clone(&pool.inner);
        pool.submit(move || {
            inner.close();
            let _ = done_tx.send(());
        })
        .unwrap();

        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(pool.is_closed());
    }

    #[test]
    fn retire_does_not_wait_on_worker_finishing_in_blocking_mode() {
        let pool = ThreadPool::with_config(Config {
            saturation: SaturationPolicy::Block { timeout: None },
            ..quiet_config(1, 2)
        })
        .expect("valid config");

        let (hold_tx, hold_rx) = mpsc::channel::<()>();
        pool.submit(move || { let _ = hold_rx.recv(); }).unwrap();
        pool.add_thread().unwrap();
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        pool.submit(move || { let _ = gate_rx.recv(); }).unwrap();
        assert_eq!(pool.get_status().busy_count, 2);

        let (result_tx, result_rx) = mpsc::channel();
        let inner = Arc::clone(&pool.inner);
        let retirer = thread::spawn(move || {
            let mut state = inner.lock_state();
            drop(gate_tx);
            // Задача уже вернулась, воркер ждет блокировку пула
            thread::sleep(Duration::from_millis(200));
            let _ = result_tx.send(inner.retire_worker(&mut state));
        });

        let result = match result_rx.recv_timeout(Duration::from_secs(5)) {
            Ok(result) => result,
            Err(_) => {
                // Блокировка пула так и не освободится, Drop пула повис бы в close
                std::mem::forget(pool);
                panic!("retire_worker did not return while holding the pool lock");
            }
        };
        assert_eq!(result, Err(PoolError::NoIdleWorker));
        retirer.join().unwrap();

        while pool.get_status().busy_count > 1 {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(pool.delete_thread().is_ok());
        let status = pool.get_status();
        assert_eq!(status.current_count, 1);
        assert_eq!(status.busy_count, 1);
        assert_eq!(status.completed_jobs, 1);

        drop(hold_tx);
    }

    #[test]
    fn failed_spawn_at_creation_is_reported() {
        let result = ThreadPool::with_config(Config {
            stack_size: Some(HUGE_STACK),
            ..quiet_config(2, 4)
        });
        assert!(matches!(result, Err(PoolError::SpawnFailure(_))));
    }

    #[test]
    fn failed_add_thread_leaves_pool_unchanged() {
        // Пул без воркеров: with_config с таким стеком не создался бы
        let pool = ThreadPool {
            inner: Arc::new(PoolInner::new(Config {
                stack_size: Some(HUGE_STACK),
                ..quiet_config(1, 4)
            })),
        };

        assert!(matches!(pool.add_thread(), Err(PoolError::SpawnFailure(_))));
        assert!(matches!(pool.add_thread(), Err(PoolError::SpawnFailure(_))));

        let status = pool.get_status();
        assert_eq!(status.current_count, 0);
        assert_eq!(status.busy_count, 0);
        assert!(pool.workers().is_empty());
        assert!(!status.closed);
    }

    #[test]
    fn invalid_threshold_is_rejected() {
        let config = Config {
            busy_threshold: 1.5,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(PoolError::InvalidConfig(_))));

        let config = Config {
            busy_threshold: f64::NAN,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(PoolError::InvalidConfig(_))));

        let config = Config {
            manage_interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(PoolError::InvalidConfig(_))));
    }
}
