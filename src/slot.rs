use super::{
    handle::Job,
    model::{WorkerId, WorkerState},
};
use crossbeam::sync::WaitGroup;
use parking_lot::{Condvar, Mutex};
use std::fmt;


struct SlotInner {
    state: WorkerState,
    is_busy: bool,
    is_waiting: bool,
    job: Option<Job>,
    exit_requested: bool,
}

/// Слот воркера: состояние одного потока под собственным монитором (mutex + condvar).
///
/// Поля трогает только сам воркер и пул, причем пул всегда под своей блокировкой.
/// Порядок захвата: блокировка пула, затем блокировка слота, не наоборот.
pub(crate) struct WorkerSlot {
    id: WorkerId,
    inner: Mutex<SlotInner>,
    wake: Condvar,
}

impl WorkerSlot {
    pub(crate) fn new(id: WorkerId) -> Self {
        Self {
            id,
            inner: Mutex::new(SlotInner {
                state: WorkerState::Starting,
                is_busy: false,
                is_waiting: false,
                job: None,
                exit_requested: false,
            }),
            wake: Condvar::new(),
        }
    }

    #[inline]
    pub(crate) fn id(&self) -> WorkerId {
        self.id
    }

    #[inline]
    pub(crate) fn is_busy(&self) -> bool {
        self.inner.lock().is_busy
    }

    #[inline]
    pub(crate) fn state(&self) -> WorkerState {
        self.inner.lock().state
    }

    /// Назначить задачу, если слот свободен. Иначе задача возвращается вызывающему.
    pub(crate) fn try_assign(&self, job: Job) -> Result<(), Job> {
        let mut inner = self.inner.lock();
        if inner.is_busy || inner.exit_requested || inner.job.is_some() || !inner.state.is_alive() {
            return Err(job);
        }
        inner.job = Some(job);
        inner.is_busy = true;
        self.wake.notify_one();
        Ok(())
    }

    /// Попросить простаивающий воркер завершиться. Занятый воркер не трогаем.
    pub(crate) fn try_retire(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.is_busy || inner.exit_requested || inner.job.is_some() || !inner.state.is_alive() {
            return false;
        }
        inner.exit_requested = true;
        self.wake.notify_one();
        true
    }

    /// Безусловный запрос на выход: текущая задача будет доделана
    pub(crate) fn request_exit(&self) {
        let mut inner = self.inner.lock();
        inner.exit_requested = true;
        self.wake.notify_one();
    }

    /// Единственная точка добровольной приостановки воркера.
    ///
    /// Переводит слот в `Waiting`, отпускает `ready` (регистрация завершена)
    /// и ждет, пока не появится задача или запрос на выход.
    /// `None` означает, что воркер должен завершиться.
    pub(crate) fn wait_for_job(&self, ready: &mut Option<WaitGroup>) -> Option<Job> {
        let mut inner = self.inner.lock();
        inner.state = WorkerState::Waiting;
        inner.is_waiting = true;
        drop(ready.take());

        while inner.job.is_none() && !inner.exit_requested {
            self.wake.wait(&mut inner);
        }
        inner.is_waiting = false;

        match inner.job.take() {
            Some(job) => {
                inner.state = WorkerState::Running;
                Some(job)
            }
            None => {
                inner.state = WorkerState::Exiting;
                None
            }
        }
    }

    pub(crate) fn finish_job(&self) {
        self.inner.lock().is_busy = false;
    }

    pub(crate) fn mark_terminated(&self) {
        let mut inner = self.inner.lock();
        inner.state = WorkerState::Terminated;
        inner.is_busy = false;
    }
}

impl fmt::Debug for WorkerSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("WorkerSlot")
            .field("id", &self.id)
            .field("state", &inner.state)
            .field("is_busy", &inner.is_busy)
            .field("is_waiting", &inner.is_waiting)
            .field("has_job", &inner.job.is_some())
            .field("exit_requested", &inner.exit_requested)
            .finish()
    }
}
