use super::errors::TaskError;
use futures::FutureExt;
use std::{
    any::Any,
    future::Future,
    panic::{self, AssertUnwindSafe},
    pin::Pin,
    task::{Context, Poll},
};
use tokio::{
    sync::oneshot::{self, error::TryRecvError},
    time::Duration,
};


/// Единица работы: замыкание вместе со всем захваченным состоянием
pub type Job = Box<dyn FnOnce() + Send + 'static>;

pub type TaskResult<T> = Result<T, TaskError>;


/// Handle на результат задачи, запущенной через `ThreadPool::spawn`
pub struct TaskHandle<T> {
    receiver: oneshot::Receiver<TaskResult<T>>,
}

impl<T> TaskHandle<T> {

    pub(crate) fn new(receiver: oneshot::Receiver<TaskResult<T>>) -> Self {
        Self { receiver }
    }

    /// Блокирующее ожидание результата.
    /// Нельзя вызывать из async-контекста tokio, там нужно `.await`.
    pub fn join(self) -> TaskResult<T> {
        self.receiver
            .blocking_recv()
            .unwrap_or(Err(TaskError::Closed))
    }

    pub async fn join_timeout(self, timeout: Duration) -> TaskResult<T> {
        match tokio::time::timeout(timeout, self.receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TaskError::Closed),
            Err(_) => Err(TaskError::Timeout),
        }
    }

    /// Неблокирующая проверка: `None`, пока задача не завершилась
    pub fn try_result(&mut self) -> Option<TaskResult<T>> {
        match self.receiver.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Closed) => Some(Err(TaskError::Closed)),
        }
    }
}

impl<T> Future for TaskHandle<T> {
    type Output = TaskResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.get_mut()
            .receiver
            .poll_unpin(cx)
            .map(|res| res.unwrap_or(Err(TaskError::Closed)))
    }
}


/// Оборачивает замыкание с результатом в `Job` и связанный с ним handle.
/// Паника отправляется в handle и пробрасывается дальше, чтобы воркер
/// учел ее так же, как панику обычной задачи.
pub(crate) fn with_handle<T, F>(f: F) -> (Job, TaskHandle<T>)
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (tx, rx) = oneshot::channel::<TaskResult<T>>();

    let job: Job = Box::new(move || {
        match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(value) => {
                let _ = tx.send(Ok(value));
            }
            Err(payload) => {
                let _ = tx.send(Err(TaskError::Panicked(panic_message(payload.as_ref()))));
                panic::resume_unwind(payload);
            }
        }
    });

    (job, TaskHandle::new(rx))
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
