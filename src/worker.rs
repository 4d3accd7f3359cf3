use super::{
    handle::panic_message,
    model::WorkerPanic,
    pool::PoolInner,
    slot::WorkerSlot,
};
use std::{
    io,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    thread::{self, JoinHandle},
};
use crossbeam::sync::WaitGroup;
use tracing::{debug, debug_span};


pub(crate) fn spawn(
    pool: Arc<PoolInner>,
    slot: Arc<WorkerSlot>,
    ready: WaitGroup,
) -> io::Result<JoinHandle<()>> {
    let config = pool.config();
    let mut builder = thread::Builder::new().name(format!("{}-{}", config.thread_name, slot.id()));
    if let Some(size) = config.stack_size {
        builder = builder.stack_size(size);
    }

    builder.spawn(move || worker_loop(pool, slot, ready))
}

/// Цикл воркера: ждать задачу, выполнить, снова ждать, пока не попросят выйти.
/// Паника задачи перехватывается здесь и не убивает поток.
fn worker_loop(pool: Arc<PoolInner>, slot: Arc<WorkerSlot>, ready: WaitGroup) {
    let span = debug_span!("worker", id = %slot.id());
    let _enter = span.enter();
    debug!("worker starting");

    let mut ready = Some(ready);
    while let Some(job) = slot.wait_for_job(&mut ready) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(job));

        let panicked = match outcome {
            Ok(()) => false,
            Err(payload) => {
                pool.report_panic(WorkerPanic {
                    worker: slot.id(),
                    message: panic_message(payload.as_ref()),
                });
                true
            }
        };

        pool.job_finished(&slot, panicked);
    }

    slot.mark_terminated();
    debug!("worker terminated");
}
