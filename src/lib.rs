//! Пул OS-потоков с автомасштабированием
//!
//! # Features
//! - Долгоживущие воркеры, каждый со своим монитором (mutex + condvar)
//! - Менеджер, который раз в интервал добавляет или убирает воркер по утилизации
//! - Синхронный рост при `submit`, если свободных воркеров нет
//! - Отказ или ожидание при насыщении (`SaturationPolicy`)
//! - Перехват паник на границе воркера с хуком для отчетов
//! - Handle на результат задачи, мониторинг статуса через tokio

pub mod errors;
pub mod handle;
pub mod manager;
pub mod model;
pub mod pool;
mod slot;
mod worker;

pub use errors::{PoolError, TaskError};
pub use handle::TaskHandle;
pub use manager::ScaleDecision;
pub use model::{PoolStatus, WorkerId, WorkerPanic, WorkerState};
pub use pool::{create_pool, Config, PanicHandler, SaturationPolicy, ThreadPool};
