use elastic_pool::{Config, PoolError, SaturationPolicy, ThreadPool};
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};
use tracing_subscriber::EnvFilter;


fn main() -> Result<(), PoolError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_thread_names(true)
        .init();

    let pool = ThreadPool::with_config(Config {
        min_threads: 2,
        max_threads: 16,
        manage_interval: Duration::from_millis(200),
        saturation: SaturationPolicy::Block { timeout: None },
        ..Default::default()
    })?;

    let now = Instant::now();
    let done = Arc::new(AtomicUsize::new(0));
    for i in 0..2_000u64 {
        let done = done.clone();
        pool.submit(move || {
            thread::sleep(Duration::from_micros(500 + i % 500));
            done.fetch_add(1, Ordering::Relaxed);
        })?;
    }

    while done.load(Ordering::Relaxed) < 2_000 {
        thread::sleep(Duration::from_millis(100));
        let status = pool.get_status();
        tracing::info!(
            current = status.current_count,
            busy = status.busy_count,
            utilization = status.utilization(),
            "pool status"
        );
    }

    pool.close();
    println!("elapsed: {:?}", now.elapsed());
    Ok(())
}
