/// Dedicated Rayon thread pool for CPU-intensive reconciliation work.
///
/// Key precomputation runs on this pool instead of the global one to avoid
/// contention with the Tokio runtime that hosts the job workers.
use once_cell::sync::Lazy;
use rayon::ThreadPool;
use std::sync::Arc;

static RECON_POOL: Lazy<Arc<ThreadPool>> = Lazy::new(|| {
    let num_threads = optimal_thread_count();
    Arc::new(
        rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|i| format!("txn-recon-{}", i))
            .build()
            .expect("Failed to create dedicated Rayon thread pool"),
    )
});

fn optimal_thread_count() -> usize {
    if let Ok(val) = std::env::var("TXN_RECON_RAYON_THREADS") {
        if let Ok(n) = val.parse::<usize>() {
            if n > 0 {
                log::info!("[Rayon Pool] Using {} threads from TXN_RECON_RAYON_THREADS", n);
                return n;
            }
        }
    }
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

pub fn recon_pool() -> Arc<ThreadPool> {
    RECON_POOL.clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_is_usable() {
        let pool = recon_pool();
        let sum = pool.install(|| (1..=100u64).sum::<u64>());
        assert_eq!(sum, 5050);
    }
}
