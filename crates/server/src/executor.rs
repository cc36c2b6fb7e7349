//! Worker pool the server runs on.

use tokio::runtime::{Builder, Runtime};

/// Name given to every worker thread.
pub const WORKER_THREAD_NAME: &str = "blockwire-worker";

/// Builds a multi-thread runtime with a fixed number of workers.
///
/// All connection, session and file I/O tasks are scheduled on it; tasks
/// of one session run sequentially while different sessions run in
/// parallel across the workers.
pub fn build_runtime(worker_threads: usize) -> std::io::Result<Runtime> {
    Builder::new_multi_thread()
        .worker_threads(worker_threads.max(1))
        .thread_name(WORKER_THREAD_NAME)
        .enable_all()
        .build()
}
