//! Where asynchronous calls run.

use std::fmt;
use std::time::Duration;

/// A unit of work submitted by the dispatcher.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs dispatcher jobs.
///
/// A job occupies its thread for the whole network round trip, so executors should
/// run each job on a thread of its own (or one borrowed from an unbounded pool).
pub trait Executor: fmt::Debug + Send + Sync + 'static {
    /// Run `job`, without waiting for it to complete.
    fn execute(&self, job: Job);
}

/// Runs jobs on the blocking pool of an existing tokio runtime.
impl Executor for tokio::runtime::Handle {
    fn execute(&self, job: Job) {
        drop(self.spawn_blocking(job));
    }
}

/// The default executor: an unbounded pool of threads which are reclaimed after a
/// minute of idleness.
///
/// Threads are borrowed from the blocking pool of a private tokio runtime, which is
/// created on first use.
pub struct ThreadPool {
    runtime: Option<tokio::runtime::Runtime>,
}

const THREAD_NAME: &str = "hyperdial dispatcher";
const KEEP_ALIVE: Duration = Duration::from_secs(60);

impl ThreadPool {
    /// Create the pool.
    ///
    /// If the runtime can't be built, jobs fall back to one new thread each.
    pub fn new() -> Self {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(usize::MAX >> 4)
            .thread_keep_alive(KEEP_ALIVE)
            .thread_name(THREAD_NAME)
            .build();

        match runtime {
            Ok(runtime) => Self {
                runtime: Some(runtime),
            },
            Err(error) => {
                tracing::warn!(%error, "unable to start dispatcher pool, using one thread per call");
                Self { runtime: None }
            }
        }
    }
}

impl Default for ThreadPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor for ThreadPool {
    fn execute(&self, job: Job) {
        match &self.runtime {
            Some(runtime) => {
                drop(runtime.spawn_blocking(job));
            }
            None => {
                let spawned = std::thread::Builder::new()
                    .name(THREAD_NAME.into())
                    .spawn(job);
                if let Err(error) = spawned {
                    tracing::warn!(%error, "unable to spawn dispatcher thread");
                }
            }
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPool")
            .field("name", &THREAD_NAME)
            .field("keep_alive", &KEEP_ALIVE)
            .finish()
    }
}
