//! Admission control for calls.
//!
//! The [`Dispatcher`] decides when asynchronous calls run. Each dispatcher bounds the
//! number of asynchronous calls running at once, both overall
//! ([`max_requests`][Dispatcher::max_requests]) and per host
//! ([`max_requests_per_host`][Dispatcher::max_requests_per_host]). Calls beyond those
//! limits wait in a ready queue, and are promoted in submission order (per host) as
//! running calls finish.
//!
//! Synchronous calls run on their caller's thread. The dispatcher tracks them so they
//! can be cancelled and so the idle callback fires only once nothing is running, but
//! they do not count against the limits.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::Error;

mod call;
mod executor;

pub use self::call::Call;
pub use self::executor::{Executor, Job, ThreadPool};

type IdleCallback = Arc<dyn Fn() + Send + Sync + 'static>;
type Task = Box<dyn FnOnce(&Call) + Send + 'static>;

/// Decides when calls run.
///
/// Dispatchers are cheap to clone. Clones share the same queues, limits and executor.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    state: Mutex<DispatcherState>,
    executor: OnceLock<Arc<dyn Executor>>,
}

struct AsyncCall {
    call: Arc<Call>,
    task: Task,
}

impl fmt::Debug for AsyncCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.call.fmt(f)
    }
}

#[derive(Default)]
struct DispatcherState {
    max_requests: usize,
    max_requests_per_host: usize,
    idle_callback: Option<IdleCallback>,

    // Ready async calls, in the order they will run.
    ready: VecDeque<AsyncCall>,

    // Running async calls, including cancelled calls which haven't finished yet.
    running_async: VecDeque<Arc<Call>>,

    // Running sync calls, including cancelled calls which haven't finished yet.
    running_sync: VecDeque<Arc<Call>>,
}

impl DispatcherState {
    fn running_calls_for_host(&self, host: &str) -> usize {
        self.running_async
            .iter()
            .filter(|call| call.host() == host)
            .count()
    }

    fn running_count(&self) -> usize {
        self.running_async.len() + self.running_sync.len()
    }

    /// Move ready calls into the running queue while capacity allows, returning the
    /// calls to submit once the lock is released.
    fn promote(&mut self) -> Vec<AsyncCall> {
        let mut promoted = Vec::new();
        let mut index = 0;

        while index < self.ready.len() {
            if self.running_async.len() >= self.max_requests {
                break;
            }

            if self.ready[index].call.is_canceled() {
                if let Some(dropped) = self.ready.remove(index) {
                    tracing::trace!(call = ?dropped.call, "dropping canceled call");
                }
                continue;
            }

            if self.running_calls_for_host(self.ready[index].call.host())
                >= self.max_requests_per_host
            {
                index += 1;
                continue;
            }

            if let Some(next) = self.ready.remove(index) {
                tracing::trace!(call = ?next.call, "promoting call");
                self.running_async.push_back(next.call.clone());
                promoted.push(next);
            }
        }

        promoted
    }
}

impl Dispatcher {
    /// Create a dispatcher with the default limits, which runs calls on a
    /// [`ThreadPool`] created when the first call is enqueued.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                state: Mutex::new(DispatcherState {
                    max_requests: 64,
                    max_requests_per_host: 5,
                    ..Default::default()
                }),
                executor: OnceLock::new(),
            }),
        }
    }

    /// Create a dispatcher which runs calls on `executor`.
    pub fn with_executor(executor: Arc<dyn Executor>) -> Self {
        let dispatcher = Self::new();
        let _ = dispatcher.inner.executor.set(executor);
        dispatcher
    }

    /// The executor running asynchronous calls.
    pub fn executor(&self) -> &Arc<dyn Executor> {
        self.inner
            .executor
            .get_or_init(|| Arc::new(ThreadPool::new()))
    }

    /// The maximum number of asynchronous calls to run at once.
    pub fn max_requests(&self) -> usize {
        self.inner.state.lock().max_requests
    }

    /// Set the maximum number of asynchronous calls to run at once.
    ///
    /// Calls above the limit wait in memory until running calls finish. Raising the
    /// limit promotes waiting calls immediately; lowering it doesn't interrupt calls
    /// which are already running.
    pub fn set_max_requests(&self, max_requests: usize) -> Result<(), Error> {
        if max_requests < 1 {
            return Err(Error::InvalidArgument(format!(
                "max < 1: {max_requests}"
            )));
        }

        let promoted = {
            let mut state = self.inner.state.lock();
            state.max_requests = max_requests;
            state.promote()
        };
        self.submit(promoted);
        Ok(())
    }

    /// The maximum number of asynchronous calls to run at once for each host.
    pub fn max_requests_per_host(&self) -> usize {
        self.inner.state.lock().max_requests_per_host
    }

    /// Set the maximum number of asynchronous calls to run at once for each host.
    ///
    /// Hosts are compared by name. Several hosts sharing one IP address are still
    /// counted separately.
    pub fn set_max_requests_per_host(&self, max_requests_per_host: usize) -> Result<(), Error> {
        if max_requests_per_host < 1 {
            return Err(Error::InvalidArgument(format!(
                "max < 1: {max_requests_per_host}"
            )));
        }

        let promoted = {
            let mut state = self.inner.state.lock();
            state.max_requests_per_host = max_requests_per_host;
            state.promote()
        };
        self.submit(promoted);
        Ok(())
    }

    /// Set a callback to run each time the dispatcher becomes idle, when the number of
    /// running calls (sync and async) drops to zero.
    ///
    /// The callback runs on the thread which finished the last call, without any
    /// dispatcher lock held, so it may call back into the dispatcher.
    pub fn set_idle_callback<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.state.lock().idle_callback = Some(Arc::new(callback));
    }

    /// Remove the idle callback.
    pub fn clear_idle_callback(&self) {
        self.inner.state.lock().idle_callback = None;
    }

    /// Run `task` for `call` now if the limits allow, otherwise queue it.
    ///
    /// The task runs on the executor. The call is finished when the task returns (or
    /// panics, or is dropped by the executor without running).
    pub fn enqueue<F>(&self, call: Arc<Call>, task: F)
    where
        F: FnOnce(&Call) + Send + 'static,
    {
        let call = AsyncCall {
            call,
            task: Box::new(task),
        };

        let promoted = {
            let mut state = self.inner.state.lock();
            if state.running_async.len() < state.max_requests
                && state.running_calls_for_host(call.call.host()) < state.max_requests_per_host
            {
                tracing::trace!(call = ?call.call, "running call");
                state.running_async.push_back(call.call.clone());
                vec![call]
            } else {
                tracing::trace!(call = ?call.call, "queueing call");
                state.ready.push_back(call);
                Vec::new()
            }
        };

        self.submit(promoted);
    }

    /// Record that `call` is running synchronously on the caller's thread.
    ///
    /// The caller must pair this with [`finished`][Self::finished].
    pub fn executed(&self, call: Arc<Call>) {
        tracing::trace!(call = ?call, "executing call");
        self.inner.state.lock().running_sync.push_back(call);
    }

    /// Record that `call` has finished.
    ///
    /// Finishing an asynchronous call promotes waiting calls. If nothing is running
    /// afterwards, the idle callback runs.
    pub fn finished(&self, call: &Call) {
        let (promoted, idle) = {
            let mut state = self.inner.state.lock();

            let promote = if let Some(index) = position(&state.running_async, call) {
                state.running_async.remove(index);
                true
            } else if let Some(index) = position(&state.running_sync, call) {
                state.running_sync.remove(index);
                false
            } else {
                tracing::warn!(call = ?call, "finished a call which wasn't in flight");
                return;
            };

            tracing::trace!(call = ?call, "finished call");
            let promoted = if promote { state.promote() } else { Vec::new() };

            let idle = if state.running_count() == 0 {
                state.idle_callback.clone()
            } else {
                None
            };

            (promoted, idle)
        };

        self.submit(promoted);

        if let Some(idle) = idle {
            tracing::trace!("dispatcher idle");
            idle();
        }
    }

    /// Cancel every call, queued and running.
    pub fn cancel_all(&self) {
        let state = self.inner.state.lock();
        for call in state.ready.iter() {
            call.call.cancel();
        }
        for call in state.running_async.iter().chain(state.running_sync.iter()) {
            call.cancel();
        }
    }

    /// A snapshot of the calls waiting to run.
    pub fn queued_calls(&self) -> Vec<Arc<Call>> {
        let state = self.inner.state.lock();
        state.ready.iter().map(|call| call.call.clone()).collect()
    }

    /// A snapshot of the calls currently running, async calls first.
    pub fn running_calls(&self) -> Vec<Arc<Call>> {
        let state = self.inner.state.lock();
        state
            .running_async
            .iter()
            .chain(state.running_sync.iter())
            .cloned()
            .collect()
    }

    /// The number of calls waiting to run.
    pub fn queued_calls_count(&self) -> usize {
        self.inner.state.lock().ready.len()
    }

    /// The number of calls currently running, sync and async.
    pub fn running_calls_count(&self) -> usize {
        self.inner.state.lock().running_count()
    }

    /// Hand promoted calls to the executor. Must be called without the state lock.
    fn submit(&self, promoted: Vec<AsyncCall>) {
        if promoted.is_empty() {
            return;
        }

        let executor = self.executor();
        for AsyncCall { call, task } in promoted {
            let guard = FinishGuard {
                dispatcher: self.clone(),
                call,
            };
            executor.execute(Box::new(move || {
                let guard = guard;
                (task)(&guard.call);
            }));
        }
    }
}

fn position(calls: &VecDeque<Arc<Call>>, call: &Call) -> Option<usize> {
    calls.iter().position(|running| running.id() == call.id())
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Dispatcher")
            .field("max_requests", &state.max_requests)
            .field("max_requests_per_host", &state.max_requests_per_host)
            .field("ready", &state.ready.len())
            .field("running_async", &state.running_async.len())
            .field("running_sync", &state.running_sync.len())
            .finish()
    }
}

/// Finishes an async call when its job completes, panics or is dropped unrun.
struct FinishGuard {
    dispatcher: Dispatcher,
    call: Arc<Call>,
}

impl Drop for FinishGuard {
    fn drop(&mut self) {
        self.dispatcher.finished(&self.call);
    }
}
