//! Work slicing: a fixed worker pool draining a shared index cursor.
//!
//! Every index of an inclusive [`IterationRange`] is handed to exactly one worker exactly
//! once. Workers keep their results in private lists which are only concatenated when the
//! pool is joined, so the aggregate is grouped by worker and does not follow index order.
//!
//! # Example
//!
//! ```
//! use seqpipe::slicer::{IterationRange, SlicerConfig, WorkSlicer};
//!
//! let slicer = WorkSlicer::new(IterationRange::new(0, 9), SlicerConfig::new().with_max_threads(4));
//! let doubled = slicer.run(|i, _worker| Ok(Some(i * 2))).unwrap();
//! assert_eq!(doubled.iter().sum::<i64>(), 90);
//! ```

use crate::cancel::{AbortState, CancellationToken, panic_message};
use crate::error::{PipelineError, Result};
use crate::progress::{AdaptiveSampler, ProgressSink};
use crate::utils::num_cpus;
use parking_lot::{Condvar, Mutex};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

/// Immutable inclusive range of indices. `start > end` is empty.
///
/// At most `u64::MAX` indices are handed out. Only the full `[i64::MIN, i64::MAX]` domain
/// is longer than that; its last index, `i64::MAX`, is never delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IterationRange {
    start: i64,
    end: i64,
}

impl IterationRange {
    #[must_use]
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    #[must_use]
    pub fn start(&self) -> i64 {
        self.start
    }

    #[must_use]
    pub fn end(&self) -> i64 {
        self.end
    }

    /// Number of indices in the range, capped at `u64::MAX`.
    #[must_use]
    pub fn len(&self) -> u64 {
        if self.start > self.end {
            0
        } else {
            u64::try_from(i128::from(self.end) - i128::from(self.start) + 1).unwrap_or(u64::MAX)
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.start > self.end
    }

    fn index_at(&self, offset: u64) -> i64 {
        (i128::from(self.start) + i128::from(offset)) as i64
    }
}

/// Monotonic cursor over the offsets of a range. Never advances past the end.
struct SharedCursor {
    next: AtomicU64,
    len: u64,
}

impl SharedCursor {
    fn new(len: u64) -> Self {
        Self { next: AtomicU64::new(0), len }
    }

    fn take(&self) -> Option<u64> {
        self.next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < self.len).then_some(n + 1))
            .ok()
    }
}

/// Configuration for a [`WorkSlicer`].
#[derive(Clone)]
pub struct SlicerConfig {
    max_threads: usize,
    stop_on_error: bool,
    progress: Option<Arc<dyn ProgressSink>>,
    cancel: Option<CancellationToken>,
}

impl SlicerConfig {
    /// Unlimited threads (bounded by available parallelism), stop on first error.
    #[must_use]
    pub fn new() -> Self {
        Self { max_threads: usize::MAX, stop_on_error: true, progress: None, cancel: None }
    }

    #[must_use]
    pub fn with_max_threads(mut self, max_threads: usize) -> Self {
        self.max_threads = max_threads.max(1);
        self
    }

    /// When false, workers keep draining the range after a failure; the first failure is
    /// still returned once the pool is joined.
    #[must_use]
    pub fn with_stop_on_error(mut self, stop_on_error: bool) -> Self {
        self.stop_on_error = stop_on_error;
        self
    }

    #[must_use]
    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = Some(progress);
        self
    }

    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

impl Default for SlicerConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Fans the indices of a range out across a fixed pool of worker threads.
pub struct WorkSlicer {
    range: IterationRange,
    config: SlicerConfig,
}

impl WorkSlicer {
    #[must_use]
    pub fn new(range: IterationRange, config: SlicerConfig) -> Self {
        Self { range, config }
    }

    /// Number of workers a run will start: available parallelism, capped by the range
    /// length and the configured maximum.
    #[must_use]
    pub fn num_workers(&self) -> usize {
        let len = usize::try_from(self.range.len()).unwrap_or(usize::MAX);
        if len == 0 {
            return 0;
        }
        num_cpus().min(len).min(self.config.max_threads).max(1)
    }

    /// Run `f(index, worker_id)` over every index and block until the pool is done.
    ///
    /// `Some` results are collected; `None` results are dropped.
    ///
    /// # Errors
    ///
    /// Returns the first failure raised by `f` (or a panic inside it), or
    /// [`PipelineError::Cancelled`] if the run was cancelled.
    pub fn run<R, F>(&self, f: F) -> Result<Vec<R>>
    where
        R: Send + 'static,
        F: Fn(i64, usize) -> anyhow::Result<Option<R>> + Send + Sync + 'static,
    {
        self.start(f)?.wait()
    }

    /// Start the pool and return immediately.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Spawn`] if a worker thread could not be started; any workers
    /// already running are stopped and joined first.
    pub fn start<R, F>(&self, f: F) -> Result<SliceHandle<R>>
    where
        R: Send + 'static,
        F: Fn(i64, usize) -> anyhow::Result<Option<R>> + Send + Sync + 'static,
    {
        let workers = self.num_workers();
        let state = Arc::new(SliceState {
            range: self.range,
            cursor: SharedCursor::new(self.range.len()),
            abort: AbortState::new("work slicer", self.config.cancel.clone()),
            stop_on_error: self.config.stop_on_error,
            progress: self.config.progress.clone(),
            completed: AtomicU64::new(0),
            finished: Mutex::new(0),
            finished_cv: Condvar::new(),
        });
        log::debug!(
            "work slicer: starting {workers} workers over [{}, {}]",
            self.range.start,
            self.range.end
        );

        let f = Arc::new(f);
        let mut handle = SliceHandle { state: Arc::clone(&state), handles: Vec::new(), workers };
        for worker_id in 0..workers {
            let worker_state = Arc::clone(&state);
            let f = Arc::clone(&f);
            let name = format!("slicer-{worker_id}");
            let spawned = thread::Builder::new().name(name.clone()).spawn(move || {
                let results = worker_state.worker_loop(&*f, worker_id);
                worker_state.worker_exited();
                results
            });
            match spawned {
                Ok(join) => handle.handles.push(join),
                Err(source) => {
                    handle.workers = handle.handles.len();
                    state.abort.fail(PipelineError::Spawn { name, source });
                    return Err(handle.finish_with_error());
                }
            }
        }
        Ok(handle)
    }
}

struct SliceState {
    range: IterationRange,
    cursor: SharedCursor,
    abort: AbortState,
    stop_on_error: bool,
    progress: Option<Arc<dyn ProgressSink>>,
    completed: AtomicU64,
    finished: Mutex<usize>,
    finished_cv: Condvar,
}

impl SliceState {
    fn worker_loop<R, F>(&self, f: &F, worker_id: usize) -> Vec<R>
    where
        F: Fn(i64, usize) -> anyhow::Result<Option<R>>,
    {
        let mut results = Vec::new();
        let mut sampler = self.progress.as_ref().map(|_| AdaptiveSampler::new());
        let mut iterations = 0u64;

        while !self.abort.should_stop() {
            let Some(offset) = self.cursor.take() else { break };
            let index = self.range.index_at(offset);
            match panic::catch_unwind(AssertUnwindSafe(|| f(index, worker_id))) {
                Ok(Ok(Some(result))) => results.push(result),
                Ok(Ok(None)) => {}
                Ok(Err(e)) => self.worker_failed(worker_id, index, e),
                Err(payload) => self.worker_failed(
                    worker_id,
                    index,
                    anyhow::anyhow!("panicked: {}", panic_message(payload)),
                ),
            }
            iterations += 1;
            let done = self.completed.fetch_add(1, Ordering::Relaxed) + 1;
            if let (Some(sampler), Some(progress)) = (sampler.as_mut(), self.progress.as_ref()) {
                if sampler.tick() {
                    progress.set_value_thread_safe(done as i64);
                }
            }
        }
        log::debug!("work slicer: worker {worker_id} exiting after {iterations} iterations");
        results
    }

    fn worker_failed(&self, worker_id: usize, index: i64, error: anyhow::Error) {
        let error = PipelineError::worker(format!("worker {worker_id} at index {index}"), error);
        if self.stop_on_error {
            self.abort.fail(error);
        } else {
            self.abort.record(error);
        }
    }

    fn worker_exited(&self) {
        let mut finished = self.finished.lock();
        *finished += 1;
        self.finished_cv.notify_all();
    }
}

/// A running work slicer.
///
/// Dropping the handle without calling [`SliceHandle::wait`] aborts the pool and joins it.
pub struct SliceHandle<R> {
    state: Arc<SliceState>,
    handles: Vec<JoinHandle<Vec<R>>>,
    workers: usize,
}

impl<R> SliceHandle<R> {
    /// Number of workers started.
    #[must_use]
    pub fn num_workers(&self) -> usize {
        self.workers
    }

    /// Join every worker and return the aggregated results.
    ///
    /// # Errors
    ///
    /// Returns the first error captured during the run, even if it happened long before
    /// this call.
    pub fn wait(mut self) -> Result<Vec<R>> {
        let results = self.join_all();
        if let Some(error) = self.state.abort.take_error() {
            return Err(error);
        }
        if let Some(progress) = &self.state.progress {
            progress.set_value_thread_safe(self.state.completed.load(Ordering::Relaxed) as i64);
        }
        Ok(results)
    }

    /// Block until at least `n` workers (capped at the pool size) have exited.
    ///
    /// The outcome of the run is left for [`SliceHandle::wait`].
    pub fn wait_for_finished(&self, n: usize) {
        let target = n.min(self.workers);
        let mut finished = self.state.finished.lock();
        while *finished < target {
            self.state.finished_cv.wait(&mut finished);
        }
    }

    /// True once every worker has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        *self.state.finished.lock() >= self.workers
    }

    /// Number of iterations completed so far.
    #[must_use]
    pub fn completed(&self) -> u64 {
        self.state.completed.load(Ordering::Relaxed)
    }

    /// Ask the workers to stop at their next loop top. Has no effect once all have exited.
    pub fn cancel(&self) {
        if !self.is_finished() {
            self.state.abort.fail(PipelineError::Cancelled);
        }
    }

    fn join_all(&mut self) -> Vec<R> {
        let mut results = Vec::new();
        for (worker_id, handle) in self.handles.drain(..).enumerate() {
            match handle.join() {
                Ok(mut worker_results) => results.append(&mut worker_results),
                Err(payload) => {
                    self.state.abort.fail(PipelineError::worker(
                        format!("worker {worker_id}"),
                        anyhow::anyhow!("thread panicked: {}", panic_message(payload)),
                    ));
                }
            }
        }
        results
    }

    fn finish_with_error(mut self) -> PipelineError {
        self.state.abort.raise();
        self.join_all();
        self.state.abort.take_error().unwrap_or(PipelineError::Cancelled)
    }
}

impl<R> Drop for SliceHandle<R> {
    fn drop(&mut self) {
        if self.handles.is_empty() {
            return;
        }
        self.state.abort.raise();
        self.join_all();
        if let Some(error) = self.state.abort.take_error() {
            log::warn!("work slicer dropped without waiting; captured error: {error}");
        }
    }
}
