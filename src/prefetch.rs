//! Background read-ahead over a slow upstream.
//!
//! A [`PrefetchBuffer`] owns one background thread that pulls items from an [`Upstream`],
//! runs an optional preprocessor on each item, and queues them for the consumer. The
//! queue is throttled by a watermark pair derived from the requested depth `D`:
//!
//! ```text
//! ┌──────────────┐   fetch +    ┌────────────────────┐   next()   ┌──────────┐
//! │   Upstream   │─preprocess──>│ queue (D .. 2D)    │──────────>│ consumer │
//! │ (background) │              │ pause at 2D,       │           │          │
//! └──────────────┘              │ resume below D     │           └──────────┘
//!                               └────────────────────┘
//! ```
//!
//! The producer condition-waits at the high watermark and only resumes once the consumer
//! has drained below the low one, so it does not wake for every single pop.

use crate::cancel::panic_message;
use crate::error::{PipelineError, Result};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// A slow source of items that a [`PrefetchBuffer`] reads ahead of its consumer.
pub trait Upstream: Send + 'static {
    type Item: Send + 'static;

    /// Fetch the next item, or `None` once the source is exhausted.
    fn next_item(&mut self) -> anyhow::Result<Option<Self::Item>>;

    /// Release the underlying resource. Called exactly once by the buffer.
    fn close(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Adapts a fallible iterator into an [`Upstream`]. Closing just drops it.
pub struct IterUpstream<I>(I);

impl<I> IterUpstream<I> {
    pub fn new(iter: I) -> Self {
        Self(iter)
    }
}

impl<I, T> Upstream for IterUpstream<I>
where
    I: Iterator<Item = anyhow::Result<T>> + Send + 'static,
    T: Send + 'static,
{
    type Item = T;

    fn next_item(&mut self) -> anyhow::Result<Option<T>> {
        self.0.next().transpose()
    }
}

type Preprocessor<T> = Box<dyn FnMut(&mut T) -> anyhow::Result<()> + Send>;
type DepthSampler = Box<dyn Fn(usize) + Send>;

/// Settings for a [`PrefetchBuffer`].
pub struct PrefetchConfig<T> {
    depth: usize,
    preprocess: Option<Preprocessor<T>>,
    sampler: Option<DepthSampler>,
    thread_name: String,
}

impl<T> PrefetchConfig<T> {
    /// Read ahead `depth` items (at least 1); the queue holds at most `2 * depth`.
    #[must_use]
    pub fn new(depth: usize) -> Self {
        Self { depth: depth.max(1), preprocess: None, sampler: None, thread_name: "prefetch".into() }
    }

    /// Run `f` on every item on the background thread before it becomes visible.
    #[must_use]
    pub fn with_preprocessor<F>(mut self, f: F) -> Self
    where
        F: FnMut(&mut T) -> anyhow::Result<()> + Send + 'static,
    {
        self.preprocess = Some(Box::new(f));
        self
    }

    /// Observe the queue length after every enqueue.
    #[must_use]
    pub fn with_depth_sampler<F>(mut self, f: F) -> Self
    where
        F: Fn(usize) + Send + 'static,
    {
        self.sampler = Some(Box::new(f));
        self
    }

    #[must_use]
    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }
}

enum PrefetchSlot<T> {
    Item(T),
    EndOfStream,
    /// Background failure, queued behind every item fetched before it.
    Failed(PipelineError),
}

struct QueueState<T> {
    slots: VecDeque<PrefetchSlot<T>>,
    /// A failure has been delivered; the buffer now reports end of stream.
    failed: bool,
    closed: bool,
    /// The background thread has released the upstream and exited.
    done: bool,
    close_error: Option<PipelineError>,
}

struct Shared<T> {
    state: Mutex<QueueState<T>>,
    not_empty: Condvar,
    drained: Condvar,
    low: usize,
    high: usize,
}

/// Queue of items fetched ahead of the consumer by a background thread.
pub struct PrefetchBuffer<T> {
    shared: Arc<Shared<T>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + 'static> PrefetchBuffer<T> {
    /// Start prefetching from `upstream`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Spawn`] if the background thread could not be started.
    pub fn spawn<U>(upstream: U, config: PrefetchConfig<T>) -> Result<Self>
    where
        U: Upstream<Item = T>,
    {
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState {
                slots: VecDeque::with_capacity(2 * config.depth + 1),
                failed: false,
                closed: false,
                done: false,
                close_error: None,
            }),
            not_empty: Condvar::new(),
            drained: Condvar::new(),
            low: config.depth,
            high: 2 * config.depth,
        });

        let PrefetchConfig { preprocess, sampler, thread_name, .. } = config;
        let producer = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || produce(&producer, upstream, preprocess, sampler))
            .map_err(|source| PipelineError::Spawn { name: thread_name, source })?;

        Ok(Self { shared, handle: Mutex::new(Some(handle)) })
    }

    /// Start prefetching from a fallible iterator.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Spawn`] if the background thread could not be started.
    pub fn spawn_iter<I>(iter: I, config: PrefetchConfig<T>) -> Result<Self>
    where
        I: Iterator<Item = anyhow::Result<T>> + Send + 'static,
    {
        Self::spawn(IterUpstream::new(iter), config)
    }
}

impl<T> PrefetchBuffer<T> {
    /// Block until an item or the end of the stream is available.
    ///
    /// # Errors
    ///
    /// Returns a failure raised on the background thread (upstream or preprocessor).
    pub fn has_next(&self) -> Result<bool> {
        let mut state = self.shared.state.lock();
        match self.pop_item(&mut state)? {
            Some(item) => {
                state.slots.push_front(PrefetchSlot::Item(item));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Block for the next item; `None` at the end of the stream or once [`close`] has been
    /// called, even if items were still queued.
    ///
    /// # Errors
    ///
    /// Returns a failure raised on the background thread (upstream or preprocessor) once
    /// every item fetched before it has been returned. The failure is delivered once; later
    /// calls report the end of the stream.
    ///
    /// [`close`]: PrefetchBuffer::close
    pub fn next_item(&self) -> Result<Option<T>> {
        let mut state = self.shared.state.lock();
        let item = self.pop_item(&mut state)?;
        if item.is_some() && state.slots.len() < self.shared.low {
            self.shared.drained.notify_one();
        }
        Ok(item)
    }

    /// Number of items currently queued.
    #[must_use]
    pub fn buffered(&self) -> usize {
        let state = self.shared.state.lock();
        state.slots.iter().filter(|slot| matches!(slot, PrefetchSlot::Item(_))).count()
    }

    /// Stop prefetching and release the upstream.
    ///
    /// Safe to call while the background thread is in the middle of a fetch: the call
    /// waits for that fetch to return, then joins the thread. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::ResourceClose`] if releasing the upstream failed.
    pub fn close(&self) -> Result<()> {
        {
            let mut state = self.shared.state.lock();
            state.closed = true;
            self.shared.drained.notify_all();
            self.shared.not_empty.notify_all();
        }
        if let Some(handle) = self.handle.lock().take() {
            if let Err(payload) = handle.join() {
                log::error!("prefetch thread panicked: {}", panic_message(payload));
            }
        }
        match self.shared.state.lock().close_error.take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Wait for the front slot and take it if it is an item or a failure.
    fn pop_item(&self, state: &mut MutexGuard<'_, QueueState<T>>) -> Result<Option<T>> {
        loop {
            if state.failed || state.closed {
                return Ok(None);
            }
            match state.slots.pop_front() {
                Some(PrefetchSlot::Item(item)) => return Ok(Some(item)),
                Some(PrefetchSlot::EndOfStream) => {
                    state.slots.push_front(PrefetchSlot::EndOfStream);
                    return Ok(None);
                }
                Some(PrefetchSlot::Failed(error)) => {
                    state.failed = true;
                    return Err(error);
                }
                None if state.done => return Ok(None),
                None => self.shared.not_empty.wait(state),
            }
        }
    }
}

impl<T> Iterator for PrefetchBuffer<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_item().transpose()
    }
}

impl<T> Drop for PrefetchBuffer<T> {
    fn drop(&mut self) {
        if let Err(error) = self.close() {
            log::warn!("prefetch buffer dropped: {error}");
        }
    }
}

fn produce<U: Upstream>(
    shared: &Shared<U::Item>,
    mut upstream: U,
    mut preprocess: Option<Preprocessor<U::Item>>,
    sampler: Option<DepthSampler>,
) {
    loop {
        {
            let mut state = shared.state.lock();
            if state.slots.len() >= shared.high {
                while state.slots.len() >= shared.low && !state.closed {
                    shared.drained.wait(&mut state);
                }
            }
            if state.closed {
                break;
            }
        }

        // Fetch and preprocess without holding the lock.
        let fetched = panic::catch_unwind(AssertUnwindSafe(|| -> Result<Option<U::Item>> {
            let Some(mut item) = upstream.next_item().map_err(PipelineError::Upstream)? else {
                return Ok(None);
            };
            if let Some(preprocess) = preprocess.as_mut() {
                preprocess(&mut item)
                    .map_err(|e| PipelineError::worker("prefetch preprocessor", e))?;
            }
            Ok(Some(item))
        }))
        .unwrap_or_else(|payload| {
            Err(PipelineError::worker(
                "prefetch thread",
                anyhow::anyhow!("panicked: {}", panic_message(payload)),
            ))
        });

        let mut state = shared.state.lock();
        if state.closed {
            break;
        }
        match fetched {
            Ok(Some(item)) => {
                state.slots.push_back(PrefetchSlot::Item(item));
                let depth = state.slots.len();
                shared.not_empty.notify_one();
                drop(state);
                if let Some(sampler) = &sampler {
                    sampler(depth);
                }
            }
            Ok(None) => {
                state.slots.push_back(PrefetchSlot::EndOfStream);
                shared.not_empty.notify_all();
                break;
            }
            Err(error) => {
                log::error!("prefetch: {error}");
                state.slots.push_back(PrefetchSlot::Failed(error));
                shared.not_empty.notify_all();
                break;
            }
        }
    }

    let released = upstream.close();
    let mut state = shared.state.lock();
    if let Err(source) = released {
        state.close_error =
            Some(PipelineError::ResourceClose { resource: "prefetch upstream".into(), source });
    }
    state.done = true;
    shared.not_empty.notify_all();
    log::debug!("prefetch: background thread exiting");
}
