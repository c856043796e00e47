//! Lock-step consumption of two positionally correlated line streams.
//!
//! Paired-end sequencing produces two files (R1 and R2) whose records at the same
//! position belong together. [`PairedStreamMerger`] reads each stream on its own scanner
//! thread, groups every `k` lines into a [`RecordChunk`], and feeds a bounded queue per
//! stream. A pool of consumers drains both queues and hands each matched pair to the
//! caller's handler.
//!
//! ```text
//! ┌───────────┐   chunks   ┌─────────┐
//! │ scanner A │──────────>│ queue A │──┐     ┌────────────────────┐
//! └───────────┘           └─────────┘  ├───>│ pairing lock       │──> handler (C consumers)
//! ┌───────────┐   chunks   ┌─────────┐  │     │ pop A, then pop B  │
//! │ scanner B │──────────>│ queue B │──┘     └────────────────────┘
//! └───────────┘           └─────────┘
//! ```
//!
//! Both pops happen inside one critical section (`pairing_lock`). Without it, two
//! consumers could each take A's chunk `n` and B's chunk `n + 1` and silently mispair.

use crate::cancel::{AbortState, CancellationToken, panic_message};
use crate::error::{PipelineError, Result, StreamSide};
use crate::utils::num_cpus;
use bstr::BString;
use crossbeam_channel::{Receiver, Sender, bounded, select};
use parking_lot::Mutex;
use std::io::{BufRead, ErrorKind};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

/// Lines per chunk for FASTQ records.
pub const DEFAULT_CHUNK_SIZE: usize = 4;

/// Chunks buffered per stream before its scanner blocks.
pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

/// A fixed number of consecutive lines from one stream, treated as one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordChunk {
    ordinal: u64,
    lines: Vec<BString>,
}

impl RecordChunk {
    #[must_use]
    pub fn new(ordinal: u64, lines: Vec<BString>) -> Self {
        Self { ordinal, lines }
    }

    /// Zero-based position of this chunk within its stream.
    #[must_use]
    pub fn ordinal(&self) -> u64 {
        self.ordinal
    }

    /// The chunk's lines, without line terminators.
    #[must_use]
    pub fn lines(&self) -> &[BString] {
        &self.lines
    }

    #[must_use]
    pub fn into_lines(self) -> Vec<BString> {
        self.lines
    }
}

/// A queue element: a chunk, or the end of the stream.
#[derive(Debug)]
pub enum ChunkSlot {
    Chunk(RecordChunk),
    EndOfStream,
}

/// One chunk from each stream at the same position.
#[derive(Debug)]
pub struct PairHandle {
    pub a: RecordChunk,
    pub b: RecordChunk,
}

impl PairHandle {
    /// Position shared by both chunks.
    #[must_use]
    pub fn ordinal(&self) -> u64 {
        self.a.ordinal
    }
}

/// Settings for a [`PairedStreamMerger`].
#[derive(Debug, Clone)]
pub struct MergerConfig {
    chunk_size: usize,
    queue_capacity: usize,
    consumers: usize,
    cancel: Option<CancellationToken>,
}

impl MergerConfig {
    /// Four-line chunks, 10,000 chunks per queue, one consumer per available core.
    #[must_use]
    pub fn new() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            consumers: num_cpus(),
            cancel: None,
        }
    }

    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    #[must_use]
    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity.max(1);
        self
    }

    #[must_use]
    pub fn with_consumers(mut self, consumers: usize) -> Self {
        self.consumers = consumers.max(1);
        self
    }

    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    #[must_use]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    #[must_use]
    pub fn consumers(&self) -> usize {
        self.consumers
    }
}

impl Default for MergerConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of a successful merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeSummary {
    /// Number of pairs handed to the handler.
    pub pairs: u64,
}

/// Drives two correlated line streams through a pair handler in positional lock-step.
pub struct PairedStreamMerger {
    config: MergerConfig,
}

impl PairedStreamMerger {
    #[must_use]
    pub fn new(config: MergerConfig) -> Self {
        Self { config }
    }

    /// Merge `a` and `b`, calling `handler` once per aligned pair, and block until done.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::StreamMisalignment`] if the streams hold a different
    /// number of chunks, the first handler failure, a read failure, or
    /// [`PipelineError::Cancelled`].
    pub fn run<RA, RB, H>(&self, a: RA, b: RB, handler: H) -> Result<MergeSummary>
    where
        RA: BufRead + Send + 'static,
        RB: BufRead + Send + 'static,
        H: Fn(PairHandle) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.start(a, b, handler)?.wait()
    }

    /// Start the scanners and consumers and return immediately.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Spawn`] if a thread could not be started; anything already
    /// running is stopped and joined first.
    pub fn start<RA, RB, H>(&self, a: RA, b: RB, handler: H) -> Result<MergeHandle>
    where
        RA: BufRead + Send + 'static,
        RB: BufRead + Send + 'static,
        H: Fn(PairHandle) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let (tx_a, rx_a) = bounded(self.config.queue_capacity);
        let (tx_b, rx_b) = bounded(self.config.queue_capacity);
        let abort = AbortState::new("paired merge", self.config.cancel.clone());
        let external = abort.external_tripped();
        let state = Arc::new(MergeState {
            abort,
            external,
            pairing_lock: Mutex::new(()),
            queue_a: rx_a,
            queue_b: rx_b,
            requeue_a: tx_a.clone(),
            requeue_b: tx_b.clone(),
            pairs: AtomicU64::new(0),
        });
        log::debug!(
            "paired merge: {} consumers, chunk size {}, queue capacity {}",
            self.config.consumers,
            self.config.chunk_size,
            self.config.queue_capacity
        );

        let mut handle =
            MergeHandle { state: Arc::clone(&state), scanners: Vec::new(), consumers: Vec::new() };
        let chunk_size = self.config.chunk_size;

        let scanner_a = Arc::clone(&state);
        handle.scanners.push(spawn_named("scanner-a", &state, move || {
            scanner_a.scan(StreamSide::A, a, &tx_a, chunk_size);
        })?);
        let scanner_b = Arc::clone(&state);
        match spawn_named("scanner-b", &state, move || {
            scanner_b.scan(StreamSide::B, b, &tx_b, chunk_size);
        }) {
            Ok(join) => handle.scanners.push(join),
            Err(error) => return Err(handle.abandon(error)),
        }

        let handler = Arc::new(handler);
        for consumer_id in 0..self.config.consumers {
            let consumer = Arc::clone(&state);
            let handler = Arc::clone(&handler);
            let name = format!("merge-consumer-{consumer_id}");
            match spawn_named(&name, &state, move || consumer.consume(&*handler, consumer_id)) {
                Ok(join) => handle.consumers.push(join),
                Err(error) => return Err(handle.abandon(error)),
            }
        }
        Ok(handle)
    }
}

fn spawn_named<F>(name: &str, state: &MergeState, f: F) -> Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new().name(name.to_string()).spawn(f).map_err(|source| {
        let error = PipelineError::Spawn { name: name.to_string(), source };
        state.abort.raise();
        error
    })
}

struct MergeState {
    abort: AbortState,
    external: Receiver<()>,
    /// Held across the pop from queue A and the pop from queue B.
    pairing_lock: Mutex<()>,
    queue_a: Receiver<ChunkSlot>,
    queue_b: Receiver<ChunkSlot>,
    requeue_a: Sender<ChunkSlot>,
    requeue_b: Sender<ChunkSlot>,
    pairs: AtomicU64,
}

impl MergeState {
    fn scan<R: BufRead>(
        &self,
        side: StreamSide,
        mut reader: R,
        tx: &Sender<ChunkSlot>,
        chunk_size: usize,
    ) {
        let mut ordinal = 0u64;
        let mut lines = Vec::with_capacity(chunk_size);
        let mut buf = Vec::new();

        loop {
            if self.abort.is_aborted() {
                return;
            }
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) => break,
                Ok(_) => {
                    trim_line_terminator(&mut buf);
                    lines.push(BString::from(buf.as_slice()));
                    if lines.len() == chunk_size {
                        let chunk = RecordChunk::new(
                            ordinal,
                            std::mem::replace(&mut lines, Vec::with_capacity(chunk_size)),
                        );
                        ordinal += 1;
                        if !self.send(tx, ChunkSlot::Chunk(chunk)) {
                            return;
                        }
                    }
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(source) => {
                    self.abort.fail(PipelineError::Scan { stream: side, source });
                    return;
                }
            }
        }

        if !lines.is_empty() {
            self.abort.fail(PipelineError::TruncatedChunk {
                stream: side,
                lines: lines.len(),
                chunk_size,
            });
            return;
        }
        if self.send(tx, ChunkSlot::EndOfStream) {
            log::debug!("paired merge: stream {side} exhausted after {ordinal} chunks");
        }
    }

    /// Blocking send that gives up when the merge is aborted. True if the slot was queued.
    fn send(&self, tx: &Sender<ChunkSlot>, slot: ChunkSlot) -> bool {
        select! {
            send(tx, slot) -> sent => sent.is_ok(),
            recv(self.abort.tripped()) -> _ => false,
            recv(self.external) -> _ => {
                self.abort.should_stop();
                false
            }
        }
    }

    /// Blocking receive that gives up when the merge is aborted.
    fn recv(&self, rx: &Receiver<ChunkSlot>) -> Option<ChunkSlot> {
        select! {
            recv(rx) -> slot => slot.ok(),
            recv(self.abort.tripped()) -> _ => None,
            recv(self.external) -> _ => {
                self.abort.should_stop();
                None
            }
        }
    }

    /// Pop the next aligned pair. `None` when this consumer should exit.
    fn next_pair(&self) -> Option<PairHandle> {
        let _pairing = self.pairing_lock.lock();
        if self.abort.should_stop() {
            return None;
        }
        let a = self.recv(&self.queue_a)?;
        let b = self.recv(&self.queue_b)?;
        match (a, b) {
            (ChunkSlot::Chunk(a), ChunkSlot::Chunk(b)) => Some(PairHandle { a, b }),
            (ChunkSlot::EndOfStream, ChunkSlot::EndOfStream) => {
                // Put both sentinels back so the next consumer sees them too.
                let requeued = self.requeue_a.try_send(ChunkSlot::EndOfStream).is_ok()
                    && self.requeue_b.try_send(ChunkSlot::EndOfStream).is_ok();
                if !requeued {
                    self.abort.raise();
                }
                None
            }
            (ChunkSlot::EndOfStream, ChunkSlot::Chunk(b)) => {
                self.abort.fail(PipelineError::StreamMisalignment {
                    pairs: b.ordinal,
                    longer: StreamSide::B,
                });
                None
            }
            (ChunkSlot::Chunk(a), ChunkSlot::EndOfStream) => {
                self.abort.fail(PipelineError::StreamMisalignment {
                    pairs: a.ordinal,
                    longer: StreamSide::A,
                });
                None
            }
        }
    }

    fn consume<H>(&self, handler: &H, consumer_id: usize)
    where
        H: Fn(PairHandle) -> anyhow::Result<()>,
    {
        let mut handled = 0u64;
        while let Some(pair) = self.next_pair() {
            let ordinal = pair.ordinal();
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(pair)))
                .unwrap_or_else(|payload| {
                    Err(anyhow::anyhow!("panicked: {}", panic_message(payload)))
                });
            if let Err(error) = outcome {
                self.abort.fail(PipelineError::worker(
                    format!("pair handler at position {ordinal}"),
                    error,
                ));
                break;
            }
            handled += 1;
            self.pairs.fetch_add(1, Ordering::Relaxed);
        }
        log::debug!("paired merge: consumer {consumer_id} exiting after {handled} pairs");
    }
}

fn trim_line_terminator(buf: &mut Vec<u8>) {
    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    }
}

/// A running paired merge.
///
/// Dropping the handle without calling [`MergeHandle::wait`] aborts the merge and joins
/// every thread.
pub struct MergeHandle {
    state: Arc<MergeState>,
    scanners: Vec<JoinHandle<()>>,
    consumers: Vec<JoinHandle<()>>,
}

impl MergeHandle {
    /// Join every thread and report the outcome.
    ///
    /// # Errors
    ///
    /// Returns the first error captured during the merge.
    pub fn wait(mut self) -> Result<MergeSummary> {
        self.join_all();
        match self.state.abort.take_error() {
            Some(error) => Err(error),
            None => Ok(MergeSummary { pairs: self.state.pairs.load(Ordering::Relaxed) }),
        }
    }

    /// Abort the merge. Has no effect once every thread has exited.
    pub fn cancel(&self) {
        if !self.is_finished() {
            self.state.abort.fail(PipelineError::Cancelled);
        }
    }

    /// True once every scanner and consumer has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.scanners.iter().chain(&self.consumers).all(JoinHandle::is_finished)
    }

    /// Pairs handled so far.
    #[must_use]
    pub fn pairs(&self) -> u64 {
        self.state.pairs.load(Ordering::Relaxed)
    }

    fn join_all(&mut self) {
        for handle in self.consumers.drain(..) {
            join_logged(handle, &self.state.abort);
        }
        // Consumers are gone; release any scanner parked on a full queue.
        self.state.abort.raise();
        for handle in self.scanners.drain(..) {
            join_logged(handle, &self.state.abort);
        }
    }

    fn abandon(mut self, error: PipelineError) -> PipelineError {
        self.state.abort.record(error);
        self.join_all();
        self.state.abort.take_error().unwrap_or(PipelineError::Cancelled)
    }
}

fn join_logged(handle: JoinHandle<()>, abort: &AbortState) {
    let name = handle.thread().name().unwrap_or("merge thread").to_string();
    if let Err(payload) = handle.join() {
        abort.fail(PipelineError::worker(
            name,
            anyhow::anyhow!("thread panicked: {}", panic_message(payload)),
        ));
    }
}

impl Drop for MergeHandle {
    fn drop(&mut self) {
        if self.scanners.is_empty() && self.consumers.is_empty() {
            return;
        }
        self.state.abort.raise();
        self.join_all();
        if let Some(error) = self.state.abort.take_error() {
            log::warn!("paired merge dropped without waiting; captured error: {error}");
        }
    }
}
