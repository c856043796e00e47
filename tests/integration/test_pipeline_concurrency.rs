//! Concurrency tests combining the slicer, prefetch buffer and merger.
//!
//! These tests check delivery guarantees, order preservation and shutdown under
//! multi-threaded execution.

use std::collections::HashSet;
use std::io::Cursor;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use seqpipe::{
    AtomicProgress, CancellationToken, IterationRange, MergerConfig, PairedStreamMerger,
    PipelineError, PrefetchBuffer, PrefetchConfig, ProgressSink, SlicerConfig, WorkSlicer,
};

fn numbered_lines(prefix: &str, count: usize) -> Cursor<String> {
    let text: String = (0..count).map(|i| format!("{prefix}{i}\n")).collect();
    Cursor::new(text)
}

#[test]
fn test_slicer_workers_each_drain_a_prefetch_buffer() {
    // Each index owns its own read-ahead thread; all values must come through in order.
    let slicer = WorkSlicer::new(IterationRange::new(1, 40), SlicerConfig::new().with_max_threads(6));
    let results = slicer
        .run(|i, _worker| {
            let len = i as usize;
            let buffer = PrefetchBuffer::spawn_iter(
                (0..len).map(anyhow::Ok),
                PrefetchConfig::new(len.div_ceil(3)),
            )?;
            let values: Vec<usize> = buffer.collect::<seqpipe::Result<_>>()?;
            anyhow::ensure!(values == (0..len).collect::<Vec<_>>(), "out of order for {i}");
            Ok(Some((i, values.len())))
        })
        .expect("slicer should succeed");

    let mut seen: Vec<i64> = results.iter().map(|(i, _)| *i).collect();
    seen.sort_unstable();
    assert_eq!(seen, (1..=40).collect::<Vec<_>>());
    assert!(results.iter().all(|&(i, len)| len == i as usize));
}

#[test]
fn test_slicer_negative_range_exactly_once() {
    let seen = Arc::new(Mutex::new(HashSet::new()));
    let progress = Arc::new(AtomicProgress::new());
    let config = SlicerConfig::new()
        .with_max_threads(8)
        .with_progress(Arc::clone(&progress) as Arc<dyn ProgressSink>);
    let slicer = WorkSlicer::new(IterationRange::new(-5_000, 4_999), config);
    let worker_seen = Arc::clone(&seen);
    let results: Vec<()> = slicer
        .run(move |i, _| {
            assert!(worker_seen.lock().insert(i), "index {i} delivered twice");
            Ok(None)
        })
        .unwrap();
    assert!(results.is_empty());
    assert_eq!(seen.lock().len(), 10_000);
    assert_eq!(progress.value(), 10_000);
}

#[test]
fn test_external_token_stops_long_slice() {
    let token = CancellationToken::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let config = SlicerConfig::new().with_max_threads(4).with_cancellation(token.clone());
    let slicer = WorkSlicer::new(IterationRange::new(0, i64::MAX - 1), config);
    let worker_calls = Arc::clone(&calls);
    let handle = slicer
        .start(move |_, _| {
            worker_calls.fetch_add(1, Ordering::Relaxed);
            thread::sleep(Duration::from_micros(50));
            Ok(Some(()))
        })
        .unwrap();

    while handle.completed() < 100 {
        thread::sleep(Duration::from_millis(1));
    }
    token.cancel();
    assert!(calls.load(Ordering::Relaxed) >= 100);
    let err = handle.wait().unwrap_err();
    assert!(err.is_cancelled());
}

#[test]
fn test_merger_slow_handlers_keep_pairs_aligned() {
    let pairs = Arc::new(Mutex::new(Vec::new()));
    let handler_pairs = Arc::clone(&pairs);
    let merger = PairedStreamMerger::new(
        MergerConfig::new().with_chunk_size(2).with_queue_capacity(3).with_consumers(4),
    );
    let summary = merger
        .run(numbered_lines("a", 400), numbered_lines("b", 400), move |pair| {
            if fastrand::u8(..) < 16 {
                thread::sleep(Duration::from_micros(200));
            }
            let first_a = pair.a.lines()[0].to_string();
            let first_b = pair.b.lines()[0].to_string();
            anyhow::ensure!(first_a[1..] == first_b[1..], "{first_a} paired with {first_b}");
            handler_pairs.lock().push(pair.ordinal());
            Ok(())
        })
        .unwrap();

    assert_eq!(summary.pairs, 200);
    let mut ordinals = pairs.lock().clone();
    ordinals.sort_unstable();
    assert_eq!(ordinals, (0..200).collect::<Vec<u64>>());
}

#[test]
fn test_merger_handle_dropped_mid_run() {
    let merger = PairedStreamMerger::new(MergerConfig::new().with_queue_capacity(2).with_consumers(2));
    let handle = merger
        .start(numbered_lines("a", 40_000), numbered_lines("b", 40_000), |_| {
            thread::sleep(Duration::from_micros(100));
            Ok(())
        })
        .unwrap();
    while handle.pairs() < 10 {
        thread::sleep(Duration::from_millis(1));
    }
    // Dropping stops and joins every thread; the test would hang otherwise.
    drop(handle);
}

#[test]
fn test_merger_handler_error_reported_once() {
    let merger = PairedStreamMerger::new(MergerConfig::new().with_consumers(4));
    let err = merger
        .run(numbered_lines("a", 4_000), numbered_lines("b", 4_000), |pair| {
            anyhow::ensure!(pair.ordinal() % 100 != 7, "bad pair {}", pair.ordinal());
            Ok(())
        })
        .unwrap_err();
    match err {
        PipelineError::Worker { source, .. } => assert!(source.to_string().starts_with("bad pair")),
        other => panic!("expected worker error, got {other}"),
    }
}
