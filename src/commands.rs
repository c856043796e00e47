//! The `pairs` and `scan` commands, kept in the library so they can be driven from tests.

use crate::cancel::CancellationToken;
use crate::fastq::{FastqRecord, FastqRecords, LINES_PER_RECORD, SeqStats, gc_count};
use crate::io::{input_label, open_reader};
use crate::merger::{MergerConfig, PairHandle, PairedStreamMerger};
use crate::prefetch::{PrefetchBuffer, PrefetchConfig};
use crate::progress::{LoggingProgress, ProgressSink};
use crate::slicer::{IterationRange, SlicerConfig, WorkSlicer};
use anyhow::{Context, Result, bail};
use bstr::BStr;
use log::{info, warn};
use parking_lot::Mutex;
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Mismatched names logged before going quiet.
const MISMATCH_LOG_LIMIT: u64 = 10;

#[derive(Debug, Clone)]
pub struct PairsOptions {
    pub r1: PathBuf,
    pub r2: PathBuf,
    pub consumers: usize,
    pub queue_capacity: usize,
    pub strict: bool,
    pub cancel: Option<CancellationToken>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PairsReport {
    pub pairs: u64,
    pub r1: SeqStats,
    pub r2: SeqStats,
    pub name_mismatches: u64,
}

#[derive(Default)]
struct PairTally {
    mates: Mutex<(SeqStats, SeqStats)>,
    mismatches: AtomicU64,
}

impl PairTally {
    fn record(&self, pair: PairHandle, strict: bool) -> Result<()> {
        let position = pair.ordinal();
        let r1 = FastqRecord::from_lines(pair.a.lines())
            .with_context(|| format!("R1 record {}", position + 1))?;
        let r2 = FastqRecord::from_lines(pair.b.lines())
            .with_context(|| format!("R2 record {}", position + 1))?;

        if r1.name() != r2.name() {
            if strict {
                bail!(
                    "read names differ at pair {}: {} vs {}",
                    position + 1,
                    BStr::new(r1.name()),
                    BStr::new(r2.name())
                );
            }
            let seen = self.mismatches.fetch_add(1, Ordering::Relaxed);
            if seen < MISMATCH_LOG_LIMIT {
                warn!(
                    "read names differ at pair {}: {} vs {}",
                    position + 1,
                    BStr::new(r1.name()),
                    BStr::new(r2.name())
                );
            }
        }

        let mut mates = self.mates.lock();
        mates.0.add(&r1);
        mates.1.add(&r2);
        Ok(())
    }
}

/// Walk two mate files in lock-step, one record per pair.
pub fn run_pairs(opts: &PairsOptions) -> Result<PairsReport> {
    let a = open_reader(&opts.r1)?;
    let b = open_reader(&opts.r2)?;

    let mut config = MergerConfig::new()
        .with_chunk_size(LINES_PER_RECORD)
        .with_queue_capacity(opts.queue_capacity)
        .with_consumers(opts.consumers);
    if let Some(token) = &opts.cancel {
        config = config.with_cancellation(token.clone());
    }
    info!(
        "pairing {} with {} using {} consumers, {} lines per record",
        opts.r1.display(),
        opts.r2.display(),
        config.consumers(),
        config.chunk_size()
    );

    let tally = Arc::new(PairTally::default());
    let handler_tally = Arc::clone(&tally);
    let strict = opts.strict;
    let summary = PairedStreamMerger::new(config)
        .run(a, b, move |pair| handler_tally.record(pair, strict))
        .with_context(|| {
            format!("failed to pair {} with {}", opts.r1.display(), opts.r2.display())
        })?;

    let (r1, r2) = *tally.mates.lock();
    let name_mismatches = tally.mismatches.load(Ordering::Relaxed);
    if name_mismatches > MISMATCH_LOG_LIMIT {
        warn!("{} further name mismatches not shown", name_mismatches - MISMATCH_LOG_LIMIT);
    }
    Ok(PairsReport { pairs: summary.pairs, r1, r2, name_mismatches })
}

#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub inputs: Vec<PathBuf>,
    pub threads: usize,
    pub depth: usize,
    pub keep_going: bool,
    pub cancel: Option<CancellationToken>,
}

/// Counts for one scanned file.
#[derive(Debug, Clone, PartialEq)]
pub struct FileScan {
    pub index: usize,
    pub path: PathBuf,
    pub stats: SeqStats,
    /// Largest read-ahead queue observed while scanning.
    pub peak_buffered: usize,
}

fn scan_file(path: &Path, index: usize, worker: usize, depth: usize) -> Result<FileScan> {
    let label = input_label(path);
    let reader = open_reader(path)?;
    let peak = Arc::new(AtomicUsize::new(0));
    let sampled_peak = Arc::clone(&peak);
    let config = PrefetchConfig::new(depth)
        .with_preprocessor(|record: &mut FastqRecord| {
            record.gc = Some(gc_count(&record.seq));
            Ok(())
        })
        .with_depth_sampler(move |len| {
            sampled_peak.fetch_max(len, Ordering::Relaxed);
        })
        .with_thread_name(format!("prefetch-{worker}"));

    let buffer = PrefetchBuffer::spawn(FastqRecords::new(reader, label), config)?;
    let mut stats = SeqStats::default();
    while let Some(record) = buffer.next_item()? {
        stats.add(&record);
    }
    buffer.close()?;

    Ok(FileScan {
        index,
        path: path.to_path_buf(),
        stats,
        peak_buffered: peak.load(Ordering::Relaxed),
    })
}

/// A file that could not be scanned under `keep_going`.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanFailure {
    pub index: usize,
    pub path: PathBuf,
    pub error: String,
}

/// Outcome of a scan, both lists in input order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanReport {
    pub scans: Vec<FileScan>,
    pub failures: Vec<ScanFailure>,
}

impl ScanReport {
    /// Counts summed over every scanned file.
    pub fn total(&self) -> SeqStats {
        let mut total = SeqStats::default();
        for scan in &self.scans {
            total.merge(&scan.stats);
        }
        total
    }
}

/// Count reads, bases and GC in every input, one file per slicer index.
///
/// Without `keep_going` the first file that fails aborts the scan. With it, every file is
/// scanned and failures are collected in the report.
pub fn run_scan(opts: &ScanOptions) -> Result<ScanReport> {
    if opts.inputs.is_empty() {
        return Ok(ScanReport::default());
    }
    let total = opts.inputs.len();
    let progress: Arc<dyn ProgressSink> =
        Arc::new(LoggingProgress::new("Scanned files").with_interval(1).with_total(total as i64));
    let mut config = SlicerConfig::new().with_max_threads(opts.threads).with_progress(progress);
    if let Some(token) = &opts.cancel {
        config = config.with_cancellation(token.clone());
    }

    let inputs = Arc::new(opts.inputs.clone());
    let depth = opts.depth;
    let keep_going = opts.keep_going;
    let slicer = WorkSlicer::new(IterationRange::new(0, total as i64 - 1), config);
    info!("scanning {} files with {} workers", total, slicer.num_workers());

    let outcomes = slicer.run(move |i, worker| {
        let index = i as usize;
        let path = &inputs[index];
        match scan_file(path, index, worker, depth)
            .with_context(|| format!("failed to scan {}", path.display()))
        {
            Ok(scan) => Ok(Some(Ok(scan))),
            Err(error) if keep_going => {
                warn!("{error:#}");
                let error = format!("{error:#}");
                Ok(Some(Err(ScanFailure { index, path: path.clone(), error })))
            }
            Err(error) => Err(error),
        }
    })?;

    let mut scans = Vec::new();
    let mut failures = Vec::new();
    for outcome in outcomes {
        match outcome {
            Ok(scan) => scans.push(scan),
            Err(failure) => failures.push(failure),
        }
    }
    scans.par_sort_unstable_by_key(|scan| scan.index);
    failures.sort_unstable_by_key(|failure| failure.index);
    Ok(ScanReport { scans, failures })
}
