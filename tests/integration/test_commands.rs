//! End-to-end runs of the `pairs` and `scan` commands over files on disk.

use std::path::PathBuf;

use seqpipe::commands::{PairsOptions, ScanOptions, run_pairs, run_scan};
use seqpipe::fastq::SeqStats;
use seqpipe::{CancellationToken, PipelineError};

use crate::helpers::{mate_pair, write_fastq};

fn pairs_options(dir: &tempfile::TempDir) -> PairsOptions {
    PairsOptions {
        r1: dir.path().join("R1.fq"),
        r2: dir.path().join("R2.fq"),
        consumers: 4,
        queue_capacity: 8,
        strict: true,
        cancel: None,
    }
}

#[test]
fn test_pairs_many_records() {
    let dir = mate_pair(1000, 1000);
    let report = run_pairs(&pairs_options(&dir)).expect("pairs should succeed");
    assert_eq!(report.pairs, 1000);
    assert_eq!(report.r1, SeqStats { reads: 1000, bases: 6000, gc: 4000 });
    assert_eq!(report.r2, SeqStats { reads: 1000, bases: 6000, gc: 2000 });
    assert_eq!(report.name_mismatches, 0);
}

#[test]
fn test_pairs_r2_longer() {
    let dir = mate_pair(99, 100);
    let err = run_pairs(&pairs_options(&dir)).unwrap_err();
    match err.downcast_ref::<PipelineError>() {
        Some(PipelineError::StreamMisalignment { pairs, .. }) => assert_eq!(*pairs, 99),
        other => panic!("expected misalignment, got {other:?}"),
    }
}

#[test]
fn test_pairs_cancelled_before_start() {
    let dir = mate_pair(500, 500);
    let token = CancellationToken::new();
    token.cancel();
    let opts = PairsOptions { cancel: Some(token), ..pairs_options(&dir) };
    let err = run_pairs(&opts).unwrap_err();
    assert!(err.downcast_ref::<PipelineError>().is_some_and(PipelineError::is_cancelled));
}

#[test]
fn test_pairs_missing_input() {
    let dir = mate_pair(1, 1);
    let opts = PairsOptions { r2: dir.path().join("missing.fq"), ..pairs_options(&dir) };
    let err = run_pairs(&opts).unwrap_err();
    assert!(format!("{err:#}").contains("failed to open"));
}

#[test]
fn test_scan_many_files() {
    let dir = tempfile::TempDir::new().unwrap();
    let inputs: Vec<PathBuf> = (0..8)
        .map(|n| {
            let path = dir.path().join(format!("sample{n}.fq"));
            write_fastq(&path, "r", 1, 50 * (n + 1), "GGGCCCAAAT");
            path
        })
        .collect();
    let opts = ScanOptions { inputs: inputs.clone(), threads: 3, depth: 16, keep_going: false, cancel: None };

    let report = run_scan(&opts).expect("scan should succeed");
    assert!(report.failures.is_empty());
    assert_eq!(report.scans.len(), 8);
    assert_eq!(report.total().reads, 50 * 36);
    for (n, scan) in report.scans.iter().enumerate() {
        let reads = 50 * (n as u64 + 1);
        assert_eq!(scan.path, inputs[n]);
        assert_eq!(scan.stats, SeqStats { reads, bases: reads * 10, gc: reads * 6 });
        assert!(scan.peak_buffered <= 32);
    }
}

#[test]
fn test_scan_truncated_file() {
    let dir = tempfile::TempDir::new().unwrap();
    let good = dir.path().join("good.fq");
    let bad = dir.path().join("bad.fq");
    write_fastq(&good, "r", 1, 10, "ACGT");
    std::fs::write(&bad, "@r0\nACGT\n+\nIIII\n@r1\nACGT\n").unwrap();

    let opts = ScanOptions { inputs: vec![good, bad], threads: 2, depth: 4, keep_going: false, cancel: None };
    let err = run_scan(&opts).unwrap_err();
    let message = format!("{err:#}");
    assert!(message.contains("bad.fq"), "{message}");
    assert!(message.contains("truncated record 2"), "{message}");
}

#[test]
fn test_scan_keep_going_past_truncated_file() {
    let dir = tempfile::TempDir::new().unwrap();
    let first = dir.path().join("first.fq");
    let bad = dir.path().join("bad.fq");
    let last = dir.path().join("last.fq");
    write_fastq(&first, "r", 1, 10, "ACGT");
    std::fs::write(&bad, "@r0\nACGT\n+\nIIII\n@r1\nACGT\n").unwrap();
    write_fastq(&last, "r", 1, 20, "GGGG");

    let opts = ScanOptions {
        inputs: vec![first.clone(), bad.clone(), last.clone()],
        threads: 3,
        depth: 4,
        keep_going: true,
        cancel: None,
    };
    let report = run_scan(&opts).expect("keep-going scan should report failures, not fail");
    let scanned: Vec<(&PathBuf, u64)> =
        report.scans.iter().map(|scan| (&scan.path, scan.stats.reads)).collect();
    assert_eq!(scanned, vec![(&first, 10), (&last, 20)]);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].path, bad);
    assert!(report.failures[0].error.contains("truncated record 2"), "{}", report.failures[0].error);
}
