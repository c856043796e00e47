//! Scratch FASTQ files for integration tests.

use std::io::Write;
use std::path::Path;
use tempfile::TempDir;

/// Write `count` records named `{prefix}{i}/{mate}` with a fixed sequence.
pub fn write_fastq(path: &Path, prefix: &str, mate: u8, count: usize, seq: &str) {
    let mut file = std::fs::File::create(path).expect("Failed to create FASTQ file");
    let qual = "I".repeat(seq.len());
    for i in 0..count {
        writeln!(file, "@{prefix}{i}/{mate} 1:N:0\n{seq}\n+\n{qual}").expect("Failed to write record");
    }
}

/// A temp dir holding `R1.fq` and `R2.fq` with `r1_count` and `r2_count` records.
pub fn mate_pair(r1_count: usize, r2_count: usize) -> TempDir {
    let dir = TempDir::new().expect("Failed to create temp dir");
    write_fastq(&dir.path().join("R1.fq"), "read", 1, r1_count, "ACGTGC");
    write_fastq(&dir.path().join("R2.fq"), "read", 2, r2_count, "TTGCAA");
    dir
}
