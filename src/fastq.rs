//! FASTQ record helpers shared by the `pairs` and `scan` commands.
//!
//! Records are always four lines: `@name comment`, sequence, `+`, qualities.

use crate::prefetch::Upstream;
use anyhow::{Context, Result, bail, ensure};
use bstr::{BString, ByteSlice};
use std::io::BufRead;

/// Lines per FASTQ record.
pub const LINES_PER_RECORD: usize = 4;

/// One FASTQ record. `gc` is filled in by a preprocessor, if one runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FastqRecord {
    pub header: BString,
    pub seq: BString,
    pub qual: BString,
    pub gc: Option<u64>,
}

impl FastqRecord {
    /// Build a record from its four lines, checking the markers and lengths.
    pub fn from_lines(lines: &[BString]) -> Result<Self> {
        ensure!(
            lines.len() == LINES_PER_RECORD,
            "expected {LINES_PER_RECORD} lines per record, got {}",
            lines.len()
        );
        let header = &lines[0];
        ensure!(header.starts_with(b"@"), "header line does not start with '@': {header}");
        ensure!(lines[2].starts_with(b"+"), "separator line does not start with '+': {}", lines[2]);
        ensure!(
            lines[1].len() == lines[3].len(),
            "sequence and quality lengths differ ({} vs {}) for {header}",
            lines[1].len(),
            lines[3].len()
        );
        Ok(Self { header: header.clone(), seq: lines[1].clone(), qual: lines[3].clone(), gc: None })
    }

    /// Normalised read name; see [`read_name`].
    pub fn name(&self) -> &[u8] {
        read_name(&self.header)
    }

    /// GC count, computing it if no preprocessor did.
    pub fn gc(&self) -> u64 {
        self.gc.unwrap_or_else(|| gc_count(&self.seq))
    }
}

/// Strip the `@`, any comment after the first whitespace, and a trailing `/1` or `/2`.
pub fn read_name(header: &[u8]) -> &[u8] {
    let name = header.strip_prefix(b"@").unwrap_or(header);
    let name = match name.find_byteset(b" \t") {
        Some(end) => &name[..end],
        None => name,
    };
    name.strip_suffix(b"/1").or_else(|| name.strip_suffix(b"/2")).unwrap_or(name)
}

/// Number of G/C bases, case-insensitive.
#[inline]
pub fn gc_count(seq: &[u8]) -> u64 {
    seq.iter().filter(|&&b| matches!(b, b'G' | b'C' | b'g' | b'c')).count() as u64
}

/// Running counts over a set of reads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeqStats {
    pub reads: u64,
    pub bases: u64,
    pub gc: u64,
}

impl SeqStats {
    pub fn add(&mut self, record: &FastqRecord) {
        self.reads += 1;
        self.bases += record.seq.len() as u64;
        self.gc += record.gc();
    }

    pub fn merge(&mut self, other: &SeqStats) {
        self.reads += other.reads;
        self.bases += other.bases;
        self.gc += other.gc;
    }

    /// GC fraction in percent, or 0 with no bases.
    pub fn gc_percent(&self) -> f64 {
        if self.bases == 0 { 0.0 } else { self.gc as f64 * 100.0 / self.bases as f64 }
    }
}

/// Reads consecutive four-line records from a `BufRead`.
pub struct FastqRecords<R> {
    reader: R,
    label: String,
    records: u64,
    buf: Vec<u8>,
}

impl<R: BufRead> FastqRecords<R> {
    /// `label` names the source in error messages.
    pub fn new(reader: R, label: impl Into<String>) -> Self {
        Self { reader, label: label.into(), records: 0, buf: Vec::with_capacity(256) }
    }

    /// Records returned so far.
    pub fn records(&self) -> u64 {
        self.records
    }

    fn read_line(&mut self) -> Result<Option<BString>> {
        self.buf.clear();
        let n = self
            .reader
            .read_until(b'\n', &mut self.buf)
            .with_context(|| format!("failed to read {}", self.label))?;
        if n == 0 {
            return Ok(None);
        }
        let line = self.buf.strip_suffix(b"\n").unwrap_or(&self.buf);
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        Ok(Some(BString::from(line)))
    }

    /// Read the next record, or `None` at a clean end of input.
    pub fn read_record(&mut self) -> Result<Option<FastqRecord>> {
        let mut lines = Vec::with_capacity(LINES_PER_RECORD);
        while lines.len() < LINES_PER_RECORD {
            match self.read_line()? {
                Some(line) => lines.push(line),
                None if lines.is_empty() => return Ok(None),
                None => bail!(
                    "{}: truncated record {} ({} of {LINES_PER_RECORD} lines)",
                    self.label,
                    self.records + 1,
                    lines.len()
                ),
            }
        }
        let record = FastqRecord::from_lines(&lines)
            .with_context(|| format!("{}: malformed record {}", self.label, self.records + 1))?;
        self.records += 1;
        Ok(Some(record))
    }
}

impl<R: BufRead + Send + 'static> Upstream for FastqRecords<R> {
    type Item = FastqRecord;

    fn next_item(&mut self) -> Result<Option<FastqRecord>> {
        self.read_record()
    }

    fn close(&mut self) -> Result<()> {
        log::debug!("closing {} after {} records", self.label, self.records);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn lines(text: &str) -> Vec<BString> {
        text.lines().map(BString::from).collect()
    }

    #[test]
    fn test_read_name_normalisation() {
        assert_eq!(read_name(b"@read1/1"), b"read1");
        assert_eq!(read_name(b"@read1/2 1:N:0:ACGT"), b"read1");
        assert_eq!(read_name(b"@read1 comment"), b"read1");
        assert_eq!(read_name(b"@read1\tx"), b"read1");
        assert_eq!(read_name(b"read/3"), b"read/3");
    }

    #[test]
    fn test_gc_count() {
        assert_eq!(gc_count(b"ACGTacgtNN"), 4);
        assert_eq!(gc_count(b""), 0);
    }

    #[test]
    fn test_from_lines_rejects_bad_markers() {
        assert!(FastqRecord::from_lines(&lines("r1\nACGT\n+\nIIII")).is_err());
        assert!(FastqRecord::from_lines(&lines("@r1\nACGT\n-\nIIII")).is_err());
        assert!(FastqRecord::from_lines(&lines("@r1\nACGT\n+\nIII")).is_err());
        let record = FastqRecord::from_lines(&lines("@r1/1\nACGG\n+\nIIII")).unwrap();
        assert_eq!(record.name(), b"r1");
        assert_eq!(record.gc(), 3);
    }

    #[test]
    fn test_records_reads_all() {
        let data = "@a\nAC\n+\nII\r\n@b\nGGG\n+\nIII\n";
        let mut records = FastqRecords::new(Cursor::new(data), "test");
        let first = records.read_record().unwrap().unwrap();
        assert_eq!(first.qual, "II");
        let second = records.read_record().unwrap().unwrap();
        assert_eq!(second.seq, "GGG");
        assert!(records.read_record().unwrap().is_none());
        assert_eq!(records.records(), 2);
    }

    #[test]
    fn test_records_truncated() {
        let mut records = FastqRecords::new(Cursor::new("@a\nAC\n+\nII\n@b\nGG\n"), "r.fq");
        records.read_record().unwrap();
        let err = records.read_record().unwrap_err();
        assert!(format!("{err}").contains("truncated record 2"));
    }

    #[test]
    fn test_seq_stats() {
        let mut stats = SeqStats::default();
        stats.add(&FastqRecord::from_lines(&lines("@a\nGCAT\n+\nIIII")).unwrap());
        let mut other = SeqStats::default();
        other.add(&FastqRecord::from_lines(&lines("@b\nAAAA\n+\nIIII")).unwrap());
        stats.merge(&other);
        assert_eq!(stats, SeqStats { reads: 2, bases: 8, gc: 2 });
        assert_eq!(stats.gc_percent(), 25.0);
        assert_eq!(SeqStats::default().gc_percent(), 0.0);
    }
}
