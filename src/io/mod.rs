//! Input helpers
//!
//! Opens FASTQ inputs for the pipeline stages. `-` reads standard input.

use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// Read buffer size for input files
pub const READ_BUFFER_SIZE: usize = 1 << 20;

/// Boxed line source handed to pipeline threads
pub type InputReader = Box<dyn BufRead + Send>;

/// Open `path` for buffered reading
pub fn open_reader(path: &Path) -> Result<InputReader> {
    if path.as_os_str() == "-" {
        return Ok(Box::new(BufReader::with_capacity(READ_BUFFER_SIZE, std::io::stdin())));
    }
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    Ok(Box::new(BufReader::with_capacity(READ_BUFFER_SIZE, file)))
}

/// Short display name for a path, used as a log and error label
pub fn input_label(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
