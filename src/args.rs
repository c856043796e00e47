// Command-line argument parsing
use crate::merger::DEFAULT_QUEUE_CAPACITY;
use crate::utils::num_cpus;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "seqpipe", about = "Bounded parallel FASTQ pipelines (Rust)")]
pub struct Args {
    #[arg(short = 't', long, global = true, default_value_t = num_cpus())]
    pub threads: usize,
    /// Force single-threaded mode (useful for Windows or I/O-bound workloads)
    #[arg(long, global = true)]
    pub single_threaded: bool,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Walk two mate files in lock-step and check that they pair up
    Pairs {
        #[arg(long)]
        r1: PathBuf,
        #[arg(long)]
        r2: PathBuf,
        /// Chunks buffered per mate file
        #[arg(long, default_value_t = DEFAULT_QUEUE_CAPACITY)]
        queue_capacity: usize,
        /// Fail on the first pair whose read names disagree
        #[arg(long)]
        strict: bool,
    },
    /// Per-file read, base and GC counts, one worker per file
    Scan {
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
        /// Records read ahead of each worker
        #[arg(long, default_value_t = 1024)]
        depth: usize,
        /// Scan every file even after one fails; failed files are listed and the exit status is non-zero
        #[arg(long)]
        keep_going: bool,
    },
}

/// Get effective thread count based on args and platform
#[inline]
pub fn effective_threads(args: &Args) -> usize {
    if args.single_threaded {
        1
    } else {
        args.threads.max(1)
    }
}
