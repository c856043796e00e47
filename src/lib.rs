//! seqpipe - Bounded parallel pipelines for sequencing data in Rust
//!
//! Three building blocks, each owning its threads and shutting them down before it
//! returns:
//!
//! - [`WorkSlicer`]: a fixed worker pool that hands out every index of a range exactly once
//! - [`PrefetchBuffer`]: a background reader kept between a low and a high watermark
//! - [`PairedStreamMerger`]: two line streams cut into chunks and processed pair by pair
//!
//! All three stop on the first failure, report only that failure, and honour an
//! optional external [`CancellationToken`].
//!
//! # Example
//!
//! ```
//! use seqpipe::{MergerConfig, PairedStreamMerger};
//! use std::io::Cursor;
//!
//! let a = Cursor::new("@r1/1\nACGT\n+\nIIII\n");
//! let b = Cursor::new("@r1/2\nTTGA\n+\nIIII\n");
//! let merger = PairedStreamMerger::new(MergerConfig::new().with_consumers(2));
//! let summary = merger.run(a, b, |pair| {
//!     assert_eq!(pair.a.ordinal(), pair.b.ordinal());
//!     Ok(())
//! })?;
//! assert_eq!(summary.pairs, 1);
//! # Ok::<(), seqpipe::PipelineError>(())
//! ```

pub mod args;
pub mod cancel;
pub mod commands;
pub mod error;
pub mod fastq;
pub mod io;
pub mod merger;
pub mod prefetch;
pub mod progress;
pub mod slicer;
pub mod utils;

// Re-export commonly used items
pub use cancel::CancellationToken;
pub use error::{PipelineError, Result, StreamSide};
pub use merger::{
    MergeHandle, MergeSummary, MergerConfig, PairHandle, PairedStreamMerger, RecordChunk,
};
pub use prefetch::{IterUpstream, PrefetchBuffer, PrefetchConfig, Upstream};
pub use progress::{AtomicProgress, LoggingProgress, ProgressSink};
pub use slicer::{IterationRange, SliceHandle, SlicerConfig, WorkSlicer};
