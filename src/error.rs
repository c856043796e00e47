//! Error types for pipeline invocations.

use std::fmt;
use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// One of the two inputs of a paired merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamSide {
    A,
    B,
}

impl StreamSide {
    /// The other stream of the pair.
    #[must_use]
    pub fn other(self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }
}

impl fmt::Display for StreamSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::A => write!(f, "A"),
            Self::B => write!(f, "B"),
        }
    }
}

/// The terminal error of a pipeline invocation.
///
/// Only the first error raised inside an invocation is surfaced; later ones are logged.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A caller-supplied callback failed or panicked
    #[error("{context}: {source:#}")]
    Worker {
        /// Where the callback was running (worker id, index, role)
        context: String,
        /// The callback's error
        source: anyhow::Error,
    },

    /// The paired streams hold a different number of chunks
    #[error(
        "stream {longer} has more chunks than stream {} (streams diverge after {pairs} aligned pairs)",
        longer.other()
    )]
    StreamMisalignment {
        /// Number of positions present in both streams
        pairs: u64,
        /// The stream that still had chunks when the other ended
        longer: StreamSide,
    },

    /// The invocation was cancelled by its owner or an external token
    #[error("pipeline cancelled")]
    Cancelled,

    /// Releasing an owned resource during shutdown failed
    #[error("failed to release {resource}: {source:#}")]
    ResourceClose {
        /// Name of the resource being released
        resource: String,
        /// The release error
        source: anyhow::Error,
    },

    /// The upstream of a prefetch buffer failed to produce an item
    #[error("upstream failed: {0:#}")]
    Upstream(anyhow::Error),

    /// Reading lines from one of the paired streams failed
    #[error("failed to read stream {stream}: {source}")]
    Scan {
        /// The stream being read
        stream: StreamSide,
        /// The underlying I/O error
        source: std::io::Error,
    },

    /// A paired stream ended in the middle of a chunk
    #[error("stream {stream} ended with a partial chunk of {lines} lines (expected {chunk_size})")]
    TruncatedChunk {
        /// The stream that ended early
        stream: StreamSide,
        /// Lines present in the partial chunk
        lines: usize,
        /// Configured lines per chunk
        chunk_size: usize,
    },

    /// The OS refused to start a pipeline thread
    #[error("failed to spawn thread '{name}': {source}")]
    Spawn {
        /// Name of the thread
        name: String,
        /// The spawn error
        source: std::io::Error,
    },
}

impl PipelineError {
    /// Wrap a callback failure with a description of where it happened.
    pub fn worker(context: impl Into<String>, source: anyhow::Error) -> Self {
        Self::Worker { context: context.into(), source }
    }

    /// True for the error recorded when an invocation is cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_misalignment_message_names_both_streams() {
        let error = PipelineError::StreamMisalignment { pairs: 5, longer: StreamSide::B };
        let msg = format!("{error}");
        assert!(msg.contains("stream B has more chunks than stream A"));
        assert!(msg.contains("after 5 aligned pairs"));
    }

    #[test]
    fn test_worker_message_includes_context_and_cause() {
        let error = PipelineError::worker("worker 3 at index 17", anyhow::anyhow!("boom"));
        assert_eq!(format!("{error}"), "worker 3 at index 17: boom");
    }

    #[test]
    fn test_truncated_chunk_message() {
        let error =
            PipelineError::TruncatedChunk { stream: StreamSide::A, lines: 3, chunk_size: 4 };
        let msg = format!("{error}");
        assert!(msg.contains("stream A"));
        assert!(msg.contains("3 lines (expected 4)"));
    }

    #[test]
    fn test_is_cancelled() {
        assert!(PipelineError::Cancelled.is_cancelled());
        assert!(!PipelineError::Upstream(anyhow::anyhow!("x")).is_cancelled());
    }
}
