//! Integration tests for the seqpipe library.
//!
//! These tests drive the pipelines through the public API and combine them the way the
//! `seqpipe` commands do.

mod helpers;
mod test_commands;
mod test_pipeline_concurrency;
