//! Streaming download of a source URL into the staging directory
//!
//! The body is written through a large buffer so high-throughput links do not
//! turn into one syscall per network chunk, and progress is reported on a
//! fixed wall-clock interval rather than per chunk.

mod worker;

pub use worker::{DownloadedFile, StreamingDownloader};
