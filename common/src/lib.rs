//! Parallel ranged reads of remote objects
//!
//! The [`ParallelReader`] fetches an object as fixed-size parts over several concurrent range
//! requests and presents the result as one ordered [`tokio::io::AsyncRead`] stream. Storage
//! access goes through the [`client::StorageClient`] trait; process-wide request limits are
//! configured with [`ThrottleConfig`] and enforced by the `throttle` crate.

pub mod client;
pub mod config;
pub mod parallel_reader;
pub mod pool;
pub mod stats;
#[cfg(any(test, feature = "testutils"))]
pub mod testutils;

pub use config::{ReaderConfig, ThrottleConfig};
pub use parallel_reader::{Error, ParallelReader, ReaderHandle, reader_error};
pub use stats::Summary;
