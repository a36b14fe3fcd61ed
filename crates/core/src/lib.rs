/// Command line arguments, run configuration and logger setup.
pub mod config;

/// Per-socket request/response state machine.
mod connection;
pub use connection::{ConnectionError, Phase};

/// Run orchestration and aggregation of worker results.
pub mod coordinator;
pub use coordinator::{BenchError, Benchmark, StopHandle, Summary};

/// Concurrent latency and throughput histograms.
pub mod histogram;

/// Request construction and response parsing.
pub mod http;

/// Text and JSON reports.
pub mod report;

/// Error and traffic counters.
pub mod stats;

/// Tracing and logging infrastructure.
#[cfg_attr(test, allow(dead_code))]
pub mod tracing;

/// Non-blocking byte streams the connection state machine runs on.
pub mod transport;

/// SI, binary and time unit scanning and formatting.
pub mod units;

/// Target URL parsing.
pub mod url;

/// Event loop run by each worker thread.
mod worker;
