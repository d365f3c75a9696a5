#![warn(rust_2018_idioms)]

pub mod cancel;
pub mod client;
pub mod compress;
pub mod config;
pub mod error;
pub mod retry;
pub mod serialize;
pub mod stats;
pub mod transport;

// Re-export main types for easy access
pub use client::{HecClient, ShutdownSummary};
pub use config::{ConfigOverrides, HecConfig};
pub use error::{
    Cancelled, ClientError, CompressionError, ConfigError, FlushError, RetryError,
    SerializationError, TransportError,
};
pub use retry::backoff::WaitStrategy;
pub use retry::RetryOptions;
pub use serialize::{Event, EventBody, Fields, Metadata, Metric, MetricGroup, Record, Timestamp};
pub use stats::StatsReport;

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
