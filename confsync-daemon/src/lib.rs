//! Scheduler runtimes: interval polling and backend watch.

mod error;
pub mod processor;

pub use error::DaemonError;
pub use processor::{
    error_channel, IntervalProcessor, ResourceFailure, WatchProcessor, ERROR_QUEUE_DEPTH,
};
