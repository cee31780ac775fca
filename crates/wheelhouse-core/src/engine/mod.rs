//! Download engine
//!
//! A bounded worker pool of single-stream artifact transfers, each one a
//! small state machine with cooperative cancellation and retry.

mod download_task;
mod manager;

pub use download_task::DownloadJob;
pub use manager::*;
