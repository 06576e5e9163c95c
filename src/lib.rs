//! Monthly test-result grading and snapshot service.
//!
//! The store keeps one meta record and a set of product rows per
//! (year, month) period. A period can be locked once, which freezes its rows.
//! The `resultsd` binary serves the store over JSON lines on stdin/stdout.

pub mod autosave;
pub mod config;
pub mod db;
pub mod error;
pub mod grading;
pub mod ipc;
pub mod period;
pub mod results;
pub mod snapshot;
pub mod snapshot_export;

pub use error::{Result, ResultsError};
pub use period::Period;
