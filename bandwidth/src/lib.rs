//! Bandwidth probing and the measurement log it feeds.
//!
//! - [`MeasurementStore`] keeps measurements in a plain text file, one per line, and
//!   drops records older than the retention window whenever something new is written.
//! - [`HttpDownloadTest`] downloads a resource and records the observed throughput.
//! - [`ProbeScheduler`] drives a [`DownloadTest`] at a fixed delay.

#[macro_use]
extern crate tracing;

mod measurement;
pub mod probe;
pub mod scheduler;
pub mod store;

pub use measurement::{
    sanitize_note,
    Measurement,
};
pub use probe::{
    DownloadTest,
    HttpDownloadTest,
    ProbeError,
};
pub use scheduler::{
    ProbeScheduler,
    SchedulerError,
    SchedulerPhase,
    SchedulerStatus,
};
pub use store::{
    MeasurementStore,
    StoreError,
};
