//! Domain building blocks shared by the stylize crates.
//!
//! Nothing in here performs I/O: task records and their state machine,
//! job-graph parsing and template instantiation, style presets, the
//! backoff policy, and the message-type constants used for task update
//! fan-out.

pub mod backoff;
pub mod error;
pub mod job_events;
pub mod style;
pub mod task;
pub mod types;
pub mod workflow;
