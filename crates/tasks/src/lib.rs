//! Task orchestration over an external compute service.
//!
//! A task is created `PENDING`, its job is submitted and correlated by the
//! external job id, and from then on two channels race to finish it: the
//! push listener's events and a per-job polling loop. Both feed the
//! [`reconciler::CompletionReconciler`], which applies at most one
//! terminal transition per task.

pub mod backend;
pub mod config;
pub mod poller;
pub mod progress;
pub mod reconciler;
pub mod registry;
pub mod service;
pub mod submission;
pub mod sweeper;
pub mod templates;
pub mod updates;
