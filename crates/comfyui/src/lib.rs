//! ComfyUI WebSocket and REST client library.
//!
//! Provides the HTTP API wrapper (upload, submit, history, artifact
//! download), typed push-message parsing, the long-lived push-channel
//! listener with reconnection, and normalisation of the several output
//! shapes ComfyUI has used across versions.

pub mod api;
pub mod client;
pub mod events;
pub mod history;
pub mod listener;
pub mod messages;
pub mod outputs;
pub mod reconnect;
