//! mjproxy - a multi-account proxy for Midjourney's Discord bots
//!
//! This crate provides the scheduling core of the proxy, including:
//! - Per-account gateway clients (identify/resume, heartbeat, reconnect)
//! - Per-account task executors with queueing, pacing and quotas
//! - A global account selector with four policies
//! - The task state machine with callback emission
//! - An embedded SQLite store for accounts, tasks and counters

pub mod account;
pub mod api;
pub mod config;
pub mod error;
pub mod gateway;
pub mod notify;
pub mod screen;
pub mod store;
pub mod task;
pub mod transport;
pub mod utils;

pub use config::Setting;
pub use error::{ProxyError, Result};
