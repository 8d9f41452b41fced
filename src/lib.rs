//! Metrics agent and collector.
//!
//! The agent samples process and system metrics on a schedule and delivers
//! them in batches to the collector, which keeps the current value of every
//! metric in memory, in a write-ahead file or in SQLite.

pub mod agent;
pub mod codec;
pub mod config;
pub mod export;
pub mod metric;
pub mod retry;
pub mod scheduler;
pub mod server;
pub mod shutdown;
pub mod storage;
