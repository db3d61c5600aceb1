//! CoronaWatch - webhook notifications for COVID-19 case and stringency data.
//!
//! Clients register callback URLs for a country and a metric. A scheduler
//! fires them when their timeout elapses, fetching the latest value from the
//! upstream data sources, and fans out to `ON_CHANGE` subscribers whenever
//! the value moves.

pub mod api;
pub mod app;
pub mod cli;
pub mod config;
pub mod core;
pub mod corona;
pub mod internal_metrics;
pub mod notification;
pub mod store;
pub mod task_manager;

// Re-export core types for convenience
pub use core::*;
