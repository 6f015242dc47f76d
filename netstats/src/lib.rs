//! Per-app and per-interface network traffic accounting with SIM billing
//! cycles and quota alerts.

pub mod accumulator;
pub mod adapters;
pub mod api;
pub mod cache;
pub mod callbacks;
pub mod classifier;
pub mod config;
pub mod delta;
pub mod error;
pub mod model;
pub mod persistence;
pub mod ports;
pub mod quota;
pub mod scheduler;
pub mod service;
pub mod sharing;
pub mod telemetry;

#[cfg(test)]
mod testing;

pub use error::{Result, StatsError};
pub use service::{Caller, NetStatsService};
