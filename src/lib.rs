//! Custody Withdrawer - Library interface
//!
//! Re-exports internal modules for use in integration tests.

pub mod api;
pub mod config;
pub mod db;
pub mod metrics;
pub mod rpc;
pub mod types;
pub mod withdraw;
