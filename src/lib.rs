//! # Chain Executor
//!
//! Executes calls through a deterministic smart wallet across many EVM chains: one cached client
//! per chain, fees estimated for each chain's transaction types, and submissions driven to
//! inclusion with bounded fee bumps.

pub mod builder;
pub mod cache;
pub mod chains;
pub mod cli;
pub mod config;
pub mod constants;
pub mod driver;
pub mod error;
pub mod executor;
pub mod fees;
pub mod metrics;
pub mod nonce;
pub mod serde;
pub mod signers;
pub mod transport;
pub mod wallet;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use executor::{ExecuteOptions, ExecutionMode, Executor};
