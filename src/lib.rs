//! StrasBoard Library
//!
//! Freshness-aware response cache and concurrent aggregator behind the
//! dashboard API. The binary wires these modules to an HTTP server; the
//! library form exists for integration tests.

pub mod aggregator;
pub mod cache;
pub mod cli;
pub mod clock;
pub mod data;
pub mod freshness;
pub mod server;
