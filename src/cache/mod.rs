//! In-memory response cache
//!
//! This module provides the cache that sits between the HTTP surface and the
//! sources. Each key keeps the latest response plus a separately expiring
//! backup of the latest success, so that stale-but-valid data can still be
//! served, with the fresh error attached, while an upstream is failing.

mod manager;

pub use manager::ResponseCache;
