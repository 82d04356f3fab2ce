//! Transport and export surfaces for the aggregation engine.
//!
//! Ties the abstract capabilities in `weir-core` to concrete plumbing: broker
//! consumers over an in-memory queue or TCP, a Prometheus sink with its
//! scrape server, and file-backed window state persistence.
#![deny(warnings)]
#![deny(missing_docs)]

pub mod api;
pub mod consumers;
pub mod prometheus;
pub mod state;
