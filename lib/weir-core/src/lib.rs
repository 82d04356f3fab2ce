//! Core aggregation engine for Weir.
//!
//! Weir consumes JSON messages from a broker, classifies them with
//! compiled expression programs, and folds the extracted measurements into
//! sliding windows of fixed-width buckets. A shared clock rolls every window
//! in lockstep, flushing the oldest bucket of each into a metric sink.
//!
//! This crate holds the engine itself: the data model, the namespace
//! catalog, the classification router, the window store, and the pipeline
//! tasks that tie them to a broker. Transport implementations (consumers,
//! sinks, state stores) live in `weir-io`.
#![deny(warnings)]
#![deny(missing_docs)]

pub mod broker;
pub mod catalog;
pub mod collections;
pub mod config;
pub mod data_model;
pub mod persist;
pub mod pipeline;
pub mod registry;
pub mod router;
pub mod sink;
pub mod store;
pub mod telemetry;

#[cfg(test)]
pub(crate) mod testing;
