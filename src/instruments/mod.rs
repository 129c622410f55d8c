//! Instrument Registry Module
//!
//! Concurrency-safe store of every exported series, grouped by exporter.

pub mod registry;

pub use registry::*;
