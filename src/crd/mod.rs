//! Custom Resource Definitions for the Object Exporter
//!
//! - ObjectExporter: tracked resource identifier plus exported instruments

pub mod object_exporter;

pub use object_exporter::*;
