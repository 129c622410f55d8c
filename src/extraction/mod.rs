//! Field Extractor
//!
//! Evaluates compiled instruments against raw objects, producing a numeric
//! value and a label set per instrument and object.

pub mod extractor;
pub mod path;

pub use extractor::*;
pub use path::{FieldPath, PathSegment};
