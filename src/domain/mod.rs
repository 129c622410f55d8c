//! Domain Module
//!
//! Identities, events and the cluster port shared by every component.

pub mod ports;

pub use ports::*;
