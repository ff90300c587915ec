//! Shared types and utilities for the speedtest backend
//!
//! This crate holds the telemetry data model, the IP lookup wire types and the
//! great-circle math used by the server when annotating client addresses.

pub mod geo;
pub mod types;

// Re-export commonly used types
pub use geo::{Coordinate, CoordinateError, DistanceUnit};
pub use types::{ipinfo::*, telemetry::*};
