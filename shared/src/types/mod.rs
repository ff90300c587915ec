//! Core data types

pub mod ipinfo;
pub mod telemetry;
