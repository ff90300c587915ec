//! Speed test server library

pub mod audit;
pub mod config;
pub mod locator;
pub mod metrics;
pub mod payload;
pub mod redact;
pub mod server;
pub mod storage;
