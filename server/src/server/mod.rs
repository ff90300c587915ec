//! HTTP surfaces: the data plane for test clients and the admin endpoint

pub mod api;
pub mod auth;
pub mod http;
pub mod results;

pub use api::{serve_api, ApiState};
pub use http::serve_admin;
