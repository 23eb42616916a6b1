//! The control-plane client: credential resolution, wire types, and the
//! list/watch HTTP client. Grounded on `collector.go` and `client_config.go`.

pub mod auth;
pub mod client;
pub mod types;
