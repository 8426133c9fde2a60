//! Managed identity backend (GoTrue-style auth plus a PostgREST RPC).

pub mod config;
pub mod http;

pub use config::BackendConfig;
pub use http::HttpIdentitySource;
