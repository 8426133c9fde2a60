//! # opsdash_core
//!
//! Session and authorization lifecycle for the Opsdash operations dashboard.
//!
//! The [`auth`] module decides, at every moment, whether the visitor is
//! unauthenticated, mid credential reset, or fully authenticated with
//! permissions. The [`backend`] module talks to the managed identity backend.

pub mod auth;
pub mod backend;
pub mod models;

/// Returns the crate version.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
