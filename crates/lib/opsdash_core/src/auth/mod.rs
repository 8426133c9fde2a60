//! Session and authorization lifecycle.
//!
//! - [`recovery`] classifies the page-load URL as a recovery/invite entry
//!   and cleans sensitive tokens out of it afterwards.
//! - [`reducer`] is the pure `(state, event) -> transition` table.
//! - [`source`] is the seam to the external identity provider.
//! - [`controller`] owns the authoritative stage and applies the reducer.

pub mod config;
pub mod controller;
pub mod recovery;
pub mod reducer;
pub mod source;

use thiserror::Error;

pub use config::ControllerConfig;
pub use controller::{AuthSnapshot, SessionController, SessionHandle};
pub use recovery::{Location, RecoveryIntent, classify_url};
pub use reducer::{AuthStage, BootstrapPhase};
pub use source::IdentitySource;

/// Authentication errors.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Location error: {0}")]
    Location(String),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<reqwest::Error> for AuthError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            AuthError::Decode(e.to_string())
        } else {
            AuthError::Transport(e.to_string())
        }
    }
}
