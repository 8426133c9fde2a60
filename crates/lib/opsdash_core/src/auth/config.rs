// @zen-component: SES-ControllerConfig
//
//! Timing configuration for the session controller.

use std::env;
use std::time::Duration;

/// Default watchdog delay: 5 seconds.
pub const DEFAULT_WATCHDOG_MS: u64 = 5_000;

/// Default delay before stripping tokens from the URL: 1.5 seconds.
///
/// Must stay above one second so the identity provider has read the URL first.
pub const DEFAULT_URL_CLEANUP_GRACE_MS: u64 = 1_500;

/// Default pause between a completed password update and the details fetch.
pub const DEFAULT_PASSWORD_SET_GRACE_MS: u64 = 500;

/// Timing knobs for [`SessionController`](super::SessionController).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// How long after an event a stuck in-flight flag is force-cleared.
    pub watchdog: Duration,
    /// Delay before the page URL is stripped of auth material.
    pub url_cleanup_grace: Duration,
    /// Pause after `USER_UPDATED` in the password-set stage before fetching
    /// details, so the UI can show its success state.
    pub password_set_grace: Duration,
}

impl ControllerConfig {
    /// Read overrides from the environment, falling back to defaults.
    ///
    /// | Variable                         | Default |
    /// |----------------------------------|---------|
    /// | `OPSDASH_WATCHDOG_MS`            | `5000`  |
    /// | `OPSDASH_URL_CLEANUP_GRACE_MS`   | `1500`  |
    /// | `OPSDASH_PASSWORD_SET_GRACE_MS`  | `500`   |
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unparseable values fall back to the
    /// default for that key.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let millis = |key: &str, default: u64| {
            let ms = lookup(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .unwrap_or(default);
            Duration::from_millis(ms)
        };

        let url_cleanup_grace = millis("OPSDASH_URL_CLEANUP_GRACE_MS", DEFAULT_URL_CLEANUP_GRACE_MS)
            .max(Duration::from_secs(1));

        Self {
            watchdog: millis("OPSDASH_WATCHDOG_MS", DEFAULT_WATCHDOG_MS),
            url_cleanup_grace,
            password_set_grace: millis("OPSDASH_PASSWORD_SET_GRACE_MS", DEFAULT_PASSWORD_SET_GRACE_MS),
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            watchdog: Duration::from_millis(DEFAULT_WATCHDOG_MS),
            url_cleanup_grace: Duration::from_millis(DEFAULT_URL_CLEANUP_GRACE_MS),
            password_set_grace: Duration::from_millis(DEFAULT_PASSWORD_SET_GRACE_MS),
        }
    }
}
