// @zen-component: SES-RecoveryDetector
//
//! Page-load URL classification and token scrubbing.
//!
//! A password-recovery or invite link lands on the dashboard carrying the
//! provider's tokens in the URL fragment. [`classify_url`] recognises that
//! entry once at activation; [`schedule_url_cleanup`] removes the tokens from
//! the visible address after the provider has had time to read them.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;
use url::Url;

use super::AuthError;

/// Placeholder origin used to resolve bare `path?query#fragment` input.
const PLACEHOLDER_ORIGIN: &str = "http://localhost";

/// Fragment `type=` values that mark a credential-setting entry.
const RECOVERY_TYPES: &[&str] = &["recovery", "invite"];

/// Keys the identity provider may leave behind in the query or fragment.
const SENSITIVE_KEYS: &[&str] = &[
    "access_token",
    "refresh_token",
    "type",
    "token_hash",
    "code",
    "expires_in",
    "expires_at",
    "token_type",
    "error",
    "error_code",
    "error_description",
];

/// Whether the page load is a credential recovery / invite entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RecoveryIntent {
    #[default]
    None,
    Recovery,
}

impl RecoveryIntent {
    pub fn is_pending(self) -> bool {
        self == RecoveryIntent::Recovery
    }

    /// Consume the intent, leaving `None` behind for good.
    pub fn take(&mut self) -> RecoveryIntent {
        std::mem::take(self)
    }
}

/// Parse an absolute URL or a bare `path?query#fragment`.
pub(crate) fn parse_location(input: &str) -> Option<Url> {
    match Url::parse(input) {
        Ok(url) => Some(url),
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            Url::parse(PLACEHOLDER_ORIGIN).ok()?.join(input).ok()
        }
        Err(_) => None,
    }
}

pub(crate) fn fragment_pairs(url: &Url) -> Vec<(String, String)> {
    url.fragment()
        .map(|f| {
            url::form_urlencoded::parse(f.as_bytes())
                .into_owned()
                .collect()
        })
        .unwrap_or_default()
}

/// Classify a page URL (absolute, or `path?query#fragment`).
///
/// Recovery when the fragment carries `type=recovery` / `type=invite`, or
/// when both an access token and a refresh token are present anywhere in the
/// URL. Input that cannot be parsed classifies as [`RecoveryIntent::None`].
pub fn classify_url(input: &str) -> RecoveryIntent {
    let Some(url) = parse_location(input) else {
        return RecoveryIntent::None;
    };
    let fragment = fragment_pairs(&url);

    let typed_recovery = fragment
        .iter()
        .any(|(k, v)| k == "type" && RECOVERY_TYPES.contains(&v.as_str()));
    if typed_recovery {
        return RecoveryIntent::Recovery;
    }

    let has_key = |key: &str| {
        fragment.iter().any(|(k, _)| k == key) || url.query_pairs().any(|(k, _)| k == key)
    };
    if has_key("access_token") && has_key("refresh_token") {
        RecoveryIntent::Recovery
    } else {
        RecoveryIntent::None
    }
}

/// Whether the URL still shows auth material worth scrubbing.
pub fn has_sensitive_material(input: &str) -> bool {
    let Some(url) = parse_location(input) else {
        return false;
    };
    let in_fragment = fragment_pairs(&url)
        .iter()
        .any(|(k, _)| SENSITIVE_KEYS.contains(&k.as_str()));
    in_fragment
        || url
            .query_pairs()
            .any(|(k, _)| SENSITIVE_KEYS.contains(&&*k))
}

/// The path component alone.
pub fn bare_path(input: &str) -> String {
    match parse_location(input) {
        Some(url) => url.path().to_string(),
        None => input
            .split(['?', '#'])
            .next()
            .unwrap_or_default()
            .to_string(),
    }
}

/// The host's visible address (a browser's location + history API).
pub trait Location: Send + Sync {
    /// Full current URL.
    fn current(&self) -> String;

    /// Replace the visible URL without navigating.
    fn replace(&self, path: &str) -> Result<(), AuthError>;
}

/// Rewrite the visible URL to its bare path if it still shows auth material.
///
/// Returns whether a rewrite happened. Failures are cosmetic and swallowed.
pub fn clean_url(location: &dyn Location) -> bool {
    let current = location.current();
    if !has_sensitive_material(&current) {
        return false;
    }
    let path = bare_path(&current);
    match location.replace(&path) {
        Ok(()) => {
            debug!(path = %path, "stripped auth material from URL");
            true
        }
        Err(e) => {
            debug!(error = %e, "URL cleanup failed, ignoring");
            false
        }
    }
}

/// Run [`clean_url`] once after `grace` has elapsed.
pub fn schedule_url_cleanup(location: Arc<dyn Location>, grace: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(grace).await;
        clean_url(location.as_ref());
    })
}

/// In-process [`Location`] for hosts without an address bar (CLI, tests).
#[derive(Debug, Default)]
pub struct MemoryLocation {
    url: Mutex<String>,
}

impl MemoryLocation {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: Mutex::new(url.into()),
        }
    }
}

impl Location for MemoryLocation {
    fn current(&self) -> String {
        match self.url.lock() {
            Ok(url) => url.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn replace(&self, path: &str) -> Result<(), AuthError> {
        let mut url = self
            .url
            .lock()
            .map_err(|e| AuthError::Location(format!("location lock poisoned: {e}")))?;
        *url = path.to_string();
        Ok(())
    }
}
