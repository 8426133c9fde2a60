//! Authentication domain models.
//!
//! `Session` and `User` mirror what the identity provider issues. The
//! controller only ever holds read-only copies of them. `ExtendedDetails` is
//! what the backend returns for a user id; the permission map inside it is
//! opaque to this crate.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Principal record attached to a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: Option<String>,
    pub phone: Option<String>,
}

/// Token bundle issued by the identity provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    /// Absolute expiry (unix seconds on the wire).
    #[serde(default, with = "chrono::serde::ts_seconds_option")]
    pub expires_at: Option<DateTime<Utc>>,
    pub user: User,
}

fn default_token_type() -> String {
    "bearer".to_string()
}

impl Session {
    /// Whether the access token has passed its expiry at `now`.
    ///
    /// Sessions without an expiry never report as expired.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Profile row for a user. Fields beyond the common ones are kept verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    pub full_name: Option<String>,
    pub email: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Permission-key → granted map. Absent keys are denied.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Permissions(HashMap<String, bool>);

impl Permissions {
    pub fn new(map: HashMap<String, bool>) -> Self {
        Self(map)
    }

    /// `true` only for keys explicitly granted.
    pub fn allows(&self, key: &str) -> bool {
        self.0.get(key).copied().unwrap_or(false)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl<K: Into<String>> FromIterator<(K, bool)> for Permissions {
    fn from_iter<I: IntoIterator<Item = (K, bool)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

/// Profile, role and permissions fetched separately from the session.
///
/// `Default` is the "details unavailable" value the controller degrades to.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtendedDetails {
    #[serde(default)]
    pub profile: Option<Profile>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub permissions: Permissions,
}

/// Kind of notification emitted by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum AuthEventKind {
    InitialSession,
    SignedIn,
    SignedOut,
    PasswordRecovery,
    UserUpdated,
    TokenRefreshed,
    /// Anything this crate does not know about yet.
    Other(String),
}

impl AuthEventKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::InitialSession => "INITIAL_SESSION",
            Self::SignedIn => "SIGNED_IN",
            Self::SignedOut => "SIGNED_OUT",
            Self::PasswordRecovery => "PASSWORD_RECOVERY",
            Self::UserUpdated => "USER_UPDATED",
            Self::TokenRefreshed => "TOKEN_REFRESHED",
            Self::Other(s) => s,
        }
    }
}

impl fmt::Display for AuthEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuthEventKind {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from(s.to_string()))
    }
}

impl From<String> for AuthEventKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "INITIAL_SESSION" => Self::InitialSession,
            "SIGNED_IN" => Self::SignedIn,
            "SIGNED_OUT" => Self::SignedOut,
            "PASSWORD_RECOVERY" => Self::PasswordRecovery,
            "USER_UPDATED" => Self::UserUpdated,
            "TOKEN_REFRESHED" => Self::TokenRefreshed,
            _ => Self::Other(s),
        }
    }
}

impl From<AuthEventKind> for String {
    fn from(kind: AuthEventKind) -> Self {
        kind.as_str().to_string()
    }
}

/// One notification from the identity provider, carrying its view of the
/// session at the time it was emitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthEvent {
    pub kind: AuthEventKind,
    pub session: Option<Session>,
}

impl AuthEvent {
    pub fn new(kind: AuthEventKind, session: Option<Session>) -> Self {
        Self { kind, session }
    }

    pub fn user(&self) -> Option<&User> {
        self.session.as_ref().map(|s| &s.user)
    }
}
