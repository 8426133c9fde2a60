// @zen-component: BKD-HttpIdentitySource
//
//! [`IdentitySource`] over the managed backend's HTTP API.
//!
//! The backend is stateless from our point of view: this type holds the
//! current [`Session`] in memory and turns each successful auth call into an
//! [`AuthEvent`] on its broadcast channel, the way the provider's own client
//! library would.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::config::BackendConfig;
use crate::auth::recovery::{fragment_pairs, parse_location};
use crate::auth::{AuthError, IdentitySource};
use crate::models::auth::{AuthEvent, AuthEventKind, ExtendedDetails, Session, User};

const EVENT_CAPACITY: usize = 32;

#[derive(Serialize)]
struct PasswordGrant<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Serialize)]
struct RefreshGrant<'a> {
    refresh_token: &'a str,
}

#[derive(Serialize)]
struct PasswordUpdate<'a> {
    password: &'a str,
}

#[derive(Serialize)]
struct DetailsArgs<'a> {
    p_user_id: &'a str,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    expires_at: Option<i64>,
    user: User,
}

impl TokenResponse {
    fn into_session(self, now: DateTime<Utc>) -> Session {
        let expires_at = expiry(self.expires_at, self.expires_in, now);
        Session {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            token_type: self.token_type.unwrap_or_else(|| "bearer".to_string()),
            expires_at,
            user: self.user,
        }
    }
}

/// Absolute expiry wins over a relative lifetime.
fn expiry(at: Option<i64>, lifetime: Option<i64>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    at.and_then(|secs| DateTime::from_timestamp(secs, 0)).or_else(|| {
        lifetime
            .and_then(ChronoDuration::try_seconds)
            .and_then(|d| now.checked_add_signed(d))
    })
}

/// Identity source backed by the managed backend's REST endpoints.
pub struct HttpIdentitySource {
    client: Client,
    config: BackendConfig,
    session: Mutex<Option<Session>>,
    events: broadcast::Sender<AuthEvent>,
}

impl HttpIdentitySource {
    pub fn new(config: BackendConfig) -> Self {
        Self::with_client(config, Client::new())
    }

    pub fn with_client(config: BackendConfig, client: Client) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            client,
            config,
            session: Mutex::new(None),
            events,
        }
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// The cached session, without contacting the backend.
    pub fn session(&self) -> Option<Session> {
        match self.session.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Seed the cache from a persisted session. Emits nothing.
    pub fn restore_session(&self, session: Option<Session>) {
        self.store(session);
    }

    /// `POST /auth/v1/token?grant_type=password`, then `SIGNED_IN`.
    pub async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Session, AuthError> {
        let resp = self
            .request(Method::POST, "auth/v1/token", None)?
            .query(&[("grant_type", "password")])
            .json(&PasswordGrant { email, password })
            .send()
            .await?;
        let session = self.accept_tokens(resp).await?;
        info!(user_id = %session.user.id, "signed in with password");
        self.emit(AuthEventKind::SignedIn, Some(session.clone()));
        Ok(session)
    }

    /// `POST /auth/v1/token?grant_type=refresh_token`, then `TOKEN_REFRESHED`.
    pub async fn refresh_session(&self) -> Result<Session, AuthError> {
        let current = self
            .session()
            .ok_or_else(|| AuthError::Unauthorized("no session to refresh".to_string()))?;
        let resp = self
            .request(Method::POST, "auth/v1/token", None)?
            .query(&[("grant_type", "refresh_token")])
            .json(&RefreshGrant {
                refresh_token: &current.refresh_token,
            })
            .send()
            .await?;
        let session = self.accept_tokens(resp).await?;
        debug!(user_id = %session.user.id, "session refreshed");
        self.emit(AuthEventKind::TokenRefreshed, Some(session.clone()));
        Ok(session)
    }

    /// `PUT /auth/v1/user` with a new password, then `USER_UPDATED`.
    pub async fn update_password(&self, password: &str) -> Result<User, AuthError> {
        let current = self
            .session()
            .ok_or_else(|| AuthError::Unauthorized("no session to update".to_string()))?;
        let resp = self
            .request(Method::PUT, "auth/v1/user", Some(&current.access_token))?
            .json(&PasswordUpdate { password })
            .send()
            .await?;
        let user: User = ensure_success(resp).await?.json().await?;

        let session = Session {
            user: user.clone(),
            ..current
        };
        self.store(Some(session.clone()));
        info!(user_id = %user.id, "password updated");
        self.emit(AuthEventKind::UserUpdated, Some(session));
        Ok(user)
    }

    /// Take over the session carried by a recovery or invite link.
    ///
    /// Returns `Ok(None)` when the URL carries no token pair. The tokens are
    /// verified against `GET /auth/v1/user` before being trusted. Emits
    /// `PASSWORD_RECOVERY` for `type=recovery`, otherwise `SIGNED_IN`.
    pub async fn session_from_url(&self, page_url: &str) -> Result<Option<Session>, AuthError> {
        let Some(url) = parse_location(page_url) else {
            return Ok(None);
        };
        let pairs: Vec<(String, String)> = fragment_pairs(&url)
            .into_iter()
            .chain(url.query_pairs().into_owned())
            .collect();
        let get = |key: &str| {
            pairs
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str())
        };

        if let Some(description) = get("error_description").or_else(|| get("error")) {
            return Err(AuthError::Remote(description.to_string()));
        }
        let (Some(access_token), Some(refresh_token)) = (get("access_token"), get("refresh_token"))
        else {
            return Ok(None);
        };

        let user = self
            .fetch_user(access_token)
            .await?
            .ok_or_else(|| AuthError::Unauthorized("link tokens rejected".to_string()))?;

        let number = |key: &str| get(key).and_then(|v| v.parse::<i64>().ok());
        let session = Session {
            access_token: access_token.to_string(),
            refresh_token: refresh_token.to_string(),
            token_type: get("token_type").unwrap_or("bearer").to_string(),
            expires_at: expiry(number("expires_at"), number("expires_in"), Utc::now()),
            user,
        };
        self.store(Some(session.clone()));

        let kind = if get("type") == Some("recovery") {
            AuthEventKind::PasswordRecovery
        } else {
            AuthEventKind::SignedIn
        };
        info!(user_id = %session.user.id, kind = %kind, "session taken from link");
        self.emit(kind, Some(session.clone()));
        Ok(Some(session))
    }

    fn store(&self, session: Option<Session>) {
        match self.session.lock() {
            Ok(mut guard) => *guard = session,
            Err(poisoned) => *poisoned.into_inner() = session,
        }
    }

    fn emit(&self, kind: AuthEventKind, session: Option<Session>) {
        // No receivers is fine; nobody is listening yet.
        let _ = self.events.send(AuthEvent::new(kind, session));
    }

    /// Every call carries `apikey`; the bearer is the user's token when
    /// signed in, the anon key otherwise.
    fn request(
        &self,
        method: Method,
        path: &str,
        access_token: Option<&str>,
    ) -> Result<RequestBuilder, AuthError> {
        let url = self.config.endpoint(path)?;
        Ok(self
            .client
            .request(method, url)
            .header("apikey", self.config.anon_key.as_str())
            .bearer_auth(access_token.unwrap_or(self.config.anon_key.as_str())))
    }

    async fn accept_tokens(&self, resp: Response) -> Result<Session, AuthError> {
        let tokens: TokenResponse = ensure_success(resp).await?.json().await?;
        let session = tokens.into_session(Utc::now());
        self.store(Some(session.clone()));
        Ok(session)
    }

    async fn logout(&self, access_token: &str) -> Result<(), AuthError> {
        let resp = self
            .request(Method::POST, "auth/v1/logout", Some(access_token))?
            .send()
            .await?;
        ensure_success(resp).await.map(|_| ())
    }

    /// `GET /auth/v1/user`. `Ok(None)` when the token is rejected.
    async fn fetch_user(&self, access_token: &str) -> Result<Option<User>, AuthError> {
        let resp = self
            .request(Method::GET, "auth/v1/user", Some(access_token))?
            .send()
            .await?;
        match ensure_success(resp).await {
            Ok(resp) => Ok(Some(resp.json().await?)),
            Err(AuthError::Unauthorized(msg)) => {
                debug!(reason = %msg, "access token rejected");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl IdentitySource for HttpIdentitySource {
    async fn current_session(&self) -> Result<Option<Session>, AuthError> {
        let Some(cached) = self.session() else {
            return Ok(None);
        };
        match self.fetch_user(&cached.access_token).await? {
            Some(user) => {
                let session = Session { user, ..cached };
                self.store(Some(session.clone()));
                Ok(Some(session))
            }
            None => {
                info!(user_id = %cached.user.id, "cached session no longer valid");
                self.store(None);
                Ok(None)
            }
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        let rx = self.events.subscribe();
        self.emit(AuthEventKind::InitialSession, self.session());
        rx
    }

    async fn fetch_extended_details(
        &self,
        user_id: &str,
    ) -> Result<Option<ExtendedDetails>, AuthError> {
        let token = self.session().map(|s| s.access_token);
        let path = format!("rest/v1/rpc/{}", self.config.details_rpc);
        let resp = self
            .request(Method::POST, &path, token.as_deref())?
            .json(&DetailsArgs { p_user_id: user_id })
            .send()
            .await?;
        let body: Value = ensure_success(resp).await?.json().await?;
        decode_details(body)
    }

    async fn invalidate_session(&self) -> Result<(), AuthError> {
        let taken = match self.session.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };

        let remote = match &taken {
            Some(session) => {
                let result = self.logout(&session.access_token).await;
                if let Err(e) = &result {
                    warn!(user_id = %session.user.id, error = %e, "remote logout failed, signing out locally");
                }
                result
            }
            None => Ok(()),
        };

        self.emit(AuthEventKind::SignedOut, None);
        remote
    }
}

/// Turn the details RPC payload into [`ExtendedDetails`].
///
/// `null` (or an empty set) means no record; an object with an `error` key is
/// an application-level failure.
fn decode_details(body: Value) -> Result<Option<ExtendedDetails>, AuthError> {
    let row = match body {
        Value::Null => return Ok(None),
        Value::Array(rows) => match rows.into_iter().next() {
            Some(row) => row,
            None => return Ok(None),
        },
        other => other,
    };
    if let Some(error) = row.get("error").filter(|e| !e.is_null()) {
        let message = error
            .as_str()
            .map(str::to_owned)
            .unwrap_or_else(|| error.to_string());
        return Err(AuthError::Remote(message));
    }
    serde_json::from_value(row)
        .map(Some)
        .map_err(|e| AuthError::Decode(format!("extended details: {e}")))
}

/// Map non-2xx responses to [`AuthError`], pulling the backend's message out
/// of the body when there is one.
async fn ensure_success(resp: Response) -> Result<Response, AuthError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_else(|_| "<no body>".to_string());
    let message = error_message(&body).unwrap_or_else(|| format!("HTTP {status}"));
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(AuthError::Unauthorized(message)),
        _ => Err(AuthError::Remote(message)),
    }
}

fn error_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    ["error_description", "msg", "message", "error"]
        .iter()
        .find_map(|key| value.get(key).and_then(Value::as_str).map(str::to_owned))
}
