// @zen-component: SES-IdentitySource
//
//! Seam to the external identity provider.

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::AuthError;
use crate::models::auth::{AuthEvent, ExtendedDetails, Session};

/// Identity provider as seen by the session controller.
///
/// Implementations own the session; the controller only mirrors it.
#[async_trait]
pub trait IdentitySource: Send + Sync {
    /// One-shot lookup of the current session.
    async fn current_session(&self) -> Result<Option<Session>, AuthError>;

    /// Long-lived stream of auth events. Dropping the receiver unsubscribes.
    ///
    /// Implementations may replay an `INITIAL_SESSION` event to each new
    /// subscriber.
    fn subscribe(&self) -> broadcast::Receiver<AuthEvent>;

    /// Profile, role and permissions for a user.
    ///
    /// `Ok(None)` means the backing record is missing. Application-level
    /// error payloads come back as `Err` and are treated as "details
    /// unavailable", never as a reason to deauthenticate.
    async fn fetch_extended_details(
        &self,
        user_id: &str,
    ) -> Result<Option<ExtendedDetails>, AuthError>;

    /// Ask the provider to end the session. The provider is expected to
    /// follow up with a `SIGNED_OUT` event.
    async fn invalidate_session(&self) -> Result<(), AuthError>;
}
