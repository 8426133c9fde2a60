// @zen-component: SES-ControllerTests

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, oneshot};

use super::*;
use crate::auth::recovery::MemoryLocation;
use crate::models::auth::{AuthEventKind, Permissions};

/// How the scripted source answers a details fetch.
#[derive(Clone)]
enum Reply {
    Found(ExtendedDetails),
    Missing,
    Fail,
    Hang,
    Delayed(Duration, ExtendedDetails),
}

/// In-memory identity provider driven by the test body.
struct ScriptedSource {
    events: broadcast::Sender<AuthEvent>,
    lookup: tokio::sync::Mutex<Option<oneshot::Receiver<Result<Option<Session>, AuthError>>>>,
    replies: Mutex<HashMap<String, Reply>>,
    detail_calls: AtomicUsize,
    invalidations: AtomicUsize,
    emit_signed_out: bool,
}

impl ScriptedSource {
    /// Source whose session lookup resolves when the returned sender fires.
    fn gated() -> (Arc<Self>, oneshot::Sender<Result<Option<Session>, AuthError>>) {
        let (tx, rx) = oneshot::channel();
        let (events, _) = broadcast::channel(16);
        let source = Arc::new(Self {
            events,
            lookup: tokio::sync::Mutex::new(Some(rx)),
            replies: Mutex::new(HashMap::new()),
            detail_calls: AtomicUsize::new(0),
            invalidations: AtomicUsize::new(0),
            emit_signed_out: true,
        });
        (source, tx)
    }

    /// Source whose session lookup resolves immediately.
    fn resolved(result: Result<Option<Session>, AuthError>) -> Arc<Self> {
        let (source, tx) = Self::gated();
        let _ = tx.send(result);
        source
    }

    fn reply(&self, user_id: &str, reply: Reply) {
        self.replies
            .lock()
            .unwrap()
            .insert(user_id.to_string(), reply);
    }

    fn emit(&self, kind: AuthEventKind, session: Option<Session>) {
        let _ = self.events.send(AuthEvent::new(kind, session));
    }

    fn detail_calls(&self) -> usize {
        self.detail_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IdentitySource for ScriptedSource {
    async fn current_session(&self) -> Result<Option<Session>, AuthError> {
        let rx = self.lookup.lock().await.take();
        match rx {
            Some(rx) => rx
                .await
                .unwrap_or_else(|_| Err(AuthError::Transport("lookup dropped".into()))),
            None => Ok(None),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.events.subscribe()
    }

    async fn fetch_extended_details(
        &self,
        user_id: &str,
    ) -> Result<Option<ExtendedDetails>, AuthError> {
        self.detail_calls.fetch_add(1, Ordering::SeqCst);
        let reply = self
            .replies
            .lock()
            .unwrap()
            .get(user_id)
            .cloned()
            .unwrap_or(Reply::Missing);
        match reply {
            Reply::Found(details) => Ok(Some(details)),
            Reply::Missing => Ok(None),
            Reply::Fail => Err(AuthError::Remote("permission lookup failed".into())),
            Reply::Hang => std::future::pending().await,
            Reply::Delayed(after, details) => {
                tokio::time::sleep(after).await;
                Ok(Some(details))
            }
        }
    }

    async fn invalidate_session(&self) -> Result<(), AuthError> {
        self.invalidations.fetch_add(1, Ordering::SeqCst);
        if self.emit_signed_out {
            self.emit(AuthEventKind::SignedOut, None);
        }
        Ok(())
    }
}

fn session(user_id: &str) -> Session {
    Session {
        access_token: format!("at-{user_id}"),
        refresh_token: format!("rt-{user_id}"),
        token_type: "bearer".into(),
        expires_at: None,
        user: User {
            id: user_id.to_string(),
            email: Some(format!("{user_id}@example.com")),
            phone: None,
        },
    }
}

fn staff_details(user_id: &str) -> ExtendedDetails {
    ExtendedDetails {
        profile: Some(Profile {
            id: user_id.to_string(),
            full_name: Some("Front Desk".into()),
            email: None,
            extra: Default::default(),
        }),
        role: Some("staff".into()),
        permissions: [("view_bookings", true)].into_iter().collect(),
    }
}

fn start(source: &Arc<ScriptedSource>) -> SessionHandle {
    SessionController::spawn(source.clone(), ControllerConfig::default(), None)
}

fn start_at(source: &Arc<ScriptedSource>, location: &Arc<MemoryLocation>) -> SessionHandle {
    SessionController::spawn(
        source.clone(),
        ControllerConfig::default(),
        Some(location.clone() as Arc<dyn Location>),
    )
}

/// Let every runnable task drain; the paused clock moves by `ms`.
async fn settle(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

// ---- bootstrap ------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn recovery_link_bootstrap_lands_in_password_set() {
    let source = ScriptedSource::resolved(Ok(Some(session("u-1"))));
    let location = Arc::new(MemoryLocation::new(
        "/reset#access_token=a&refresh_token=b&type=recovery",
    ));
    let handle = start_at(&source, &location);

    let snap = handle.wait_until_settled().await.unwrap();
    assert_eq!(snap.stage, AuthStage::NeedsPasswordSet);
    assert!(snap.session.is_some());
    assert_eq!(source.detail_calls(), 0);

    settle(2_000).await;
    assert_eq!(location.current(), "/reset");
}

#[tokio::test(start_paused = true)]
async fn bootstrap_with_user_authenticates_with_permissions() {
    let source = ScriptedSource::resolved(Ok(Some(session("u-1"))));
    source.reply("u-1", Reply::Found(staff_details("u-1")));
    let handle = start(&source);

    let snap = handle.wait_until_settled().await.unwrap();
    assert_eq!(snap.stage, AuthStage::Authenticated);
    assert_eq!(snap.role.as_deref(), Some("staff"));
    assert!(handle.has_permission("view_bookings"));
    assert!(!handle.has_permission("edit_bookings"));
}

#[tokio::test(start_paused = true)]
async fn stage_stays_loading_until_details_arrive() {
    let source = ScriptedSource::resolved(Ok(Some(session("u-1"))));
    source.reply(
        "u-1",
        Reply::Delayed(Duration::from_millis(800), staff_details("u-1")),
    );
    let handle = start(&source);

    settle(100).await;
    let snap = handle.snapshot();
    assert_eq!(snap.stage, AuthStage::Loading);
    assert!(snap.fetch_in_flight);
    assert!(!snap.has_permission("view_bookings"));

    let snap = handle.wait_until_settled().await.unwrap();
    assert_eq!(snap.stage, AuthStage::Authenticated);
    assert!(!snap.fetch_in_flight);
}

#[tokio::test(start_paused = true)]
async fn no_session_is_unauthenticated() {
    let source = ScriptedSource::resolved(Ok(None));
    let handle = start(&source);

    let snap = handle.wait_until_settled().await.unwrap();
    assert_eq!(snap.stage, AuthStage::Unauthenticated);
    assert!(snap.session.is_none());
}

#[tokio::test(start_paused = true)]
async fn failed_lookup_is_unauthenticated() {
    let source = ScriptedSource::resolved(Err(AuthError::Transport("offline".into())));
    let handle = start(&source);

    let snap = handle.wait_until_settled().await.unwrap();
    assert_eq!(snap.stage, AuthStage::Unauthenticated);
}

#[tokio::test(start_paused = true)]
async fn failed_details_still_authenticates_with_empty_permissions() {
    let source = ScriptedSource::resolved(Ok(Some(session("u-1"))));
    source.reply("u-1", Reply::Fail);
    let handle = start(&source);

    let snap = handle.wait_until_settled().await.unwrap();
    assert_eq!(snap.stage, AuthStage::Authenticated);
    assert!(snap.profile.is_none());
    assert!(snap.role.is_none());
    assert_eq!(snap.permissions, Permissions::default());
}

#[tokio::test(start_paused = true)]
async fn missing_details_record_still_authenticates() {
    let source = ScriptedSource::resolved(Ok(Some(session("u-1"))));
    let handle = start(&source);

    let snap = handle.wait_until_settled().await.unwrap();
    assert_eq!(snap.stage, AuthStage::Authenticated);
    assert!(snap.profile.is_none());
}

#[tokio::test(start_paused = true)]
async fn late_lookup_after_recovery_event_is_ignored() {
    let (source, gate) = ScriptedSource::gated();
    let handle = start(&source);
    settle(1).await;

    source.emit(AuthEventKind::PasswordRecovery, Some(session("u-1")));
    let snap = handle
        .wait_for(|s| s.stage == AuthStage::NeedsPasswordSet)
        .await
        .unwrap();
    assert!(snap.session.is_some());

    gate.send(Ok(Some(session("u-1")))).unwrap();
    settle(100).await;
    assert_eq!(handle.stage(), AuthStage::NeedsPasswordSet);
    assert_eq!(source.detail_calls(), 0);
}

// ---- event reduction ------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn initial_session_replay_before_bootstrap_is_ignored() {
    let (source, gate) = ScriptedSource::gated();
    source.reply("u-1", Reply::Found(staff_details("u-1")));
    let handle = start(&source);
    settle(1).await;

    source.emit(AuthEventKind::InitialSession, Some(session("u-1")));
    settle(100).await;
    assert_eq!(handle.stage(), AuthStage::Loading);
    assert_eq!(source.detail_calls(), 0);

    gate.send(Ok(Some(session("u-1")))).unwrap();
    let snap = handle.wait_until_settled().await.unwrap();
    assert_eq!(snap.stage, AuthStage::Authenticated);
    assert_eq!(source.detail_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn initial_session_after_empty_bootstrap_authenticates() {
    let source = ScriptedSource::resolved(Ok(None));
    source.reply("u-2", Reply::Found(staff_details("u-2")));
    let handle = start(&source);
    handle.wait_until_settled().await.unwrap();

    source.emit(AuthEventKind::InitialSession, Some(session("u-2")));
    let snap = handle
        .wait_for(|s| s.stage == AuthStage::Authenticated)
        .await
        .unwrap();
    assert_eq!(snap.user.unwrap().id, "u-2");
}

#[tokio::test(start_paused = true)]
async fn sign_in_from_unauthenticated_authenticates() {
    let source = ScriptedSource::resolved(Ok(None));
    source.reply("u-1", Reply::Found(staff_details("u-1")));
    let handle = start(&source);
    handle.wait_until_settled().await.unwrap();

    source.emit(AuthEventKind::SignedIn, Some(session("u-1")));
    let snap = handle
        .wait_for(|s| s.stage == AuthStage::Authenticated && !s.fetch_in_flight)
        .await
        .unwrap();
    assert!(snap.has_permission("view_bookings"));
}

#[tokio::test(start_paused = true)]
async fn duplicate_sign_in_does_not_refetch() {
    let source = ScriptedSource::resolved(Ok(Some(session("u-1"))));
    let handle = start(&source);
    handle.wait_until_settled().await.unwrap();
    assert_eq!(source.detail_calls(), 1);

    source.emit(AuthEventKind::SignedIn, Some(session("u-1")));
    source.emit(AuthEventKind::SignedIn, Some(session("u-1")));
    settle(100).await;
    assert_eq!(source.detail_calls(), 1);
    assert_eq!(handle.stage(), AuthStage::Authenticated);
}

#[tokio::test(start_paused = true)]
async fn signed_out_clears_details() {
    let source = ScriptedSource::resolved(Ok(Some(session("u-1"))));
    source.reply("u-1", Reply::Found(staff_details("u-1")));
    let handle = start(&source);
    handle.wait_until_settled().await.unwrap();

    source.emit(AuthEventKind::SignedOut, None);
    let snap = handle
        .wait_for(|s| s.stage == AuthStage::Unauthenticated)
        .await
        .unwrap();
    assert!(snap.profile.is_none());
    assert!(snap.role.is_none());
    assert!(snap.permissions.is_empty());
    assert!(snap.session.is_none());
    assert!(!handle.has_permission("view_bookings"));
}

#[tokio::test(start_paused = true)]
async fn password_update_completes_even_when_details_fail() {
    let source = ScriptedSource::resolved(Ok(Some(session("u-1"))));
    source.reply("u-1", Reply::Fail);
    let location = Arc::new(MemoryLocation::new("/#type=invite&access_token=a"));
    let handle = start_at(&source, &location);
    let snap = handle.wait_until_settled().await.unwrap();
    assert_eq!(snap.stage, AuthStage::NeedsPasswordSet);

    source.emit(AuthEventKind::UserUpdated, Some(session("u-1")));
    settle(100).await;
    // Still inside the grace pause.
    assert_eq!(handle.stage(), AuthStage::NeedsPasswordSet);
    assert!(handle.snapshot().fetch_in_flight);

    let snap = handle
        .wait_for(|s| s.stage == AuthStage::Authenticated)
        .await
        .unwrap();
    assert!(snap.permissions.is_empty());
}

#[tokio::test(start_paused = true)]
async fn consumed_intent_never_reenters_password_set() {
    let source = ScriptedSource::resolved(Ok(Some(session("u-1"))));
    source.reply("u-1", Reply::Found(staff_details("u-1")));
    let location = Arc::new(MemoryLocation::new("/reset#type=recovery"));
    let handle = start_at(&source, &location);
    handle.wait_until_settled().await.unwrap();

    source.emit(AuthEventKind::UserUpdated, Some(session("u-1")));
    handle
        .wait_for(|s| s.stage == AuthStage::Authenticated)
        .await
        .unwrap();

    source.emit(AuthEventKind::SignedIn, Some(session("u-1")));
    settle(100).await;
    assert_eq!(handle.stage(), AuthStage::Authenticated);

    source.emit(AuthEventKind::SignedOut, None);
    handle
        .wait_for(|s| s.stage == AuthStage::Unauthenticated)
        .await
        .unwrap();

    source.emit(AuthEventKind::SignedIn, Some(session("u-1")));
    let snap = handle
        .wait_for(|s| s.stage != AuthStage::Unauthenticated && !s.fetch_in_flight)
        .await
        .unwrap();
    assert_eq!(snap.stage, AuthStage::Authenticated);
}

#[tokio::test(start_paused = true)]
async fn invite_sign_in_after_empty_bootstrap_goes_to_password_set() {
    let source = ScriptedSource::resolved(Ok(None));
    let location = Arc::new(MemoryLocation::new("/#access_token=a&refresh_token=b"));
    let handle = start_at(&source, &location);
    let snap = handle.wait_until_settled().await.unwrap();
    assert_eq!(snap.stage, AuthStage::Unauthenticated);

    source.emit(AuthEventKind::SignedIn, Some(session("u-9")));
    handle
        .wait_for(|s| s.stage == AuthStage::NeedsPasswordSet)
        .await
        .unwrap();
    assert_eq!(source.detail_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn recovery_event_cleans_url_immediately() {
    let source = ScriptedSource::resolved(Ok(None));
    let location = Arc::new(MemoryLocation::new("/reset"));
    let handle = start_at(&source, &location);
    handle.wait_until_settled().await.unwrap();

    // The provider rewrote the address after activation.
    location.replace("/reset#type=recovery&access_token=x").unwrap();
    source.emit(AuthEventKind::PasswordRecovery, Some(session("u-1")));
    handle
        .wait_for(|s| s.stage == AuthStage::NeedsPasswordSet)
        .await
        .unwrap();
    assert_eq!(location.current(), "/reset");
}

#[tokio::test(start_paused = true)]
async fn user_update_while_authenticated_refreshes_in_place() {
    let source = ScriptedSource::resolved(Ok(Some(session("u-1"))));
    source.reply("u-1", Reply::Found(staff_details("u-1")));
    let handle = start(&source);
    handle.wait_until_settled().await.unwrap();

    let mut manager = staff_details("u-1");
    manager.role = Some("manager".into());
    manager.permissions = [("view_bookings", true), ("approve_invoices", true)]
        .into_iter()
        .collect();
    source.reply(
        "u-1",
        Reply::Delayed(Duration::from_millis(300), manager),
    );

    source.emit(AuthEventKind::UserUpdated, Some(session("u-1")));
    settle(10).await;
    let snap = handle.snapshot();
    assert_eq!(snap.stage, AuthStage::Authenticated);
    assert!(snap.fetch_in_flight);
    assert!(!snap.has_permission("view_bookings"));

    let snap = handle.wait_until_settled().await.unwrap();
    assert_eq!(snap.role.as_deref(), Some("manager"));
    assert!(snap.has_permission("approve_invoices"));
}

#[tokio::test(start_paused = true)]
async fn token_refresh_retries_failed_details() {
    let source = ScriptedSource::resolved(Ok(Some(session("u-1"))));
    source.reply("u-1", Reply::Fail);
    let handle = start(&source);
    let snap = handle.wait_until_settled().await.unwrap();
    assert!(snap.profile.is_none());

    source.reply("u-1", Reply::Found(staff_details("u-1")));
    source.emit(AuthEventKind::TokenRefreshed, Some(session("u-1")));
    let snap = handle
        .wait_for(|s| s.profile.is_some())
        .await
        .unwrap();
    assert_eq!(snap.stage, AuthStage::Authenticated);
    assert_eq!(source.detail_calls(), 2);

    source.emit(AuthEventKind::TokenRefreshed, Some(session("u-1")));
    settle(100).await;
    assert_eq!(source.detail_calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn unknown_event_changes_nothing_but_the_mirror() {
    let source = ScriptedSource::resolved(Ok(Some(session("u-1"))));
    let handle = start(&source);
    handle.wait_until_settled().await.unwrap();

    let mut refreshed = session("u-1");
    refreshed.access_token = "at-rotated".into();
    source.emit(
        AuthEventKind::Other("MFA_CHALLENGE_VERIFIED".into()),
        Some(refreshed),
    );
    let snap = handle
        .wait_for(|s| {
            s.session
                .as_ref()
                .is_some_and(|x| x.access_token == "at-rotated")
        })
        .await
        .unwrap();
    assert_eq!(snap.stage, AuthStage::Authenticated);
    assert_eq!(source.detail_calls(), 1);
}

// ---- races & safeguards ---------------------------------------------------

#[tokio::test(start_paused = true)]
async fn details_arriving_after_sign_out_are_discarded() {
    let source = ScriptedSource::resolved(Ok(Some(session("u-1"))));
    source.reply(
        "u-1",
        Reply::Delayed(Duration::from_secs(2), staff_details("u-1")),
    );
    let handle = start(&source);
    settle(100).await;
    assert!(handle.snapshot().fetch_in_flight);

    source.emit(AuthEventKind::SignedOut, None);
    let snap = handle
        .wait_for(|s| s.stage == AuthStage::Unauthenticated)
        .await
        .unwrap();
    assert!(!snap.fetch_in_flight);

    settle(3_000).await;
    let snap = handle.snapshot();
    assert_eq!(snap.stage, AuthStage::Unauthenticated);
    assert!(snap.profile.is_none());
    assert!(snap.role.is_none());
}

#[tokio::test(start_paused = true)]
async fn details_for_previous_user_are_discarded() {
    let source = ScriptedSource::resolved(Ok(None));
    source.reply(
        "u-1",
        Reply::Delayed(Duration::from_secs(2), staff_details("u-1")),
    );
    source.reply("u-2", Reply::Missing);
    let handle = start(&source);
    handle.wait_until_settled().await.unwrap();

    source.emit(AuthEventKind::SignedIn, Some(session("u-1")));
    settle(10).await;
    source.emit(AuthEventKind::SignedOut, None);
    settle(10).await;
    source.emit(AuthEventKind::SignedIn, Some(session("u-2")));
    handle
        .wait_for(|s| s.stage == AuthStage::Authenticated)
        .await
        .unwrap();

    settle(3_000).await;
    let snap = handle.snapshot();
    assert_eq!(snap.user.unwrap().id, "u-2");
    assert!(snap.profile.is_none());
    assert!(snap.role.is_none());
}

#[tokio::test(start_paused = true)]
async fn stalled_details_before_recovery_event_do_not_skip_password_set() {
    let source = ScriptedSource::resolved(Ok(Some(session("u-1"))));
    source.reply(
        "u-1",
        Reply::Delayed(Duration::from_secs(1), staff_details("u-1")),
    );
    let handle = start(&source);
    settle(100).await;

    source.emit(AuthEventKind::PasswordRecovery, Some(session("u-1")));
    handle
        .wait_for(|s| s.stage == AuthStage::NeedsPasswordSet)
        .await
        .unwrap();

    settle(2_000).await;
    assert_eq!(handle.stage(), AuthStage::NeedsPasswordSet);
}

#[tokio::test(start_paused = true)]
async fn watchdog_clears_stuck_flag_without_changing_stage() {
    let source = ScriptedSource::resolved(Ok(Some(session("u-1"))));
    let location = Arc::new(MemoryLocation::new("/#type=recovery"));
    let handle = start_at(&source, &location);
    handle.wait_until_settled().await.unwrap();
    source.reply("u-1", Reply::Hang);

    source.emit(AuthEventKind::UserUpdated, Some(session("u-1")));
    settle(4_000).await;
    let snap = handle.snapshot();
    assert!(snap.fetch_in_flight);
    assert_eq!(snap.stage, AuthStage::NeedsPasswordSet);

    settle(1_100).await;
    let snap = handle.snapshot();
    assert!(!snap.fetch_in_flight);
    assert_eq!(snap.stage, AuthStage::NeedsPasswordSet);
}

#[tokio::test(start_paused = true)]
async fn watchdog_is_rearmed_by_each_event() {
    let source = ScriptedSource::resolved(Ok(Some(session("u-1"))));
    let handle = start(&source);
    handle.wait_until_settled().await.unwrap();
    source.reply("u-1", Reply::Hang);

    source.emit(AuthEventKind::UserUpdated, Some(session("u-1")));
    settle(3_000).await;
    source.emit(AuthEventKind::Other("PING".into()), Some(session("u-1")));
    settle(3_000).await;
    // 6s after the fetch started but only 3s after the last event.
    assert!(handle.snapshot().fetch_in_flight);

    settle(2_100).await;
    let snap = handle.snapshot();
    assert!(!snap.fetch_in_flight);
    assert_eq!(snap.stage, AuthStage::Authenticated);
}

// ---- sign-out -------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn sign_out_goes_through_the_provider() {
    let source = ScriptedSource::resolved(Ok(Some(session("u-1"))));
    source.reply("u-1", Reply::Found(staff_details("u-1")));
    let handle = start(&source);
    handle.wait_until_settled().await.unwrap();

    handle.sign_out().await.unwrap();
    assert_eq!(source.invalidations.load(Ordering::SeqCst), 1);
    let snap = handle
        .wait_for(|s| s.stage == AuthStage::Unauthenticated)
        .await
        .unwrap();
    assert!(snap.permissions.is_empty());
}

#[tokio::test(start_paused = true)]
async fn sign_out_does_not_write_stage_locally() {
    let (events, _) = broadcast::channel(16);
    let (tx, rx) = oneshot::channel();
    let _ = tx.send(Ok(Some(session("u-1"))));
    let source = Arc::new(ScriptedSource {
        events,
        lookup: tokio::sync::Mutex::new(Some(rx)),
        replies: Mutex::new(HashMap::new()),
        detail_calls: AtomicUsize::new(0),
        invalidations: AtomicUsize::new(0),
        emit_signed_out: false,
    });
    let handle = start(&source);
    handle.wait_until_settled().await.unwrap();

    handle.sign_out().await.unwrap();
    settle(100).await;
    assert_eq!(handle.stage(), AuthStage::Authenticated);
}

#[tokio::test(start_paused = true)]
async fn session_stages_always_carry_a_session() {
    let source = ScriptedSource::resolved(Ok(Some(session("u-1"))));
    let handle = start(&source);
    let mut rx = handle.subscribe();
    handle.wait_until_settled().await.unwrap();

    let mfa = || AuthEventKind::Other("MFA_CHALLENGE_VERIFIED".into());
    let steps = [
        (AuthEventKind::SignedIn, true),
        (AuthEventKind::TokenRefreshed, false),
        (AuthEventKind::SignedIn, true),
        (AuthEventKind::InitialSession, false),
        (AuthEventKind::SignedIn, true),
        (mfa(), false),
        (AuthEventKind::PasswordRecovery, true),
        (AuthEventKind::TokenRefreshed, false),
        (AuthEventKind::PasswordRecovery, true),
        (AuthEventKind::InitialSession, false),
        (AuthEventKind::PasswordRecovery, true),
        (mfa(), false),
        (AuthEventKind::SignedIn, true),
        (AuthEventKind::UserUpdated, false),
        (AuthEventKind::SignedOut, false),
    ];
    for (kind, with_session) in steps {
        let label = kind.to_string();
        source.emit(kind, with_session.then(|| session("u-1")));
        settle(700).await;
        let snap = rx.borrow_and_update().clone();
        if matches!(
            snap.stage,
            AuthStage::Authenticated | AuthStage::NeedsPasswordSet
        ) {
            assert!(snap.session.is_some(), "{label}: stage {} without session", snap.stage);
        }
        if !with_session {
            assert_eq!(snap.stage, AuthStage::Unauthenticated, "{label} without session");
            assert!(snap.permissions.is_empty(), "{label} without session");
        }
    }
}

#[tokio::test(start_paused = true)]
async fn sessionless_refresh_deauthenticates() {
    let source = ScriptedSource::resolved(Ok(Some(session("u-1"))));
    source.reply("u-1", Reply::Found(staff_details("u-1")));
    let handle = start(&source);
    handle.wait_until_settled().await.unwrap();
    assert!(handle.has_permission("view_bookings"));

    source.emit(AuthEventKind::TokenRefreshed, None);
    settle(10).await;
    let snap = handle.snapshot();
    assert_eq!(snap.stage, AuthStage::Unauthenticated);
    assert!(snap.session.is_none());
    assert!(snap.profile.is_none());
    assert!(!handle.has_permission("view_bookings"));

    source.emit(AuthEventKind::SignedIn, Some(session("u-1")));
    handle
        .wait_for(|s| s.stage == AuthStage::Authenticated && !s.fetch_in_flight)
        .await
        .unwrap();
    source.emit(AuthEventKind::InitialSession, None);
    settle(10).await;
    assert_eq!(handle.stage(), AuthStage::Unauthenticated);
    assert!(handle.snapshot().session.is_none());
}

#[tokio::test(start_paused = true)]
async fn switching_user_replaces_previous_details() {
    let source = ScriptedSource::resolved(Ok(Some(session("u-1"))));
    source.reply("u-1", Reply::Found(staff_details("u-1")));
    let manager = ExtendedDetails {
        role: Some("manager".into()),
        permissions: [("edit_bookings", true)].into_iter().collect(),
        ..staff_details("u-2")
    };
    source.reply("u-2", Reply::Delayed(Duration::from_millis(100), manager));
    let handle = start(&source);
    handle.wait_until_settled().await.unwrap();
    assert!(handle.has_permission("view_bookings"));

    source.emit(AuthEventKind::SignedIn, Some(session("u-2")));
    settle(10).await;
    let snap = handle.snapshot();
    assert_eq!(snap.user.as_ref().map(|u| u.id.as_str()), Some("u-2"));
    assert!(snap.profile.is_none());
    assert!(snap.role.is_none());
    assert!(snap.fetch_in_flight);
    assert!(!handle.has_permission("view_bookings"));

    let snap = handle.wait_until_settled().await.unwrap();
    assert_eq!(snap.stage, AuthStage::Authenticated);
    assert_eq!(snap.profile.map(|p| p.id).as_deref(), Some("u-2"));
    assert_eq!(snap.role.as_deref(), Some("manager"));
    assert!(handle.has_permission("edit_bookings"));
    assert!(!handle.has_permission("view_bookings"));
}

#[tokio::test(start_paused = true)]
async fn repeated_sign_in_for_same_user_keeps_details() {
    let source = ScriptedSource::resolved(Ok(Some(session("u-1"))));
    source.reply("u-1", Reply::Found(staff_details("u-1")));
    let handle = start(&source);
    handle.wait_until_settled().await.unwrap();

    source.emit(AuthEventKind::SignedIn, Some(session("u-1")));
    settle(10).await;
    assert!(handle.has_permission("view_bookings"));
    assert_eq!(source.detail_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn controller_stops_when_handles_are_dropped() {
    let source = ScriptedSource::resolved(Ok(None));
    let handle = start(&source);
    handle.wait_until_settled().await.unwrap();
    assert_eq!(source.events.receiver_count(), 1);

    drop(handle);
    settle(10).await;
    assert_eq!(source.events.receiver_count(), 0);
}
