// @zen-component: SES-EventReducer
//
//! Pure reduction from `(stage, event)` to the next transition.
//!
//! Nothing in here performs I/O or reads a clock. The controller feeds the
//! current state plus one input in and applies whatever [`Transition`] comes
//! out, which keeps every rule testable as a table row.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::recovery::RecoveryIntent;
use crate::models::auth::AuthEventKind;

/// Authoritative projection of authentication progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthStage {
    Loading,
    NeedsPasswordSet,
    Authenticated,
    Unauthenticated,
}

impl AuthStage {
    /// Whether the stage is a final answer for the ordinary app
    /// (everything except `Loading`).
    pub fn is_settled(self) -> bool {
        !matches!(self, AuthStage::Loading)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AuthStage::Loading => "loading",
            AuthStage::NeedsPasswordSet => "needs_password_set",
            AuthStage::Authenticated => "authenticated",
            AuthStage::Unauthenticated => "unauthenticated",
        }
    }
}

impl std::fmt::Display for AuthStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether the one-shot session lookup has resolved yet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BootstrapPhase {
    #[default]
    Pending,
    Complete,
}

/// What to do once an extended-details fetch finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Commit `Authenticated` whatever the fetch outcome.
    Authenticate,
    /// Replace profile/role/permissions only; the stage is left alone.
    InPlace,
}

/// A details fetch requested by a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchPlan {
    pub then: Completion,
    /// Pause before the request goes out.
    pub delay: Duration,
}

impl FetchPlan {
    pub fn authenticate() -> Self {
        Self {
            then: Completion::Authenticate,
            delay: Duration::ZERO,
        }
    }

    pub fn in_place() -> Self {
        Self {
            then: Completion::InPlace,
            delay: Duration::ZERO,
        }
    }
}

/// Controller state the reducer looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReduceInput {
    pub stage: AuthStage,
    pub bootstrap: BootstrapPhase,
    pub intent: RecoveryIntent,
    /// Whether the input (event or lookup) carries a user.
    pub has_user: bool,
    /// Whether that user differs from the one currently mirrored.
    pub user_changed: bool,
    /// Whether a profile is currently loaded.
    pub profile_present: bool,
}

/// Effects the controller applies after a reduction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Transition {
    /// Stage to commit now, if any.
    pub stage: Option<AuthStage>,
    pub fetch: Option<FetchPlan>,
    pub consume_intent: bool,
    pub clear_details: bool,
    pub clean_url: bool,
}

impl Transition {
    pub fn ignore() -> Self {
        Self::default()
    }

    pub fn is_noop(&self) -> bool {
        *self == Self::default()
    }

    fn to(stage: AuthStage) -> Self {
        Self {
            stage: Some(stage),
            ..Self::default()
        }
    }

    fn signed_out() -> Self {
        Self {
            stage: Some(AuthStage::Unauthenticated),
            clear_details: true,
            ..Self::default()
        }
    }

    fn password_set() -> Self {
        Self {
            stage: Some(AuthStage::NeedsPasswordSet),
            consume_intent: true,
            ..Self::default()
        }
    }

    fn fetch(plan: FetchPlan) -> Self {
        Self {
            fetch: Some(plan),
            ..Self::default()
        }
    }
}

/// Resolution of the one-shot session lookup.
///
/// Only applies while the stage is still `Loading`: if an event already
/// resolved the stage, the late lookup is a no-op.
pub fn reduce_bootstrap(input: &ReduceInput, lookup_ok: bool) -> Transition {
    if input.stage != AuthStage::Loading {
        return Transition::ignore();
    }
    if !lookup_ok {
        return Transition::to(AuthStage::Unauthenticated);
    }
    match (input.has_user, input.intent.is_pending()) {
        (true, true) => Transition::password_set(),
        (true, false) => Transition::fetch(FetchPlan::authenticate()),
        (false, _) => Transition::signed_out(),
    }
}

/// Reduce one identity event against the current state.
///
/// `password_set_grace` is the pause inserted before the details fetch that
/// follows a completed password update.
pub fn reduce(input: &ReduceInput, kind: &AuthEventKind, password_set_grace: Duration) -> Transition {
    let mut transition = reduce_event(input, kind, password_set_grace);

    // Details belong to the user they were fetched for.
    if input.has_user && input.user_changed {
        transition.clear_details = true;
    }
    if transition.stage.is_some() {
        return transition;
    }

    // A stage that stands on a session never outlives it.
    if !input.has_user && holds_session(input) {
        return Transition {
            consume_intent: transition.consume_intent,
            clean_url: transition.clean_url,
            ..Transition::signed_out()
        };
    }

    if input.has_user && input.user_changed {
        match input.stage {
            AuthStage::Authenticated => transition.fetch = Some(FetchPlan::in_place()),
            AuthStage::Loading if input.bootstrap == BootstrapPhase::Complete => {
                transition.fetch = Some(FetchPlan::authenticate());
            }
            _ => {}
        }
    }

    transition
}

/// Whether the current stage is only valid while a session is mirrored.
///
/// `Loading` after bootstrap means an authenticating fetch for a user is
/// pending; before bootstrap the lookup still decides.
fn holds_session(input: &ReduceInput) -> bool {
    match input.stage {
        AuthStage::Authenticated | AuthStage::NeedsPasswordSet => true,
        AuthStage::Loading => input.bootstrap == BootstrapPhase::Complete,
        AuthStage::Unauthenticated => false,
    }
}

/// The per-kind event table.
fn reduce_event(input: &ReduceInput, kind: &AuthEventKind, password_set_grace: Duration) -> Transition {
    use AuthStage::*;

    match kind {
        AuthEventKind::InitialSession => {
            let replayable = input.bootstrap == BootstrapPhase::Complete
                && matches!(input.stage, Loading | Unauthenticated);
            if !replayable {
                return Transition::ignore();
            }
            match (input.has_user, input.intent.is_pending()) {
                (true, true) => Transition::password_set(),
                (true, false) => Transition::fetch(FetchPlan::authenticate()),
                (false, _) => Transition::signed_out(),
            }
        }

        AuthEventKind::SignedIn => {
            if !input.has_user {
                Transition::signed_out()
            } else if input.intent.is_pending() {
                Transition::password_set()
            } else if input.stage == Unauthenticated {
                Transition::fetch(FetchPlan::authenticate())
            } else {
                Transition::ignore()
            }
        }

        AuthEventKind::SignedOut => Transition::signed_out(),

        AuthEventKind::PasswordRecovery => {
            let base = if input.has_user {
                Transition::password_set()
            } else {
                // No identity to set a credential for.
                Transition::signed_out()
            };
            Transition {
                clean_url: true,
                consume_intent: true,
                ..base
            }
        }

        AuthEventKind::UserUpdated => {
            if !input.has_user {
                return Transition::signed_out();
            }
            match input.stage {
                NeedsPasswordSet => Transition {
                    consume_intent: true,
                    ..Transition::fetch(FetchPlan {
                        then: Completion::Authenticate,
                        delay: password_set_grace,
                    })
                },
                Authenticated => Transition::fetch(FetchPlan::in_place()),
                Loading | Unauthenticated => Transition::ignore(),
            }
        }

        AuthEventKind::TokenRefreshed => {
            if input.stage == Authenticated && input.has_user && !input.profile_present {
                Transition::fetch(FetchPlan::in_place())
            } else {
                Transition::ignore()
            }
        }

        AuthEventKind::Other(_) => Transition::ignore(),
    }
}
