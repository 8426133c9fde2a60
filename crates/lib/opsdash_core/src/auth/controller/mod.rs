// @zen-component: SES-SessionController
//
//! Session state machine.
//!
//! One actor task owns every piece of mutable auth state. Three kinds of
//! input reach it: the one-shot session lookup, the provider's event stream,
//! and completions of extended-details fetches. Each is reduced through
//! [`reducer`](super::reducer) and the resulting snapshot is published on a
//! `watch` channel. Consumers only ever read snapshots; the single write
//! path they get is [`SessionHandle::sign_out`], which goes through the
//! provider and comes back as a `SIGNED_OUT` event.
//!
//! Fetches are tagged with the user id and stage epoch they were issued
//! under. A result whose user no longer matches the mirrored session, or
//! whose stage has moved on, is dropped instead of being applied.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::config::ControllerConfig;
use super::recovery::{self, Location, RecoveryIntent};
use super::reducer::{
    AuthStage, BootstrapPhase, Completion, FetchPlan, ReduceInput, Transition, reduce,
    reduce_bootstrap,
};
use super::source::IdentitySource;
use super::AuthError;
use crate::models::auth::{AuthEvent, ExtendedDetails, Permissions, Profile, Session, User};

/// Read-only view of the controller state handed to consumers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuthSnapshot {
    pub session: Option<Session>,
    pub user: Option<User>,
    pub profile: Option<Profile>,
    pub role: Option<String>,
    pub permissions: Permissions,
    pub fetch_in_flight: bool,
    pub stage: AuthStage,
}

impl AuthSnapshot {
    fn initial() -> Self {
        Self {
            session: None,
            user: None,
            profile: None,
            role: None,
            permissions: Permissions::default(),
            fetch_in_flight: false,
            stage: AuthStage::Loading,
        }
    }

    /// Permission check for route guards.
    ///
    /// Always `false` while a details fetch is in flight or the stage is
    /// anything but `Authenticated`.
    pub fn has_permission(&self, key: &str) -> bool {
        !self.fetch_in_flight
            && self.stage == AuthStage::Authenticated
            && self.permissions.allows(key)
    }
}

/// Identifies one extended-details fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
struct FetchTicket {
    seq: u64,
    user_id: String,
    then: Completion,
    /// Stage epoch at issue time.
    epoch: u64,
}

enum Input {
    Bootstrap(Result<Option<Session>, AuthError>),
    Details {
        ticket: FetchTicket,
        result: Result<Option<ExtendedDetails>, AuthError>,
    },
}

enum Step {
    Event(Result<AuthEvent, broadcast::error::RecvError>),
    Input(Input),
    Watchdog,
    Shutdown,
}

#[derive(Debug)]
struct ControllerState {
    stage: AuthStage,
    /// Bumped on every committed stage change.
    epoch: u64,
    bootstrap: BootstrapPhase,
    intent: RecoveryIntent,
    session: Option<Session>,
    details: ExtendedDetails,
    fetch_in_flight: bool,
    outstanding: BTreeMap<u64, FetchTicket>,
    next_seq: u64,
}

impl ControllerState {
    fn new(intent: RecoveryIntent) -> Self {
        Self {
            stage: AuthStage::Loading,
            epoch: 0,
            bootstrap: BootstrapPhase::Pending,
            intent,
            session: None,
            details: ExtendedDetails::default(),
            fetch_in_flight: false,
            outstanding: BTreeMap::new(),
            next_seq: 0,
        }
    }

    fn user_id(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.user.id.as_str())
    }

    fn snapshot(&self) -> AuthSnapshot {
        AuthSnapshot {
            session: self.session.clone(),
            user: self.session.as_ref().map(|s| s.user.clone()),
            profile: self.details.profile.clone(),
            role: self.details.role.clone(),
            permissions: self.details.permissions.clone(),
            fetch_in_flight: self.fetch_in_flight,
            stage: self.stage,
        }
    }
}

/// The session controller actor.
pub struct SessionController {
    state: ControllerState,
    source: Arc<dyn IdentitySource>,
    config: ControllerConfig,
    location: Option<Arc<dyn Location>>,
    inputs_tx: mpsc::UnboundedSender<Input>,
    snapshot_tx: watch::Sender<AuthSnapshot>,
    watchdog: Option<Instant>,
}

impl SessionController {
    /// Activate the controller. Must be called inside a tokio runtime.
    ///
    /// Classifies the page URL (when a `location` is given), subscribes to the
    /// provider's events, starts the one-shot session lookup and spawns the
    /// actor. The actor stops once every [`SessionHandle`] is dropped or
    /// [`SessionHandle::shutdown`] is called.
    pub fn spawn(
        source: Arc<dyn IdentitySource>,
        config: ControllerConfig,
        location: Option<Arc<dyn Location>>,
    ) -> SessionHandle {
        let intent = match &location {
            Some(loc) => {
                let current = loc.current();
                if recovery::has_sensitive_material(&current) {
                    recovery::schedule_url_cleanup(loc.clone(), config.url_cleanup_grace);
                }
                recovery::classify_url(&current)
            }
            None => RecoveryIntent::None,
        };
        info!(recovery = intent.is_pending(), "activating session controller");

        // Subscribe before the lookup so no event slips between the two.
        let events = source.subscribe();
        let (inputs_tx, inputs_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(AuthSnapshot::initial());

        tokio::spawn({
            let source = source.clone();
            let tx = inputs_tx.clone();
            async move {
                let result = source.current_session().await;
                let _ = tx.send(Input::Bootstrap(result));
            }
        });

        let controller = SessionController {
            state: ControllerState::new(intent),
            source: source.clone(),
            config,
            location,
            inputs_tx,
            snapshot_tx,
            watchdog: None,
        };
        let task = tokio::spawn(controller.run(events, inputs_rx));

        SessionHandle {
            snapshot: snapshot_rx,
            source,
            task: Arc::new(task.abort_handle()),
        }
    }

    async fn run(
        mut self,
        mut events: broadcast::Receiver<AuthEvent>,
        mut inputs: mpsc::UnboundedReceiver<Input>,
    ) {
        let mut events_open = true;
        loop {
            let deadline = self.watchdog;
            let step = tokio::select! {
                event = events.recv(), if events_open => Step::Event(event),
                Some(input) = inputs.recv() => Step::Input(input),
                () = watchdog_expiry(deadline) => Step::Watchdog,
                () = self.snapshot_tx.closed() => Step::Shutdown,
            };

            match step {
                Step::Event(Ok(event)) => self.on_event(event),
                Step::Event(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                    warn!(skipped, "auth event subscription lagged");
                }
                Step::Event(Err(broadcast::error::RecvError::Closed)) => {
                    warn!("auth event stream closed");
                    events_open = false;
                }
                Step::Input(Input::Bootstrap(result)) => self.on_bootstrap(result),
                Step::Input(Input::Details { ticket, result }) => self.on_details(ticket, result),
                Step::Watchdog => self.on_watchdog(),
                Step::Shutdown => {
                    debug!("all session handles dropped, stopping controller");
                    break;
                }
            }
        }
    }

    fn reduce_input(&self, has_user: bool, user_changed: bool) -> ReduceInput {
        ReduceInput {
            stage: self.state.stage,
            bootstrap: self.state.bootstrap,
            intent: self.state.intent,
            has_user,
            user_changed,
            profile_present: self.state.details.profile.is_some(),
        }
    }

    fn arm_watchdog(&mut self) {
        self.watchdog = Some(Instant::now() + self.config.watchdog);
    }

    fn on_bootstrap(&mut self, result: Result<Option<Session>, AuthError>) {
        self.arm_watchdog();
        self.state.bootstrap = BootstrapPhase::Complete;

        let lookup_ok = result.is_ok();
        let session = result.unwrap_or_else(|e| {
            warn!(error = %e, "session lookup failed, treating visitor as signed out");
            None
        });

        let transition = reduce_bootstrap(&self.reduce_input(session.is_some(), false), lookup_ok);
        if self.state.stage == AuthStage::Loading {
            self.state.session = session;
        } else {
            debug!(stage = %self.state.stage, "session lookup resolved after an event, ignoring");
        }
        self.apply(transition);
        self.publish();
    }

    fn on_event(&mut self, event: AuthEvent) {
        self.arm_watchdog();
        let user_changed = match (self.state.user_id(), event.user()) {
            (Some(mirrored), Some(incoming)) => mirrored != incoming.id,
            _ => false,
        };
        self.state.session = event.session.clone();
        self.drop_foreign_fetches();

        let transition = reduce(
            &self.reduce_input(event.session.is_some(), user_changed),
            &event.kind,
            self.config.password_set_grace,
        );
        if transition.is_noop() {
            debug!(kind = %event.kind, stage = %self.state.stage, "auth event ignored");
        } else {
            debug!(kind = %event.kind, stage = %self.state.stage, ?transition, "auth event reduced");
        }
        self.apply(transition);
        self.publish();
    }

    fn on_details(
        &mut self,
        ticket: FetchTicket,
        result: Result<Option<ExtendedDetails>, AuthError>,
    ) {
        self.state.outstanding.remove(&ticket.seq);

        let details = match result {
            Ok(Some(details)) => details,
            Ok(None) => {
                info!(user_id = %ticket.user_id, "no extended details on record");
                ExtendedDetails::default()
            }
            Err(e) => {
                warn!(user_id = %ticket.user_id, error = %e, "extended details unavailable");
                ExtendedDetails::default()
            }
        };

        if self.state.user_id() != Some(ticket.user_id.as_str()) {
            debug!(seq = ticket.seq, user_id = %ticket.user_id, "discarding details for a previous user");
        } else {
            match ticket.then {
                Completion::Authenticate if ticket.epoch == self.state.epoch => {
                    self.state.details = details;
                    self.commit(AuthStage::Authenticated);
                }
                _ if self.state.stage == AuthStage::Authenticated => {
                    self.state.details = details;
                }
                _ => {
                    debug!(seq = ticket.seq, stage = %self.state.stage, "discarding details, stage moved on");
                }
            }
        }
        self.publish();
    }

    fn on_watchdog(&mut self) {
        self.watchdog = None;
        if self.state.fetch_in_flight {
            warn!(
                stage = %self.state.stage,
                pending = self.state.outstanding.len(),
                "details fetch still pending at watchdog, clearing in-flight flag"
            );
            self.state.outstanding.clear();
            self.publish();
        }
    }

    fn apply(&mut self, transition: Transition) {
        if transition.consume_intent && self.state.intent.take().is_pending() {
            debug!("recovery intent consumed");
        }
        if transition.clear_details {
            self.state.details = ExtendedDetails::default();
            self.state.outstanding.clear();
        }
        if let Some(stage) = transition.stage {
            self.commit(stage);
        }
        if transition.clean_url
            && let Some(location) = &self.location
        {
            recovery::clean_url(location.as_ref());
        }
        if let Some(plan) = transition.fetch {
            self.issue_fetch(plan);
        }
    }

    fn commit(&mut self, next: AuthStage) {
        if next == self.state.stage {
            return;
        }
        info!(from = %self.state.stage, to = %next, "auth stage changed");
        self.state.stage = next;
        self.state.epoch += 1;
    }

    /// Forget pending fetches issued for someone other than the mirrored user.
    fn drop_foreign_fetches(&mut self) {
        let current = self.state.user_id().map(str::to_owned);
        self.state
            .outstanding
            .retain(|_, t| current.as_deref() == Some(t.user_id.as_str()));
    }

    fn issue_fetch(&mut self, plan: FetchPlan) {
        let Some(user_id) = self.state.user_id().map(str::to_owned) else {
            return;
        };

        let duplicate = plan.then == Completion::Authenticate
            && self.state.outstanding.values().any(|t| {
                t.then == Completion::Authenticate
                    && t.user_id == user_id
                    && t.epoch == self.state.epoch
            });
        if duplicate {
            debug!(user_id = %user_id, "details fetch already pending");
            return;
        }

        let ticket = FetchTicket {
            seq: self.state.next_seq,
            user_id,
            then: plan.then,
            epoch: self.state.epoch,
        };
        self.state.next_seq += 1;
        self.state.outstanding.insert(ticket.seq, ticket.clone());
        debug!(seq = ticket.seq, user_id = %ticket.user_id, then = ?ticket.then, "fetching extended details");

        let source = self.source.clone();
        let tx = self.inputs_tx.clone();
        let delay = plan.delay;
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let result = source.fetch_extended_details(&ticket.user_id).await;
            let _ = tx.send(Input::Details { ticket, result });
        });
    }

    fn publish(&mut self) {
        self.state.fetch_in_flight = !self.state.outstanding.is_empty();
        let next = self.state.snapshot();
        self.snapshot_tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

async fn watchdog_expiry(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Consumer-side handle to a running [`SessionController`].
#[derive(Clone)]
pub struct SessionHandle {
    snapshot: watch::Receiver<AuthSnapshot>,
    source: Arc<dyn IdentitySource>,
    task: Arc<AbortHandle>,
}

impl SessionHandle {
    /// Current snapshot.
    pub fn snapshot(&self) -> AuthSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn stage(&self) -> AuthStage {
        self.snapshot.borrow().stage
    }

    /// Receiver that is notified on every snapshot change.
    pub fn subscribe(&self) -> watch::Receiver<AuthSnapshot> {
        self.snapshot.clone()
    }

    /// See [`AuthSnapshot::has_permission`].
    pub fn has_permission(&self, key: &str) -> bool {
        self.snapshot.borrow().has_permission(key)
    }

    /// Wait until a snapshot satisfies `predicate`.
    pub async fn wait_for<F>(&self, mut predicate: F) -> Result<AuthSnapshot, AuthError>
    where
        F: FnMut(&AuthSnapshot) -> bool,
    {
        let mut rx = self.snapshot.clone();
        let snapshot = rx
            .wait_for(|s| predicate(s))
            .await
            .map_err(|_| AuthError::Internal("session controller stopped".into()))?
            .clone();
        Ok(snapshot)
    }

    /// Wait until the stage is no longer `Loading` and no fetch is in flight.
    pub async fn wait_until_settled(&self) -> Result<AuthSnapshot, AuthError> {
        self.wait_for(|s| s.stage.is_settled() && !s.fetch_in_flight)
            .await
    }

    /// Ask the provider to end the session.
    ///
    /// The stage is not touched here; the provider's `SIGNED_OUT` event
    /// drives the transition.
    pub async fn sign_out(&self) -> Result<(), AuthError> {
        info!("sign-out requested");
        self.source.invalidate_session().await
    }

    /// Stop the controller task.
    pub fn shutdown(&self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests;
