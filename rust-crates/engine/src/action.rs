//! Submission of round-affecting transactions, one at a time.

use crate::{
    config::EngineConfig,
    remote::{
        RemoteWriter,
        WriteCall,
        WriteError,
    },
    scheduler::RefreshTrigger,
    snapshot::{
        Account,
        RoundSnapshot,
        TicketNumbers,
        Variant,
    },
    state::{
        EngineEvent,
        EventSink,
        Lifecycle,
        SharedState,
        lock,
    },
};
use std::{
    fmt,
    sync::Arc,
};
use tokio::{
    sync::mpsc,
    time::{
        self,
        Instant,
    },
};
use tracing::{
    debug,
    error,
    info,
    trace,
    warn,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Join,
    Claim,
    Distribute,
    Reset,
    Draw,
    AutoDraw,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ActionKind::Join => "join",
            ActionKind::Claim => "claim",
            ActionKind::Distribute => "distribute",
            ActionKind::Reset => "reset",
            ActionKind::Draw => "draw",
            ActionKind::AutoDraw => "auto-draw",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActionOrigin {
    User,
    Auto,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActionStatus {
    Submitting,
    AwaitingConfirmation,
    Confirmed,
    Failed,
}

/// The single action allowed to be in flight.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingAction {
    pub id: u64,
    pub kind: ActionKind,
    pub origin: ActionOrigin,
    pub submitted_at: Instant,
    pub status: ActionStatus,
    pub tx_hash: Option<String>,
}

impl PendingAction {
    pub(crate) fn submitting(id: u64, kind: ActionKind, origin: ActionOrigin) -> Self {
        Self {
            id,
            kind,
            origin,
            submitted_at: Instant::now(),
            status: ActionStatus::Submitting,
            tx_hash: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UserAction {
    /// Pool join, or lottery entry with the chosen numbers.
    Join { numbers: Option<TicketNumbers> },
    Claim,
    Distribute,
    Reset,
    Draw,
}

impl UserAction {
    pub fn kind(&self) -> ActionKind {
        match self {
            UserAction::Join { .. } => ActionKind::Join,
            UserAction::Claim => ActionKind::Claim,
            UserAction::Distribute => ActionKind::Distribute,
            UserAction::Reset => ActionKind::Reset,
            UserAction::Draw => ActionKind::Draw,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxOutcome {
    pub kind: ActionKind,
    pub tx_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ActionError {
    #[error("a {0} transaction is already in flight")]
    AlreadyInFlight(ActionKind),
    #[error("cannot {kind}: {reason}")]
    Rejected { kind: ActionKind, reason: String },
    #[error("transaction reverted: {0}")]
    Reverted(String),
    #[error("transaction not confirmed: {0}")]
    NotConfirmed(String),
    #[error("engine has shut down")]
    ShutDown,
}

impl ActionError {
    fn rejected(kind: ActionKind, reason: impl Into<String>) -> Self {
        ActionError::Rejected {
            kind,
            reason: reason.into(),
        }
    }
}

/// Holds the in-flight slot. Dropping it frees the slot, also when the
/// driving future is dropped.
struct ActionGuard {
    state: SharedState,
    id: u64,
    kind: ActionKind,
    origin: ActionOrigin,
}

impl ActionGuard {
    fn set_status(&self, status: ActionStatus, tx_hash: Option<&str>) {
        let mut state = lock(&self.state);
        if let Some(pending) = state.pending_mut().filter(|p| p.id == self.id) {
            pending.status = status;
            if let Some(hash) = tx_hash {
                pending.tx_hash = Some(hash.to_string());
            }
        }
    }

    fn release(self, result: &Result<TxOutcome, ActionError>) {
        let mut state = lock(&self.state);
        let Some(mut action) = state.release_slot(self.id) else {
            return;
        };
        match result {
            Ok(_) => action.status = ActionStatus::Confirmed,
            // outcome unknown; the next snapshot decides
            Err(ActionError::NotConfirmed(_)) => {}
            Err(_) => action.status = ActionStatus::Failed,
        }
        state.record_finished(action);
    }
}

impl Drop for ActionGuard {
    fn drop(&mut self) {
        lock(&self.state).release_slot(self.id);
    }
}

/// Owns the at-most-one-action-in-flight invariant and drives the writer.
pub struct ActionCoordinator<W> {
    writer: Arc<W>,
    state: SharedState,
    refresh_tx: mpsc::UnboundedSender<RefreshTrigger>,
    events: EventSink,
    lifecycle: Lifecycle,
    config: Arc<EngineConfig>,
}

impl<W> Clone for ActionCoordinator<W> {
    fn clone(&self) -> Self {
        Self {
            writer: self.writer.clone(),
            state: self.state.clone(),
            refresh_tx: self.refresh_tx.clone(),
            events: self.events.clone(),
            lifecycle: self.lifecycle.clone(),
            config: self.config.clone(),
        }
    }
}

impl<W: RemoteWriter> ActionCoordinator<W> {
    pub fn new(
        writer: Arc<W>,
        state: SharedState,
        refresh_tx: mpsc::UnboundedSender<RefreshTrigger>,
        events: EventSink,
        lifecycle: Lifecycle,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            writer,
            state,
            refresh_tx,
            events,
            lifecycle,
            config,
        }
    }

    /// Runs a user-initiated action to a terminal outcome. The in-flight slot
    /// is claimed on the first poll, before any remote call.
    pub async fn perform_user_action(
        &self,
        action: UserAction,
    ) -> Result<TxOutcome, ActionError> {
        let kind = action.kind();
        let (guard, call) = match self.begin_user_action(&action) {
            Ok(started) => started,
            Err(err) => {
                debug!(%kind, %err, "user action refused");
                self.events.send(EngineEvent::ActionFinished {
                    kind,
                    origin: ActionOrigin::User,
                    result: Err(err.clone()),
                });
                return Err(err);
            }
        };
        self.events.send(EngineEvent::ActionStarted {
            kind,
            origin: ActionOrigin::User,
        });
        let result = self.drive(&guard, &call).await;
        self.settle(guard, &result);
        result
    }

    /// Starts the automatic round transition if the snapshot calls for one.
    /// `Ok(None)` means there is nothing to do; the returned future carries
    /// an already claimed slot and should be spawned.
    pub fn maybe_auto_act(
        &self,
        snapshot: &RoundSnapshot,
        seconds_remaining: u64,
    ) -> Result<Option<impl Future<Output = ()> + Send + 'static + use<W>>, ActionError>
    {
        if !self.config.auto_act || !self.lifecycle.is_alive() {
            return Ok(None);
        }
        let account = lock(&self.state).account().clone();
        let Some((kind, call)) = auto_action_for(snapshot, seconds_remaining, &account)
        else {
            return Ok(None);
        };
        let claimed = {
            let mut state = lock(&self.state);
            if !state.auto_act_allowed(snapshot.id) {
                trace!(
                    %kind,
                    id = %snapshot.id,
                    "waiting for a snapshot read after the last action"
                );
                return Ok(None);
            }
            state.claim_slot(kind, ActionOrigin::Auto)
        };
        let guard = match claimed {
            Ok(id) => self.guard(id, kind, ActionOrigin::Auto),
            Err(err) => {
                trace!(%kind, %err, "auto action skipped");
                return Err(err);
            }
        };
        info!(%kind, round_id = snapshot.round_id, "round expired, acting automatically");
        self.events.send(EngineEvent::ActionStarted {
            kind,
            origin: ActionOrigin::Auto,
        });

        let this = self.clone();
        Ok(Some(async move {
            let result = this.drive(&guard, &call).await;
            if let Err(err) = &result {
                warn!(%kind, %err, "auto action failed");
            }
            this.settle(guard, &result);
        }))
    }

    fn claim(
        &self,
        kind: ActionKind,
        origin: ActionOrigin,
    ) -> Result<ActionGuard, ActionError> {
        let id = lock(&self.state).claim_slot(kind, origin)?;
        Ok(self.guard(id, kind, origin))
    }

    fn guard(&self, id: u64, kind: ActionKind, origin: ActionOrigin) -> ActionGuard {
        ActionGuard {
            state: self.state.clone(),
            id,
            kind,
            origin,
        }
    }

    fn begin_user_action(
        &self,
        action: &UserAction,
    ) -> Result<(ActionGuard, WriteCall), ActionError> {
        let kind = action.kind();
        if !self.lifecycle.is_alive() {
            return Err(ActionError::ShutDown);
        }
        let call = {
            let state = lock(&self.state);
            if let Some(pending) = state.pending() {
                return Err(ActionError::AlreadyInFlight(pending.kind));
            }
            let snapshot = state
                .snapshot()
                .ok_or_else(|| ActionError::rejected(kind, "round state not loaded yet"))?;
            let flags = state.flags();
            match action {
                UserAction::Join { numbers } => {
                    if !flags.can_join {
                        return Err(ActionError::rejected(kind, "joining is closed"));
                    }
                    match (snapshot.variant, numbers) {
                        (Variant::Pool, _) => WriteCall::JoinPool {
                            value: snapshot.entry_price,
                        },
                        (Variant::Lottery, Some(numbers)) => WriteCall::Enter {
                            numbers: *numbers,
                            value: snapshot.entry_price,
                        },
                        (Variant::Lottery, None) => {
                            return Err(ActionError::rejected(kind, "pick 7 numbers first"));
                        }
                    }
                }
                UserAction::Claim => {
                    if !flags.can_claim {
                        return Err(ActionError::rejected(kind, "nothing to claim"));
                    }
                    WriteCall::Claim
                }
                UserAction::Distribute => {
                    if !flags.can_distribute {
                        return Err(admin_rejection(kind, flags.is_admin));
                    }
                    WriteCall::DistributeReward
                }
                UserAction::Reset => {
                    if !flags.can_reset {
                        return Err(admin_rejection(kind, flags.is_admin));
                    }
                    WriteCall::EmergencyReset
                }
                UserAction::Draw => {
                    if !flags.can_draw {
                        return Err(admin_rejection(kind, flags.is_admin));
                    }
                    WriteCall::Draw
                }
            }
        };
        let guard = self.claim(kind, ActionOrigin::User)?;
        Ok((guard, call))
    }

    async fn drive(
        &self,
        guard: &ActionGuard,
        call: &WriteCall,
    ) -> Result<TxOutcome, ActionError> {
        let kind = guard.kind;
        let gas_limit = self.gas_limit(call);
        info!(%kind, %call, gas_limit, "submitting transaction");
        let tx = match self.writer.submit(call, gas_limit).await {
            Ok(tx) => tx,
            Err(WriteError::Rejected(reason)) => {
                error!(%kind, %reason, "transaction refused");
                return Err(ActionError::Reverted(reason));
            }
            // may have been broadcast anyway
            Err(err) => {
                warn!(%kind, %err, "submission outcome unknown");
                return Err(ActionError::NotConfirmed(err.to_string()));
            }
        };
        guard.set_status(ActionStatus::AwaitingConfirmation, Some(&tx.hash));

        let timeout = self.config.confirmation_timeout();
        match time::timeout(timeout, self.writer.wait_for_confirmation(&tx)).await {
            Ok(Ok(())) => {
                info!(%kind, tx = %tx.hash, "transaction confirmed");
                Ok(TxOutcome {
                    kind,
                    tx_hash: tx.hash,
                })
            }
            Ok(Err(WriteError::Rejected(reason))) => {
                error!(%kind, tx = %tx.hash, %reason, "transaction reverted");
                Err(ActionError::Reverted(reason))
            }
            Ok(Err(err)) => {
                warn!(%kind, tx = %tx.hash, %err, "confirmation not observed");
                Err(ActionError::NotConfirmed(err.to_string()))
            }
            Err(_) => {
                warn!(%kind, tx = %tx.hash, ?timeout, "confirmation timed out");
                Err(ActionError::NotConfirmed(format!(
                    "no receipt for {} after {timeout:?}",
                    tx.hash
                )))
            }
        }
    }

    /// Applies a terminal outcome: auto-act held until a later snapshot, one
    /// delayed refresh, the slot freed and the result published. A no-op once
    /// the engine is torn down.
    fn settle(&self, guard: ActionGuard, result: &Result<TxOutcome, ActionError>) {
        if !self.lifecycle.is_alive() {
            debug!(kind = %guard.kind, "outcome arrived after shutdown, ignoring");
            return;
        }
        let generation = lock(&self.state).hold_auto_act();
        self.schedule_refresh(generation);
        let (kind, origin) = (guard.kind, guard.origin);
        guard.release(result);
        self.events.send(EngineEvent::ActionFinished {
            kind,
            origin,
            result: result.clone(),
        });
    }

    fn schedule_refresh(&self, generation: u64) {
        let refresh_tx = self.refresh_tx.clone();
        let lifecycle = self.lifecycle.clone();
        let state = self.state.clone();
        let delay = self.config.settle_delay();
        tokio::spawn(async move {
            time::sleep(delay).await;
            if lifecycle.is_alive() {
                lock(&state).rearm_auto_act(generation);
                let _ = refresh_tx.send(RefreshTrigger::PostAction);
            }
        });
    }

    fn gas_limit(&self, call: &WriteCall) -> u64 {
        let gas = &self.config.gas;
        match call {
            WriteCall::JoinPool { .. } => gas.join,
            WriteCall::Enter { .. } => gas.enter,
            WriteCall::Claim => gas.claim,
            WriteCall::DistributeReward => gas.distribute,
            WriteCall::EmergencyReset => gas.reset,
            WriteCall::Draw => gas.draw,
        }
    }
}

fn admin_rejection(kind: ActionKind, is_admin: bool) -> ActionError {
    if is_admin {
        ActionError::rejected(kind, "not available while the round is running")
    } else {
        ActionError::rejected(kind, "administrator only")
    }
}

/// The transition the round needs once its time is up, if `account` is
/// allowed to perform it.
pub fn auto_action_for(
    snapshot: &RoundSnapshot,
    seconds_remaining: u64,
    account: &Account,
) -> Option<(ActionKind, WriteCall)> {
    if seconds_remaining > 0 || !snapshot.is_open() {
        return None;
    }
    match snapshot.variant {
        Variant::Lottery => Some((ActionKind::AutoDraw, WriteCall::Draw)),
        Variant::Pool => {
            let is_owner = snapshot.owner.as_ref() == Some(account);
            (is_owner && !snapshot.participants.is_empty())
                .then_some((ActionKind::Distribute, WriteCall::DistributeReward))
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use crate::{
        snapshot::RoundState,
        test_helpers::{
            ALICE,
            BOB,
            OWNER,
            account,
            lottery_snapshot,
            pool_snapshot,
        },
    };

    #[test]
    fn auto_action_for__expired_open_lottery__draws_for_anyone() {
        let snapshot = lottery_snapshot(1, 0);

        let action = auto_action_for(&snapshot, 0, &account(ALICE));

        assert_eq!(action, Some((ActionKind::AutoDraw, WriteCall::Draw)));
    }

    #[test]
    fn auto_action_for__lottery_already_drawing__does_nothing() {
        let mut snapshot = lottery_snapshot(1, 0);
        snapshot.state = RoundState::Drawing;

        assert_eq!(auto_action_for(&snapshot, 0, &account(ALICE)), None);
    }

    #[test]
    fn auto_action_for__time_left__does_nothing() {
        let snapshot = lottery_snapshot(1, 5);

        assert_eq!(auto_action_for(&snapshot, 5, &account(ALICE)), None);
    }

    #[test]
    fn auto_action_for__expired_pool_with_players__distributes_only_for_owner() {
        // given
        let mut snapshot = pool_snapshot(1, 4, 0, 60);
        snapshot.participants = vec![account(BOB)];

        // when
        let as_owner = auto_action_for(&snapshot, 0, &account(OWNER));
        let as_player = auto_action_for(&snapshot, 0, &account(ALICE));

        // then
        assert_eq!(
            as_owner,
            Some((ActionKind::Distribute, WriteCall::DistributeReward))
        );
        assert_eq!(as_player, None);
    }

    #[test]
    fn auto_action_for__expired_empty_pool__is_left_alone() {
        let snapshot = pool_snapshot(1, 4, 0, 60);

        assert_eq!(auto_action_for(&snapshot, 0, &account(OWNER)), None);
    }
}
