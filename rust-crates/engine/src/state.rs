//! The engine's shared mutable state and the events it publishes.

use crate::{
    action::{
        ActionError,
        ActionKind,
        ActionOrigin,
        ActionStatus,
        PendingAction,
        TxOutcome,
    },
    capability::{
        self,
        CapabilityFlags,
        JoinLabel,
    },
    countdown::CountdownClock,
    snapshot::{
        Account,
        RoundSnapshot,
        SnapshotId,
    },
};
use std::sync::{
    Arc,
    Mutex,
    MutexGuard,
    atomic::{
        AtomicBool,
        Ordering,
    },
};
use tokio::sync::mpsc;

/// Latest snapshot, countdown, flags and pending action. Only ever touched
/// through [`SharedState`] and never held across an await.
#[derive(Debug)]
pub struct EngineState {
    account: Account,
    snapshot: Option<Arc<RoundSnapshot>>,
    countdown: CountdownClock,
    flags: CapabilityFlags,
    pending: Option<PendingAction>,
    unconfirmed: Option<PendingAction>,
    last_finished: Option<PendingAction>,
    next_action_id: u64,
    auto_act: AutoActGate,
}

/// Keeps auto-act from firing on a snapshot read before the last action
/// settled. Snapshot ids are build sequence numbers.
#[derive(Debug, Default)]
struct AutoActGate {
    /// Set between a settle and the end of its settle delay.
    held: Option<u64>,
    generation: u64,
    /// Only snapshots with a greater id may trigger auto-act.
    floor: u64,
    last_build_started: u64,
}

impl EngineState {
    pub fn new(account: Account) -> Self {
        Self {
            account,
            snapshot: None,
            countdown: CountdownClock::new(),
            flags: CapabilityFlags::default(),
            pending: None,
            unconfirmed: None,
            last_finished: None,
            next_action_id: 1,
            auto_act: AutoActGate::default(),
        }
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    pub fn snapshot(&self) -> Option<&Arc<RoundSnapshot>> {
        self.snapshot.as_ref()
    }

    pub fn countdown(&self) -> &CountdownClock {
        &self.countdown
    }

    pub fn seconds_remaining(&self) -> u64 {
        self.countdown.seconds_remaining()
    }

    pub fn flags(&self) -> &CapabilityFlags {
        &self.flags
    }

    pub fn pending(&self) -> Option<&PendingAction> {
        self.pending.as_ref()
    }

    pub fn pending_mut(&mut self) -> Option<&mut PendingAction> {
        self.pending.as_mut()
    }

    pub fn unconfirmed(&self) -> Option<&PendingAction> {
        self.unconfirmed.as_ref()
    }

    pub fn last_finished(&self) -> Option<&PendingAction> {
        self.last_finished.as_ref()
    }

    /// Installs a freshly built snapshot: re-bases the countdown if needed,
    /// recomputes flags and drops any remembered unconfirmed action.
    pub fn apply_snapshot(&mut self, snapshot: RoundSnapshot, now_epoch: u64) {
        self.countdown.on_snapshot(&snapshot, now_epoch);
        self.snapshot = Some(Arc::new(snapshot));
        self.unconfirmed = None;
        self.recompute_flags();
    }

    pub fn tick(&mut self) -> u64 {
        let remaining = self.countdown.tick();
        self.recompute_flags();
        remaining
    }

    pub(crate) fn note_build_started(&mut self, id: SnapshotId) {
        let gate = &mut self.auto_act;
        gate.last_build_started = gate.last_build_started.max(id.0);
    }

    /// Blocks auto-act after an action settles. Returns the generation to
    /// pass to [`EngineState::rearm_auto_act`].
    pub(crate) fn hold_auto_act(&mut self) -> u64 {
        let gate = &mut self.auto_act;
        gate.generation += 1;
        gate.held = Some(gate.generation);
        gate.generation
    }

    /// Lifts the hold from `generation`; from here on only a build started
    /// later may trigger auto-act. A newer hold stays in place.
    pub(crate) fn rearm_auto_act(&mut self, generation: u64) {
        let gate = &mut self.auto_act;
        if gate.held == Some(generation) {
            gate.held = None;
            gate.floor = gate.last_build_started;
        }
    }

    pub fn auto_act_allowed(&self, id: SnapshotId) -> bool {
        self.auto_act.held.is_none() && id.0 > self.auto_act.floor
    }

    pub(crate) fn claim_slot(
        &mut self,
        kind: ActionKind,
        origin: ActionOrigin,
    ) -> Result<u64, ActionError> {
        if let Some(pending) = &self.pending {
            return Err(ActionError::AlreadyInFlight(pending.kind));
        }
        let id = self.next_action_id;
        self.next_action_id += 1;
        self.pending = Some(PendingAction::submitting(id, kind, origin));
        Ok(id)
    }

    /// Frees the slot if it still belongs to action `id`.
    pub(crate) fn release_slot(&mut self, id: u64) -> Option<PendingAction> {
        if self.pending.as_ref().map(|p| p.id) == Some(id) {
            self.pending.take()
        } else {
            None
        }
    }

    /// Keeps a released action around for display. One whose confirmation
    /// was never observed is held as unconfirmed until the next snapshot.
    pub(crate) fn record_finished(&mut self, action: PendingAction) {
        match action.status {
            ActionStatus::Confirmed | ActionStatus::Failed => {
                self.last_finished = Some(action);
            }
            ActionStatus::Submitting | ActionStatus::AwaitingConfirmation => {
                self.unconfirmed = Some(action);
            }
        }
    }

    fn recompute_flags(&mut self) {
        self.flags = match &self.snapshot {
            Some(snapshot) => capability::evaluate(
                snapshot,
                &self.account,
                self.countdown.seconds_remaining(),
            ),
            None => CapabilityFlags::default(),
        };
    }

    pub fn view(&self) -> EngineView {
        EngineView {
            account: self.account.clone(),
            snapshot: self.snapshot.clone(),
            seconds_remaining: self.countdown.seconds_remaining(),
            flags: self.flags,
            join_label: self
                .snapshot
                .as_ref()
                .map(|snapshot| JoinLabel::from_flags(snapshot, &self.flags)),
            pending: self.pending.clone(),
            unconfirmed: self.unconfirmed.clone(),
            last_finished: self.last_finished.clone(),
        }
    }
}

pub type SharedState = Arc<Mutex<EngineState>>;

pub(crate) fn lock(state: &SharedState) -> MutexGuard<'_, EngineState> {
    // A panic while holding the lock leaves plain data behind; keep going.
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Read-only copy of the state handed to the UI.
#[derive(Clone, Debug)]
pub struct EngineView {
    pub account: Account,
    pub snapshot: Option<Arc<RoundSnapshot>>,
    pub seconds_remaining: u64,
    pub flags: CapabilityFlags,
    pub join_label: Option<JoinLabel>,
    pub pending: Option<PendingAction>,
    pub unconfirmed: Option<PendingAction>,
    pub last_finished: Option<PendingAction>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum EngineEvent {
    SnapshotApplied {
        id: SnapshotId,
        round_id: u64,
    },
    RefreshFailed {
        reason: String,
    },
    Tick {
        seconds_remaining: u64,
    },
    ActionStarted {
        kind: ActionKind,
        origin: ActionOrigin,
    },
    ActionFinished {
        kind: ActionKind,
        origin: ActionOrigin,
        result: Result<TxOutcome, ActionError>,
    },
}

/// Fan-out to the UI layer. Sending never fails the caller.
#[derive(Clone, Debug, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<EngineEvent>>,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<EngineEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn disconnected() -> Self {
        Self { tx: None }
    }

    pub fn send(&self, event: EngineEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}

/// Cleared on teardown; outcomes arriving afterwards are dropped.
#[derive(Clone, Debug)]
pub struct Lifecycle(Arc<AtomicBool>);

impl Lifecycle {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub fn is_alive(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn shut_down(&self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}
