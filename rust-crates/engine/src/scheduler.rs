//! Merges poll, push and post-action triggers into de-duplicated builds.

use crate::{
    clock::WallClock,
    remote::ReadError,
    snapshot::SnapshotId,
    snapshot_builder::SnapshotSource,
    state::{
        EngineEvent,
        EventSink,
        Lifecycle,
        SharedState,
        lock,
    },
};
use std::{
    sync::{
        Arc,
        Mutex,
    },
    time::Duration,
};
use tokio::time::{
    self,
    Instant,
};
use tracing::{
    debug,
    trace,
    warn,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefreshTrigger {
    Poll,
    Push,
    PostAction,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RefreshOutcome {
    Applied(SnapshotId),
    /// Another build was already running and will answer this trigger.
    Coalesced,
    /// Completed after a later-initiated build had been applied.
    Discarded(SnapshotId),
    Failed(ReadError),
    /// Completed after teardown.
    Abandoned,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BuildTicket {
    Start(u64),
    Coalesced,
}

/// Sequence numbers for builds. Results are applied in initiation order; a
/// result older than the last applied one is dropped.
#[derive(Debug, Default)]
pub struct BuildTracker {
    next_seq: u64,
    in_flight: Option<(u64, Instant)>,
    last_applied: u64,
}

impl BuildTracker {
    pub fn begin(&mut self, now: Instant, stale_after: Duration) -> BuildTicket {
        if let Some((_, started)) = self.in_flight
            && now.saturating_duration_since(started) < stale_after
        {
            return BuildTicket::Coalesced;
        }
        self.next_seq += 1;
        self.in_flight = Some((self.next_seq, now));
        BuildTicket::Start(self.next_seq)
    }

    /// Marks build `seq` as done and says whether its result may be applied.
    pub fn finish(&mut self, seq: u64, succeeded: bool) -> bool {
        if self.in_flight.is_some_and(|(current, _)| current == seq) {
            self.in_flight = None;
        }
        if !succeeded || seq <= self.last_applied {
            return false;
        }
        self.last_applied = seq;
        true
    }

    pub fn is_building(&self) -> bool {
        self.in_flight.is_some()
    }
}

pub struct RefreshScheduler<B> {
    inner: Arc<Inner<B>>,
}

struct Inner<B> {
    source: B,
    state: SharedState,
    tracker: Mutex<BuildTracker>,
    clock: Arc<dyn WallClock>,
    events: EventSink,
    lifecycle: Lifecycle,
    read_timeout: Duration,
    stale_after: Duration,
}

impl<B> Clone for RefreshScheduler<B> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<B: SnapshotSource> RefreshScheduler<B> {
    pub fn new(
        source: B,
        state: SharedState,
        clock: Arc<dyn WallClock>,
        events: EventSink,
        lifecycle: Lifecycle,
        read_timeout: Duration,
        stale_after: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                source,
                state,
                tracker: Mutex::new(BuildTracker::default()),
                clock,
                events,
                lifecycle,
                read_timeout,
                stale_after,
            }),
        }
    }

    /// Builds and applies a snapshot unless a build is already running.
    /// Failures leave the previous snapshot in place.
    pub async fn refresh(&self, trigger: RefreshTrigger) -> RefreshOutcome {
        let inner = &self.inner;
        let ticket = inner
            .tracker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .begin(Instant::now(), inner.stale_after);
        let seq = match ticket {
            BuildTicket::Start(seq) => seq,
            BuildTicket::Coalesced => {
                debug!(?trigger, "refresh coalesced into in-flight build");
                return RefreshOutcome::Coalesced;
            }
        };
        let id = SnapshotId(seq);
        lock(&inner.state).note_build_started(id);
        trace!(%id, ?trigger, "building snapshot");

        let result =
            match time::timeout(inner.read_timeout, inner.source.build_snapshot(id)).await {
                Ok(result) => result,
                Err(_) => Err(ReadError::Timeout(inner.read_timeout)),
            };
        let apply = inner
            .tracker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .finish(seq, result.is_ok());
        if !inner.lifecycle.is_alive() {
            return RefreshOutcome::Abandoned;
        }

        match result {
            Err(err) => {
                warn!(%err, ?trigger, "snapshot refresh failed");
                inner.events.send(EngineEvent::RefreshFailed {
                    reason: err.to_string(),
                });
                RefreshOutcome::Failed(err)
            }
            Ok(_) if !apply => {
                debug!(%id, "discarding snapshot superseded by a later build");
                RefreshOutcome::Discarded(id)
            }
            Ok(snapshot) => {
                let round_id = snapshot.round_id;
                let now = inner.clock.now_epoch();
                lock(&inner.state).apply_snapshot(snapshot, now);
                inner
                    .events
                    .send(EngineEvent::SnapshotApplied { id, round_id });
                RefreshOutcome::Applied(id)
            }
        }
    }

    pub fn is_building(&self) -> bool {
        self.inner
            .tracker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_building()
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;

    const STALE: Duration = Duration::from_secs(30);

    #[tokio::test(start_paused = true)]
    async fn begin__while_building__coalesces() {
        // given
        let mut tracker = BuildTracker::default();
        let now = Instant::now();
        assert_eq!(tracker.begin(now, STALE), BuildTicket::Start(1));

        // when
        let second = tracker.begin(now + Duration::from_secs(1), STALE);

        // then
        assert_eq!(second, BuildTicket::Coalesced);
    }

    #[tokio::test(start_paused = true)]
    async fn begin__in_flight_build_gone_stale__starts_a_new_one() {
        let mut tracker = BuildTracker::default();
        let now = Instant::now();
        tracker.begin(now, STALE);

        let second = tracker.begin(now + STALE, STALE);

        assert_eq!(second, BuildTicket::Start(2));
    }

    #[tokio::test(start_paused = true)]
    async fn finish__earlier_build_completing_last__is_discarded() {
        // given
        let mut tracker = BuildTracker::default();
        let now = Instant::now();
        tracker.begin(now, STALE);
        tracker.begin(now + STALE, STALE);

        // when
        let later = tracker.finish(2, true);
        let earlier = tracker.finish(1, true);

        // then
        assert!(later);
        assert!(!earlier);
        assert!(!tracker.is_building());
    }

    #[tokio::test(start_paused = true)]
    async fn finish__earlier_build_completing_first__is_applied_then_superseded() {
        let mut tracker = BuildTracker::default();
        let now = Instant::now();
        tracker.begin(now, STALE);
        tracker.begin(now + STALE, STALE);

        assert!(tracker.finish(1, true));
        assert!(tracker.is_building());
        assert!(tracker.finish(2, true));
    }

    #[tokio::test(start_paused = true)]
    async fn finish__failed_build__frees_the_slot_without_applying() {
        let mut tracker = BuildTracker::default();
        tracker.begin(Instant::now(), STALE);

        assert!(!tracker.finish(1, false));
        assert_eq!(tracker.begin(Instant::now(), STALE), BuildTicket::Start(2));
    }
}
