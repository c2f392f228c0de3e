use crate::snapshot::{
    RoundSnapshot,
    RoundTiming,
    SnapshotId,
};

/// What a countdown baseline was derived from. A new snapshot only moves the
/// baseline when this changes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BaselineKey {
    Round { round_id: u64, deadline: u64 },
    Draw { seconds: u64 },
}

impl BaselineKey {
    fn of(snapshot: &RoundSnapshot) -> Self {
        match snapshot.timing {
            RoundTiming::Scheduled { start, duration } => BaselineKey::Round {
                round_id: snapshot.round_id,
                deadline: start.saturating_add(duration),
            },
            RoundTiming::Countdown { seconds } => BaselineKey::Draw { seconds },
        }
    }
}

/// Locally decrementing view of the time left in the current round.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CountdownClock {
    seconds_remaining: u64,
    based_on: Option<SnapshotId>,
    key: Option<BaselineKey>,
}

impl CountdownClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-bases the countdown when the snapshot describes a different round
    /// or draw time. Returns whether the baseline moved.
    pub fn on_snapshot(&mut self, snapshot: &RoundSnapshot, now_epoch: u64) -> bool {
        let key = BaselineKey::of(snapshot);
        if self.key == Some(key) {
            return false;
        }
        self.key = Some(key);
        self.based_on = Some(snapshot.id);
        self.seconds_remaining = snapshot.timing.remaining_at(now_epoch);
        true
    }

    /// One second elapsed. Stays at zero once expired.
    pub fn tick(&mut self) -> u64 {
        self.seconds_remaining = self.seconds_remaining.saturating_sub(1);
        self.seconds_remaining
    }

    pub fn seconds_remaining(&self) -> u64 {
        self.seconds_remaining
    }

    pub fn based_on(&self) -> Option<SnapshotId> {
        self.based_on
    }

    pub fn is_expired(&self) -> bool {
        self.key.is_some() && self.seconds_remaining == 0
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use crate::test_helpers::{
        lottery_snapshot,
        pool_snapshot,
    };
    use proptest::prelude::*;

    #[test]
    fn on_snapshot__same_round_and_deadline__keeps_ticking_baseline() {
        // given
        let mut clock = CountdownClock::new();
        let first = pool_snapshot(1, 5, 1_000, 600);
        clock.on_snapshot(&first, 1_100);
        clock.tick();
        clock.tick();

        // when
        let second = pool_snapshot(2, 5, 1_000, 600);
        let moved = clock.on_snapshot(&second, 1_102);

        // then
        assert!(!moved);
        assert_eq!(clock.seconds_remaining(), 498);
        assert_eq!(clock.based_on(), Some(SnapshotId(1)));
    }

    #[test]
    fn on_snapshot__new_round__rebases() {
        let mut clock = CountdownClock::new();
        clock.on_snapshot(&pool_snapshot(1, 5, 1_000, 600), 1_700);
        assert!(clock.is_expired());

        let moved = clock.on_snapshot(&pool_snapshot(2, 6, 1_700, 600), 1_710);

        assert!(moved);
        assert_eq!(clock.seconds_remaining(), 590);
        assert_eq!(clock.based_on(), Some(SnapshotId(2)));
    }

    #[test]
    fn on_snapshot__lottery_draw_time_changes__rebases_to_reported_seconds() {
        // given
        let mut clock = CountdownClock::new();
        clock.on_snapshot(&lottery_snapshot(1, 120), 0);

        // when
        let moved = clock.on_snapshot(&lottery_snapshot(2, 90), 0);

        // then
        assert!(moved);
        assert_eq!(clock.seconds_remaining(), 90);
        clock.tick();
        assert_eq!(clock.seconds_remaining(), 89);
    }

    #[test]
    fn tick__at_zero__stays_at_zero() {
        let mut clock = CountdownClock::new();
        clock.on_snapshot(&lottery_snapshot(1, 1), 0);

        assert_eq!(clock.tick(), 0);
        assert_eq!(clock.tick(), 0);
        assert!(clock.is_expired());
    }

    #[test]
    fn is_expired__before_any_snapshot__is_false() {
        assert!(!CountdownClock::new().is_expired());
    }

    proptest! {
        #[test]
        fn on_snapshot__strictly_increasing_rounds__baseline_follows_last(
            steps in prop::collection::vec((1u64..5, 0u64..3_600, 0u64..10), 1..20),
        ) {
            let mut clock = CountdownClock::new();
            let mut round_id = 0;
            let mut now = 10_000;
            let mut last = None;
            for (index, (round_step, duration, ticks)) in steps.into_iter().enumerate() {
                round_id += round_step;
                now += ticks;
                let snapshot = pool_snapshot(index as u64, round_id, now, duration);
                for _ in 0..ticks {
                    clock.tick();
                }
                clock.on_snapshot(&snapshot, now);
                last = Some(snapshot);
            }
            let last = last.unwrap();
            prop_assert_eq!(clock.based_on(), Some(last.id));
            prop_assert_eq!(clock.seconds_remaining(), last.timing.remaining_at(now));
        }
    }
}
