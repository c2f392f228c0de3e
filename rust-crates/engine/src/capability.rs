//! What the local account may do in the current round.

use crate::snapshot::{
    Account,
    RoundSnapshot,
    Variant,
    Wei,
};
use std::fmt;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CapabilityFlags {
    pub can_join: bool,
    pub already_joined: bool,
    pub is_admin: bool,
    pub can_claim: bool,
    pub claimable_amount: Wei,
    pub can_distribute: bool,
    pub can_reset: bool,
    pub can_draw: bool,
}

/// Computes the flags for `account` given a snapshot and the current local
/// countdown. Total and side-effect free.
pub fn evaluate(
    snapshot: &RoundSnapshot,
    account: &Account,
    seconds_remaining: u64,
) -> CapabilityFlags {
    let own_view = snapshot.viewer.account == *account;
    let is_admin = snapshot.owner.as_ref() == Some(account);
    let already_joined = own_view
        && snapshot.variant == Variant::Pool
        && snapshot.viewer.last_joined_round == Some(snapshot.round_id);
    let claimable_amount = if own_view { snapshot.viewer.claimable } else { 0 };
    let time_left = seconds_remaining > 0;
    let expired = !time_left;
    let no_participants = snapshot.participants.is_empty();

    CapabilityFlags {
        can_join: !already_joined
            && snapshot.is_open()
            && (time_left || no_participants),
        already_joined,
        is_admin,
        can_claim: claimable_amount > 0,
        claimable_amount,
        can_distribute: is_admin && expired && !no_participants,
        can_reset: is_admin && expired && no_participants,
        can_draw: snapshot.variant == Variant::Lottery
            && is_admin
            && expired
            && snapshot.is_open(),
    }
}

/// Caption of the join/enter control.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinLabel {
    Join,
    Entered,
    WaitForReset,
    Drawing,
}

impl JoinLabel {
    pub fn from_flags(snapshot: &RoundSnapshot, flags: &CapabilityFlags) -> Self {
        if !snapshot.is_open() {
            JoinLabel::Drawing
        } else if flags.already_joined {
            JoinLabel::Entered
        } else if !flags.can_join {
            JoinLabel::WaitForReset
        } else {
            JoinLabel::Join
        }
    }
}

impl fmt::Display for JoinLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            JoinLabel::Join => "Join",
            JoinLabel::Entered => "Entered",
            JoinLabel::WaitForReset => "Wait for reset",
            JoinLabel::Drawing => "Drawing...",
        };
        f.write_str(text)
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
    use proptest::prelude::*;

    #[test]
    fn evaluate__empty_round_at_zero__can_join() {
        // given
        let snapshot = pool_snapshot(1, 3, 0, 60);

        // when
        let flags = evaluate(&snapshot, &account(ALICE), 0);

        // then
        assert!(flags.can_join);
        assert!(!flags.already_joined);
    }

    #[test]
    fn evaluate__one_participant_at_zero__cannot_join() {
        // given
        let mut snapshot = pool_snapshot(1, 3, 0, 60);
        snapshot.participants = vec![account(BOB)];

        // when
        let flags = evaluate(&snapshot, &account(ALICE), 0);

        // then
        assert!(!flags.can_join);
        assert_eq!(JoinLabel::from_flags(&snapshot, &flags), JoinLabel::WaitForReset);
    }

    #[test]
    fn evaluate__marker_matches_round__already_joined() {
        let mut snapshot = pool_snapshot(1, 3, 0, 60);
        snapshot.participants = vec![account(ALICE)];
        snapshot.viewer.last_joined_round = Some(3);

        let flags = evaluate(&snapshot, &account(ALICE), 30);

        assert!(flags.already_joined);
        assert!(!flags.can_join);
        assert_eq!(JoinLabel::from_flags(&snapshot, &flags), JoinLabel::Entered);
    }

    #[test]
    fn evaluate__marker_from_previous_round__not_joined() {
        let mut snapshot = pool_snapshot(1, 3, 0, 60);
        snapshot.viewer.last_joined_round = Some(2);

        let flags = evaluate(&snapshot, &account(ALICE), 30);

        assert!(!flags.already_joined);
        assert!(flags.can_join);
    }

    #[test]
    fn evaluate__owner_with_differently_cased_address__is_admin() {
        // given
        let snapshot = pool_snapshot(1, 3, 0, 60);
        let upper = OWNER.to_uppercase().replacen("0X", "0x", 1);

        // when
        let flags = evaluate(&snapshot, &Account::parse(&upper).unwrap(), 0);

        // then
        assert!(flags.is_admin);
        assert!(flags.can_reset);
        assert!(!flags.can_distribute);
    }

    #[test]
    fn evaluate__admin_with_time_left__cannot_distribute_or_reset() {
        let mut snapshot = pool_snapshot(1, 3, 0, 60);
        snapshot.participants = vec![account(BOB)];

        let flags = evaluate(&snapshot, &account(OWNER), 10);

        assert!(flags.is_admin);
        assert!(!flags.can_distribute);
        assert!(!flags.can_reset);
    }

    #[test]
    fn evaluate__lottery_drawing__cannot_join() {
        // given
        let mut snapshot = lottery_snapshot(1, 30);
        snapshot.state = RoundState::Drawing;

        // when
        let flags = evaluate(&snapshot, &account(ALICE), 30);

        // then
        assert!(!flags.can_join);
        assert!(!flags.is_admin);
        assert_eq!(JoinLabel::from_flags(&snapshot, &flags), JoinLabel::Drawing);
    }

    #[test]
    fn evaluate__positive_winnings__can_claim() {
        let mut snapshot = lottery_snapshot(1, 30);
        snapshot.viewer.claimable = 5;

        let flags = evaluate(&snapshot, &account(ALICE), 30);

        assert!(flags.can_claim);
        assert_eq!(flags.claimable_amount, 5);
    }

    #[test]
    fn evaluate__snapshot_read_for_other_account__ignores_its_balance() {
        let mut snapshot = lottery_snapshot(1, 30);
        snapshot.viewer.claimable = 5;

        let flags = evaluate(&snapshot, &account(BOB), 30);

        assert!(!flags.can_claim);
        assert_eq!(flags.claimable_amount, 0);
    }

    proptest! {
        #[test]
        fn evaluate__same_inputs__same_flags(
            participants in 0usize..4,
            marker in prop::option::of(0u64..6),
            claimable in 0u128..1_000,
            seconds in 0u64..120,
            drawing in any::<bool>(),
            as_owner in any::<bool>(),
        ) {
            let mut snapshot = pool_snapshot(1, 3, 0, 60);
            snapshot.participants = vec![account(BOB); participants];
            snapshot.viewer.last_joined_round = marker;
            snapshot.viewer.claimable = claimable;
            if drawing {
                snapshot.state = RoundState::Drawing;
            }
            let who = if as_owner { account(OWNER) } else { account(ALICE) };
            let before = snapshot.clone();

            let first = evaluate(&snapshot, &who, seconds);
            let second = evaluate(&snapshot, &who, seconds);

            prop_assert_eq!(first, second);
            prop_assert_eq!(before, snapshot);
        }
    }
}
