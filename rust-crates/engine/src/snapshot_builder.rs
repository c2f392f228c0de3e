//! Turns one round of contract reads into a [`RoundSnapshot`].

use crate::{
    remote::{
        LotteryReader,
        PoolReader,
        ReadError,
    },
    snapshot::{
        Account,
        AccountView,
        LastResult,
        RoundSnapshot,
        RoundState,
        RoundTiming,
        SnapshotId,
        Variant,
        Wei,
    },
};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::trace;

/// Something that can assemble a complete snapshot. Builds are independent of
/// each other and may overlap.
pub trait SnapshotSource: Send + Sync + 'static {
    fn build_snapshot(
        &self,
        id: SnapshotId,
    ) -> impl Future<Output = Result<RoundSnapshot, ReadError>> + Send;
}

pub struct PoolSnapshotBuilder<R> {
    reader: Arc<R>,
    viewer: Account,
    join_stake: Wei,
}

impl<R: PoolReader> PoolSnapshotBuilder<R> {
    pub fn new(reader: Arc<R>, viewer: Account, join_stake: Wei) -> Self {
        Self {
            reader,
            viewer,
            join_stake,
        }
    }
}

impl<R: PoolReader> SnapshotSource for PoolSnapshotBuilder<R> {
    async fn build_snapshot(&self, id: SnapshotId) -> Result<RoundSnapshot, ReadError> {
        let fetched_at = Instant::now();
        let reader = &self.reader;
        let (participants, pool_balance, round_id, start, duration, owner, last_joined) =
            futures::try_join!(
                reader.participants(),
                reader.pool_balance(),
                reader.round_id(),
                reader.round_start(),
                reader.round_duration(),
                reader.owner(),
                reader.last_joined_round(&self.viewer),
            )?;

        // the recipient lookup needs the round id, so it cannot join the batch
        let last_result = if round_id > 1 {
            let recipient = reader.reward_recipient(round_id - 1).await?;
            if recipient.is_zero() {
                LastResult::NoWinner
            } else {
                LastResult::Winner(recipient)
            }
        } else {
            LastResult::Pending
        };
        trace!(%id, round_id, players = participants.len(), "pool snapshot assembled");

        Ok(RoundSnapshot {
            id,
            variant: Variant::Pool,
            pool_balance,
            round_id,
            timing: RoundTiming::Scheduled { start, duration },
            state: RoundState::Open,
            participants,
            last_result,
            owner: Some(owner),
            viewer: AccountView {
                account: self.viewer.clone(),
                last_joined_round: (last_joined != 0).then_some(last_joined),
                claimable: 0,
            },
            entry_price: self.join_stake,
            fetched_at,
        })
    }
}

pub struct LotterySnapshotBuilder<R> {
    reader: Arc<R>,
    viewer: Account,
}

impl<R: LotteryReader> LotterySnapshotBuilder<R> {
    pub fn new(reader: Arc<R>, viewer: Account) -> Self {
        Self { reader, viewer }
    }
}

impl<R: LotteryReader> SnapshotSource for LotterySnapshotBuilder<R> {
    async fn build_snapshot(&self, id: SnapshotId) -> Result<RoundSnapshot, ReadError> {
        let fetched_at = Instant::now();
        let reader = &self.reader;
        let (pool_balance, state, seconds, claimable, entry_price, numbers) = futures::try_join!(
            reader.balance(),
            reader.state(),
            reader.time_until_next_draw(),
            reader.winnings(&self.viewer),
            reader.ticket_price(),
            reader.winning_numbers(),
        )?;
        trace!(%id, seconds, ?state, "lottery snapshot assembled");

        Ok(RoundSnapshot {
            id,
            variant: Variant::Lottery,
            pool_balance,
            round_id: 0,
            timing: RoundTiming::Countdown { seconds },
            state,
            participants: Vec::new(),
            last_result: numbers.map_or(LastResult::Pending, LastResult::Numbers),
            owner: None,
            viewer: AccountView {
                account: self.viewer.clone(),
                last_joined_round: None,
                claimable,
            },
            entry_price,
            fetched_at,
        })
    }
}

/// Either variant's builder, picked at start-up from configuration.
pub enum VariantBuilder<P, L> {
    Pool(PoolSnapshotBuilder<P>),
    Lottery(LotterySnapshotBuilder<L>),
}

impl<P: PoolReader, L: LotteryReader> SnapshotSource for VariantBuilder<P, L> {
    async fn build_snapshot(&self, id: SnapshotId) -> Result<RoundSnapshot, ReadError> {
        match self {
            VariantBuilder::Pool(builder) => builder.build_snapshot(id).await,
            VariantBuilder::Lottery(builder) => builder.build_snapshot(id).await,
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use crate::test_helpers::{
        ALICE,
        BOB,
        FakeChain,
        OWNER,
        account,
    };

    #[tokio::test]
    async fn build_snapshot__first_round__has_pending_result() {
        // given
        let chain = FakeChain::pool(account(OWNER), 1_000, 600);
        let builder = PoolSnapshotBuilder::new(chain.reader(), account(ALICE), 7);

        // when
        let snapshot = builder.build_snapshot(SnapshotId(1)).await.unwrap();

        // then
        assert_eq!(snapshot.round_id, 1);
        assert_eq!(snapshot.last_result, LastResult::Pending);
        assert_eq!(snapshot.owner, Some(account(OWNER)));
        assert_eq!(snapshot.entry_price, 7);
        assert_eq!(snapshot.viewer.last_joined_round, None);
        assert_eq!(
            snapshot.timing,
            RoundTiming::Scheduled {
                start: 1_000,
                duration: 600
            }
        );
    }

    #[tokio::test]
    async fn build_snapshot__previous_round_won__reports_winner() {
        // given
        let chain = FakeChain::pool(account(OWNER), 1_000, 600);
        chain.with_state(|s| {
            s.round_id = 3;
            s.recipients.insert(2, account(BOB));
            s.participants = vec![account(ALICE)];
            s.last_joined.insert(account(ALICE), 3);
        });
        let builder = PoolSnapshotBuilder::new(chain.reader(), account(ALICE), 7);

        // when
        let snapshot = builder.build_snapshot(SnapshotId(1)).await.unwrap();

        // then
        assert_eq!(snapshot.last_result, LastResult::Winner(account(BOB)));
        assert_eq!(snapshot.participants, vec![account(ALICE)]);
        assert_eq!(snapshot.viewer.last_joined_round, Some(3));
    }

    #[tokio::test]
    async fn build_snapshot__previous_round_without_recipient__reports_no_winner() {
        let chain = FakeChain::pool(account(OWNER), 1_000, 600);
        chain.with_state(|s| s.round_id = 2);
        let builder = PoolSnapshotBuilder::new(chain.reader(), account(ALICE), 7);

        let snapshot = builder.build_snapshot(SnapshotId(1)).await.unwrap();

        assert_eq!(snapshot.last_result, LastResult::NoWinner);
    }

    #[tokio::test]
    async fn build_snapshot__any_read_failing__fails_whole_build() {
        // given
        let chain = FakeChain::pool(account(OWNER), 1_000, 600);
        chain.fail_reads_on("owner");
        let builder = PoolSnapshotBuilder::new(chain.reader(), account(ALICE), 7);

        // when
        let result = builder.build_snapshot(SnapshotId(1)).await;

        // then
        assert!(matches!(result, Err(ReadError::Call { call: "owner", .. })));
    }

    #[tokio::test]
    async fn build_snapshot__lottery_without_numbers__is_pending_with_no_owner() {
        // given
        let chain = FakeChain::lottery(90, 5);
        chain.with_state(|s| s.winnings.insert(account(ALICE), 11));
        let builder = LotterySnapshotBuilder::new(chain.reader(), account(ALICE));

        // when
        let snapshot = builder.build_snapshot(SnapshotId(4)).await.unwrap();

        // then
        assert_eq!(snapshot.last_result, LastResult::Pending);
        assert_eq!(snapshot.owner, None);
        assert_eq!(snapshot.timing, RoundTiming::Countdown { seconds: 90 });
        assert_eq!(snapshot.viewer.claimable, 11);
        assert_eq!(snapshot.entry_price, 5);
        assert!(snapshot.participants.is_empty());
    }
}
