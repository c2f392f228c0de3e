//! Typed read and write capabilities of the round contracts.

use crate::snapshot::{
    Account,
    RoundState,
    TicketNumbers,
    Wei,
};
use std::{
    fmt,
    time::Duration,
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReadError {
    #[error("remote call `{call}` failed: {reason}")]
    Call { call: &'static str, reason: String },
    #[error("snapshot reads timed out after {0:?}")]
    Timeout(Duration),
}

impl ReadError {
    pub fn call(call: &'static str, reason: impl Into<String>) -> Self {
        ReadError::Call {
            call,
            reason: reason.into(),
        }
    }
}

pub type ReadResult<T> = Result<T, ReadError>;

/// Read interface of the pool contract.
pub trait PoolReader: Send + Sync + 'static {
    fn participants(&self) -> impl Future<Output = ReadResult<Vec<Account>>> + Send;

    fn pool_balance(&self) -> impl Future<Output = ReadResult<Wei>> + Send;

    fn round_id(&self) -> impl Future<Output = ReadResult<u64>> + Send;

    fn round_start(&self) -> impl Future<Output = ReadResult<u64>> + Send;

    fn round_duration(&self) -> impl Future<Output = ReadResult<u64>> + Send;

    fn owner(&self) -> impl Future<Output = ReadResult<Account>> + Send;

    /// Round the account last joined, `0` if never.
    fn last_joined_round(
        &self,
        account: &Account,
    ) -> impl Future<Output = ReadResult<u64>> + Send;

    /// Winner of the given round; the zero account when nobody won.
    fn reward_recipient(
        &self,
        round_id: u64,
    ) -> impl Future<Output = ReadResult<Account>> + Send;
}

/// Read interface of the lottery contract.
pub trait LotteryReader: Send + Sync + 'static {
    fn balance(&self) -> impl Future<Output = ReadResult<Wei>> + Send;

    fn state(&self) -> impl Future<Output = ReadResult<RoundState>> + Send;

    fn time_until_next_draw(&self) -> impl Future<Output = ReadResult<u64>> + Send;

    fn winnings(&self, account: &Account) -> impl Future<Output = ReadResult<Wei>> + Send;

    fn ticket_price(&self) -> impl Future<Output = ReadResult<Wei>> + Send;

    /// `None` until the first draw has published numbers.
    fn winning_numbers(
        &self,
    ) -> impl Future<Output = ReadResult<Option<TicketNumbers>>> + Send;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WriteCall {
    JoinPool { value: Wei },
    Enter { numbers: TicketNumbers, value: Wei },
    Claim,
    DistributeReward,
    EmergencyReset,
    Draw,
}

impl WriteCall {
    /// Contract method name.
    pub fn method(&self) -> &'static str {
        match self {
            WriteCall::JoinPool { .. } => "joinPool",
            WriteCall::Enter { .. } => "enter",
            WriteCall::Claim => "claim",
            WriteCall::DistributeReward => "distributeReward",
            WriteCall::EmergencyReset => "emergencyReset",
            WriteCall::Draw => "draw",
        }
    }

    pub fn value(&self) -> Wei {
        match self {
            WriteCall::JoinPool { value } | WriteCall::Enter { value, .. } => *value,
            _ => 0,
        }
    }
}

impl fmt::Display for WriteCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteCall::Enter { numbers, .. } => write!(f, "enter({numbers})"),
            other => write!(f, "{}()", other.method()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxHandle {
    pub hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WriteError {
    /// The contract or the node refused the call.
    #[error("{0}")]
    Rejected(String),
    /// The transaction was sent but no terminal receipt could be observed.
    #[error("confirmation unavailable: {0}")]
    Unconfirmed(String),
    #[error("transport error: {0}")]
    Transport(String),
}

/// Write interface shared by both contracts. Calls a contract does not
/// support come back as [`WriteError::Rejected`].
pub trait RemoteWriter: Send + Sync + 'static {
    fn submit(
        &self,
        call: &WriteCall,
        gas_limit: u64,
    ) -> impl Future<Output = Result<TxHandle, WriteError>> + Send;

    /// Resolves once the transaction reaches a terminal state. A revert is
    /// [`WriteError::Rejected`] carrying the revert reason.
    fn wait_for_confirmation(
        &self,
        tx: &TxHandle,
    ) -> impl Future<Output = Result<(), WriteError>> + Send;
}
