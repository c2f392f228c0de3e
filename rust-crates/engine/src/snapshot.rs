use serde::{
    Deserialize,
    Serialize,
};
use std::{
    fmt,
    str::FromStr,
};
use tokio::time::Instant;

/// Amounts in the smallest currency unit.
pub type Wei = u128;

/// Contract account identifier. Stored lower-cased so comparisons are
/// case-insensitive.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Account(String);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AccountError {
    #[error("account `{0}` must start with 0x")]
    MissingPrefix(String),
    #[error("account `{0}` is not 20 bytes of hex")]
    InvalidHex(String),
}

impl Account {
    pub const ZERO: &'static str = "0x0000000000000000000000000000000000000000";

    pub fn parse(raw: &str) -> Result<Self, AccountError> {
        let trimmed = raw.trim();
        let body = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .ok_or_else(|| AccountError::MissingPrefix(raw.to_string()))?;
        let bytes =
            hex::decode(body).map_err(|_| AccountError::InvalidHex(raw.to_string()))?;
        if bytes.len() != 20 {
            return Err(AccountError::InvalidHex(raw.to_string()));
        }
        Ok(Self(format!("0x{}", hex::encode(bytes))))
    }

    pub fn zero() -> Self {
        Self(Self::ZERO.to_string())
    }

    pub fn is_zero(&self) -> bool {
        self.0 == Self::ZERO
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `0x1234...abcd`
    pub fn short(&self) -> String {
        format!("{}...{}", &self.0[..6], &self.0[self.0.len() - 4..])
    }
}

impl fmt::Display for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Account {
    type Err = AccountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Account {
    type Error = AccountError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Account> for String {
    fn from(account: Account) -> Self {
        account.0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    /// Join a pool, one winner per round, administrator distributes.
    #[default]
    Pool,
    /// Pick seven numbers, anyone may trigger the draw once time is up.
    Lottery,
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Variant::Pool => f.write_str("pool"),
            Variant::Lottery => f.write_str("lottery"),
        }
    }
}

impl FromStr for Variant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pool" => Ok(Variant::Pool),
            "lottery" => Ok(Variant::Lottery),
            other => Err(format!("unknown variant `{other}` (expected pool or lottery)")),
        }
    }
}

pub const TICKET_SIZE: usize = 7;
pub const TICKET_MAX: u8 = 49;

/// Seven lottery numbers, each in `1..=49`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TicketNumbers([u8; TICKET_SIZE]);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TicketError {
    #[error("expected 7 numbers, got {0}")]
    WrongCount(usize),
    #[error("`{0}` is not a number between 1 and 49")]
    OutOfRange(String),
}

impl TicketNumbers {
    pub fn new(numbers: [u8; TICKET_SIZE]) -> Result<Self, TicketError> {
        if let Some(bad) = numbers.iter().find(|n| **n == 0 || **n > TICKET_MAX) {
            return Err(TicketError::OutOfRange(bad.to_string()));
        }
        Ok(Self(numbers))
    }

    /// Parses whitespace or comma separated numbers.
    pub fn parse(raw: &str) -> Result<Self, TicketError> {
        let parts: Vec<&str> = raw
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|p| !p.is_empty())
            .collect();
        if parts.len() != TICKET_SIZE {
            return Err(TicketError::WrongCount(parts.len()));
        }
        let mut numbers = [0u8; TICKET_SIZE];
        for (slot, part) in numbers.iter_mut().zip(parts) {
            *slot = part
                .parse::<u8>()
                .map_err(|_| TicketError::OutOfRange(part.to_string()))?;
        }
        Self::new(numbers)
    }

    pub fn numbers(&self) -> &[u8; TICKET_SIZE] {
        &self.0
    }
}

impl fmt::Display for TicketNumbers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|n| n.to_string()).collect();
        f.write_str(&parts.join(" "))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoundState {
    Open,
    Drawing,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoundTiming {
    /// Pool rounds: epoch start plus fixed duration.
    Scheduled { start: u64, duration: u64 },
    /// Lottery rounds: the contract reports the remaining seconds directly.
    Countdown { seconds: u64 },
}

impl RoundTiming {
    pub fn remaining_at(&self, now_epoch: u64) -> u64 {
        match *self {
            RoundTiming::Scheduled { start, duration } => {
                start.saturating_add(duration).saturating_sub(now_epoch)
            }
            RoundTiming::Countdown { seconds } => seconds,
        }
    }

    pub fn duration(&self) -> Option<u64> {
        match *self {
            RoundTiming::Scheduled { duration, .. } => Some(duration),
            RoundTiming::Countdown { .. } => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LastResult {
    /// No round has completed yet.
    Pending,
    NoWinner,
    Winner(Account),
    Numbers(TicketNumbers),
}

/// Per-account fields read for the local account.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccountView {
    pub account: Account,
    pub last_joined_round: Option<u64>,
    pub claimable: Wei,
}

impl AccountView {
    pub fn empty(account: Account) -> Self {
        Self {
            account,
            last_joined_round: None,
            claimable: 0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SnapshotId(pub u64);

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One reconciliation pass over the contract. The fields come from
/// independent reads and may straddle a round transition.
#[derive(Clone, Debug, PartialEq)]
pub struct RoundSnapshot {
    pub id: SnapshotId,
    pub variant: Variant,
    pub pool_balance: Wei,
    pub round_id: u64,
    pub timing: RoundTiming,
    pub state: RoundState,
    pub participants: Vec<Account>,
    pub last_result: LastResult,
    pub owner: Option<Account>,
    pub viewer: AccountView,
    pub entry_price: Wei,
    pub fetched_at: Instant,
}

impl RoundSnapshot {
    pub fn is_open(&self) -> bool {
        self.state == RoundState::Open
    }

    pub fn has_participant(&self, account: &Account) -> bool {
        self.participants.iter().any(|p| p == account)
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;

    #[test]
    fn parse__mixed_case_addresses__compare_equal() {
        // given
        let upper = "0xAbCdEf0123456789ABCDEF0123456789abcdef01";
        let lower = "0xabcdef0123456789abcdef0123456789abcdef01";

        // when
        let a = Account::parse(upper).unwrap();
        let b = Account::parse(lower).unwrap();

        // then
        assert_eq!(a, b);
        assert_eq!(a.as_str(), lower);
    }

    #[test]
    fn parse__short_hex__is_rejected() {
        let result = Account::parse("0x1234");
        assert_eq!(result, Err(AccountError::InvalidHex("0x1234".to_string())));
    }

    #[test]
    fn short__keeps_prefix_and_suffix() {
        let account = Account::parse("0xabcdef0123456789abcdef0123456789abcdef01").unwrap();
        assert_eq!(account.short(), "0xabcd...ef01");
    }

    #[test]
    fn ticket_parse__seven_in_range_numbers__succeeds() {
        let ticket = TicketNumbers::parse("1, 2 3 4 5 6 49").unwrap();
        assert_eq!(ticket.numbers(), &[1, 2, 3, 4, 5, 6, 49]);
    }

    #[test]
    fn ticket_parse__out_of_range__fails() {
        let result = TicketNumbers::parse("1 2 3 4 5 6 50");
        assert_eq!(result, Err(TicketError::OutOfRange("50".to_string())));
    }

    #[test]
    fn ticket_parse__wrong_count__fails() {
        let result = TicketNumbers::parse("1 2 3");
        assert_eq!(result, Err(TicketError::WrongCount(3)));
    }

    #[test]
    fn remaining_at__past_deadline__clamps_to_zero() {
        let timing = RoundTiming::Scheduled {
            start: 1_000,
            duration: 600,
        };
        assert_eq!(timing.remaining_at(1_500), 100);
        assert_eq!(timing.remaining_at(2_000), 0);
    }
}
