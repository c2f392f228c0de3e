//! HTTP adapter for a JSON contract gateway. Implements the engine's reader,
//! writer and event subscription seams for both round contracts.

use color_eyre::eyre::{
    Result,
    WrapErr,
};
use reqwest::StatusCode;
use round_engine::{
    notifications::{
        EventSource,
        EventSubscriber,
        RoundEvent,
        SubscriptionError,
    },
    remote::{
        LotteryReader,
        PoolReader,
        ReadError,
        ReadResult,
        RemoteWriter,
        TxHandle,
        WriteCall,
        WriteError,
    },
    snapshot::{
        Account,
        RoundState,
        TICKET_SIZE,
        TicketNumbers,
        Wei,
    },
};
use serde::{
    Deserialize,
    Serialize,
    de::DeserializeOwned,
};
use std::{
    collections::VecDeque,
    fmt,
    time::Duration,
};
use tracing::{
    debug,
    trace,
};
use url::Url;

/// Gap between receipt polls while the gateway reports a transaction pending.
const RECEIPT_RETRY: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct GatewayClient {
    base_url: String,
    contract: Account,
    from: Account,
    http: reqwest::Client,
}

/// Why a single gateway request failed.
#[derive(Debug, Clone, PartialEq, Eq)]
enum GatewayFailure {
    /// The contract reverted the call.
    Reverted(String),
    /// The gateway refused the request itself (4xx).
    Refused(String),
    Unavailable(String),
}

impl fmt::Display for GatewayFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayFailure::Reverted(reason) => write!(f, "execution reverted: {reason}"),
            GatewayFailure::Refused(reason) => f.write_str(reason),
            GatewayFailure::Unavailable(reason) => f.write_str(reason),
        }
    }
}

impl GatewayClient {
    pub fn new(base_url: &Url, contract: Account, from: Account) -> Result<Self> {
        let base_url = base_url.as_str().trim_end_matches('/').to_string();
        let http = reqwest::Client::builder()
            .build()
            .wrap_err("failed to build HTTP client for gateway")?;
        Ok(Self {
            base_url,
            contract,
            from,
            http,
        })
    }

    fn contract_url(&self, suffix: &str) -> String {
        format!("{}/contracts/{}/{}", self.base_url, self.contract, suffix)
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &'static str,
        args: &[String],
    ) -> Result<T, GatewayFailure> {
        let query: Vec<(&str, &str)> = args.iter().map(|a| ("arg", a.as_str())).collect();
        trace!(method, ?args, "gateway call");
        let res = self
            .http
            .get(self.contract_url(&format!("call/{method}")))
            .query(&query)
            .send()
            .await
            .map_err(|e| GatewayFailure::Unavailable(format!("gateway request failed: {e}")))?;
        let dto: CallResponseDto<T> = read_json(res).await?;
        Ok(dto.value)
    }

    async fn read<T: DeserializeOwned>(
        &self,
        method: &'static str,
        args: &[String],
    ) -> ReadResult<T> {
        self.call(method, args)
            .await
            .map_err(|failure| ReadError::call(method, failure.to_string()))
    }

    async fn read_uint(&self, method: &'static str, args: &[String]) -> ReadResult<Wei> {
        let raw: UintDto = self.read(method, args).await?;
        raw.to_wei().map_err(|reason| ReadError::call(method, reason))
    }

    async fn read_u64(&self, method: &'static str, args: &[String]) -> ReadResult<u64> {
        let value = self.read_uint(method, args).await?;
        u64::try_from(value)
            .map_err(|_| ReadError::call(method, format!("{value} does not fit in 64 bits")))
    }

    async fn read_account(&self, method: &'static str, args: &[String]) -> ReadResult<Account> {
        let raw: String = self.read(method, args).await?;
        Account::parse(&raw).map_err(|e| ReadError::call(method, e.to_string()))
    }

    async fn fetch_receipt(&self, tx: &TxHandle) -> Result<ReceiptDto, GatewayFailure> {
        let url = format!("{}/tx/{}/receipt", self.base_url, tx.hash);
        let res = self
            .http
            .get(url)
            .query(&[("wait", "true")])
            .send()
            .await
            .map_err(|e| GatewayFailure::Unavailable(format!("gateway request failed: {e}")))?;
        if res.status() == StatusCode::NOT_FOUND {
            return Ok(ReceiptDto::pending());
        }
        read_json(res).await
    }

    async fn fetch_events(&self, after: u64) -> Result<EventsPageDto, SubscriptionError> {
        let res = self
            .http
            .get(self.contract_url("events"))
            .query(&[("after", after.to_string()), ("wait", "true".to_string())])
            .send()
            .await
            .map_err(|e| SubscriptionError::Failed(format!("gateway request failed: {e}")))?;
        if res.status() == StatusCode::GONE {
            return Err(SubscriptionError::Closed);
        }
        read_json(res)
            .await
            .map_err(|failure| SubscriptionError::Failed(failure.to_string()))
    }
}

async fn read_json<T: DeserializeOwned>(res: reqwest::Response) -> Result<T, GatewayFailure> {
    let status = res.status();
    let bytes = res.bytes().await.map_err(|e| {
        GatewayFailure::Unavailable(format!("failed to read gateway response body: {e}"))
    })?;
    if !status.is_success() {
        return Err(classify_failure(status, &bytes));
    }
    serde_json::from_slice(&bytes)
        .map_err(|e| GatewayFailure::Unavailable(format!("invalid gateway payload: {e}")))
}

fn classify_failure(status: StatusCode, body: &[u8]) -> GatewayFailure {
    let reason = serde_json::from_slice::<ErrorDto>(body)
        .map(|dto| dto.error)
        .unwrap_or_else(|_| String::from_utf8_lossy(body).into_owned());
    if status == StatusCode::CONFLICT {
        GatewayFailure::Reverted(reason)
    } else if status.is_client_error() {
        GatewayFailure::Refused(format!("gateway responded with {status}: {reason}"))
    } else {
        GatewayFailure::Unavailable(format!("gateway responded with {status}: {reason}"))
    }
}

impl PoolReader for GatewayClient {
    async fn participants(&self) -> ReadResult<Vec<Account>> {
        let raw: Vec<String> = self.read("getParticipants", &[]).await?;
        raw.iter()
            .map(|p| Account::parse(p))
            .collect::<Result<_, _>>()
            .map_err(|e| ReadError::call("getParticipants", e.to_string()))
    }

    async fn pool_balance(&self) -> ReadResult<Wei> {
        self.read_uint("getPoolBalance", &[]).await
    }

    async fn round_id(&self) -> ReadResult<u64> {
        self.read_u64("roundId", &[]).await
    }

    async fn round_start(&self) -> ReadResult<u64> {
        self.read_u64("roundStart", &[]).await
    }

    async fn round_duration(&self) -> ReadResult<u64> {
        self.read_u64("ROUND_DURATION", &[]).await
    }

    async fn owner(&self) -> ReadResult<Account> {
        self.read_account("owner", &[]).await
    }

    async fn last_joined_round(&self, account: &Account) -> ReadResult<u64> {
        self.read_u64("lastJoinedRound", &[account.to_string()])
            .await
    }

    async fn reward_recipient(&self, round_id: u64) -> ReadResult<Account> {
        self.read_account("getRewardRecipient", &[round_id.to_string()])
            .await
    }
}

impl LotteryReader for GatewayClient {
    /// Native balance held by the contract, not a contract method.
    async fn balance(&self) -> ReadResult<Wei> {
        let res = self
            .http
            .get(format!("{}/accounts/{}/balance", self.base_url, self.contract))
            .send()
            .await
            .map_err(|e| ReadError::call("balance", format!("gateway request failed: {e}")))?;
        let dto: CallResponseDto<UintDto> = read_json(res)
            .await
            .map_err(|failure| ReadError::call("balance", failure.to_string()))?;
        dto.value
            .to_wei()
            .map_err(|reason| ReadError::call("balance", reason))
    }

    async fn state(&self) -> ReadResult<RoundState> {
        match self.read_uint("state", &[]).await? {
            0 => Ok(RoundState::Open),
            1 => Ok(RoundState::Drawing),
            other => Err(ReadError::call("state", format!("unknown lottery state {other}"))),
        }
    }

    async fn time_until_next_draw(&self) -> ReadResult<u64> {
        self.read_u64("getTimeUntilNextDraw", &[]).await
    }

    async fn winnings(&self, account: &Account) -> ReadResult<Wei> {
        self.read_uint("winnings", &[account.to_string()]).await
    }

    async fn ticket_price(&self) -> ReadResult<Wei> {
        self.read_uint("ticketPrice", &[]).await
    }

    async fn winning_numbers(&self) -> ReadResult<Option<TicketNumbers>> {
        let raw: Vec<UintDto> = match self.call("getWinningNumbers", &[]).await {
            Ok(raw) => raw,
            // reverts until the first draw
            Err(GatewayFailure::Reverted(reason)) => {
                debug!(%reason, "no winning numbers published yet");
                return Ok(None);
            }
            Err(failure) => {
                return Err(ReadError::call("getWinningNumbers", failure.to_string()));
            }
        };
        decode_winning_numbers(&raw).map_err(|reason| ReadError::call("getWinningNumbers", reason))
    }
}

fn decode_winning_numbers(raw: &[UintDto]) -> Result<Option<TicketNumbers>, String> {
    let values = raw
        .iter()
        .map(UintDto::to_wei)
        .collect::<Result<Vec<_>, _>>()?;
    if values.iter().all(|v| *v == 0) {
        return Ok(None);
    }
    let numbers: [u8; TICKET_SIZE] = values
        .iter()
        .map(|v| u8::try_from(*v).map_err(|_| format!("{v} is not a lottery number")))
        .collect::<Result<Vec<_>, _>>()?
        .try_into()
        .map_err(|v: Vec<u8>| format!("expected {TICKET_SIZE} numbers, got {}", v.len()))?;
    TicketNumbers::new(numbers)
        .map(Some)
        .map_err(|e| e.to_string())
}

impl RemoteWriter for GatewayClient {
    async fn submit(&self, call: &WriteCall, gas_limit: u64) -> Result<TxHandle, WriteError> {
        let body = TxRequestDto::new(&self.from, call, gas_limit);
        debug!(%call, gas_limit, "submitting transaction");
        let res = self
            .http
            .post(self.contract_url("tx"))
            .json(&body)
            .send()
            .await
            .map_err(|e| WriteError::Transport(format!("gateway request failed: {e}")))?;
        let dto: TxResponseDto = read_json(res).await.map_err(|failure| match failure {
            GatewayFailure::Reverted(reason) | GatewayFailure::Refused(reason) => {
                WriteError::Rejected(reason)
            }
            GatewayFailure::Unavailable(reason) => WriteError::Transport(reason),
        })?;
        Ok(TxHandle { hash: dto.hash })
    }

    async fn wait_for_confirmation(&self, tx: &TxHandle) -> Result<(), WriteError> {
        loop {
            let receipt = self.fetch_receipt(tx).await.map_err(|failure| match failure {
                GatewayFailure::Reverted(reason) => WriteError::Rejected(reason),
                other => WriteError::Unconfirmed(other.to_string()),
            })?;
            match receipt.status {
                ReceiptStatusDto::Confirmed => return Ok(()),
                ReceiptStatusDto::Reverted => {
                    let reason = receipt
                        .reason
                        .unwrap_or_else(|| "execution reverted".to_string());
                    return Err(WriteError::Rejected(reason));
                }
                ReceiptStatusDto::Pending => {
                    trace!(hash = %tx.hash, "transaction still pending");
                    tokio::time::sleep(RECEIPT_RETRY).await;
                }
            }
        }
    }
}

impl EventSubscriber for GatewayClient {
    type Source = GatewayEventSource;

    /// Starts from the current head so only new events trigger refreshes.
    async fn subscribe(&self) -> Result<GatewayEventSource, SubscriptionError> {
        let res = self
            .http
            .get(self.contract_url("events/head"))
            .send()
            .await
            .map_err(|e| SubscriptionError::Failed(format!("gateway request failed: {e}")))?;
        let head: EventHeadDto = read_json(res)
            .await
            .map_err(|failure| SubscriptionError::Failed(failure.to_string()))?;
        debug!(cursor = head.cursor, "subscribed to contract events");
        Ok(GatewayEventSource {
            client: self.clone(),
            cursor: head.cursor,
            buffered: VecDeque::new(),
        })
    }
}

pub struct GatewayEventSource {
    client: GatewayClient,
    cursor: u64,
    buffered: VecDeque<RoundEvent>,
}

impl EventSource for GatewayEventSource {
    async fn next_event(&mut self) -> Result<RoundEvent, SubscriptionError> {
        loop {
            if let Some(event) = self.buffered.pop_front() {
                return Ok(event);
            }
            let page = self.client.fetch_events(self.cursor).await?;
            for dto in page.events {
                self.cursor = self.cursor.max(dto.cursor);
                match dto.into_round_event() {
                    Ok(Some(event)) => self.buffered.push_back(event),
                    Ok(None) => {}
                    Err(reason) => debug!(%reason, "skipping malformed contract event"),
                }
            }
        }
    }
}

impl fmt::Display for GatewayClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.base_url, self.contract)
    }
}

#[derive(Debug, Deserialize)]
struct CallResponseDto<T> {
    value: T,
}

#[derive(Debug, Deserialize)]
struct ErrorDto {
    error: String,
}

/// Gateways send uints as decimal strings; small ones sometimes as numbers.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
enum UintDto {
    Text(String),
    Number(u64),
}

impl UintDto {
    fn to_wei(&self) -> Result<Wei, String> {
        match self {
            UintDto::Number(n) => Ok(Wei::from(*n)),
            UintDto::Text(raw) => {
                let trimmed = raw.trim();
                match trimmed.strip_prefix("0x") {
                    Some(hex) => Wei::from_str_radix(hex, 16),
                    None => trimmed.parse::<Wei>(),
                }
                .map_err(|e| format!("invalid uint `{raw}`: {e}"))
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct TxRequestDto {
    from: String,
    method: &'static str,
    args: Vec<serde_json::Value>,
    value: String,
    gas_limit: u64,
}

impl TxRequestDto {
    fn new(from: &Account, call: &WriteCall, gas_limit: u64) -> Self {
        let args = match call {
            WriteCall::Enter { numbers, .. } => vec![serde_json::Value::from(
                numbers.numbers().iter().map(|n| u64::from(*n)).collect::<Vec<_>>(),
            )],
            _ => Vec::new(),
        };
        Self {
            from: from.to_string(),
            method: call.method(),
            args,
            value: call.value().to_string(),
            gas_limit,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TxResponseDto {
    hash: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum ReceiptStatusDto {
    Pending,
    Confirmed,
    Reverted,
}

#[derive(Debug, Deserialize)]
struct ReceiptDto {
    status: ReceiptStatusDto,
    #[serde(default)]
    reason: Option<String>,
}

impl ReceiptDto {
    fn pending() -> Self {
        Self {
            status: ReceiptStatusDto::Pending,
            reason: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct EventHeadDto {
    cursor: u64,
}

#[derive(Debug, Deserialize)]
struct EventsPageDto {
    #[serde(default)]
    events: Vec<EventDto>,
}

#[derive(Debug, Deserialize)]
struct EventDto {
    cursor: u64,
    name: String,
    #[serde(default)]
    args: serde_json::Value,
}

impl EventDto {
    /// `Ok(None)` for events the engine does not react to.
    fn into_round_event(self) -> Result<Option<RoundEvent>, String> {
        let event = match self.name.as_str() {
            "Entered" | "PlayerJoined" => {
                let player = self
                    .args
                    .get("player")
                    .and_then(|p| p.as_str())
                    .ok_or_else(|| format!("{} without a player", self.name))?;
                let account = Account::parse(player).map_err(|e| e.to_string())?;
                RoundEvent::ParticipantJoined { account }
            }
            "PrizeDistributed" | "RewardDistributed" => RoundEvent::ResultDistributed,
            "WinningNumbers" => {
                let raw: Vec<UintDto> = serde_json::from_value(
                    self.args.get("numbers").cloned().unwrap_or_default(),
                )
                .map_err(|e| format!("WinningNumbers with malformed numbers: {e}"))?;
                match decode_winning_numbers(&raw)? {
                    Some(numbers) => RoundEvent::NumbersPublished(numbers),
                    None => return Ok(None),
                }
            }
            _ => return Ok(None),
        };
        Ok(Some(event))
    }
}
