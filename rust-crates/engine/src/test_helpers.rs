//! In-memory contract, clock and event stream for exercising the engine.

use crate::{
    clock::WallClock,
    config::DEFAULT_JOIN_STAKE,
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
        AccountView,
        LastResult,
        RoundSnapshot,
        RoundState,
        RoundTiming,
        SnapshotId,
        TicketNumbers,
        Variant,
        Wei,
    },
    state::EngineEvent,
};
use std::{
    collections::{
        HashMap,
        VecDeque,
    },
    sync::{
        Arc,
        Mutex,
        MutexGuard,
        atomic::{
            AtomicU64,
            Ordering,
        },
    },
    time::Duration,
};
use tokio::{
    sync::{
        mpsc,
        watch,
    },
    time::{
        self,
        Instant,
    },
};

pub const ALICE: &str = "0x1111111111111111111111111111111111111111";
pub const BOB: &str = "0x2222222222222222222222222222222222222222";
pub const OWNER: &str = "0xabcdefabcdefabcdefabcdefabcdefabcdefabcd";

pub fn account(raw: &str) -> Account {
    Account::parse(raw).expect("fixture address is valid")
}

pub fn ticket() -> TicketNumbers {
    TicketNumbers::new([3, 9, 14, 21, 28, 35, 49]).expect("fixture ticket is valid")
}

/// Open pool round viewed by [`ALICE`] and owned by [`OWNER`], nobody joined.
pub fn pool_snapshot(id: u64, round_id: u64, start: u64, duration: u64) -> RoundSnapshot {
    RoundSnapshot {
        id: SnapshotId(id),
        variant: Variant::Pool,
        pool_balance: 0,
        round_id,
        timing: RoundTiming::Scheduled { start, duration },
        state: RoundState::Open,
        participants: Vec::new(),
        last_result: LastResult::Pending,
        owner: Some(account(OWNER)),
        viewer: AccountView::empty(account(ALICE)),
        entry_price: DEFAULT_JOIN_STAKE,
        fetched_at: Instant::now(),
    }
}

/// Open lottery viewed by [`ALICE`].
pub fn lottery_snapshot(id: u64, seconds: u64) -> RoundSnapshot {
    RoundSnapshot {
        id: SnapshotId(id),
        variant: Variant::Lottery,
        pool_balance: 0,
        round_id: 0,
        timing: RoundTiming::Countdown { seconds },
        state: RoundState::Open,
        participants: Vec::new(),
        last_result: LastResult::Pending,
        owner: None,
        viewer: AccountView::empty(account(ALICE)),
        entry_price: DEFAULT_JOIN_STAKE,
        fetched_at: Instant::now(),
    }
}

/// Contract storage of the fake chain. Tests mutate it through
/// [`FakeChain::with_state`].
#[derive(Debug)]
pub struct ChainState {
    pub owner: Account,
    pub round_id: u64,
    pub round_start: u64,
    pub round_duration: u64,
    pub participants: Vec<Account>,
    pub balance: Wei,
    pub last_joined: HashMap<Account, u64>,
    pub recipients: HashMap<u64, Account>,
    pub state: RoundState,
    pub time_until_draw: u64,
    pub draw_period: u64,
    pub ticket_price: Wei,
    pub winnings: HashMap<Account, Wei>,
    pub winning_numbers: Option<TicketNumbers>,
    pub tickets: Vec<(Account, TicketNumbers)>,
    failing: Option<&'static str>,
    build_delays: VecDeque<Duration>,
    reject_next_submit: Option<String>,
    lose_next_reply: Option<String>,
    revert_next: Option<String>,
    pending_reverts: HashMap<String, String>,
    pending_txs: HashMap<String, (WriteCall, Account)>,
    submitted: Vec<(WriteCall, u64)>,
    confirmed: Vec<WriteCall>,
    reads: u64,
    next_tx: u64,
}

impl ChainState {
    fn new(owner: Account) -> Self {
        Self {
            owner,
            round_id: 1,
            round_start: 0,
            round_duration: 0,
            participants: Vec::new(),
            balance: 0,
            last_joined: HashMap::new(),
            recipients: HashMap::new(),
            state: RoundState::Open,
            time_until_draw: 0,
            draw_period: 0,
            ticket_price: 0,
            winnings: HashMap::new(),
            winning_numbers: None,
            tickets: Vec::new(),
            failing: None,
            build_delays: VecDeque::new(),
            reject_next_submit: None,
            lose_next_reply: None,
            revert_next: None,
            pending_reverts: HashMap::new(),
            pending_txs: HashMap::new(),
            submitted: Vec::new(),
            confirmed: Vec::new(),
            reads: 0,
            next_tx: 0,
        }
    }

    fn execute(&mut self, call: &WriteCall, from: Account) {
        match call {
            WriteCall::JoinPool { value } => {
                self.participants.push(from.clone());
                self.last_joined.insert(from, self.round_id);
                self.balance += value;
            }
            WriteCall::Enter { numbers, value } => {
                self.tickets.push((from, *numbers));
                self.balance += value;
            }
            WriteCall::Claim => {
                self.winnings.remove(&from);
            }
            WriteCall::DistributeReward => {
                if let Some(winner) = self.participants.first().cloned() {
                    self.recipients.insert(self.round_id, winner);
                }
                self.start_next_round();
            }
            WriteCall::EmergencyReset => self.start_next_round(),
            WriteCall::Draw => {
                self.winning_numbers = Some(ticket());
                self.tickets.clear();
                self.time_until_draw = self.draw_period;
            }
        }
    }

    fn start_next_round(&mut self) {
        self.participants.clear();
        self.balance = 0;
        self.round_id += 1;
        self.round_start += self.round_duration;
    }
}

/// An in-memory round contract implementing both readers. Clones share state.
#[derive(Clone)]
pub struct FakeChain {
    state: Arc<Mutex<ChainState>>,
    confirmations_open: Arc<watch::Sender<bool>>,
}

impl FakeChain {
    /// Pool in round 1 starting at `round_start` epoch seconds.
    pub fn pool(owner: Account, round_start: u64, round_duration: u64) -> Self {
        let mut state = ChainState::new(owner);
        state.round_start = round_start;
        state.round_duration = round_duration;
        Self::from_state(state)
    }

    /// Open lottery with `seconds` until the draw.
    pub fn lottery(seconds: u64, ticket_price: Wei) -> Self {
        let mut state = ChainState::new(Account::zero());
        state.round_id = 0;
        state.time_until_draw = seconds;
        state.draw_period = seconds;
        state.ticket_price = ticket_price;
        Self::from_state(state)
    }

    fn from_state(state: ChainState) -> Self {
        let (confirmations_open, _) = watch::channel(true);
        Self {
            state: Arc::new(Mutex::new(state)),
            confirmations_open: Arc::new(confirmations_open),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ChainState> {
        self.state.lock().unwrap()
    }

    pub fn reader(&self) -> Arc<Self> {
        Arc::new(self.clone())
    }

    /// Writer signing as `from`.
    pub fn writer(&self, from: Account) -> Arc<FakeWriter> {
        Arc::new(FakeWriter {
            chain: self.clone(),
            from,
        })
    }

    pub fn with_state<T>(&self, f: impl FnOnce(&mut ChainState) -> T) -> T {
        f(&mut self.lock())
    }

    /// Reads named `call` fail until [`FakeChain::heal`]; `"*"` fails all.
    pub fn fail_reads_on(&self, call: &'static str) {
        self.lock().failing = Some(call);
    }

    pub fn heal(&self) {
        self.lock().failing = None;
    }

    /// The next snapshot build stalls for `delay` before reading the balance.
    pub fn delay_next_build(&self, delay: Duration) {
        self.lock().build_delays.push_back(delay);
    }

    pub fn reject_next_submit(&self, reason: &str) {
        self.lock().reject_next_submit = Some(reason.to_string());
    }

    /// The next transaction is mined but its submission reply is lost.
    pub fn lose_next_reply(&self, reason: &str) {
        self.lock().lose_next_reply = Some(reason.to_string());
    }

    /// The next submitted transaction is mined but reverts.
    pub fn revert_next(&self, reason: &str) {
        self.lock().revert_next = Some(reason.to_string());
    }

    /// Receipts are withheld until [`FakeChain::release_confirmations`].
    pub fn hold_confirmations(&self) {
        self.confirmations_open.send_replace(false);
    }

    pub fn release_confirmations(&self) {
        self.confirmations_open.send_replace(true);
    }

    pub fn submitted(&self) -> Vec<(WriteCall, u64)> {
        self.lock().submitted.clone()
    }

    pub fn confirmed(&self) -> Vec<WriteCall> {
        self.lock().confirmed.clone()
    }

    pub fn reads(&self) -> u64 {
        self.lock().reads
    }

    fn read<T>(
        &self,
        call: &'static str,
        f: impl FnOnce(&ChainState) -> T,
    ) -> ReadResult<T> {
        let mut state = self.lock();
        state.reads += 1;
        if state.failing.is_some_and(|failing| failing == "*" || failing == call) {
            return Err(ReadError::call(call, "node unavailable"));
        }
        Ok(f(&state))
    }

    async fn build_gate(&self) {
        let delay = self.lock().build_delays.pop_front();
        if let Some(delay) = delay {
            time::sleep(delay).await;
        }
    }
}

impl PoolReader for FakeChain {
    async fn participants(&self) -> ReadResult<Vec<Account>> {
        self.read("getParticipants", |s| s.participants.clone())
    }

    async fn pool_balance(&self) -> ReadResult<Wei> {
        self.build_gate().await;
        self.read("getPoolBalance", |s| s.balance)
    }

    async fn round_id(&self) -> ReadResult<u64> {
        self.read("roundId", |s| s.round_id)
    }

    async fn round_start(&self) -> ReadResult<u64> {
        self.read("roundStart", |s| s.round_start)
    }

    async fn round_duration(&self) -> ReadResult<u64> {
        self.read("ROUND_DURATION", |s| s.round_duration)
    }

    async fn owner(&self) -> ReadResult<Account> {
        self.read("owner", |s| s.owner.clone())
    }

    async fn last_joined_round(&self, account: &Account) -> ReadResult<u64> {
        self.read("lastJoinedRound", |s| {
            s.last_joined.get(account).copied().unwrap_or_default()
        })
    }

    async fn reward_recipient(&self, round_id: u64) -> ReadResult<Account> {
        self.read("getRewardRecipient", |s| {
            s.recipients.get(&round_id).cloned().unwrap_or_else(Account::zero)
        })
    }
}

impl LotteryReader for FakeChain {
    async fn balance(&self) -> ReadResult<Wei> {
        self.build_gate().await;
        self.read("balance", |s| s.balance)
    }

    async fn state(&self) -> ReadResult<RoundState> {
        self.read("state", |s| s.state)
    }

    async fn time_until_next_draw(&self) -> ReadResult<u64> {
        self.read("getTimeUntilNextDraw", |s| s.time_until_draw)
    }

    async fn winnings(&self, account: &Account) -> ReadResult<Wei> {
        self.read("winnings", |s| s.winnings.get(account).copied().unwrap_or_default())
    }

    async fn ticket_price(&self) -> ReadResult<Wei> {
        self.read("ticketPrice", |s| s.ticket_price)
    }

    async fn winning_numbers(&self) -> ReadResult<Option<TicketNumbers>> {
        self.read("getWinningNumbers", |s| s.winning_numbers)
    }
}

pub struct FakeWriter {
    chain: FakeChain,
    from: Account,
}

impl RemoteWriter for FakeWriter {
    async fn submit(&self, call: &WriteCall, gas_limit: u64) -> Result<TxHandle, WriteError> {
        let mut state = self.chain.lock();
        state.submitted.push((call.clone(), gas_limit));
        if let Some(reason) = state.reject_next_submit.take() {
            return Err(WriteError::Rejected(reason));
        }
        if let Some(reason) = state.lose_next_reply.take() {
            state.execute(call, self.from.clone());
            state.confirmed.push(call.clone());
            return Err(WriteError::Transport(reason));
        }
        state.next_tx += 1;
        let hash = format!("0x{:064x}", state.next_tx);
        if let Some(reason) = state.revert_next.take() {
            state.pending_reverts.insert(hash.clone(), reason);
        }
        state
            .pending_txs
            .insert(hash.clone(), (call.clone(), self.from.clone()));
        Ok(TxHandle { hash })
    }

    async fn wait_for_confirmation(&self, tx: &TxHandle) -> Result<(), WriteError> {
        let mut open = self.chain.confirmations_open.subscribe();
        let _ = open.wait_for(|open| *open).await;

        let mut state = self.chain.lock();
        let Some((call, from)) = state.pending_txs.remove(&tx.hash) else {
            return Err(WriteError::Unconfirmed(format!("unknown transaction {}", tx.hash)));
        };
        if let Some(reason) = state.pending_reverts.remove(&tx.hash) {
            return Err(WriteError::Rejected(reason));
        }
        state.execute(&call, from);
        state.confirmed.push(call);
        Ok(())
    }
}

/// Wall clock fixed by the test.
#[derive(Debug, Default)]
pub struct FixedClock(AtomicU64);

impl FixedClock {
    pub fn at(epoch: u64) -> Arc<Self> {
        Arc::new(Self(AtomicU64::new(epoch)))
    }

    pub fn set(&self, epoch: u64) {
        self.0.store(epoch, Ordering::SeqCst);
    }

    pub fn advance(&self, seconds: u64) {
        self.0.fetch_add(seconds, Ordering::SeqCst);
    }
}

impl WallClock for FixedClock {
    fn now_epoch(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct FakeEventSource {
    recv: mpsc::Receiver<Result<RoundEvent, SubscriptionError>>,
}

impl EventSource for FakeEventSource {
    async fn next_event(&mut self) -> Result<RoundEvent, SubscriptionError> {
        match self.recv.recv().await {
            Some(event) => event,
            None => Err(SubscriptionError::Closed),
        }
    }
}

pub struct FakeSubscriber {
    source: Mutex<Option<FakeEventSource>>,
    failure: Option<SubscriptionError>,
}

impl FakeSubscriber {
    pub fn new_with_sender()
    -> (Self, mpsc::Sender<Result<RoundEvent, SubscriptionError>>) {
        let (send, recv) = mpsc::channel(10);
        let subscriber = Self {
            source: Mutex::new(Some(FakeEventSource { recv })),
            failure: None,
        };
        (subscriber, send)
    }

    pub fn failing(error: SubscriptionError) -> Self {
        Self {
            source: Mutex::new(None),
            failure: Some(error),
        }
    }
}

impl EventSubscriber for FakeSubscriber {
    type Source = FakeEventSource;

    async fn subscribe(&self) -> Result<FakeEventSource, SubscriptionError> {
        if let Some(error) = &self.failure {
            return Err(error.clone());
        }
        self.source
            .lock()
            .unwrap()
            .take()
            .ok_or(SubscriptionError::Failed("already subscribed".to_string()))
    }
}

/// Receives engine events until one matches.
pub async fn next_event_matching(
    events: &mut mpsc::UnboundedReceiver<EngineEvent>,
    mut predicate: impl FnMut(&EngineEvent) -> bool,
) -> EngineEvent {
    loop {
        let event = events.recv().await.expect("engine event channel open");
        if predicate(&event) {
            return event;
        }
    }
}
