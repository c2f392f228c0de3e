//! Wires the scheduler, coordinator and timers into a running engine.

use crate::{
    Result,
    action::ActionCoordinator,
    clock::WallClock,
    config::EngineConfig,
    notifications::{
        EventSource,
        EventSubscriber,
        SubscriptionError,
    },
    remote::RemoteWriter,
    scheduler::{
        RefreshOutcome,
        RefreshScheduler,
        RefreshTrigger,
    },
    snapshot::Account,
    snapshot_builder::SnapshotSource,
    state::{
        EngineEvent,
        EngineState,
        EngineView,
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
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{
        self,
        Instant,
        MissedTickBehavior,
    },
};
use tracing::{
    debug,
    info,
    trace,
    warn,
};

/// Background tasks owned by the engine. Dropping the set marks the engine
/// dead and aborts every task, on success and on setup failure alike.
struct TaskSet {
    handles: Vec<(&'static str, JoinHandle<()>)>,
    lifecycle: Lifecycle,
}

impl TaskSet {
    fn new(lifecycle: Lifecycle) -> Self {
        Self {
            handles: Vec::new(),
            lifecycle,
        }
    }

    fn spawn(
        &mut self,
        name: &'static str,
        task: impl Future<Output = ()> + Send + 'static,
    ) {
        self.handles.push((name, tokio::spawn(task)));
    }
}

impl Drop for TaskSet {
    fn drop(&mut self) {
        self.lifecycle.shut_down();
        for (name, handle) in &self.handles {
            trace!(task = name, "stopping");
            handle.abort();
        }
    }
}

pub struct Engine<B, W> {
    scheduler: RefreshScheduler<B>,
    coordinator: ActionCoordinator<W>,
    state: SharedState,
    _tasks: TaskSet,
}

impl<B: SnapshotSource, W: RemoteWriter> Engine<B, W> {
    /// Starts the poll, tick, post-action and push tasks. The first poll
    /// fires immediately.
    pub async fn start<S: EventSubscriber>(
        config: EngineConfig,
        account: Account,
        source: B,
        writer: Arc<W>,
        subscriber: &S,
        clock: Arc<dyn WallClock>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<EngineEvent>)> {
        config.validate()?;
        let config = Arc::new(config);
        info!(variant = %config.variant, %account, "starting round engine");

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (refresh_tx, refresh_rx) = mpsc::unbounded_channel();
        let events = EventSink::new(event_tx);
        let lifecycle = Lifecycle::new();
        let state: SharedState = Arc::new(Mutex::new(EngineState::new(account)));

        let scheduler = RefreshScheduler::new(
            source,
            state.clone(),
            clock,
            events.clone(),
            lifecycle.clone(),
            config.read_timeout(),
            config.stale_build_after(),
        );
        let coordinator = ActionCoordinator::new(
            writer,
            state.clone(),
            refresh_tx,
            events.clone(),
            lifecycle.clone(),
            config.clone(),
        );

        let mut tasks = TaskSet::new(lifecycle);
        tasks.spawn(
            "poll",
            poll_loop(
                config.poll_interval(),
                scheduler.clone(),
                coordinator.clone(),
                state.clone(),
            ),
        );
        tasks.spawn(
            "tick",
            tick_loop(config.tick_interval(), state.clone(), events),
        );
        tasks.spawn("post-action", post_action_loop(refresh_rx, scheduler.clone()));

        let source = subscriber.subscribe().await?;
        tasks.spawn(
            "push",
            push_loop(source, config.poll_interval(), scheduler.clone()),
        );

        let engine = Self {
            scheduler,
            coordinator,
            state,
            _tasks: tasks,
        };
        Ok((engine, event_rx))
    }

    pub fn coordinator(&self) -> &ActionCoordinator<W> {
        &self.coordinator
    }

    pub fn view(&self) -> EngineView {
        lock(&self.state).view()
    }

    /// Out-of-band refresh, e.g. on user request.
    pub async fn refresh_now(&self) -> RefreshOutcome {
        self.scheduler.refresh(RefreshTrigger::Poll).await
    }

    /// Stops the timers and the push subscription. An action still awaiting
    /// its receipt keeps running but its outcome is ignored.
    pub fn shutdown(self) {
        info!("shutting down round engine");
    }
}

async fn poll_loop<B: SnapshotSource, W: RemoteWriter>(
    period: Duration,
    scheduler: RefreshScheduler<B>,
    coordinator: ActionCoordinator<W>,
    state: SharedState,
) {
    let mut ticker = time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        scheduler.refresh(RefreshTrigger::Poll).await;
        auto_act(&coordinator, &state);
    }
}

fn auto_act<W: RemoteWriter>(coordinator: &ActionCoordinator<W>, state: &SharedState) {
    let (snapshot, seconds_remaining) = {
        let state = lock(state);
        let Some(snapshot) = state.snapshot() else {
            return;
        };
        (snapshot.clone(), state.seconds_remaining())
    };
    if let Ok(Some(action)) = coordinator.maybe_auto_act(&snapshot, seconds_remaining) {
        tokio::spawn(action);
    }
}

async fn tick_loop(period: Duration, state: SharedState, events: EventSink) {
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let seconds_remaining = {
            let mut state = lock(&state);
            if state.snapshot().is_none() {
                continue;
            }
            state.tick()
        };
        events.send(EngineEvent::Tick { seconds_remaining });
    }
}

async fn post_action_loop<B: SnapshotSource>(
    mut refresh_rx: mpsc::UnboundedReceiver<RefreshTrigger>,
    scheduler: RefreshScheduler<B>,
) {
    while let Some(trigger) = refresh_rx.recv().await {
        scheduler.refresh(trigger).await;
    }
}

async fn push_loop<S: EventSource, B: SnapshotSource>(
    mut source: S,
    backoff: Duration,
    scheduler: RefreshScheduler<B>,
) {
    loop {
        match source.next_event().await {
            Ok(event) => {
                debug!(event = event.label(), "contract event received");
                scheduler.refresh(RefreshTrigger::Push).await;
            }
            Err(SubscriptionError::Closed) => {
                warn!("contract event stream closed, continuing with polling only");
                break;
            }
            Err(err) => {
                warn!(%err, "contract event stream error");
                time::sleep(backoff).await;
            }
        }
    }
}
