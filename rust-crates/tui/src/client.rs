use crate::{
    gateway_client::GatewayClient,
    settings::Settings,
    ui,
};
use chrono::Local;
use color_eyre::eyre::{
    Result,
    WrapErr,
};
use round_engine::{
    ActionError,
    ActionOrigin,
    Engine,
    EngineEvent,
    Variant,
    clock::SystemClock,
    scheduler::RefreshOutcome,
    snapshot_builder::{
        LotterySnapshotBuilder,
        PoolSnapshotBuilder,
        VariantBuilder,
    },
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{
    error,
    info,
    warn,
};

const MAX_ERRORS: usize = 50;

type RoundEngine = Engine<VariantBuilder<GatewayClient, GatewayClient>, GatewayClient>;

/// Status line and error log shown under the dashboard.
#[derive(Clone, Debug, Default)]
pub struct StatusBoard {
    pub status: String,
    pub errors: Vec<String>,
    /// Set while refreshes fail; the last snapshot is still shown.
    pub stale: Option<String>,
    last_round: Option<u64>,
}

impl StatusBoard {
    fn set_status(&mut self, message: impl Into<String>) {
        let message = message.into();
        info!("{}", message);
        self.status = format!("[{}] {}", Local::now().format("%H:%M:%S"), message);
        self.errors.clear();
    }

    fn push_error(&mut self, message: impl Into<String>) {
        let message = message.into();
        error!("{}", message);
        self.errors
            .push(format!("[{}] {}", Local::now().format("%H:%M:%S"), message));
        if self.errors.len() > MAX_ERRORS {
            let drain = self.errors.len() - MAX_ERRORS;
            self.errors.drain(0..drain);
        }
    }

    pub fn apply(&mut self, event: &EngineEvent) {
        match event {
            EngineEvent::SnapshotApplied { round_id, .. } => {
                if self.stale.take().is_some() {
                    self.set_status("Connection to the contract restored");
                }
                if let Some(previous) = self.last_round
                    && *round_id > previous
                {
                    self.set_status(format!("Round {round_id} started"));
                }
                self.last_round = Some(*round_id);
            }
            EngineEvent::RefreshFailed { reason } => {
                self.stale = Some(reason.clone());
            }
            EngineEvent::Tick { .. } => {}
            EngineEvent::ActionStarted { kind, origin } => match origin {
                ActionOrigin::User => self.set_status(format!("Submitting {kind}...")),
                ActionOrigin::Auto => {
                    self.set_status(format!("Round expired, submitting {kind} automatically..."))
                }
            },
            EngineEvent::ActionFinished {
                kind,
                origin,
                result,
            } => match result {
                Ok(outcome) => self.set_status(format!(
                    "{kind} confirmed (tx {})",
                    ui::hash_preview(&outcome.tx_hash)
                )),
                Err(ActionError::AlreadyInFlight(busy)) => {
                    self.set_status(format!("Wait for the pending {busy} to finish"))
                }
                Err(ActionError::NotConfirmed(reason)) => self.set_status(format!(
                    "{kind} sent but not yet confirmed ({reason}); the next refresh will tell"
                )),
                Err(ActionError::ShutDown) => {}
                Err(err) if *origin == ActionOrigin::Auto => {
                    self.push_error(format!("Automatic {kind} failed: {err}"))
                }
                Err(err) => self.push_error(format!("{err}")),
            },
        }
    }
}

pub async fn run_app(settings: Settings) -> Result<()> {
    let gateway = Arc::new(
        GatewayClient::new(
            &settings.gateway_url,
            settings.contract.clone(),
            settings.account.clone(),
        )
        .wrap_err("creating gateway client")?,
    );
    let variant = settings.engine.variant;
    let source = match variant {
        Variant::Pool => VariantBuilder::Pool(PoolSnapshotBuilder::new(
            gateway.clone(),
            settings.account.clone(),
            settings.engine.join_stake,
        )),
        Variant::Lottery => VariantBuilder::Lottery(LotterySnapshotBuilder::new(
            gateway.clone(),
            settings.account.clone(),
        )),
    };
    info!(%gateway, %variant, "connecting to round contract");
    let (engine, engine_events) = Engine::start(
        settings.engine.clone(),
        settings.account.clone(),
        source,
        gateway.clone(),
        gateway.as_ref(),
        Arc::new(SystemClock),
    )
    .await
    .wrap_err("starting round engine")?;

    let mut ui_state = ui::UiState::new(variant);
    let mut input_events = ui::input_event_stream();

    ui::terminal_enter(&mut ui_state)?;
    info!("UI ready");
    let res = run_loop(&engine, engine_events, &mut ui_state, &mut input_events).await;
    ui::terminal_exit()?;
    engine.shutdown();
    res
}

async fn run_loop(
    engine: &RoundEngine,
    mut engine_events: mpsc::UnboundedReceiver<EngineEvent>,
    ui_state: &mut ui::UiState,
    input_events: &mut ui::InputEventReceiver,
) -> Result<()> {
    let mut board = StatusBoard::default();
    board.set_status("Loading round state...");
    ui::draw(ui_state, &engine.view(), &board).wrap_err("initial draw failed")?;

    loop {
        tokio::select! {
            maybe_event = engine_events.recv() => {
                let Some(event) = maybe_event else {
                    warn!("engine event channel closed");
                    break;
                };
                board.apply(&event);
                ui::draw(ui_state, &engine.view(), &board)
                    .wrap_err("draw after engine event failed")?;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("received interrupt, exiting");
                break;
            }
            raw_ev = ui::next_raw_event(input_events) => {
                let event = raw_ev?;
                let Some(ev) = ui::interpret_event(ui_state, event) else {
                    continue;
                };
                match ev {
                    ui::UserEvent::Quit => break,
                    ui::UserEvent::Redraw => {}
                    ui::UserEvent::Refresh => {
                        board.set_status("Refreshing...");
                        ui::draw(ui_state, &engine.view(), &board)
                            .wrap_err("draw before refresh failed")?;
                        match engine.refresh_now().await {
                            RefreshOutcome::Failed(err) => {
                                board.push_error(format!("Refresh failed: {err}"))
                            }
                            RefreshOutcome::Coalesced => {
                                board.set_status("A refresh is already running")
                            }
                            _ => board.set_status("Round state refreshed"),
                        }
                    }
                    ui::UserEvent::Act(action) => {
                        // outcome arrives as ActionFinished
                        let coordinator = engine.coordinator().clone();
                        tokio::spawn(async move {
                            let _ = coordinator.perform_user_action(action).await;
                        });
                    }
                }
                ui::draw(ui_state, &engine.view(), &board)
                    .wrap_err("draw after input failed")?;
            }
        }
    }
    Ok(())
}
