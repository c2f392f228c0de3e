use crate::client::StatusBoard;
use color_eyre::eyre::{
    Result,
    eyre,
};
use crossterm::{
    event::{
        self,
        Event,
        KeyCode,
        KeyEventKind,
    },
    terminal::{
        disable_raw_mode,
        enable_raw_mode,
    },
};
use rand::seq::index;
use ratatui::{
    prelude::*,
    widgets::*,
};
use round_engine::{
    ActionStatus,
    EngineView,
    PendingAction,
    UserAction,
    Variant,
    Wei,
    snapshot::{
        LastResult,
        RoundTiming,
        TICKET_MAX,
        TICKET_SIZE,
        TicketError,
        TicketNumbers,
    },
};
use std::io::stdout;
use tokio::sync::mpsc;

const WEI_DECIMALS: u32 = 18;

pub enum UserEvent {
    Quit,
    Redraw,
    Refresh,
    Act(UserAction),
}

pub type InputEventReceiver = mpsc::UnboundedReceiver<Event>;

#[derive(Debug)]
pub struct UiState {
    mode: Mode,
    variant: Variant,
    terminal: Option<Terminal<CrosstermBackend<std::io::Stdout>>>,
}

impl UiState {
    pub fn new(variant: Variant) -> Self {
        UiState {
            mode: Mode::Normal,
            variant,
            terminal: None,
        }
    }
}

#[derive(Clone, Debug, Default)]
enum Mode {
    #[default]
    Normal,
    TicketModal(TicketState),
    QuitModal,
}

#[derive(Clone, Debug, Default)]
struct TicketState {
    input: String,
    error: Option<String>,
}

pub fn terminal_enter(state: &mut UiState) -> Result<()> {
    enable_raw_mode()?;
    crossterm::execute!(std::io::stdout(), crossterm::terminal::EnterAlternateScreen)?;
    // one persistent Terminal so buffers survive across draws
    let backend = CrosstermBackend::new(stdout());
    let terminal = Terminal::new(backend)?;
    state.terminal = Some(terminal);
    Ok(())
}

pub fn terminal_exit() -> Result<()> {
    disable_raw_mode()?;
    crossterm::execute!(std::io::stdout(), crossterm::terminal::LeaveAlternateScreen)?;
    Ok(())
}

pub fn draw(state: &mut UiState, view: &EngineView, board: &StatusBoard) -> Result<()> {
    if let Some(mut term) = state.terminal.take() {
        term.draw(|f| ui(f, state, view, board))?;
        state.terminal = Some(term);
    }
    Ok(())
}

/// Reads terminal input on a dedicated thread; crossterm's reader blocks.
pub fn input_event_stream() -> InputEventReceiver {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        loop {
            match event::read() {
                Ok(ev) => {
                    if tx.send(ev).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    tracing::error!(%err, "terminal input failed");
                    break;
                }
            }
        }
    });
    rx
}

pub async fn next_raw_event(input: &mut InputEventReceiver) -> Result<Event> {
    input
        .recv()
        .await
        .ok_or_else(|| eyre!("terminal input closed"))
}

pub fn interpret_event(state: &mut UiState, event: Event) -> Option<UserEvent> {
    let k = match event {
        Event::Key(k) => k,
        Event::Resize(..) => return Some(UserEvent::Redraw),
        _ => return None,
    };
    if k.kind != KeyEventKind::Press {
        return None;
    }
    match &mut state.mode {
        Mode::TicketModal(ts) => {
            match k.code {
                KeyCode::Esc => state.mode = Mode::Normal,
                KeyCode::Enter => match TicketNumbers::parse(&ts.input) {
                    Ok(numbers) => {
                        state.mode = Mode::Normal;
                        return Some(UserEvent::Act(UserAction::Join {
                            numbers: Some(numbers),
                        }));
                    }
                    Err(err) => ts.error = Some(err.to_string()),
                },
                KeyCode::Backspace => {
                    ts.input.pop();
                    ts.error = None;
                }
                KeyCode::Char('p') => match quick_pick() {
                    Ok(numbers) => {
                        ts.input = numbers.to_string();
                        ts.error = None;
                    }
                    Err(err) => ts.error = Some(err.to_string()),
                },
                KeyCode::Char(c) if c.is_ascii_digit() || c == ' ' || c == ',' => {
                    ts.input.push(c);
                    ts.error = None;
                }
                _ => return None,
            }
            return Some(UserEvent::Redraw);
        }
        Mode::QuitModal => {
            return match k.code {
                KeyCode::Char('y') | KeyCode::Char('Y') => Some(UserEvent::Quit),
                KeyCode::Char('n') | KeyCode::Char('N') | KeyCode::Esc => {
                    state.mode = Mode::Normal;
                    Some(UserEvent::Redraw)
                }
                _ => None,
            };
        }
        Mode::Normal => {}
    }
    Some(match k.code {
        KeyCode::Char('q') | KeyCode::Esc => {
            state.mode = Mode::QuitModal;
            UserEvent::Redraw
        }
        KeyCode::Char('j') => match state.variant {
            Variant::Pool => UserEvent::Act(UserAction::Join { numbers: None }),
            Variant::Lottery => {
                state.mode = Mode::TicketModal(TicketState::default());
                UserEvent::Redraw
            }
        },
        KeyCode::Char('c') => UserEvent::Act(UserAction::Claim),
        KeyCode::Char('d') => UserEvent::Act(UserAction::Distribute),
        KeyCode::Char('x') => UserEvent::Act(UserAction::Reset),
        KeyCode::Char('w') => UserEvent::Act(UserAction::Draw),
        KeyCode::Char('r') => UserEvent::Refresh,
        _ => return None,
    })
}

/// Seven distinct numbers, ascending.
fn quick_pick() -> Result<TicketNumbers, TicketError> {
    let mut rng = rand::rng();
    let mut drawn: Vec<u8> = index::sample(&mut rng, usize::from(TICKET_MAX), TICKET_SIZE)
        .into_iter()
        .filter_map(|i| u8::try_from(i + 1).ok())
        .collect();
    drawn.sort_unstable();
    let mut picked = [0u8; TICKET_SIZE];
    for (slot, n) in picked.iter_mut().zip(drawn) {
        *slot = n;
    }
    TicketNumbers::new(picked)
}

fn ui(f: &mut Frame, state: &UiState, view: &EngineView, board: &StatusBoard) {
    f.render_widget(Clear, f.area());
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(4),  // round overview
            Constraint::Length(3),  // countdown
            Constraint::Min(8),     // participants + last result
            Constraint::Length(5),  // actions
            Constraint::Length(9),  // status/errors + help
        ])
        .split(f.area());

    draw_overview_panel(f, chunks[0], state.variant, view);
    draw_countdown(f, chunks[1], view);
    draw_middle(f, chunks[2], view);
    draw_actions(f, chunks[3], state.variant, view);
    draw_bottom(f, chunks[4], board);
    draw_modals(f, state);
}

fn draw_overview_panel(f: &mut Frame, area: Rect, variant: Variant, view: &EngineView) {
    let role = if view.flags.is_admin { " (admin)" } else { "" };
    let text = match view.snapshot.as_deref() {
        None => format!("Account: {}{} | loading round state...", view.account.short(), role),
        Some(snap) => {
            let pot_label = match variant {
                Variant::Pool => "Pool",
                Variant::Lottery => "Jackpot",
            };
            let round = match variant {
                Variant::Pool => format!("Round: {} | ", snap.round_id),
                Variant::Lottery => format!("State: {:?} | ", snap.state),
            };
            format!(
                "Account: {}{}\n{}{}: {} ETH | Entry: {} ETH",
                view.account.short(),
                role,
                round,
                pot_label,
                format_eth(snap.pool_balance),
                format_eth(snap.entry_price),
            )
        }
    };
    let widget = Paragraph::new(text).block(
        Block::default()
            .borders(Borders::ALL)
            .title(format!("Round ({variant})")),
    );
    f.render_widget(widget, area);
}

fn draw_countdown(f: &mut Frame, area: Rect, view: &EngineView) {
    let total = view.snapshot.as_deref().map(|snap| match snap.timing {
        RoundTiming::Scheduled { duration, .. } => duration,
        RoundTiming::Countdown { seconds } => seconds,
    });
    let remaining = view.seconds_remaining;
    let (label, style) = match total {
        None => ("--:--".to_string(), Style::default().fg(Color::DarkGray)),
        Some(_) if remaining == 0 => (
            "00:00 round over".to_string(),
            Style::default().fg(Color::Red),
        ),
        Some(_) => (
            format!("{} remaining", format_countdown(remaining)),
            Style::default().fg(Color::Green),
        ),
    };
    let gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title("Time left"))
        .gauge_style(style)
        .ratio(progress_ratio(remaining, total.unwrap_or(0)))
        .label(label);
    f.render_widget(gauge, area);
}

fn draw_middle(f: &mut Frame, area: Rect, view: &EngineView) {
    let cols = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
        .split(area);

    let mut players: Vec<Line> = Vec::new();
    match view.snapshot.as_deref() {
        None => players.push(Line::from("")),
        Some(snap) if snap.variant == Variant::Lottery => {
            players.push(Line::from("The lottery does not list its tickets."));
        }
        Some(snap) if snap.participants.is_empty() => {
            players.push(Line::from("Nobody has joined this round yet."));
        }
        Some(snap) => {
            for (i, p) in snap.participants.iter().enumerate() {
                let line = format!("{:>3}. {}", i + 1, p);
                if *p == view.account {
                    players.push(Line::from(Span::styled(
                        format!("{line}  <- me"),
                        Style::default()
                            .fg(Color::Yellow)
                            .add_modifier(Modifier::BOLD),
                    )));
                } else {
                    players.push(Line::from(line));
                }
            }
        }
    }
    let count = view
        .snapshot
        .as_deref()
        .map_or(0, |snap| snap.participants.len());
    let widget = Paragraph::new(players).wrap(Wrap { trim: true }).block(
        Block::default()
            .borders(Borders::ALL)
            .title(format!("Participants ({count})")),
    );
    f.render_widget(widget, cols[0]);

    let mut lines: Vec<Line> = Vec::new();
    if let Some(snap) = view.snapshot.as_deref() {
        let result = match &snap.last_result {
            LastResult::Pending => "No round has finished yet".to_string(),
            LastResult::NoWinner => "Previous round ended without a winner".to_string(),
            LastResult::Winner(winner) if *winner == view.account => {
                format!("Previous winner: {winner} (you!)")
            }
            LastResult::Winner(winner) => format!("Previous winner: {winner}"),
            LastResult::Numbers(numbers) => format!("Winning numbers: {numbers}"),
        };
        lines.push(Line::from(result));
        lines.push(Line::from(""));
        if view.flags.can_claim {
            lines.push(Line::from(Span::styled(
                format!("Claimable: {} ETH", format_eth(view.flags.claimable_amount)),
                Style::default().fg(Color::Green),
            )));
        } else {
            lines.push(Line::from("Nothing to claim"));
        }
        if let Some(owner) = &snap.owner {
            lines.push(Line::from(format!("Owner: {}", owner.short())));
        }
    }
    let widget = Paragraph::new(lines)
        .wrap(Wrap { trim: true })
        .block(Block::default().borders(Borders::ALL).title("Results"));
    f.render_widget(widget, cols[1]);
}

fn draw_actions(f: &mut Frame, area: Rect, variant: Variant, view: &EngineView) {
    let flags = &view.flags;
    let join = view
        .join_label
        .as_ref()
        .map_or_else(|| "Join".to_string(), |label| label.to_string());
    let mut hints = vec![hint('j', &join, flags.can_join), hint('c', "Claim", flags.can_claim)];
    if flags.is_admin {
        match variant {
            Variant::Pool => {
                hints.push(hint('d', "Distribute", flags.can_distribute));
                hints.push(hint('x', "Reset", flags.can_reset));
            }
            Variant::Lottery => hints.push(hint('w', "Draw", flags.can_draw)),
        }
    }
    let mut spans = Vec::new();
    for (i, h) in hints.into_iter().enumerate() {
        if i > 0 {
            spans.push(Span::raw("  "));
        }
        spans.push(h);
    }

    let mut lines = vec![Line::from(spans)];
    lines.push(Line::from(match (&view.pending, &view.unconfirmed) {
        (Some(pending), _) => describe_pending("In flight", pending),
        (None, Some(unconfirmed)) => describe_pending("Unconfirmed", unconfirmed),
        (None, None) => "No transaction in flight".to_string(),
    }));
    if let Some(done) = &view.last_finished {
        lines.push(Line::from(describe_pending("Last", done)));
    }
    let widget = Paragraph::new(lines)
        .block(Block::default().borders(Borders::ALL).title("Actions"));
    f.render_widget(widget, area);
}

fn hint(key: char, label: &str, enabled: bool) -> Span<'static> {
    let style = if enabled {
        Style::default().fg(Color::Cyan)
    } else {
        Style::default().fg(Color::DarkGray)
    };
    Span::styled(format!("[{key}] {label}"), style)
}

fn describe_pending(prefix: &str, action: &PendingAction) -> String {
    let status = match action.status {
        ActionStatus::Submitting => "submitting",
        ActionStatus::AwaitingConfirmation => "awaiting confirmation",
        ActionStatus::Confirmed => "confirmed",
        ActionStatus::Failed => "failed",
    };
    match &action.tx_hash {
        Some(hash) => format!("{prefix}: {} {status} (tx {})", action.kind, hash_preview(hash)),
        None => format!("{prefix}: {} {status}", action.kind),
    }
}

fn draw_bottom(f: &mut Frame, area: Rect, board: &StatusBoard) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(3), Constraint::Length(3)])
        .split(area);

    let status_widget = if board.errors.is_empty() {
        let mut lines: Vec<Line> = Vec::new();
        if board.status.trim().is_empty() {
            lines.push(Line::from("Ready"));
        } else {
            for line in board.status.lines() {
                lines.push(Line::from(line.to_string()));
            }
        }
        if let Some(reason) = &board.stale {
            lines.push(Line::from(Span::styled(
                format!("Contract unreachable, showing last known state: {reason}"),
                Style::default().fg(Color::Yellow),
            )));
        }
        Paragraph::new(lines)
            .wrap(Wrap { trim: false })
            .block(Block::default().borders(Borders::ALL).title("Status"))
            .style(Style::default().fg(Color::Green))
    } else {
        let lines: Vec<Line> = board
            .errors
            .iter()
            .rev()
            .map(|e| Line::from(e.clone()))
            .collect();
        Paragraph::new(lines)
            .wrap(Wrap { trim: false })
            .block(Block::default().borders(Borders::ALL).title("Errors"))
            .style(Style::default().fg(Color::Red))
    };
    f.render_widget(status_widget, chunks[0]);

    let help = Paragraph::new(
        "j join | c claim | d distribute | x reset | w draw | r refresh | q/Esc quit",
    )
    .block(Block::default().borders(Borders::ALL).title("Help"));
    f.render_widget(help, chunks[1]);
}

fn draw_modals(f: &mut Frame, state: &UiState) {
    match &state.mode {
        Mode::TicketModal(ts) => {
            let area = centered_rect(50, 30, f.area());
            let block = Block::default().borders(Borders::ALL).title("Enter Lottery");
            let mut lines = vec![
                Line::from(format!("Numbers: {}_", ts.input)),
                Line::from(format!("Pick {TICKET_SIZE} numbers between 1 and {TICKET_MAX}")),
                Line::from("Enter=buy ticket  p=quick pick  Esc=cancel"),
            ];
            if let Some(err) = &ts.error {
                lines.push(Line::from(Span::styled(
                    err.clone(),
                    Style::default().fg(Color::Red),
                )));
            }
            f.render_widget(Clear, area);
            f.render_widget(block.clone(), area);
            f.render_widget(Paragraph::new(lines), block.inner(area));
        }
        Mode::QuitModal => {
            let area = centered_rect(30, 20, f.area());
            let block = Block::default().borders(Borders::ALL).title("Quit");
            f.render_widget(Clear, area);
            f.render_widget(block.clone(), area);
            f.render_widget(
                Paragraph::new("Quit the dashboard? (y/n)"),
                block.inner(area),
            );
        }
        Mode::Normal => {}
    }
}

fn centered_rect(w_percent: u16, h_percent: u16, r: Rect) -> Rect {
    let popup_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - h_percent) / 2),
            Constraint::Percentage(h_percent),
            Constraint::Percentage((100 - h_percent) / 2),
        ])
        .split(r);

    let horizontal = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - w_percent) / 2),
            Constraint::Percentage(w_percent),
            Constraint::Percentage((100 - w_percent) / 2),
        ])
        .split(popup_layout[1]);

    horizontal[1]
}

fn format_eth(wei: Wei) -> String {
    let one_unit: Wei = 10u128.pow(WEI_DECIMALS);
    let whole = wei / one_unit;
    let fractional = wei % one_unit;
    if fractional == 0 {
        format!("{}", whole)
    } else {
        format!(
            "{}.{}",
            whole,
            format!("{:018}", fractional).trim_end_matches('0')
        )
    }
}

/// `mm:ss`, or `h:mm:ss` from one hour up.
fn format_countdown(seconds: u64) -> String {
    let (h, m, s) = (seconds / 3600, (seconds % 3600) / 60, seconds % 60);
    if h > 0 {
        format!("{h}:{m:02}:{s:02}")
    } else {
        format!("{m:02}:{s:02}")
    }
}

/// Share of the round already elapsed.
fn progress_ratio(remaining: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let elapsed = total.saturating_sub(remaining.min(total));
    elapsed as f64 / total as f64
}

pub fn hash_preview(hash: &str) -> String {
    let chars: Vec<char> = hash.chars().collect();
    if chars.len() <= 14 {
        return hash.to_string();
    }
    let head: String = chars[..10].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}...{tail}")
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use crossterm::event::{
        KeyEvent,
        KeyModifiers,
    };
    use proptest::prelude::*;

    fn key(code: KeyCode) -> Event {
        Event::Key(KeyEvent::new(code, KeyModifiers::NONE))
    }

    #[test]
    fn format_eth__whole_and_fractional_amounts() {
        assert_eq!(format_eth(0), "0");
        assert_eq!(format_eth(2_000_000_000_000_000_000), "2");
        assert_eq!(format_eth(10_000_000_000_000_000), "0.01");
        assert_eq!(format_eth(1_500_000_000_000_000_001), "1.500000000000000001");
    }

    #[test]
    fn format_countdown__pads_minutes_and_seconds() {
        assert_eq!(format_countdown(0), "00:00");
        assert_eq!(format_countdown(89), "01:29");
        assert_eq!(format_countdown(3_725), "1:02:05");
    }

    #[test]
    fn hash_preview__long_hash__is_shortened() {
        let hash = format!("0x{:064x}", 7);

        assert_eq!(hash_preview(&hash), "0x00000000...0007");
    }

    #[test]
    fn hash_preview__multibyte_characters__does_not_split_them() {
        let hash = "0xé€ü".repeat(5);

        assert_eq!(hash_preview(&hash), "0xé€ü0xé€ü...xé€ü");
    }

    proptest! {
        #[test]
        fn progress_ratio__always_within_unit_interval(remaining in 0u64..10_000, total in 0u64..10_000) {
            let ratio = progress_ratio(remaining, total);
            prop_assert!((0.0..=1.0).contains(&ratio));
        }

        #[test]
        fn quick_pick__yields_distinct_ascending_numbers(_seed in 0u8..32) {
            let ticket = quick_pick().unwrap();
            let numbers = ticket.numbers();
            prop_assert!(numbers.windows(2).all(|w| w[0] < w[1]));
            prop_assert!(numbers.iter().all(|n| (1..=TICKET_MAX).contains(n)));
        }
    }

    #[test]
    fn interpret_event__pool_join_key__acts_immediately() {
        let mut state = UiState::new(Variant::Pool);

        let event = interpret_event(&mut state, key(KeyCode::Char('j')));

        assert!(matches!(
            event,
            Some(UserEvent::Act(UserAction::Join { numbers: None }))
        ));
    }

    #[test]
    fn interpret_event__lottery_ticket_typed_and_confirmed__joins_with_numbers() {
        // given
        let mut state = UiState::new(Variant::Lottery);
        interpret_event(&mut state, key(KeyCode::Char('j')));
        for c in "1 2 3 4 5 6 49".chars() {
            interpret_event(&mut state, key(KeyCode::Char(c)));
        }

        // when
        let event = interpret_event(&mut state, key(KeyCode::Enter));

        // then
        let Some(UserEvent::Act(UserAction::Join {
            numbers: Some(numbers),
        })) = event
        else {
            panic!("expected a join with numbers");
        };
        assert_eq!(numbers.numbers(), &[1, 2, 3, 4, 5, 6, 49]);
        assert!(matches!(state.mode, Mode::Normal));
    }

    #[test]
    fn interpret_event__lottery_ticket_incomplete__stays_in_modal_with_error() {
        let mut state = UiState::new(Variant::Lottery);
        interpret_event(&mut state, key(KeyCode::Char('j')));
        interpret_event(&mut state, key(KeyCode::Char('5')));

        let event = interpret_event(&mut state, key(KeyCode::Enter));

        assert!(matches!(event, Some(UserEvent::Redraw)));
        let Mode::TicketModal(ts) = &state.mode else {
            panic!("modal closed");
        };
        assert!(ts.error.is_some());
    }

    #[test]
    fn interpret_event__quit_needs_confirmation() {
        let mut state = UiState::new(Variant::Pool);

        let first = interpret_event(&mut state, key(KeyCode::Char('q')));
        let second = interpret_event(&mut state, key(KeyCode::Char('y')));

        assert!(matches!(first, Some(UserEvent::Redraw)));
        assert!(matches!(second, Some(UserEvent::Quit)));
    }
}
