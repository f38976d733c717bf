use std::{
    collections::VecDeque,
    sync::{mpsc::Receiver, Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use crate::{
    collaborators::TrialDisplay,
    event::{Report, ReportLabel, Severity, XmodEvent},
    gui::{
        error::XmodGuiError,
        terminal::{init_terminal, restore_terminal, Tui},
    },
    runner::{ExperimentRunner, RunHandle, RunSummary},
};

use crossterm::event::{self, KeyCode, KeyEventKind};
use log::warn;
use ratatui::{
    prelude::*,
    widgets::{
        block::{Position, Title},
        *,
    },
};

const STATUS_LINES: usize = 5;

#[derive(Debug, Default)]
struct ScreenState {
    text: String,
    visible: bool,
}

/// A [`TrialDisplay`] that [`trial_screen`] draws. Clones share the screen.
#[derive(Debug, Default, Clone)]
pub struct ScreenDisplay {
    state: Arc<Mutex<ScreenState>>,
}

impl ScreenDisplay {
    fn state(&self) -> MutexGuard<'_, ScreenState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// What the participants see right now, `None` while hidden.
    pub fn current(&self) -> Option<String> {
        let state = self.state();
        state.visible.then(|| state.text.clone())
    }
}

impl TrialDisplay for ScreenDisplay {
    fn update_trial_text(&self, text: &str) {
        self.state().text = text.to_owned();
    }

    fn show(&self) {
        self.state().visible = true;
    }

    fn hide(&self) {
        self.state().visible = false;
    }
}

/// Progress and recent reports, folded from the event stream.
#[derive(Debug, Default)]
struct Progress {
    trial: usize,
    total: usize,
    status: VecDeque<(Severity, String)>,
}

impl Progress {
    fn apply(&mut self, event: XmodEvent) {
        match event {
            XmodEvent::TrialStarted { index, total, .. } => {
                self.trial = index + 1;
                self.total = total;
            }
            XmodEvent::Report(report) => {
                if self.status.len() == STATUS_LINES {
                    self.status.pop_front();
                }
                self.status.push_back((report.severity, report.to_string()));
            }
            XmodEvent::Connection(state) => {
                self.apply(XmodEvent::Report(Report::info(
                    ReportLabel::Connection,
                    state.to_string(),
                )));
            }
            XmodEvent::ConnectionFailed { .. }
            | XmodEvent::RunCompleted { .. }
            | XmodEvent::RunAborted { .. } => {}
        }
    }

    fn ratio(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.trial as f64 / self.total as f64
        }
    }
}

/// Shows the running experiment until it finishes. `<Esc>` or `<Q>` asks
/// the runner to abort after the current trial.
///
/// The run is always joined, also when the terminal fails; in that case
/// the run goes on unattended and the terminal error is returned once it
/// is over.
pub fn trial_screen(
    display: &ScreenDisplay,
    runner: &ExperimentRunner,
    handle: RunHandle,
    events: &Receiver<XmodEvent>,
) -> Result<RunSummary, XmodGuiError> {
    let shown = init_terminal().and_then(|mut terminal| {
        let drawn = draw_until_finished(&mut terminal, display, runner, &handle, events);
        let restored = restore_terminal(&mut terminal);
        drawn.and(restored)
    });
    join_after(shown, handle)
}

fn join_after(
    shown: Result<(), XmodGuiError>,
    handle: RunHandle,
) -> Result<RunSummary, XmodGuiError> {
    if let Err(e) = &shown {
        warn!("trial screen failed, waiting for the run to finish: {}", e);
    }
    let summary = handle.join()?;
    shown.map(|()| summary)
}

fn draw_until_finished(
    terminal: &mut Tui,
    display: &ScreenDisplay,
    runner: &ExperimentRunner,
    handle: &RunHandle,
    events: &Receiver<XmodEvent>,
) -> Result<(), XmodGuiError> {
    let mut progress = Progress {
        total: runner.trial_count(),
        ..Progress::default()
    };
    let mut aborting = false;
    while !handle.is_finished() {
        for event in events.try_iter() {
            progress.apply(event);
        }

        let title = Title::from(" Experiment running ".magenta().bold());
        let instructions = Title::from(Line::from(vec![
            " Abort ".into(),
            "<Esc>/<Q> ".magenta().bold(),
        ]));
        let block = Block::default()
            .title(title.alignment(Alignment::Center))
            .title(
                instructions
                    .alignment(Alignment::Center)
                    .position(Position::Bottom),
            )
            .borders(Borders::ALL);
        let item = Paragraph::new(display.current().unwrap_or_default().bold())
            .alignment(Alignment::Center)
            .wrap(Wrap { trim: true })
            .block(block);

        let label = if aborting {
            format!("trial {} of {} (aborting)", progress.trial, progress.total)
        } else {
            format!("trial {} of {}", progress.trial, progress.total)
        };
        let gauge = Gauge::default()
            .block(Block::default().borders(Borders::ALL))
            .gauge_style(Style::default().fg(Color::Magenta))
            .ratio(progress.ratio().clamp(0.0, 1.0))
            .label(label);

        let status: Vec<Line> = progress
            .status
            .iter()
            .map(|(severity, text)| {
                let color = match severity {
                    Severity::Info => Color::White,
                    Severity::Warning => Color::Yellow,
                    Severity::Error => Color::Red,
                };
                Line::styled(text.clone(), Style::default().fg(color))
            })
            .collect();
        let status = Paragraph::new(status)
            .wrap(Wrap { trim: true })
            .block(Block::default().title(" Status ").borders(Borders::ALL));

        terminal.draw(|frame| {
            let chunks = Layout::default()
                .direction(Direction::Vertical)
                .constraints([
                    Constraint::Min(3),
                    Constraint::Length(3),
                    Constraint::Length(STATUS_LINES as u16 + 2),
                ])
                .split(frame.size());
            frame.render_widget(item, chunks[0]);
            frame.render_widget(gauge, chunks[1]);
            frame.render_widget(status, chunks[2]);
        })?;

        if event::poll(Duration::from_millis(16))? {
            if let event::Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press
                    && matches!(key.code, KeyCode::Esc | KeyCode::Char('q'))
                {
                    runner.abort();
                    aborting = true;
                }
            }
        }
    }

    Ok(())
}
