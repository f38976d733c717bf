use std::io::{stdout, Stdout};

use crossterm::{
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
    ExecutableCommand,
};
use ratatui::{backend::CrosstermBackend, Terminal};

use crate::gui::error::XmodGuiError;

pub(crate) type Tui = Terminal<CrosstermBackend<Stdout>>;

/// Raw mode plus the alternate screen. Every successful call must be paired
/// with [`restore_terminal`], whatever the screen loop returned.
pub(crate) fn init_terminal() -> Result<Tui, XmodGuiError> {
    enable_raw_mode()?;
    if let Err(e) = stdout().execute(EnterAlternateScreen) {
        let _ = disable_raw_mode();
        return Err(e.into());
    }
    let mut terminal = match Terminal::new(CrosstermBackend::new(stdout())) {
        Ok(terminal) => terminal,
        Err(e) => {
            let _ = stdout().execute(LeaveAlternateScreen);
            let _ = disable_raw_mode();
            return Err(e.into());
        }
    };
    if let Err(e) = terminal.clear() {
        let _ = restore_terminal(&mut terminal);
        return Err(e.into());
    }
    Ok(terminal)
}

/// Gives the terminal back to the shell. Tries every step even if an
/// earlier one fails, and reports the first failure.
pub(crate) fn restore_terminal(terminal: &mut Tui) -> Result<(), XmodGuiError> {
    let raw = disable_raw_mode();
    let screen = terminal.backend_mut().execute(LeaveAlternateScreen).map(|_| ());
    let cursor = terminal.show_cursor();
    raw.and(screen).and(cursor)?;
    Ok(())
}
