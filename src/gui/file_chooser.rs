use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{
    collaborators::FileChooser,
    gui::{
        error::XmodGuiError,
        terminal::{init_terminal, restore_terminal, Tui},
    },
    tms::TMS_EXTENSION,
};

use crossterm::event::{self, KeyCode, KeyEventKind};
use log::{error, warn};
use ratatui::{
    prelude::*,
    widgets::{
        block::{Position, Title},
        *,
    },
};

/// The `.tms` files directly inside `dir`, sorted by name.
pub fn list_tms_files(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let is_tms = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case(TMS_EXTENSION));
        if is_tms && path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Lets the user pick one of the TMS files in `dir`. Returns `None` if they
/// quit, or if there is nothing to pick.
pub fn tms_chooser(dir: &Path) -> Result<Option<PathBuf>, XmodGuiError> {
    let mut files = list_tms_files(dir)?;
    if files.is_empty() {
        warn!("no .tms files in {}", dir.display());
        return Ok(None);
    }

    let mut terminal = init_terminal()?;
    let picked = pick_file(&mut terminal, dir, &files);
    let restored = restore_terminal(&mut terminal);
    let picked = picked?;
    restored?;

    Ok(picked.map(|i| files.swap_remove(i)))
}

/// The chooser loop. Returns the index of the chosen file.
fn pick_file(
    terminal: &mut Tui,
    dir: &Path,
    files: &[PathBuf],
) -> Result<Option<usize>, XmodGuiError> {
    let mut cursor = 0;
    let mut list_state = ListState::default().with_selected(Some(cursor));
    let n_files = files.len();
    let mut selected = None;
    loop {
        let title = Title::from(format!(" Load TMS file: {} ", dir.display()).magenta().bold());
        let instructions = Title::from(Line::from(vec![
            " Navigate ".into(),
            "<Up>/<Down>".magenta().bold(),
            " Load ".into(),
            "<Enter>".magenta().bold(),
            " Cancel ".into(),
            "<Q> ".magenta().bold(),
        ]));
        let block = Block::default()
            .title(title.alignment(Alignment::Center))
            .title(
                instructions
                    .alignment(Alignment::Center)
                    .position(Position::Bottom),
            )
            .borders(Borders::ALL);
        let names = files
            .iter()
            .map(|p| p.file_name().map(|n| n.to_string_lossy()).unwrap_or_default());
        let list = List::new(names)
            .style(Style::default().fg(Color::White))
            .highlight_symbol(">>")
            .highlight_style(Style::default().fg(Color::Magenta))
            .block(block);
        list_state.select(Some(cursor));
        terminal.draw(|frame| {
            let area = frame.size();
            frame.render_stateful_widget(list, area, &mut list_state);
        })?;
        if event::poll(Duration::from_millis(16))? {
            if let event::Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    match key.code {
                        KeyCode::Down => {
                            cursor = (cursor + 1) % n_files;
                        }
                        KeyCode::Up => {
                            cursor = (cursor + n_files - 1) % n_files;
                        }
                        KeyCode::Enter => {
                            selected = Some(cursor);
                            break;
                        }
                        KeyCode::Char('q') | KeyCode::Esc => break,
                        _ => {}
                    }
                }
            }
        }
    }

    Ok(selected)
}

/// [`FileChooser`] backed by [`tms_chooser`].
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalChooser;

impl FileChooser for TerminalChooser {
    fn choose_file(&self, start_dir: &Path) -> Option<PathBuf> {
        tms_chooser(start_dir).unwrap_or_else(|e| {
            error!("file chooser failed: {}", e);
            None
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lists_only_tms_files() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.tms", "a.TMS", "notes.txt", "cue.wav"] {
            fs::write(dir.path().join(name), "x").unwrap();
        }
        fs::create_dir(dir.path().join("results.tms")).unwrap();

        let files = list_tms_files(dir.path()).unwrap();
        assert_eq!(
            files,
            vec![dir.path().join("a.TMS"), dir.path().join("b.tms")]
        );
    }

    #[test]
    fn empty_directory_needs_no_terminal() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(tms_chooser(dir.path()), Ok(None)));
        assert_eq!(TerminalChooser.choose_file(dir.path()), None);
    }
}
