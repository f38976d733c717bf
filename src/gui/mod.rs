//! Terminal front ends: a file chooser and the screen shown during a run.

mod error;
mod file_chooser;
mod terminal;
mod trial_screen;

pub use error::XmodGuiError;
pub use file_chooser::{list_tms_files, tms_chooser, TerminalChooser};
pub use trial_screen::{trial_screen, ScreenDisplay};
