//! The narrow interfaces the experiment runner drives but does not own.
//!
//! Calls into these are fire-and-forget: the runner never waits for a
//! display or an audio player to confirm anything.

use log::info;
use std::{
    path::{Path, PathBuf},
    sync::Mutex,
};

/// Shows the current trial's screen item to the participants.
pub trait TrialDisplay: Send + Sync {
    /// Replaces the text on screen. An empty string clears it.
    fn update_trial_text(&self, text: &str);
    /// Makes the display visible.
    fn show(&self);
    /// Hides it again.
    fn hide(&self);
}

/// The audio cue that plays under the trials. Its signal triggers the
/// controller box's interrupt, so nothing happens in hardware without it.
pub trait AudioCue: Send + Sync {
    /// True once a cue file has been loaded and checked.
    fn is_loaded(&self) -> bool;
    /// Starts playback from the beginning. Returns immediately.
    fn play(&self);
    /// Stops playback; a no-op when nothing is playing.
    fn stop(&self);
}

/// Asks somebody for a TMS file.
pub trait FileChooser {
    /// `None` when the user backed out.
    fn choose_file(&self, start_dir: &Path) -> Option<PathBuf>;
}

/// A display that writes the trial text to the log. Good enough for
/// headless runs and the simulated box.
#[derive(Debug, Default)]
pub struct LogDisplay {
    visible: Mutex<bool>,
}

impl TrialDisplay for LogDisplay {
    fn update_trial_text(&self, text: &str) {
        if *self.visible.lock().unwrap_or_else(|p| p.into_inner()) && !text.is_empty() {
            info!("screen: {}", text);
        }
    }

    fn show(&self) {
        *self.visible.lock().unwrap_or_else(|p| p.into_inner()) = true;
    }

    fn hide(&self) {
        *self.visible.lock().unwrap_or_else(|p| p.into_inner()) = false;
    }
}

/// A cue that is always ready and makes no sound, for dry runs against the
/// simulated box.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentCue;

impl AudioCue for SilentCue {
    fn is_loaded(&self) -> bool {
        true
    }

    fn play(&self) {
        info!("silent cue playing");
    }

    fn stop(&self) {}
}

/// A chooser with the answer already decided, e.g. from the command line.
#[derive(Debug, Clone, Default)]
pub struct FixedChoice(pub Option<PathBuf>);

impl FileChooser for FixedChoice {
    fn choose_file(&self, _start_dir: &Path) -> Option<PathBuf> {
        self.0.clone()
    }
}
