//! The WAV audio cue.
//!
//! The file is checked with [hound] when it is loaded, so a broken cue is
//! caught before a run starts rather than in the middle of one. Playback
//! itself is handed to an external player command from the config.

use hound::{WavReader, WavSpec};
use log::{debug, error, info, warn};
use std::{
    borrow::Cow,
    fmt,
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
    sync::{Mutex, MutexGuard, PoisonError},
};

use crate::collaborators::AudioCue;

/// What we learned about a cue while loading it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CueInfo {
    /// Channels, sample rate and sample format.
    pub spec: WavSpec,
    /// Length in samples per channel.
    pub duration: u32,
}

impl CueInfo {
    /// Playing time.
    pub fn seconds(&self) -> f32 {
        self.duration as f32 / self.spec.sample_rate as f32
    }
}

/// Errors loading or playing a cue.
#[derive(Debug)]
#[allow(missing_docs)]
pub enum AudioError {
    /// Returned when the file is missing or not a WAV file.
    HoundError { path: PathBuf, error: hound::Error },

    /// Returned when the WAV file contains no samples.
    Empty(PathBuf),
}

impl fmt::Display for AudioError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let msg = match self {
            AudioError::HoundError { path, error } => {
                Cow::from(format!("could not read {}: {}", path.display(), error))
            }
            AudioError::Empty(path) => Cow::from(format!("{} has no samples", path.display())),
        };

        write!(f, "{}", msg)
    }
}

impl std::error::Error for AudioError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AudioError::HoundError { error, .. } => Some(error),
            AudioError::Empty(_) => None,
        }
    }
}

#[derive(Default)]
struct CueState {
    loaded: Option<(PathBuf, CueInfo)>,
    playing: Option<Child>,
}

/// A WAV file played through an external command.
pub struct WavCue {
    player: Vec<String>,
    state: Mutex<CueState>,
}

impl WavCue {
    /// `player` is the command and its leading arguments; the WAV path is
    /// appended when playing.
    pub fn new(player: Vec<String>) -> Self {
        WavCue {
            player,
            state: Mutex::new(CueState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, CueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Checks that `path` is a playable WAV file and makes it the cue.
    /// On failure the previous cue is unloaded.
    pub fn load(&self, path: impl AsRef<Path>) -> Result<CueInfo, AudioError> {
        let path = path.as_ref();
        let mut state = self.state();
        state.loaded = None;

        let reader = WavReader::open(path).map_err(|error| AudioError::HoundError {
            path: path.to_path_buf(),
            error,
        })?;
        let info = CueInfo {
            spec: reader.spec(),
            duration: reader.duration(),
        };
        if info.duration == 0 {
            return Err(AudioError::Empty(path.to_path_buf()));
        }

        info!(
            "loaded cue {} ({} ch, {} Hz, {:.1}s)",
            path.display(),
            info.spec.channels,
            info.spec.sample_rate,
            info.seconds()
        );
        state.loaded = Some((path.to_path_buf(), info));
        Ok(info)
    }

    /// The loaded file, if any.
    pub fn path(&self) -> Option<PathBuf> {
        self.state().loaded.as_ref().map(|(p, _)| p.clone())
    }
}

impl AudioCue for WavCue {
    fn is_loaded(&self) -> bool {
        self.state().loaded.is_some()
    }

    fn play(&self) {
        let mut state = self.state();
        let Some((path, _)) = &state.loaded else {
            warn!("no cue loaded, nothing to play");
            return;
        };
        let Some((program, args)) = self.player.split_first() else {
            warn!("no audio player configured, not playing {}", path.display());
            return;
        };

        let spawned = Command::new(program)
            .args(args)
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        match spawned {
            Ok(child) => {
                debug!("{} playing {} (pid {})", program, path.display(), child.id());
                if let Some(mut old) = state.playing.replace(child) {
                    let _ = old.kill();
                    let _ = old.wait();
                }
            }
            Err(e) => error!("could not start {}: {}", program, e),
        }
    }

    fn stop(&self) {
        if let Some(mut child) = self.state().playing.take() {
            // It may already have finished on its own.
            let _ = child.kill();
            if let Err(e) = child.wait() {
                warn!("audio player did not exit cleanly: {}", e);
            }
        }
    }
}

impl Drop for WavCue {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hound::{SampleFormat, WavWriter};

    fn write_wav(path: &Path, samples: u32) {
        let spec = WavSpec {
            channels: 1,
            sample_rate: 8000,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut writer = WavWriter::create(path, spec).unwrap();
        for i in 0..samples {
            writer.write_sample((i % 100) as i16).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn loads_valid_wav() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cue.wav");
        write_wav(&path, 8000);

        let cue = WavCue::new(Vec::new());
        assert!(!cue.is_loaded());
        let info = cue.load(&path).unwrap();
        assert_eq!(info.duration, 8000);
        assert!((info.seconds() - 1.0).abs() < f32::EPSILON);
        assert!(cue.is_loaded());
        assert_eq!(cue.path(), Some(path));
    }

    #[test]
    fn bad_file_unloads() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("cue.wav");
        write_wav(&good, 10);
        let bad = dir.path().join("notes.wav");
        std::fs::write(&bad, b"definitely not RIFF").unwrap();

        let cue = WavCue::new(Vec::new());
        cue.load(&good).unwrap();
        assert!(matches!(cue.load(&bad), Err(AudioError::HoundError { .. })));
        assert!(!cue.is_loaded());
    }

    #[test]
    fn empty_wav_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("silence.wav");
        write_wav(&path, 0);
        assert!(matches!(
            WavCue::new(Vec::new()).load(&path),
            Err(AudioError::Empty(_))
        ));
    }

    #[test]
    fn play_without_player_is_harmless() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cue.wav");
        write_wav(&path, 10);

        let cue = WavCue::new(Vec::new());
        cue.play();
        cue.load(&path).unwrap();
        cue.play();
        cue.stop();
    }

    #[cfg(unix)]
    #[test]
    fn play_spawns_and_stop_reaps() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cue.wav");
        write_wav(&path, 10);

        let cue = WavCue::new(vec!["sleep".to_owned(), "5".to_owned()]);
        cue.load(&path).unwrap();
        cue.play();
        assert!(cue.state().playing.is_some());
        cue.stop();
        assert!(cue.state().playing.is_none());
    }
}
