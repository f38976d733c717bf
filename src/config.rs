//! Settings that change from lab to lab, read from a [ron] file.
//!
//! Every field has a default, so a config file only needs the values that
//! differ:
//!
//! ```text
//! (
//!     device_signature: "usbmodem",
//!     receive_timeout_ms: Some(30000),
//!     audio_player: ["aplay", "-q"],
//! )
//! ```

use serde::{Deserialize, Serialize};
use std::{borrow::Cow, fmt, fs, path::Path, time::Duration};

use crate::link::LinkSettings;

/// Everything configurable about a session.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Substring of the serial device path that identifies the box
    pub device_signature: String,
    /// Serial line speed
    pub baud_rate: u32,
    /// Attempts when connecting at start-up
    pub connect_attempts: u32,
    /// Attempts after the box was lost mid-session
    pub reconnect_attempts: u32,
    /// Pause between connection attempts
    pub retry_interval_ms: u64,
    /// Pause after every byte sent to the box
    pub inter_byte_pause_ms: u64,
    /// How long to wait for a reaction packet; `None` waits forever
    pub receive_timeout_ms: Option<u64>,
    /// How often to check that the box is still plugged in; `0` disables
    pub watch_interval_ms: u64,
    /// Command (and leading arguments) that plays a WAV file given as the
    /// last argument
    pub audio_player: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            device_signature: "usbserial".to_owned(),
            baud_rate: 19200,
            connect_attempts: 5,
            reconnect_attempts: 5,
            retry_interval_ms: 1000,
            inter_byte_pause_ms: 40,
            receive_timeout_ms: None,
            watch_interval_ms: 1000,
            audio_player: default_player(),
        }
    }
}

#[cfg(target_os = "macos")]
fn default_player() -> Vec<String> {
    vec!["afplay".to_owned()]
}

#[cfg(not(target_os = "macos"))]
fn default_player() -> Vec<String> {
    vec!["aplay".to_owned(), "-q".to_owned()]
}

/// Errors reading a config file.
#[derive(Debug)]
pub enum ConfigError {
    /// Returned when the file cannot be read.
    IoError(std::io::Error),

    /// Returned when the file is not valid RON for a [Config].
    RonSpannedError(ron::de::SpannedError),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let msg = match self {
            ConfigError::IoError(error) => Cow::from(format!("io error: {}", error)),
            ConfigError::RonSpannedError(error) => Cow::from(format!("ron error: {}", error)),
        };

        write!(f, "{}", msg)
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::IoError(e) => Some(e),
            ConfigError::RonSpannedError(e) => Some(e),
        }
    }
}

impl Config {
    /// Reads a config file. Missing fields take their defaults.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(ConfigError::IoError)?;
        Self::from_ron(&text)
    }

    /// Parses config text.
    pub fn from_ron(text: &str) -> Result<Self, ConfigError> {
        ron::from_str(text).map_err(ConfigError::RonSpannedError)
    }

    /// The link settings these values describe.
    pub fn link_settings(&self) -> LinkSettings {
        LinkSettings {
            device_signature: self.device_signature.clone(),
            baud_rate: self.baud_rate,
            retry_interval: Duration::from_millis(self.retry_interval_ms),
            reconnect_attempts: self.reconnect_attempts,
            inter_byte_pause: Duration::from_millis(self.inter_byte_pause_ms),
            receive_timeout: self.receive_timeout_ms.map(Duration::from_millis),
            watch_interval: (self.watch_interval_ms > 0)
                .then(|| Duration::from_millis(self.watch_interval_ms)),
        }
    }
}
