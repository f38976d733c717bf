//! Command line arguments, parsed with clap.

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::config::Config;

#[derive(Debug, Parser, Clone)]
#[clap(version, about)]
/// Runs reaction-time experiments on the XMOD controller box
pub struct XmodArgs {
    #[command(subcommand)]
    /// What to do with the controller box
    pub command: Task,

    /// RON config file; built-in defaults are used without one
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Talk to a simulated controller box instead of a serial port
    #[arg(long, global = true)]
    pub dummy: bool,

    /// Substring that identifies the controller box's serial device
    #[arg(short = 'd', long = "device", global = true)]
    pub device_signature: Option<String>,

    /// How many times to try connecting before giving up
    #[arg(short = 'a', long, global = true)]
    pub attempts: Option<u32>,

    /// Give up waiting for a reaction packet after this many milliseconds
    #[arg(long = "timeout", global = true)]
    pub receive_timeout_ms: Option<u64>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Task {
    /// Load a TMS file and run the experiment
    #[command(about)]
    Run(RunCommand),

    /// Ask the controller box about its firmware and hardware
    Info,

    /// Flash the LEDs on every response box
    Flash,

    /// Switch the participants' monitors on or off
    Monitors(MonitorsCommand),

    /// List serial devices and mark the ones that look like the box
    Ports,
}

#[derive(Debug, Args, Clone)]
pub struct RunCommand {
    /// The TMS file; without one, a chooser lists the files in --dir
    pub tms: Option<PathBuf>,

    /// Where the chooser looks for TMS files
    #[arg(long, default_value = ".")]
    pub dir: PathBuf,

    /// The audio cue; defaults to the WAV file next to the TMS file
    #[arg(long)]
    pub audio: Option<PathBuf>,

    /// Run without an audio cue (only useful with --dummy)
    #[arg(long)]
    pub silent: bool,

    /// Log trial text instead of drawing the trial screen
    #[arg(long)]
    pub headless: bool,

    /// Seed for the simulated box's button presses
    #[arg(long)]
    pub seed: Option<u64>,
}

#[derive(Debug, Args, Clone)]
pub struct MonitorsCommand {
    /// Which way to switch them
    #[arg(value_enum)]
    pub state: MonitorState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum MonitorState {
    On,
    Off,
}

impl XmodArgs {
    /// Lets command line flags win over the config file.
    pub fn apply_to(&self, config: &mut Config) {
        if let Some(signature) = &self.device_signature {
            config.device_signature = signature.clone();
        }
        if let Some(attempts) = self.attempts {
            config.connect_attempts = attempts;
        }
        if let Some(timeout) = self.receive_timeout_ms {
            config.receive_timeout_ms = Some(timeout);
        }
    }
}
