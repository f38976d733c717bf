//! The xmod command line: connects to the controller box and runs
//! experiments from TMS files.

use clap::Parser;
use log::{debug, error, info};
use std::{
    path::Path,
    process::ExitCode,
    sync::{mpsc::Receiver, Arc},
    thread,
};
use xmod::{
    args::{MonitorState, RunCommand, Task, XmodArgs},
    audio::WavCue,
    collaborators::{AudioCue, LogDisplay, SilentCue, TrialDisplay},
    config::Config,
    dummy_box::DummyBox,
    event::{EventSink, Report, ReportLabel, XmodEvent},
    gui::{trial_screen, ScreenDisplay, TerminalChooser},
    link::{Connector, HardwareLink, SerialConnector},
    runner::{ExperimentRunner, RunOutcome},
};

// Example:
// RUST_LOG=info cargo run -- --dummy run words.tms --silent --headless

fn main() -> ExitCode {
    env_logger::init();
    let args = XmodArgs::parse();

    let mut config = match &args.config {
        Some(path) => match Config::from_path(path) {
            Ok(config) => config,
            Err(e) => {
                error!("could not read config {}: {}", path.display(), e);
                return ExitCode::FAILURE;
            }
        },
        None => Config::default(),
    };
    args.apply_to(&mut config);
    debug!("{:#?}", config);

    let (events, rx) = EventSink::channel();
    let seed = match &args.command {
        Task::Run(run) => run.seed,
        _ => None,
    };
    let link = make_link(&args, &config, seed, events.clone());

    let ok = match &args.command {
        Task::Ports => list_ports(&args, &config),
        Task::Run(run) => {
            connect(&link, &config) && run_experiment(run, &config, link.clone(), events, rx)
        }
        other => {
            drain_events(rx);
            connect(&link, &config) && box_command(&link, other)
        }
    };

    if let Err(e) = link.close() {
        debug!("not closing the port: {}", e);
    }
    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn make_link(args: &XmodArgs, config: &Config, seed: Option<u64>, events: EventSink) -> HardwareLink {
    let settings = config.link_settings();
    if args.dummy {
        let mut dummy = DummyBox::builder();
        if let Some(seed) = seed {
            dummy = dummy.seed(seed);
        }
        HardwareLink::new(dummy.build(), settings, events)
    } else {
        HardwareLink::serial(settings, events)
    }
}

/// Logs whatever nobody else is listening for.
fn drain_events(rx: Receiver<XmodEvent>) {
    thread::spawn(move || {
        for event in rx {
            if !matches!(event, XmodEvent::Report(_)) {
                debug!("{:?}", event);
            }
        }
    });
}

fn connect(link: &HardwareLink, config: &Config) -> bool {
    let settings = link.settings();
    info!(
        "looking for a {:?} device at {} baud",
        settings.device_signature, settings.baud_rate
    );
    match link.connect(config.connect_attempts) {
        Ok(outcome) => {
            debug!("{:?}", outcome);
            true
        }
        Err(e) => {
            error!("{}", e);
            false
        }
    }
}

fn list_ports(args: &XmodArgs, config: &Config) -> bool {
    let connector: Box<dyn Connector> = if args.dummy {
        Box::new(DummyBox::builder().build())
    } else {
        Box::new(SerialConnector)
    };
    match connector.available_ports() {
        Ok(ports) => {
            println!("Available devices:");
            for port in ports {
                let name = port.to_string_lossy();
                let mark = if name.contains(config.device_signature.as_str()) {
                    "*"
                } else {
                    " "
                };
                println!("{} {}", mark, name);
            }
            true
        }
        Err(e) => {
            error!("could not list serial ports: {}", e);
            false
        }
    }
}

fn box_command(link: &HardwareLink, task: &Task) -> bool {
    let result = match task {
        Task::Info => link.query_info().map(|info| println!("{}", info)),
        Task::Flash => link.check_connection(),
        Task::Monitors(m) => match m.state {
            MonitorState::On => link.monitors_on(),
            MonitorState::Off => link.monitors_off(),
        },
        Task::Run(_) | Task::Ports => Ok(()),
    };
    match result {
        Ok(()) => true,
        Err(e) => {
            error!("{}", e);
            false
        }
    }
}

fn run_experiment(
    run: &RunCommand,
    config: &Config,
    link: HardwareLink,
    events: EventSink,
    rx: Receiver<XmodEvent>,
) -> bool {
    let wav = Arc::new(WavCue::new(config.audio_player.clone()));
    let audio: Arc<dyn AudioCue> = if run.silent {
        Arc::new(SilentCue) as Arc<dyn AudioCue>
    } else {
        wav.clone() as Arc<dyn AudioCue>
    };

    let screen = ScreenDisplay::default();
    let display: Arc<dyn TrialDisplay> = if run.headless {
        Arc::new(LogDisplay::default()) as Arc<dyn TrialDisplay>
    } else {
        Arc::new(screen.clone()) as Arc<dyn TrialDisplay>
    };

    let runner = ExperimentRunner::new(link, audio, display, events.clone());
    let loaded = match &run.tms {
        Some(path) => runner.load(path),
        None => runner.load_chosen(&TerminalChooser, &run.dir),
    };
    if loaded.is_err() {
        return false;
    }

    if !run.silent {
        let Some(plan) = runner.plan() else {
            return false;
        };
        let audio_path = run.audio.clone().unwrap_or_else(|| plan.audio_path());
        load_audio(&wav, &audio_path, &events);
    }

    let Ok(handle) = runner.run() else {
        return false;
    };
    let summary = if run.headless {
        drain_events(rx);
        handle.join().map_err(|e| e.to_string())
    } else {
        trial_screen(&screen, &runner, handle, &rx).map_err(|e| e.to_string())
    };

    match summary {
        Ok(summary) => {
            let outcome = match summary.outcome {
                RunOutcome::Completed => "completed",
                RunOutcome::Aborted => "aborted",
            };
            println!(
                "Experiment {} after {} of {} trials, {} responses",
                outcome,
                summary.trials_completed,
                summary.results.plan().trial_count(),
                summary.results.responses()
            );
            if let Some(path) = &summary.results_path {
                println!("Results: {}", path.display());
            }
            info!("done");
            summary.outcome == RunOutcome::Completed
        }
        Err(e) => {
            error!("{}", e);
            false
        }
    }
}

fn load_audio(wav: &WavCue, path: &Path, events: &EventSink) {
    match wav.load(path) {
        Ok(cue) => events.report(
            Report::info(ReportLabel::Audio, format!("Success loading audio: {}", path.display()))
                .message(format!("{:.1}s", cue.seconds())),
        ),
        Err(e) => events.report(
            Report::error(ReportLabel::Audio, "Failure loading audio")
                .message(e.to_string())
                .advice("Please load a valid audio file"),
        ),
    }
}
