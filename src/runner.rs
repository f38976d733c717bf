//! Runs an experiment: one trial after another against the controller box.
//!
//! An [`ExperimentRunner`] moves through [`RunState`]s:
//!
//! ```text
//! Idle -> Loaded -> Running -> Completed
//!            ^                 \-> Aborted
//!            '------ reload ------'
//! ```
//!
//! [`ExperimentRunner::run`] checks every precondition up front, then hands
//! the trial loop to its own thread and returns a [`RunHandle`]. The loop
//! takes the serial port for itself for the whole run. Aborting is
//! cooperative and only happens between trials: once a trial's timing went
//! out, the loop waits for its reaction packet.

use chrono::Local;
use log::{debug, error, info, warn};
use std::{
    borrow::Cow,
    fmt, io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    thread::{self, JoinHandle},
};

use crate::{
    collaborators::{AudioCue, FileChooser, TrialDisplay},
    command::Command,
    event::{EventSink, Report, ReportLabel, XmodEvent},
    link::{HardwareLink, LinkError, LinkSession, REACTION_PACKET_LEN},
    results::{ReactionPacket, ResultSet, TrialIndex},
    tms::{self, ExperimentPlan, ParseError},
};

/// Where the runner is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Nothing loaded yet.
    Idle,
    /// A plan is loaded and the result grid is empty.
    Loaded,
    /// The trial loop is going.
    Running,
    /// Every trial ran. Needs a reload before the next run.
    Completed,
    /// The run stopped early. Needs a reload before the next run.
    Aborted,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every trial ran.
    Completed,
    /// Stopped on request or by a link error.
    Aborted,
}

/// Errors starting a run or loading a plan.
#[derive(Debug)]
pub enum RunError {
    /// A run is in progress.
    AlreadyRunning,
    /// No plan has been loaded.
    NoPlan,
    /// The audio cue is not loaded.
    AudioNotLoaded,
    /// The controller box is not connected.
    NotConnected,
    /// The file chooser came back empty.
    NoFileChosen,
    /// The TMS file could not be loaded.
    Load(ParseError),
    /// The hardware link refused.
    Link(LinkError),
    /// The run thread could not be started.
    Spawn(io::Error),
    /// The run thread panicked.
    Panicked,
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use RunError as RE;
        let msg = match self {
            RE::AlreadyRunning => Cow::from("an experiment is already in progress"),
            RE::NoPlan => Cow::from("no experiment loaded"),
            RE::AudioNotLoaded => Cow::from("no audio loaded"),
            RE::NotConnected => Cow::from("control box not connected"),
            RE::NoFileChosen => Cow::from("no file chosen"),
            RE::Load(e) => Cow::from(format!("load error: {}", e)),
            RE::Link(e) => Cow::from(format!("link error: {}", e)),
            RE::Spawn(e) => Cow::from(format!("could not start run thread: {}", e)),
            RE::Panicked => Cow::from("run thread panicked"),
        };

        write!(f, "{}", msg)
    }
}

impl std::error::Error for RunError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RunError::Load(e) => Some(e),
            RunError::Link(e) => Some(e),
            RunError::Spawn(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ParseError> for RunError {
    fn from(value: ParseError) -> Self {
        Self::Load(value)
    }
}

impl From<LinkError> for RunError {
    fn from(value: LinkError) -> Self {
        Self::Link(value)
    }
}

/// What a finished run produced.
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// How the run ended.
    pub outcome: RunOutcome,
    /// Trials whose packet was decoded.
    pub trials_completed: usize,
    /// Everything decoded, including trials nobody answered.
    pub results: ResultSet,
    /// `None` when writing the results file failed.
    pub results_path: Option<PathBuf>,
}

/// The run thread. Dropping it detaches the run.
#[derive(Debug)]
pub struct RunHandle {
    thread: JoinHandle<RunSummary>,
}

impl RunHandle {
    /// Waits for the run to finish.
    pub fn join(self) -> Result<RunSummary, RunError> {
        self.thread.join().map_err(|_| RunError::Panicked)
    }

    /// True once the run thread has returned.
    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }
}

struct RunnerState {
    run_state: RunState,
    plan: Option<Arc<ExperimentPlan>>,
    /// Taken by the run thread while running, handed back at the end.
    results: Option<ResultSet>,
}

/// Loads plans and runs them.
pub struct ExperimentRunner {
    link: HardwareLink,
    audio: Arc<dyn AudioCue>,
    display: Arc<dyn TrialDisplay>,
    events: EventSink,
    state: Arc<Mutex<RunnerState>>,
    abort: Arc<AtomicBool>,
}

fn lock(state: &Mutex<RunnerState>) -> MutexGuard<'_, RunnerState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn display_name(path: &Path) -> Cow<'_, str> {
    path.file_name()
        .map_or_else(|| path.to_string_lossy(), |n| n.to_string_lossy())
}

impl ExperimentRunner {
    /// An idle runner. Nothing touches the link until [`Self::run`].
    pub fn new(
        link: HardwareLink,
        audio: Arc<dyn AudioCue>,
        display: Arc<dyn TrialDisplay>,
        events: EventSink,
    ) -> Self {
        ExperimentRunner {
            link,
            audio,
            display,
            events,
            state: Arc::new(Mutex::new(RunnerState {
                run_state: RunState::Idle,
                plan: None,
                results: None,
            })),
            abort: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The current run state.
    pub fn state(&self) -> RunState {
        lock(&self.state).run_state
    }

    /// Trials in the loaded plan, `0` when nothing is loaded.
    pub fn trial_count(&self) -> usize {
        lock(&self.state)
            .plan
            .as_ref()
            .map_or(0, |p| p.trial_count())
    }

    /// The loaded plan.
    pub fn plan(&self) -> Option<Arc<ExperimentPlan>> {
        lock(&self.state).plan.clone()
    }

    /// A copy of the results so far. `None` while a run holds them.
    pub fn results_snapshot(&self) -> Option<ResultSet> {
        lock(&self.state).results.clone()
    }

    /// Parses `path` and, on success, makes it the plan with a fresh result
    /// grid. On failure nothing changes.
    pub fn load(&self, path: impl AsRef<Path>) -> Result<usize, RunError> {
        let path = path.as_ref();
        let mut state = lock(&self.state);
        if state.run_state == RunState::Running {
            self.report_already_running();
            return Err(RunError::AlreadyRunning);
        }
        let count = self.load_locked(&mut state, path)?;
        Ok(count)
    }

    /// Asks `chooser` for a TMS file, starting in `start_dir`, and loads it.
    pub fn load_chosen(
        &self,
        chooser: &dyn FileChooser,
        start_dir: &Path,
    ) -> Result<usize, RunError> {
        match chooser.choose_file(start_dir) {
            Some(path) => self.load(path),
            None => {
                self.events.report(
                    Report::warning(ReportLabel::Tms, "No file chosen")
                        .advice("Please load a valid TMS file"),
                );
                Err(RunError::NoFileChosen)
            }
        }
    }

    fn load_locked(&self, state: &mut RunnerState, path: &Path) -> Result<usize, RunError> {
        let name = display_name(path);
        match tms::parse(path) {
            Ok(plan) => {
                let plan = Arc::new(plan);
                let count = plan.trial_count();
                state.results = Some(ResultSet::new(Arc::clone(&plan)));
                state.plan = Some(plan);
                state.run_state = RunState::Loaded;
                self.events.report(
                    Report::info(ReportLabel::Tms, format!("Success loading file: {}", name))
                        .message(format!("{} trials", count)),
                );
                Ok(count)
            }
            Err(e) => {
                self.events.report(
                    Report::error(ReportLabel::Tms, format!("Failure loading file: {}", name))
                        .message(e.to_string())
                        .advice("Please load a valid TMS file"),
                );
                Err(RunError::Load(e))
            }
        }
    }

    fn report_already_running(&self) {
        self.events.report(
            Report::warning(ReportLabel::Status, "Experiment already in progress")
                .advice("Abort the current run first"),
        );
    }

    /// Starts the trial loop on its own thread.
    ///
    /// A finished plan is reloaded from disk first, so every run starts
    /// with an empty grid. Each missing precondition (plan, audio,
    /// connection) is reported; the first one is returned.
    pub fn run(&self) -> Result<RunHandle, RunError> {
        let mut state = lock(&self.state);
        match state.run_state {
            RunState::Running => {
                self.report_already_running();
                return Err(RunError::AlreadyRunning);
            }
            RunState::Completed | RunState::Aborted => self.reload(&mut state)?,
            RunState::Idle | RunState::Loaded => {}
        }

        let mut problems = Vec::new();
        if state.plan.is_none() {
            self.events.report(
                Report::error(ReportLabel::Tms, "Experiment not ready")
                    .message("Cannot begin experiment as no experiment loaded")
                    .advice("Please load a valid TMS file"),
            );
            problems.push(RunError::NoPlan);
        }
        if !self.audio.is_loaded() {
            self.events.report(
                Report::error(ReportLabel::Audio, "Experiment not ready")
                    .message("Cannot begin experiment as no audio loaded")
                    .advice("Please load a valid audio file"),
            );
            problems.push(RunError::AudioNotLoaded);
        }
        if !self.link.is_connected() {
            self.events.report(
                Report::error(ReportLabel::Connection, "Experiment not ready")
                    .message("Cannot begin experiment as the control box is not connected")
                    .advice("Please check serial port connection"),
            );
            problems.push(RunError::NotConnected);
        }
        let plan = match (problems.into_iter().next(), &state.plan) {
            (Some(problem), _) => return Err(problem),
            (None, Some(plan)) => Arc::clone(plan),
            (None, None) => return Err(RunError::NoPlan),
        };

        let results = state
            .results
            .take()
            .unwrap_or_else(|| ResultSet::new(Arc::clone(&plan)));
        self.abort.store(false, Ordering::SeqCst);
        state.run_state = RunState::Running;
        drop(state);

        let task = RunTask {
            link: self.link.clone(),
            audio: Arc::clone(&self.audio),
            display: Arc::clone(&self.display),
            events: self.events.clone(),
            state: Arc::clone(&self.state),
            abort: Arc::clone(&self.abort),
        };
        let spawned = thread::Builder::new()
            .name("xmod-run".to_owned())
            .spawn(move || task.run(plan, results));

        match spawned {
            Ok(thread) => {
                self.events
                    .report(Report::info(ReportLabel::Status, "Experiment started"));
                Ok(RunHandle { thread })
            }
            Err(e) => {
                error!("could not start the run thread: {}", e);
                let mut state = lock(&self.state);
                state.run_state = RunState::Loaded;
                Err(RunError::Spawn(e))
            }
        }
    }

    /// Makes a finished plan runnable again with an empty grid.
    fn reload(&self, state: &mut RunnerState) -> Result<(), RunError> {
        let Some(plan) = state.plan.clone() else {
            state.run_state = RunState::Idle;
            return Ok(());
        };
        let source = plan.source_path();
        if source.as_os_str().is_empty() {
            debug!("plan has no source file, resetting results only");
            state.results = Some(ResultSet::new(Arc::clone(&plan)));
            state.run_state = RunState::Loaded;
            return Ok(());
        }
        info!("reloading {} for a fresh run", source.display());
        self.load_locked(state, source).map(|_| ())
    }

    /// Asks the run to stop before its next trial.
    pub fn abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
        if self.state() == RunState::Running {
            self.events.report(
                Report::info(ReportLabel::Status, "Abort requested")
                    .message("Stopping after the current trial"),
            );
        }
    }
}

/// Everything the run thread needs.
struct RunTask {
    link: HardwareLink,
    audio: Arc<dyn AudioCue>,
    display: Arc<dyn TrialDisplay>,
    events: EventSink,
    state: Arc<Mutex<RunnerState>>,
    abort: Arc<AtomicBool>,
}

impl RunTask {
    fn run(self, plan: Arc<ExperimentPlan>, mut results: ResultSet) -> RunSummary {
        let (outcome, trials_completed) = match self.link.session() {
            Ok(mut session) => self.trial_loop(&mut session, &plan, &mut results),
            Err(e) => {
                self.events.report(
                    Report::error(ReportLabel::Connection, "Experiment aborted")
                        .message(e.to_string())
                        .advice("Please check serial port connection"),
                );
                (RunOutcome::Aborted, 0)
            }
        };
        self.finish(outcome, trials_completed, results)
    }

    fn trial_loop(
        &self,
        session: &mut LinkSession<'_>,
        plan: &ExperimentPlan,
        results: &mut ResultSet,
    ) -> (RunOutcome, usize) {
        self.audio.play();
        self.display.show();
        self.display.update_trial_text("");
        if let Err(e) = session.send_command(Command::AdjustOff) {
            self.events.report(
                Report::warning(ReportLabel::Monitors, "Could not turn monitors off")
                    .detail(e.to_string()),
            );
        }

        let total = plan.trial_count();
        let mut completed = 0;
        for (index, trial) in plan.trials().iter().enumerate() {
            if self.abort.load(Ordering::SeqCst) {
                info!("run aborted before trial {} of {}", index + 1, total);
                return (RunOutcome::Aborted, completed);
            }

            self.events.emit(XmodEvent::TrialStarted {
                index,
                total,
                screen_item: trial.screen_item.clone(),
            });
            self.display.update_trial_text(&trial.screen_item);

            let packet = session
                .send_trial_timing(
                    trial.reaction_timeout_ms,
                    trial.monitor_on_ms,
                    trial.monitor_off_ms,
                )
                .and_then(|()| session.receive_array::<REACTION_PACKET_LEN>());
            let packet = match packet {
                Ok(bytes) => ReactionPacket::from(bytes),
                Err(e) => {
                    self.events.report(
                        Report::error(ReportLabel::Connection, "Experiment aborted")
                            .message(format!("Trial {} of {} failed", index + 1, total))
                            .advice("Please check serial port connection")
                            .detail(e.to_string()),
                    );
                    return (RunOutcome::Aborted, completed);
                }
            };

            if let Err(e) = results.record(&packet, TrialIndex(index)) {
                warn!("dropping reaction packet: {}", e);
                continue;
            }
            completed += 1;
            debug!("trial {} of {} recorded", index + 1, total);
        }
        (RunOutcome::Completed, completed)
    }

    fn finish(self, outcome: RunOutcome, trials_completed: usize, results: ResultSet) -> RunSummary {
        self.audio.stop();
        self.display.update_trial_text("");
        self.display.hide();

        let results_path = match results.write_to_disk(Local::now()) {
            Ok(path) => {
                self.events.report(
                    Report::info(ReportLabel::Status, "Results successfully printed to file")
                        .message(path.display().to_string()),
                );
                Some(path)
            }
            Err(e) => {
                self.events.report(
                    Report::error(ReportLabel::Status, "Could not create results file")
                        .advice("Please check that the results directory is writable")
                        .detail(e.to_string()),
                );
                None
            }
        };

        {
            let mut state = lock(&self.state);
            state.run_state = match outcome {
                RunOutcome::Completed => RunState::Completed,
                RunOutcome::Aborted => RunState::Aborted,
            };
            state.results = Some(results.clone());
        }

        match outcome {
            RunOutcome::Completed => {
                info!("experiment completed, {} trials", trials_completed);
                self.events.emit(XmodEvent::RunCompleted {
                    trials: trials_completed,
                    results_path: results_path.clone(),
                });
            }
            RunOutcome::Aborted => {
                warn!("experiment aborted after {} trials", trials_completed);
                self.events.emit(XmodEvent::RunAborted {
                    trials_completed,
                    results_path: results_path.clone(),
                });
            }
        }

        RunSummary {
            outcome,
            trials_completed,
            results,
            results_path,
        }
    }
}
