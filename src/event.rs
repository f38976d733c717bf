//! Typed events emitted by the engine.
//!
//! Every component that has something to tell the outside world (the
//! hardware link, the loader, the experiment runner) holds an
//! [`EventSink`], a cloneable handle around an [`mpsc::Sender`]. Whoever
//! drives the engine keeps the matching receiver and matches on
//! [`XmodEvent`].

use log::{debug, error, info, warn};
use std::{
    fmt,
    path::PathBuf,
    sync::mpsc::{self, Receiver, Sender},
};

use crate::link::ConnectionState;

/// Which part of the status display a [`Report`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReportLabel {
    /// General experiment status
    Status,
    /// Trial-definition file loading
    Tms,
    /// The audio cue
    Audio,
    /// The serial connection to the controller box
    Connection,
    /// The participants' monitors
    Monitors,
}

impl fmt::Display for ReportLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReportLabel::Status => "Status",
            ReportLabel::Tms => "TMS",
            ReportLabel::Audio => "Audio",
            ReportLabel::Connection => "Connection",
            ReportLabel::Monitors => "Monitors",
        };
        write!(f, "{}", name)
    }
}

/// Severity of a [`Report`], used to pick a log level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Everything is fine, just letting you know
    Info,
    /// Something did not work, but we can carry on
    Warning,
    /// An operation failed
    Error,
}

/// A structured status update: a headline status plus an optional
/// message, remediation advice and diagnostic detail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    /// Which part of the engine is talking.
    pub label: ReportLabel,
    /// How bad it is.
    pub severity: Severity,
    /// One-line headline.
    pub status: String,
    /// What happened, in more words.
    pub message: Option<String>,
    /// What the user can do about it.
    pub advice: Option<String>,
    /// Underlying error text, for the log.
    pub detail: Option<String>,
}

impl Report {
    /// Starts an informational report.
    pub fn info(label: ReportLabel, status: impl Into<String>) -> Self {
        Report {
            label,
            severity: Severity::Info,
            status: status.into(),
            message: None,
            advice: None,
            detail: None,
        }
    }

    /// Starts a warning report.
    pub fn warning(label: ReportLabel, status: impl Into<String>) -> Self {
        Report {
            severity: Severity::Warning,
            ..Report::info(label, status)
        }
    }

    /// Starts an error report.
    pub fn error(label: ReportLabel, status: impl Into<String>) -> Self {
        Report {
            severity: Severity::Error,
            ..Report::info(label, status)
        }
    }

    /// Attaches a message.
    pub fn message(self, message: impl Into<String>) -> Self {
        Report {
            message: Some(message.into()),
            ..self
        }
    }

    /// Attaches advice on how to fix the problem.
    pub fn advice(self, advice: impl Into<String>) -> Self {
        Report {
            advice: Some(advice.into()),
            ..self
        }
    }

    /// Attaches diagnostic detail, usually the `Display` of an error chain.
    pub fn detail(self, detail: impl Into<String>) -> Self {
        Report {
            detail: Some(detail.into()),
            ..self
        }
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.label, self.status)?;
        if let Some(message) = &self.message {
            write!(f, ": {}", message)?;
        }
        if let Some(advice) = &self.advice {
            write!(f, " ({})", advice)?;
        }
        if let Some(detail) = &self.detail {
            write!(f, " [{}]", detail)?;
        }
        Ok(())
    }
}

/// Everything the engine can tell its collaborators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XmodEvent {
    /// The serial connection changed state.
    Connection(ConnectionState),
    /// All automatic connection attempts failed; nothing more will be tried
    /// until someone asks.
    ConnectionFailed {
        /// Attempts made before giving up.
        attempts: u32,
    },
    /// A trial is about to be sent to the controller box.
    TrialStarted {
        /// Zero-based trial number.
        index: usize,
        /// Trials in the plan.
        total: usize,
        /// What the participants will see.
        screen_item: String,
    },
    /// The run went through every trial.
    RunCompleted {
        /// Trials run.
        trials: usize,
        /// `None` if the results file could not be written.
        results_path: Option<PathBuf>,
    },
    /// The run stopped early, either on request or because the link failed.
    /// Whatever was collected is in `results_path`.
    RunAborted {
        /// Trials whose packet was decoded.
        trials_completed: usize,
        /// `None` if the results file could not be written.
        results_path: Option<PathBuf>,
    },
    /// A status update for the user.
    Report(Report),
}

/// A cloneable sending half for [`XmodEvent`]s.
///
/// Sending never fails from the caller's point of view: if nobody is
/// listening any more the event is dropped.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: Option<Sender<XmodEvent>>,
}

impl EventSink {
    /// Creates a sink and the receiver that its events arrive on.
    pub fn channel() -> (Self, Receiver<XmodEvent>) {
        let (tx, rx) = mpsc::channel();
        (EventSink { tx: Some(tx) }, rx)
    }

    /// A sink that drops everything. Reports are still logged.
    pub fn discard() -> Self {
        EventSink { tx: None }
    }

    /// Sends an event to the listener, if there is one.
    pub fn emit(&self, event: XmodEvent) {
        if let Some(tx) = &self.tx {
            if tx.send(event).is_err() {
                debug!("event listener has hung up, dropping event");
            }
        }
    }

    /// Logs a report at the level matching its severity and emits it.
    pub fn report(&self, report: Report) {
        match report.severity {
            Severity::Info => info!("{}", report),
            Severity::Warning => warn!("{}", report),
            Severity::Error => error!("{}", report),
        }
        self.emit(XmodEvent::Report(report));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_fills_optional_fields() {
        let report = Report::error(ReportLabel::Tms, "Failure loading file")
            .message("bad row")
            .advice("Please try again");

        assert_eq!(report.severity, Severity::Error);
        assert_eq!(report.message.as_deref(), Some("bad row"));
        assert_eq!(report.advice.as_deref(), Some("Please try again"));
        assert_eq!(report.detail, None);
        assert_eq!(
            report.to_string(),
            "[TMS] Failure loading file: bad row (Please try again)"
        );
    }

    #[test]
    fn sink_delivers_in_order() {
        let (sink, rx) = EventSink::channel();
        sink.emit(XmodEvent::ConnectionFailed { attempts: 3 });
        sink.report(Report::info(ReportLabel::Status, "hello"));

        assert_eq!(rx.recv(), Ok(XmodEvent::ConnectionFailed { attempts: 3 }));
        assert!(matches!(rx.recv(), Ok(XmodEvent::Report(r)) if r.status == "hello"));
    }

    #[test]
    fn sink_survives_dropped_receiver() {
        let (sink, rx) = EventSink::channel();
        drop(rx);
        sink.emit(XmodEvent::ConnectionFailed { attempts: 1 });
        EventSink::discard().emit(XmodEvent::ConnectionFailed { attempts: 1 });
    }
}
