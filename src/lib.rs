//! xmod drives a reaction-time lab apparatus. A host computer sends trial
//! timings over a serial line to the XMOD controller box, which presents
//! the stimulus signal and collects button presses from up to 16
//! participant response boxes.
//!
//! The pieces, leaves first:
//!
//! - [tms] reads a trial-definition file into an [tms::ExperimentPlan].
//! - [link] and [command] own the serial connection and its byte protocol.
//! - [results] decodes the per-trial reaction packets and writes the
//!   results file.
//! - [runner] ties them together in a cancellable trial loop.
//!
//! Everything reports back through the typed events in [event]. The
//! [dummy_box] stands in for the hardware in tests and dry runs.

#![warn(missing_docs)]
#[allow(missing_docs)]
pub mod args;
pub mod audio;
pub mod collaborators;
pub mod command;
pub mod config;
pub mod dummy_box;
pub mod event;
pub mod gui;
pub mod link;
pub mod results;
pub mod runner;
pub mod tms;
