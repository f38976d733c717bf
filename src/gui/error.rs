use std::{error::Error, fmt::Display};

use crate::runner::RunError;

/// Errors from the terminal front ends.
#[derive(Debug)]
pub enum XmodGuiError {
    /// The terminal could not be set up, drawn to, or read from.
    IOError(std::io::Error),
    /// The run thread could not be joined.
    Run(RunError),
}

impl Display for XmodGuiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            XmodGuiError::IOError(e) => write!(f, "terminal error: {}", e),
            XmodGuiError::Run(e) => write!(f, "{}", e),
        }
    }
}

impl Error for XmodGuiError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            XmodGuiError::IOError(e) => Some(e),
            XmodGuiError::Run(e) => Some(e),
        }
    }
}

impl From<std::io::Error> for XmodGuiError {
    fn from(value: std::io::Error) -> Self {
        Self::IOError(value)
    }
}

impl From<RunError> for XmodGuiError {
    fn from(value: RunError) -> Self {
        Self::Run(value)
    }
}
