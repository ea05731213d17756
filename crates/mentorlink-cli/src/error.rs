//! CLI error types.

use mentorlink_client::BackoffError;
use thiserror::Error;

/// Errors that end the CLI or reject a typed command.
#[derive(Error, Debug)]
pub enum CliError {
    /// `--backoff-ms` does not describe a valid schedule.
    #[error("invalid backoff schedule: {0}")]
    Backoff(#[from] BackoffError),

    /// Reading stdin failed.
    #[error("stdin: {0}")]
    Io(#[from] std::io::Error),

    /// A typed line is not a known command.
    #[error("{0}")]
    InvalidCommand(String),
}
