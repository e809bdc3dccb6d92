//! Error taxonomy for the scheduler runtime
//!
//! Each kind is a distinct type so callers can route them differently:
//! user mistakes go back to the caller, expected command failures are
//! logged, and only [`SchedulerError`] initiates shutdown.

use thiserror::Error;

/// Convenience result type using [`CoreError`]
pub type Result<T> = std::result::Result<T, CoreError>;

/// Argument-shape problem in user input
///
/// Returned to the caller before a command is queued; never logged as a
/// scheduler fault.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct InputError(pub String);

impl InputError {
    /// Build an input error from anything displayable
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Resolved configuration is internally inconsistent
///
/// Fatal at first load; during reload the scheduler reverts to the prior
/// configuration and keeps running.
#[derive(Debug, Error)]
#[error("configuration error: {0}")]
pub struct ConfigError(pub String);

impl ConfigError {
    /// Build a config error from anything displayable
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// A job's recorded platform no longer resolves
#[derive(Debug, Error)]
#[error("platform not defined: {platform}")]
pub struct PlatformLookupError {
    /// The unresolvable platform name
    pub platform: String,
}

/// A command's execution phase raised an expected, user-visible failure
///
/// Logged, never fatal to the scheduler.
#[derive(Debug, Error)]
#[error("command {command} failed: {reason}")]
pub struct CommandFailedError {
    /// The command that failed
    pub command: String,
    /// Human-readable failure reason
    pub reason: String,
}

impl CommandFailedError {
    /// Build a command failure with context
    pub fn new(command: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self {
            command: command.into(),
            reason: reason.to_string(),
        }
    }
}

/// Unrecoverable runtime fault; initiates shutdown with non-zero exit
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The durable store failed beyond repair
    #[error("database failure: {0}")]
    Database(#[from] cadence_db::StoreError),

    /// The contact file disappeared or no longer matches this run
    #[error("contact file lost or modified: {0}")]
    ContactFileLost(String),

    /// The workflow run directory disappeared
    #[error("run directory lost: {0}")]
    RunDirectoryLost(String),

    /// The scheduler host was condemned and no restart target exists
    #[error("host condemned: {0}")]
    HostCondemned(String),

    /// A bug: an internal invariant did not hold
    #[error("internal error: {0}")]
    Internal(String),
}

/// Normal-shutdown sentinel; not an error
///
/// Carries the reason the scheduler is leaving its main loop cleanly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerStop(pub String);

impl std::fmt::Display for SchedulerStop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "scheduler stopping: {}", self.0)
    }
}

/// Umbrella error for internal plumbing
///
/// Command handlers translate these into [`CommandFailedError`] unless the
/// root cause is a [`SchedulerError`], which always propagates.
#[derive(Debug, Error)]
pub enum CoreError {
    /// User input problem
    #[error(transparent)]
    Input(#[from] InputError),

    /// Configuration problem
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Cycling arithmetic problem
    #[error(transparent)]
    Cycling(#[from] cadence_cycling::CyclingError),

    /// Platform resolution problem
    #[error(transparent)]
    PlatformLookup(#[from] PlatformLookupError),

    /// Expected command failure
    #[error(transparent)]
    CommandFailed(#[from] CommandFailedError),

    /// Unrecoverable fault
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

impl From<cadence_db::StoreError> for CoreError {
    fn from(e: cadence_db::StoreError) -> Self {
        CoreError::Scheduler(SchedulerError::Database(e))
    }
}

impl CoreError {
    /// Translate into the command-handler propagation policy
    ///
    /// `SchedulerError` passes through; everything else becomes a
    /// `CommandFailedError` for the named command.
    pub fn into_command_failure(self, command: &str) -> CoreError {
        match self {
            CoreError::Scheduler(e) => CoreError::Scheduler(e),
            CoreError::CommandFailed(e) => CoreError::CommandFailed(e),
            other => CoreError::CommandFailed(CommandFailedError::new(command, other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_into_command_failure_wraps_input() {
        let err = CoreError::Input(InputError::new("bad selector"));
        match err.into_command_failure("trigger") {
            CoreError::CommandFailed(e) => {
                assert_eq!(e.command, "trigger");
                assert!(e.reason.contains("bad selector"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_into_command_failure_keeps_scheduler_error() {
        let err = CoreError::Scheduler(SchedulerError::Internal("bug".into()));
        assert!(matches!(
            err.into_command_failure("hold"),
            CoreError::Scheduler(SchedulerError::Internal(_))
        ));
    }
}
