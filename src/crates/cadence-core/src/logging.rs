//! Reloadable logging filter
//!
//! The scheduler never installs a global subscriber on its own. An
//! embedder that wants the `set-verbosity` command to work calls
//! [`init_verbosity`] at process start and hands the returned handle to
//! the scheduler; the command then swaps the filter in place.

use crate::error::{InputError, Result, SchedulerError};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Registry};

/// Handle for changing the logging filter at runtime
pub type VerbosityHandle = reload::Handle<EnvFilter, Registry>;

/// Install the global subscriber with a reloadable filter
///
/// Returns the handle to pass to the scheduler's
/// `set_verbosity_handle`. Fails if a global subscriber is already
/// installed.
pub fn init_verbosity(initial: &str) -> Result<VerbosityHandle> {
    let filter = parse_directive(initial)?;
    let (layer, handle) = reload::Layer::new(filter);
    tracing_subscriber::registry()
        .with(layer)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .map_err(|e| SchedulerError::Internal(format!("logging already initialised: {}", e)))?;
    Ok(handle)
}

/// Parse a filter directive such as `debug` or `cadence_core=trace`
pub fn parse_directive(level: &str) -> Result<EnvFilter> {
    EnvFilter::try_new(level).map_err(|e| {
        InputError::new(format!("invalid verbosity level {:?}: {}", level, e)).into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_directive() {
        assert!(parse_directive("debug").is_ok());
        assert!(parse_directive("cadence_core=trace,info").is_ok());
        assert!(parse_directive("no=such=thing").is_err());
    }

    #[test]
    fn test_init_and_reload() {
        // First initialisation wins; a second attempt reports failure
        // instead of silently replacing the subscriber.
        let handle = init_verbosity("info").unwrap();
        assert!(handle.reload(parse_directive("debug").unwrap()).is_ok());
        assert!(init_verbosity("info").is_err());
    }
}
