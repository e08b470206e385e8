//! Unified error handling for the signal multiplexer
//!
//! Only the control plane can fail. The signal path (phaser entry/exit and
//! the dispatch walk) is infallible by construction and never produces one of
//! these values.

use std::io;

use thiserror::Error;

/// Result alias used across the workspace
pub type Result<T> = std::result::Result<T, SigmuxError>;

/// Errors reported by the control API
#[derive(Error, Debug)]
pub enum SigmuxError {
    #[error("Invalid signal number: {0}")]
    InvalidSignal(i32),

    #[error("{op} failed: {source}")]
    Os {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("Registration {0} is not owned by this multiplexer")]
    UnknownRegistration(u64),

    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("Only the global multiplexer can seize {0} from the kernel")]
    NotGlobal(i32),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SigmuxError {
    /// Wrap an I/O error produced by `op`
    pub fn os(op: &'static str, source: io::Error) -> Self {
        SigmuxError::Os { op, source }
    }

    /// The errno a C caller should observe for this error
    pub fn raw_os_error(&self) -> i32 {
        match self {
            SigmuxError::InvalidSignal(_)
            | SigmuxError::UnknownRegistration(_)
            | SigmuxError::InvalidArgument(_)
            | SigmuxError::NotGlobal(_) => libc_einval(),
            SigmuxError::Os { source, .. } => source.raw_os_error().unwrap_or_else(libc_einval),
            SigmuxError::Config(_) => libc_einval(),
        }
    }
}

fn libc_einval() -> i32 {
    nix::errno::Errno::EINVAL as i32
}

impl From<toml::de::Error> for SigmuxError {
    fn from(err: toml::de::Error) -> Self {
        SigmuxError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_signal_maps_to_einval() {
        let err = SigmuxError::InvalidSignal(0);
        assert_eq!(err.raw_os_error(), nix::errno::Errno::EINVAL as i32);
        assert_eq!(err.to_string(), "Invalid signal number: 0");
    }

    #[test]
    fn test_invalid_argument_maps_to_einval() {
        let err = SigmuxError::InvalidArgument("null handler");
        assert_eq!(err.raw_os_error(), nix::errno::Errno::EINVAL as i32);
        assert_eq!(err.to_string(), "Invalid argument: null handler");
    }

    #[test]
    fn test_os_error_keeps_errno() {
        let err = SigmuxError::os("pipe", io::Error::from_raw_os_error(24));
        assert_eq!(err.raw_os_error(), 24);
        assert!(err.to_string().starts_with("pipe failed"));
    }
}
