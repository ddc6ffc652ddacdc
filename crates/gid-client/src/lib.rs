//! G.I.D agent client
//!
//! This crate provides:
//! - A persistent agent identity
//! - An [`session::AgentSession`] that registers with a relay, resolves
//!   peer keys and exchanges end-to-end encrypted messages and files
//! - The `gid-client` command-line front end

pub mod cli;
pub mod config;
pub mod identity;
pub mod interactive;
pub mod session;

pub use cli::Cli;
pub use config::{CliOverrides, Config};
pub use session::{AgentSession, SessionError, SessionEvent, SessionSettings};

/// Exit codes for CLI operations
///
/// - 0: Success
/// - 1: General error
/// - 3: Timeout waiting for the relay
/// - 4: Could not connect to the relay
/// - 5: Bad arguments or data
/// - 6: Recipient is not registered with the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,
    GeneralError = 1,
    Timeout = 3,
    ConnectionFailed = 4,
    InvalidInput = 5,
    UnknownRecipient = 6,
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code as i32
    }
}

impl From<&SessionError> for ExitCode {
    fn from(err: &SessionError) -> Self {
        match err {
            SessionError::Connect { .. } | SessionError::Closed => ExitCode::ConnectionFailed,
            SessionError::HandshakeTimeout(_) => ExitCode::Timeout,
            SessionError::UnknownRecipient(_) => ExitCode::UnknownRecipient,
            SessionError::InvalidRecipient(_) => ExitCode::InvalidInput,
            _ => ExitCode::GeneralError,
        }
    }
}

impl ExitCode {
    /// Convert to process exit code
    pub fn to_exit_code(self) -> std::process::ExitCode {
        std::process::ExitCode::from(self as u8)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ExitCode::Success => "SUCCESS",
            ExitCode::GeneralError => "GENERAL_ERROR",
            ExitCode::Timeout => "TIMEOUT",
            ExitCode::ConnectionFailed => "CONNECTION_FAILED",
            ExitCode::InvalidInput => "INVALID_INPUT",
            ExitCode::UnknownRecipient => "UNKNOWN_RECIPIENT",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ExitCode::Success => "Operation completed successfully",
            ExitCode::GeneralError => "An unspecified error occurred",
            ExitCode::Timeout => "Timed out waiting for the relay",
            ExitCode::ConnectionFailed => "Could not reach the relay",
            ExitCode::InvalidInput => "Invalid arguments or data provided",
            ExitCode::UnknownRecipient => "Recipient is not registered with the relay",
        }
    }
}

#[cfg(test)]
mod exit_code_tests {
    use super::*;

    #[test]
    fn test_exit_code_values() {
        assert_eq!(i32::from(ExitCode::Success), 0);
        assert_eq!(i32::from(ExitCode::GeneralError), 1);
        assert_eq!(i32::from(ExitCode::Timeout), 3);
        assert_eq!(i32::from(ExitCode::ConnectionFailed), 4);
        assert_eq!(i32::from(ExitCode::InvalidInput), 5);
        assert_eq!(i32::from(ExitCode::UnknownRecipient), 6);
    }

    #[test]
    fn test_exit_code_names() {
        assert_eq!(ExitCode::Timeout.name(), "TIMEOUT");
        assert_eq!(ExitCode::UnknownRecipient.name(), "UNKNOWN_RECIPIENT");
        assert!(!ExitCode::ConnectionFailed.description().is_empty());
    }

    #[test]
    fn test_session_errors_map_to_exit_codes() {
        assert_eq!(
            ExitCode::from(&SessionError::HandshakeTimeout("AGENT-X".into())),
            ExitCode::Timeout
        );
        assert_eq!(
            ExitCode::from(&SessionError::UnknownRecipient("AGENT-X".into())),
            ExitCode::UnknownRecipient
        );
        assert_eq!(ExitCode::from(&SessionError::Closed), ExitCode::ConnectionFailed);
    }
}
