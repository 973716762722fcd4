//! Error types for tunnel operations
//!
//! Each variant is one failure kind a caller has to react to differently.
//! Variants carry the operation (or subject) they failed in so log lines
//! and admin responses can name it.
//!
//! - `Protocol` and `Io` end the tunnel they happened on.
//! - `Timeout`, `OutOfState`, `AgentError` and `InvalidArgument` are
//!   returned to the caller and leave the tunnel running.
//! - `Shutdown` is what every operation on a closed tunnel or channel gets.

use thiserror::Error;
use tunnelmux_proto::{rcc, FrameError};

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for tunnel operations
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed frame or a message that is not valid in the current state
    #[error("protocol error [{context}]: {message}")]
    Protocol {
        /// Where the error was detected
        context: String,
        /// Description of what was malformed
        message: String,
    },

    /// TLS or socket failure
    #[error("I/O error [{context}]: {message}")]
    Io {
        /// Where the error was detected
        context: String,
        /// Underlying failure
        message: String,
    },

    /// A bounded wait expired
    #[error("timed out [{context}]")]
    Timeout {
        /// The operation that timed out
        context: String,
    },

    /// Operation invoked in the wrong tunnel state
    #[error("out of state [{context}]: {message}")]
    OutOfState {
        /// The operation that was refused
        context: String,
        /// Current state description
        message: String,
    },

    /// Agent rejected a control request
    #[error("agent rejected {context} with rcc {rcc}")]
    AgentError {
        /// The request the agent rejected
        context: String,
        /// Result code reported by the agent
        rcc: u32,
    },

    /// Bad parameters (unknown id, malformed CSR)
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of the bad argument
        message: String,
        /// Whether the argument named something that does not exist
        not_found: bool,
    },

    /// Tunnel or channel is no longer active
    #[error("shut down [{context}]")]
    Shutdown {
        /// The object that is shut down
        context: String,
    },

    /// Invalid configuration value
    #[error("configuration error for {key}: {message}")]
    Config {
        /// Configuration key
        key: String,
        /// Description of the problem
        message: String,
    },

    /// Certificate issuance or validation failed
    #[error("certificate error: {message}")]
    Certificate {
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Where the error occurred
        context: String,
        /// Description of what failed
        message: String,
    },
}

impl Error {
    /// Create a protocol error
    pub fn protocol(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Protocol {
            context: context.into(),
            message: msg.into(),
        }
    }

    /// Create an I/O error
    pub fn io(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Io {
            context: context.into(),
            message: msg.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(context: impl Into<String>) -> Self {
        Self::Timeout {
            context: context.into(),
        }
    }

    /// Create an out-of-state error
    pub fn out_of_state(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::OutOfState {
            context: context.into(),
            message: msg.into(),
        }
    }

    /// Create an agent error from a non-zero rcc
    pub fn agent(context: impl Into<String>, rcc: u32) -> Self {
        Self::AgentError {
            context: context.into(),
            rcc,
        }
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: msg.into(),
            not_found: false,
        }
    }

    /// Create an invalid argument error for an id that does not exist
    pub fn not_found(kind: &str, id: impl std::fmt::Display) -> Self {
        Self::InvalidArgument {
            message: format!("{} {} not found", kind, id),
            not_found: true,
        }
    }

    /// Create a shutdown error
    pub fn shutdown(context: impl Into<String>) -> Self {
        Self::Shutdown {
            context: context.into(),
        }
    }

    /// Create a configuration error
    pub fn config(key: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Config {
            key: key.into(),
            message: msg.into(),
        }
    }

    /// Create a certificate error
    pub fn certificate(msg: impl Into<String>) -> Self {
        Self::Certificate {
            message: msg.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            context: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            context: context.into(),
            message: msg.into(),
        }
    }

    /// Whether this error ends the tunnel it occurred on
    pub fn is_terminal(&self) -> bool {
        matches!(self, Error::Protocol { .. } | Error::Io { .. })
    }

    /// Wire result code used when this error answers an agent request
    pub fn rcc(&self) -> u32 {
        match self {
            Error::AgentError { rcc, .. } => *rcc,
            Error::OutOfState { .. } => rcc::OUT_OF_STATE,
            Error::InvalidArgument { .. } => rcc::BAD_ARGUMENTS,
            Error::Certificate { .. } => rcc::CERTIFICATE_ERROR,
            Error::Timeout { .. } => rcc::REQUEST_TIMEOUT,
            Error::Protocol { .. }
            | Error::Io { .. }
            | Error::Shutdown { .. }
            | Error::Config { .. }
            | Error::Internal { .. } => rcc::INTERNAL_ERROR,
        }
    }

    /// Get the context if this error has one
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::Protocol { context, .. }
            | Error::Io { context, .. }
            | Error::Timeout { context }
            | Error::OutOfState { context, .. }
            | Error::AgentError { context, .. }
            | Error::Shutdown { context }
            | Error::Internal { context, .. } => Some(context),
            Error::Config { key, .. } => Some(key),
            Error::InvalidArgument { .. } | Error::Certificate { .. } => None,
        }
    }
}

impl From<FrameError> for Error {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::Io(io) => Error::io("frame", io.to_string()),
            other => Error::protocol("frame", other.to_string()),
        }
    }
}
