//! Error types for the link layer.
//!
//! `LinkError` is the single error type returned by every queue, transport and
//! protocol operation. Each variant belongs to one [`ErrorClass`], which is what
//! callers usually branch on:
//!
//! - **`Io`**: the transport itself failed (port not openable, write failure,
//!   port closed underneath us). Never retried automatically.
//! - **`Protocol`**: a reply arrived but was wrong (bad ACK, unmatched
//!   identification string, more bytes than requested). These always carry the
//!   offending command and the raw reply.
//! - **`Timeout`**: the deadline elapsed with no reply or a partial one.
//! - **`Abort`**: the abort signal was raised by the user. Kept apart from
//!   `Timeout` so a user cancellation is not mistaken for a device fault.
//! - **`Internal`**: queue shutdown and configuration problems.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the link error type.
pub type Result<T> = std::result::Result<T, LinkError>;

/// Coarse classification of a [`LinkError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Transport-level failure.
    Io,
    /// Reply received but invalid.
    Protocol,
    /// Deadline elapsed.
    Timeout,
    /// Cancelled through the abort signal.
    Abort,
    /// Queue or configuration problem.
    Internal,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ErrorClass::Io => "io",
            ErrorClass::Protocol => "protocol",
            ErrorClass::Timeout => "timeout",
            ErrorClass::Abort => "abort",
            ErrorClass::Internal => "internal",
        };
        f.write_str(label)
    }
}

/// Errors produced by the link layer.
#[derive(Error, Debug)]
pub enum LinkError {
    /// The serial port could not be opened.
    #[error("Cannot connect to serial port '{port}': {message}")]
    PortUnavailable {
        /// Port that was requested.
        port: String,
        /// Reason reported by the operating system.
        message: String,
    },

    /// An exchange was attempted while the port is closed.
    #[error("Serial port disconnected")]
    NotConnected,

    /// Read or write failure on an open port.
    #[error("I/O error while {context}: {source}")]
    Io {
        /// What was being done when the failure happened.
        context: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Initialisation exchange failed before an identification string arrived.
    #[error("Initialization failed at {baud_rate} baud: {source}")]
    InitializationFailed {
        /// Baud rate used for the attempt.
        baud_rate: u32,
        /// Failure of the underlying exchange.
        #[source]
        source: Box<LinkError>,
    },

    /// The device replied with something other than the expected ACK token.
    #[error("Command {command}{} returned '{reply}'", describe_args(.args))]
    Protocol {
        /// Command name.
        command: String,
        /// Arguments sent with the command, if any.
        args: Option<String>,
        /// Raw reply line.
        reply: String,
    },

    /// The identification reply does not contain the expected substring.
    #[error("Wrong init string at {baud_rate} baud: expected '{expected}', got '{reply}'")]
    Identification {
        /// Expected identification substring.
        expected: String,
        /// Raw reply line.
        reply: String,
        /// Baud rate used for the attempt.
        baud_rate: u32,
    },

    /// The device sent more bytes than the binary request asked for.
    #[error("Too many bytes received for {command}: requested {requested}, received {received}")]
    TooManyBytes {
        /// Command name.
        command: String,
        /// Bytes requested.
        requested: usize,
        /// Bytes available when the overflow was detected.
        received: usize,
    },

    /// The deadline elapsed before the reply was complete.
    #[error("Timeout waiting for {command}: requested {requested} bytes, received {received} after {waited:?}")]
    Timeout {
        /// Command name.
        command: String,
        /// Bytes requested (0 for line reads).
        requested: usize,
        /// Bytes received before the deadline.
        received: usize,
        /// Time spent waiting.
        waited: Duration,
    },

    /// The read was cancelled through the abort signal.
    #[error("{command} aborted")]
    Aborted {
        /// Command name.
        command: String,
    },

    /// The transaction was discarded before it ran, or the worker is gone.
    #[error("Worker queue '{queue}' closed before the transaction completed")]
    QueueClosed {
        /// Queue name.
        queue: String,
    },

    /// A blocking call was made from the worker thread it would wait on.
    #[error("Blocking call on worker queue '{queue}' from its own worker thread")]
    WorkerThread {
        /// Queue name.
        queue: String,
    },

    /// Configuration file could not be parsed.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Configuration parsed but is semantically invalid.
    #[error("Configuration validation error: {0}")]
    Configuration(String),
}

fn describe_args(args: &Option<String>) -> String {
    match args {
        Some(args) => format!(" args '{args}'"),
        None => String::new(),
    }
}

impl LinkError {
    /// Wrap an I/O error with a short description of what was being done.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Classify this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::PortUnavailable { .. }
            | Self::NotConnected
            | Self::Io { .. }
            | Self::InitializationFailed { .. } => ErrorClass::Io,
            Self::Protocol { .. } | Self::Identification { .. } | Self::TooManyBytes { .. } => {
                ErrorClass::Protocol
            }
            Self::Timeout { .. } => ErrorClass::Timeout,
            Self::Aborted { .. } => ErrorClass::Abort,
            Self::QueueClosed { .. }
            | Self::WorkerThread { .. }
            | Self::Config(_)
            | Self::Configuration(_) => ErrorClass::Internal,
        }
    }

    /// Check if the operation was cancelled by the user.
    pub fn is_abort(&self) -> bool {
        matches!(self, Self::Aborted { .. })
    }

    /// Check if the deadline elapsed.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Check if the transport was closed.
    pub fn is_not_connected(&self) -> bool {
        matches!(self, Self::NotConnected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_error_names_command_and_reply() {
        let err = LinkError::Protocol {
            command: "SetVoltage".into(),
            args: Some("5.00".into()),
            reply: "ERR".into(),
        };
        let text = err.to_string();
        assert!(text.contains("SetVoltage"));
        assert!(text.contains("5.00"));
        assert!(text.contains("'ERR'"));
        assert_eq!(err.class(), ErrorClass::Protocol);
    }

    #[test]
    fn timeout_and_abort_are_distinct() {
        let timeout = LinkError::Timeout {
            command: "Fetch".into(),
            requested: 4,
            received: 2,
            waited: Duration::from_millis(100),
        };
        let abort = LinkError::Aborted {
            command: "Fetch".into(),
        };
        assert!(timeout.is_timeout() && !timeout.is_abort());
        assert!(abort.is_abort() && !abort.is_timeout());
        assert_ne!(timeout.class(), abort.class());
        assert!(timeout.to_string().contains("received 2"));
    }

    #[test]
    fn initialization_failure_is_io_class() {
        let err = LinkError::InitializationFailed {
            baud_rate: 57600,
            source: Box::new(LinkError::NotConnected),
        };
        assert_eq!(err.class(), ErrorClass::Io);
        assert!(err.to_string().contains("57600"));
    }
}
