use rustix::io::Errno;
use thiserror::Error;

/// Errors that can occur while running the engine or serving control requests.
#[derive(Error, Debug)]
pub enum PinbaError {
    /// A custom error with a free-form message.
    #[error("Custom error: {0}")]
    Custom(String),

    /// An I/O error from the standard library.
    #[error("Std Io error: {0}")]
    StdIo(#[from] std::io::Error),

    /// A low-level system errno.
    #[error("Errno error: {0}")]
    Errno(#[from] Errno),

    /// A datagram failed to decode as a wire record.
    #[error("Packet decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    /// Invalid report or histogram configuration.
    #[error("Config error: {0}")]
    Config(String),

    /// A control request referenced a report that is not registered.
    #[error("Unknown report: {0}")]
    UnknownReport(String),

    /// `add_report` was called with a name that is already registered.
    #[error("Report already exists: {0}")]
    DuplicateReport(String),

    /// The engine (or one of its stages) is already shut down.
    #[error("Engine is shut down")]
    ShutDown,
}

impl From<String> for PinbaError {
    fn from(value: String) -> Self {
        Self::Custom(value)
    }
}

impl From<&str> for PinbaError {
    fn from(value: &str) -> Self {
        Self::Custom(value.to_string())
    }
}
