use std::error::Error as StdError;
use std::io;

use thiserror::Error;

pub const EPIPE: i32 = 32;
pub const ECONNRESET: i32 = 104;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("`{key}` not set; using default")]
    Missing { key: &'static str },
    #[error("invalid `{key}` value `{value}`; using default")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RadioError {
    #[error("connection error: {0}")]
    Connection(String),
    #[error("radio error: {0}")]
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SensorError {
    #[error("{model} failed to initialize: {reason}")]
    Init { model: String, reason: String },
    #[error("{model} read failed: {reason}")]
    Read { model: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    #[error("door relay write failed: {0}")]
    Write(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteFetchError {
    #[error("peer request timed out")]
    Timeout,
    #[error("peer transport error: {0}")]
    Transport(String),
    #[error("peer answered HTTP {0}")]
    Status(u16),
    #[error("peer sent malformed status: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FatalError {
    #[error("wifi credentials not found in settings")]
    MissingCredentials,
    #[error("connection fatal: {0}")]
    ConnectionFatal(String),
    #[error("unhandled error: {0}")]
    Unhandled(String),
}

impl FatalError {
    // Startup errors that already carry a fatal kind keep it.
    pub fn from_startup_error(err: &(dyn StdError + 'static)) -> Self {
        if let Some(fatal) = err.downcast_ref::<Self>() {
            return fatal.clone();
        }
        let message = error_chain(err)
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(": ");
        Self::Unhandled(message)
    }
}

pub fn is_benign_transport_errno(errno: i32) -> bool {
    errno == EPIPE || errno == ECONNRESET
}

// Client went away mid-response: broken pipe or reset anywhere in the chain.
pub fn is_benign_transport_error(err: &(dyn StdError + 'static)) -> bool {
    error_chain(err).any(|cause| {
        cause.downcast_ref::<io::Error>().is_some_and(|io_err| {
            matches!(
                io_err.kind(),
                io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset
            ) || io_err.raw_os_error().is_some_and(is_benign_transport_errno)
        })
    })
}

pub fn error_chain<'a>(
    err: &'a (dyn StdError + 'static),
) -> impl Iterator<Item = &'a (dyn StdError + 'static)> {
    std::iter::successors(Some(err), |&cause| cause.source())
}
