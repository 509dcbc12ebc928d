use std::fmt::Display;

/// EmberDB errors.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// A user function aborted a transaction or select pipeline. Nothing was
    /// committed.
    Abort(String),
    /// The database handle was closed while the operation was in flight.
    Closed,
    /// Invalid on-disk data: a checksum mismatch, an unknown node tag, or a
    /// payload that fails to decode.
    Corrupted(String),
    /// An invalid configuration value, at startup or reconfiguration.
    InvalidConfig(String),
    /// An IO error.
    Io(String),
    /// The data directory is already opened by another process.
    Locked(String),
    /// The key does not exist. Returned by `fetch` only.
    NotFound,
    /// A compaction was requested while one is already in flight.
    PendingCompaction,
    /// The call exceeded its deadline. The background work still runs to
    /// completion.
    Timeout,
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Abort(msg) => write!(f, "aborted by user function: {msg}"),
            Error::Closed => write!(f, "database is closed"),
            Error::Corrupted(msg) => write!(f, "corrupted data: {msg}"),
            Error::InvalidConfig(msg) => write!(f, "invalid configuration: {msg}"),
            Error::Io(msg) => write!(f, "io error: {msg}"),
            Error::Locked(msg) => write!(f, "data directory is locked: {msg}"),
            Error::NotFound => write!(f, "key not found"),
            Error::PendingCompaction => write!(f, "a compaction is already in progress"),
            Error::Timeout => write!(f, "operation timed out"),
        }
    }
}

/// An EmberDB Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<Box<bincode::ErrorKind>> for Error {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        Error::Corrupted(err.to_string())
    }
}
