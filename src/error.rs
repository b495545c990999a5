use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// EmberDB errors.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// The requested key does not exist in the store.
    KeyNotFound,
    /// Invalid user input: bad configuration values, unknown tables, or
    /// keys/values that cannot be represented (e.g. a B-tree node that would
    /// exceed the page size).
    InvalidInput(String),
    /// On-disk data failed validation, typically a checksum mismatch or a
    /// length field pointing past the end of a page or file.
    Corrupted(String),
    /// The active memtable is at its byte cap. Handled internally by the LSM
    /// coordinator (flush then retry); callers normally never observe it.
    MemtableFull,
    /// A write was attempted on a read-only structure, e.g. a memtable that
    /// has already been swapped out for flushing. Callers retry against the
    /// new active table.
    ReadOnly,
    /// The write-ahead log has been closed and no longer accepts appends.
    WalClosed,
    /// The database already holds the configured maximum number of tables.
    TableLimitExceeded,
    /// The operation is not valid in the current state, e.g. using a closed
    /// store.
    InvalidState(String),
    /// An IO error, carrying the failed operation for context.
    IO(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::KeyNotFound => write!(f, "key not found"),
            Error::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Error::Corrupted(msg) => write!(f, "corrupted data: {msg}"),
            Error::MemtableFull => write!(f, "memtable is full"),
            Error::ReadOnly => write!(f, "write attempted on read-only structure"),
            Error::WalClosed => write!(f, "write-ahead log is closed"),
            Error::TableLimitExceeded => write!(f, "table limit exceeded"),
            Error::InvalidState(msg) => write!(f, "invalid state: {msg}"),
            Error::IO(msg) => write!(f, "io error: {msg}"),
        }
    }
}

/// Constructs an Error::InvalidInput for the given format string.
#[macro_export]
macro_rules! errinput {
    ($($args:tt)*) => { $crate::error::Error::InvalidInput(format!($($args)*)).into() };
}

/// Constructs an Error::Corrupted for the given format string.
#[macro_export]
macro_rules! errcorrupt {
    ($($args:tt)*) => { $crate::error::Error::Corrupted(format!($($args)*)).into() };
}

/// An EmberDB Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl<T> From<Error> for Result<T> {
    fn from(error: Error) -> Self {
        Err(error)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::IO(err.to_string())
    }
}

impl<T> From<std::sync::mpsc::SendError<T>> for Error {
    fn from(_: std::sync::mpsc::SendError<T>) -> Self {
        Error::WalClosed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(Error::KeyNotFound.to_string(), "key not found");
        assert_eq!(
            Error::Corrupted("checksum mismatch".to_string()).to_string(),
            "corrupted data: checksum mismatch"
        );
        assert_eq!(Error::MemtableFull.to_string(), "memtable is full");
    }

    #[test]
    fn test_macros() {
        let err: Result<()> = errinput!("degree {} too small", 1);
        assert_eq!(
            err,
            Err(Error::InvalidInput("degree 1 too small".to_string()))
        );

        let err: Result<()> = errcorrupt!("node length {} exceeds page", 5000);
        assert_eq!(
            err,
            Err(Error::Corrupted("node length 5000 exceeds page".to_string()))
        );
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: Error = io.into();
        assert!(matches!(err, Error::IO(_)));
    }
}
