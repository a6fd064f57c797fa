use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// EmberDB errors.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// The supplied transaction handle is unknown to the store or no longer
    /// active. Caller misuse; the store state is untouched.
    InvalidTx,
    /// An insert collided with an existing key. Reserved by the status-code
    /// protocol; the engine reports insert collisions as `WriteConflict`.
    KeyExists,
    /// The first-writer-wins rule fired while installing versions. The
    /// transaction was rolled back and must be retried.
    WriteConflict,
    /// No version of the requested key is visible to the transaction.
    ValueNotFound,
    /// Invalid data, typically decoding errors or unexpected internal values.
    InvalidData(String),
    /// The pool file failed verification (bad magic, layout or checksum).
    Corrupted(String),
    /// An IO error.
    IO(String),
}

impl Error {
    /// The wire status code for client-protocol errors, if one is assigned.
    /// Success is code 0; storage-layer errors carry no code.
    pub fn code(&self) -> Option<u16> {
        match self {
            Error::InvalidTx => Some(1),
            Error::KeyExists => Some(2),
            Error::WriteConflict => Some(3),
            Error::ValueNotFound => Some(404),
            _ => None,
        }
    }
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::InvalidTx => write!(f, "invalid or inactive transaction"),
            Error::KeyExists => write!(f, "key already exists"),
            Error::WriteConflict => write!(f, "write conflict, retry transaction"),
            Error::ValueNotFound => write!(f, "value not found"),
            Error::InvalidData(msg) => write!(f, "invalid data: {msg}"),
            Error::Corrupted(msg) => write!(f, "pool corrupted: {msg}"),
            Error::IO(msg) => write!(f, "io error: {msg}"),
        }
    }
}

/// Constructs an Error::InvalidData for the given format string.
#[macro_export]
macro_rules! errdata {
    ($($args:tt)*) => { $crate::error::Error::InvalidData(format!($($args)*)) };
}

/// An EmberDB Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl serde::de::Error for Error {
    fn custom<T: Display>(msg: T) -> Self {
        Error::InvalidData(msg.to_string())
    }
}

impl serde::ser::Error for Error {
    fn custom<T: Display>(msg: T) -> Self {
        Error::InvalidData(msg.to_string())
    }
}

impl From<Box<bincode::ErrorKind>> for Error {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        Error::InvalidData(err.to_string())
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
