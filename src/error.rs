//! Crate error type.

use std::error::Error as StdError;
use std::fmt;
use std::fmt::Display;
use std::io;

/// Boxed error raised by an external collaborator (input stream, table backend).
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Crate result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Spill, sort and merge error.
#[derive(Debug)]
pub enum Error {
    /// Write or reseal of an accumulator after it has been completed.
    AlreadySealed,
    /// Acquisition of a resource whose reference count already dropped to zero.
    AlreadyReleased { resource: String },
    /// Merge input does not carry the sort key of the merge comparer.
    NotSorted { expected: String, found: Option<String> },
    /// Merge semantics applied to an unsupported number of inputs.
    InvalidArity {
        semantics: &'static str,
        expected: usize,
        found: usize,
    },
    /// Failure of a storage collaborator, wrapped with operation context.
    SpillBackendFailure { context: String, source: BoxError },
    /// Backing store cleanup failure.
    Cleanup { resource: String, source: BoxError },
    /// Common I/O error.
    IO(io::Error),
    /// Data serialization error.
    SerializationError(rmp_serde::encode::Error),
    /// Data deserialization error.
    DeserializationError(rmp_serde::decode::Error),
    /// Input data stream error.
    InputError(BoxError),
}

impl Error {
    pub(crate) fn backend(context: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Error::SpillBackendFailure {
            context: context.into(),
            source: source.into(),
        }
    }

    pub(crate) fn input(source: impl Into<BoxError>) -> Self {
        Error::InputError(source.into())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match &self {
            Error::SpillBackendFailure { source, .. } => Some(source.as_ref()),
            Error::Cleanup { source, .. } => Some(source.as_ref()),
            Error::IO(err) => Some(err),
            Error::SerializationError(err) => Some(err),
            Error::DeserializationError(err) => Some(err),
            Error::InputError(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            Error::AlreadySealed => write!(f, "accumulator already completed"),
            Error::AlreadyReleased { resource } => write!(f, "resource {} already released", resource),
            Error::NotSorted { expected, found } => match found {
                Some(found) => write!(f, "input sorted by {} while {} is required", found, expected),
                None => write!(f, "input is not sorted, {} is required", expected),
            },
            Error::InvalidArity {
                semantics,
                expected,
                found,
            } => write!(f, "{} merge takes {} inputs, got {}", semantics, expected, found),
            Error::SpillBackendFailure { context, source } => write!(f, "{}: {}", context, source),
            Error::Cleanup { resource, source } => write!(f, "cleanup of {} failed: {}", resource, source),
            Error::IO(err) => write!(f, "I/O operation failed: {}", err),
            Error::SerializationError(err) => write!(f, "data serialization error: {}", err),
            Error::DeserializationError(err) => write!(f, "data deserialization error: {}", err),
            Error::InputError(err) => write!(f, "input data stream error: {}", err),
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::IO(err)
    }
}

impl From<rmp_serde::encode::Error> for Error {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Error::SerializationError(err)
    }
}

impl From<rmp_serde::decode::Error> for Error {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Error::DeserializationError(err)
    }
}
