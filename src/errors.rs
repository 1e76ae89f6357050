//! Definition of errors.

use std::error::Error;
use std::fmt;
use std::io;

/// Error used when the configuration is contradictory or selects an
/// unsupported component.
#[derive(Debug)]
pub struct ConfigError {
    msg: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ConfigError: {}", self.msg)
    }
}

impl Error for ConfigError {}

/// Error used when a serialized model is malformed.
#[derive(Debug)]
pub struct FormatError {
    msg: String,
}

impl fmt::Display for FormatError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "FormatError: {}", self.msg)
    }
}

impl Error for FormatError {}

/// Error used when input documents disagree with the model.
#[derive(Debug)]
pub struct DataError {
    msg: String,
}

impl fmt::Display for DataError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "DataError: {}", self.msg)
    }
}

impl Error for DataError {}

/// Error used when the objective, a likelihood, or a gradient produces a
/// non-finite value.
#[derive(Debug)]
pub struct NumericError {
    msg: String,
}

impl fmt::Display for NumericError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "NumericError: {}", self.msg)
    }
}

impl Error for NumericError {}

/// The error type for seqcrf.
#[derive(Debug)]
pub enum SeqCrfError {
    /// Error variant for [`ConfigError`].
    Config(ConfigError),

    /// Error variant for [`FormatError`].
    Format(FormatError),

    /// Error variant for [`DataError`].
    Data(DataError),

    /// Error variant for [`NumericError`].
    Numeric(NumericError),

    /// I/O failure on a model file or input document, surfaced verbatim.
    Resource(io::Error),
}

impl SeqCrfError {
    /// Creates a new [`ConfigError`].
    pub(crate) fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(ConfigError { msg: msg.into() })
    }

    /// Creates a new [`FormatError`].
    pub(crate) fn format<S: Into<String>>(msg: S) -> Self {
        Self::Format(FormatError { msg: msg.into() })
    }

    /// Creates a new [`DataError`].
    pub(crate) fn data<S: Into<String>>(msg: S) -> Self {
        Self::Data(DataError { msg: msg.into() })
    }

    /// Creates a new [`NumericError`].
    pub(crate) fn numeric<S: Into<String>>(msg: S) -> Self {
        Self::Numeric(NumericError { msg: msg.into() })
    }
}

impl fmt::Display for SeqCrfError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Config(e) => e.fmt(f),
            Self::Format(e) => e.fmt(f),
            Self::Data(e) => e.fmt(f),
            Self::Numeric(e) => e.fmt(f),
            Self::Resource(e) => write!(f, "ResourceError: {e}"),
        }
    }
}

impl Error for SeqCrfError {}

impl From<io::Error> for SeqCrfError {
    fn from(e: io::Error) -> Self {
        Self::Resource(e)
    }
}

/// A specialized Result type.
pub type Result<T, E = SeqCrfError> = std::result::Result<T, E>;
