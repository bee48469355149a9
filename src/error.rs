use std::fmt::Display;

/// CinderDB errors.
#[derive(Debug)]
pub enum Error {
    /// An underlying read/write/seek/sync/truncate failure. Surfaced
    /// verbatim; the engine never retries on behalf of the caller.
    Io(String),
    /// A segment file failed validation when it was opened. The message
    /// names the offending file. A corrupt segment is never silently
    /// accepted into the store.
    CorruptSegment(String),
    /// Invalid user input, typically a key or value that exceeds the 16-bit
    /// length limit of the record format.
    InvalidInput(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Io(msg) => write!(f, "io error: {msg}"),
            Error::CorruptSegment(msg) => write!(f, "corrupt segment: {msg}"),
            Error::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
        }
    }
}

/// A CinderDB Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}
