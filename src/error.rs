use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum TapeError {
    #[error("a tape already exists at {path}")]
    #[diagnostic(help("delete the existing tape or record into a different directory"))]
    TapeExists { path: String },

    #[error("no tape found at {path}")]
    #[diagnostic(help("run a recorder commit first to create the tape"))]
    TapeNotFound { path: String },

    #[error("root path is not a directory: {path}")]
    NotADirectory { path: String },

    #[error("offset {offset} is out of range for a tape of {total_size} bytes")]
    OffsetOutOfRange { offset: u64, total_size: u64 },

    #[error("validation error: {message}")]
    Validation { message: String },

    #[error("'{path}' violates the 512-byte header contract: {reason}")]
    #[diagnostic(help(
        "USTAR limits: 255-byte paths with a valid prefix/name split, 100-byte components and link targets, 32-byte owner names"
    ))]
    Compliance { path: String, reason: String },

    #[error("integrity check failed for '{path}': {reason}")]
    #[diagnostic(help("the directory changed since the tape was recorded; re-record it"))]
    Integrity { path: String, reason: String },

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("tape store error: {context}")]
    Store {
        context: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("internal invariant violated: {message}")]
    #[diagnostic(help("this is a bug in tartape, not a problem with your data"))]
    Internal { message: String },
}

impl TapeError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        TapeError::Io {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn store(context: impl Into<String>, source: rusqlite::Error) -> Self {
        TapeError::Store {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn integrity(path: impl Into<String>, reason: impl Into<String>) -> Self {
        TapeError::Integrity {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
