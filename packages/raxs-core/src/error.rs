use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::key::Key;
use crate::version::Version;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("node not found: {0}")]
    NodeNotFound(Key),
    #[error("no such version: {0}")]
    NoSuchVersion(Version),
    #[error("parse error at byte {byte_offset}: {message} (near {context:?})")]
    Parse {
        message: String,
        byte_offset: u64,
        context: String,
    },
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    #[error("illegal state: {0}")]
    IllegalState(String),
    #[error("store is not writable: {}", .0.display())]
    NotWritable(PathBuf),
    #[error("broken repository: delta for version {version} references missing node {key}")]
    BrokenRepository { version: Version, key: Key },
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    pub(crate) fn parse(message: impl Into<String>, byte_offset: u64, context: &[u8]) -> Self {
        let end = context.len().min(32);
        Error::Parse {
            message: message.into(),
            byte_offset,
            context: String::from_utf8_lossy(&context[..end]).into_owned(),
        }
    }

    /// Lookup failures a caller can recover from by choosing another key or version.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NodeNotFound(_) | Error::NoSuchVersion(_))
    }

    /// Caller-side precondition violations; the store is left untouched.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Error::InvalidOperation(_) | Error::IllegalState(_) | Error::NotWritable(_)
        )
    }

    /// Re-tags a missing reference found while replaying a delta.
    pub(crate) fn in_delta(self, version: Version) -> Self {
        match self {
            Error::NodeNotFound(key) => Error::BrokenRepository { version, key },
            other => other,
        }
    }
}
