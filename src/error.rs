use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DbError>;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("structure error: {0}")]
    Structure(String),
    #[error("bad argument: {0}")]
    BadArgument(String),
    #[error("type error: {0}")]
    Type(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("not implemented: {0}")]
    NotImplemented(&'static str),
    #[error("runtime invariant violated: {0}")]
    Runtime(String),
}

impl DbError {
    /// The failure kinds a `Default` open recovers from by reinitializing
    /// the file.
    pub fn is_recoverable_open_failure(&self) -> bool {
        matches!(self, DbError::Structure(_) | DbError::BadArgument(_))
    }
}
