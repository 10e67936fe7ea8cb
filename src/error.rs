use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("SQL error {code}: {message}")]
    Sql { code: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Truncated message: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("Unknown replication message: {0:#04x}")]
    UnknownMessage(u8),

    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Unknown relation ID: {0}")]
    UnknownRelation(u32),

    #[error("Tuple arity mismatch: relation has {expected} columns, tuple has {actual}")]
    ArityMismatch { expected: usize, actual: usize },

    #[error("Replication error: {0}")]
    Replication(String),
}

impl Error {
    /// SQLSTATE of the underlying server error, when there is one.
    ///
    /// Setup DDL uses this to tolerate `42710` (duplicate object) when the
    /// publication or slot already exists.
    pub fn sql_state(&self) -> Option<&str> {
        match self {
            Error::Sql { code, .. } => Some(code),
            Error::Postgres(e) => e.code().map(|c| c.code()),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
