use thiserror::Error;

/// Error taxonomy shared by every core operation (chunk store, ingest
/// pipeline, stream assembler, garbage collector). HTTP-specific variants
/// exist here too since the boundary maps them 1:1 without re-wrapping.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found")]
    NotFound,

    #[error("payload too large")]
    TooLarge,

    #[error("unsupported media type")]
    UnsupportedMediaType,

    #[error("corrupt data: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Internal(err.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
