use std::result;
use thiserror::Error;

/// Crate-wide error taxonomy. Streaming sinks never surface these directly;
/// they latch an error state and report it when the import is finalized.
#[derive(Error, Debug)]
pub enum TitleVaultError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid format: {0}")]
    InvalidFormat(&'static str),

    #[error("hash or signature mismatch: {0}")]
    HashMismatch(&'static str),

    #[error("unsupported crypto: {0}")]
    UnsupportedCrypto(&'static str),

    #[error("caller is not authorized to install encrypted content")]
    NotAuthorized,

    #[error("operation issued in an invalid import state")]
    InvalidState,

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("already done")]
    AlreadyDone,

    #[error(transparent)]
    Parse(#[from] binrw::Error),
}

pub type TitleVaultResult<T> = result::Result<T, TitleVaultError>;
