use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("walkdir error: {0}")]
    Walkdir(#[from] walkdir::Error),

    #[error("path not found: {path} (account {account_id})")]
    PathNotFound { path: String, account_id: String },

    #[error("ambiguous path: {path} (missing segments: {remainder})")]
    AmbiguousPath { path: String, remainder: String },

    #[error("transient network error: {message}")]
    Transient { message: String },

    #[error("api error: {message}")]
    Api { message: String },

    #[error("protocol violation: {message}")]
    Protocol { message: String },

    #[error("destination conflict: {path}")]
    Conflict { path: PathBuf },

    #[error("unsupported path (must be UTF-8): {path:?}")]
    NonUtf8Path { path: PathBuf },

    #[error("cancelled")]
    Cancelled,
}
