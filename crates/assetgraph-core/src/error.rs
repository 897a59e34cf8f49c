use thiserror::Error;

use crate::types::AssetId;

#[derive(Error, Debug)]
pub enum AssetGraphError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("File watcher error: {0}")]
    Notify(#[from] notify::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Asset not found: {0}")]
    AssetNotFound(AssetId),

    #[error("Instance has been disposed")]
    Disposed,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Threading error: {0}")]
    Threading(String),
}

pub type Result<T> = std::result::Result<T, AssetGraphError>;
