use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to create {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("stored event is not valid json: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<StoreError> for relay_pool::Error {
    fn from(e: StoreError) -> Self {
        relay_pool::Error::Store(e.to_string())
    }
}
