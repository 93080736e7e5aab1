use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error for kind {kind}: {source}")]
    Serde {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("lock error on {path}: {message}")]
    Lock { path: String, message: String },
}
