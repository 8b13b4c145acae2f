use std::path::PathBuf;

/// UTXO commitment error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Ingest file error: {0}")]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Multiset(#[from] subcoin_crypto::ecmh::Error),

    #[error("Chunk file {path:?} already exists with {existing} bytes, expected {expected}")]
    ChunkConflict {
        path: PathBuf,
        existing: u64,
        expected: u64,
    },

    #[error("Corrupt database row: {0}")]
    CorruptRow(String),

    #[error("Malformed ingest row {line}: {reason}")]
    MalformedIngestRow { line: u64, reason: String },

    #[error(transparent)]
    Join(#[from] tokio::task::JoinError),

    #[error("Block #{0} not found")]
    BlockNotFound(u32),
}

pub type Result<T> = std::result::Result<T, Error>;
