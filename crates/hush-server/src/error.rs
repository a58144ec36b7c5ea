use thiserror::Error;

/// Failures raised by the secret store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("shared secret not found")]
    NotFound,

    #[error("open database: {0}")]
    Database(#[from] redb::DatabaseError),

    #[error("begin transaction: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("open table: {0}")]
    Table(#[from] redb::TableError),

    #[error("storage: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("commit: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("encode record: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("decode record: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    #[error("corrupt record: {0}")]
    Corrupt(&'static str),
}

/// Failures raised while loading or consulting organization membership.
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("read membership file: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse membership file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Errors surfaced by the sharing engine to its callers.
///
/// `NotFound` covers every reason a secret cannot be read: wrong id, wrong
/// lookup hash, time expiry, exhausted views, prior deletion.
#[derive(Debug, Error)]
pub enum SharingError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("shared secret not found")]
    NotFound,

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Store(StoreError),

    #[error(transparent)]
    Policy(#[from] PolicyError),
}

impl From<StoreError> for SharingError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => Self::NotFound,
            other => Self::Store(other),
        }
    }
}

pub type Result<T, E = SharingError> = std::result::Result<T, E>;
