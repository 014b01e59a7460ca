use thiserror::Error;

/// Failure taxonomy for one sync run.
///
/// Propagation policy: `Config` aborts before any I/O, `SourceUnavailable`
/// degrades the fetch phase to zero candidates, `UiTimeout` is handled per
/// login state, `TransactionPost` is caught at transaction granularity, and
/// `StoreConflict` is surfaced and logged but never retried automatically.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("missing or invalid configuration: {0}")]
    Config(String),

    #[error("mail source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("timed out waiting for {0}")]
    UiTimeout(String),

    #[error("failed to post transaction: {0}")]
    TransactionPost(String),

    #[error("ledger row conflict at sheet row {sheet_row}: {reason}")]
    StoreConflict { sheet_row: usize, reason: String },

    #[error("ledger store error: {0}")]
    Store(String),
}

pub type SyncResult<T> = Result<T, SyncError>;

impl SyncError {
    pub fn store(err: impl std::fmt::Display) -> Self {
        SyncError::Store(err.to_string())
    }
}
