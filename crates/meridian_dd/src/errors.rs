//! Typed errors surfaced at the distributor RPC boundary, plus the
//! classification sets that drive retry and restart policy.

use thiserror::Error;

pub type Result<T, E = DdError> = std::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DdError {
    #[error("operation failed")]
    OperationFailed,
    #[error("operation timed out")]
    TimedOut,
    #[error("operation cancelled")]
    OperationCancelled,
    #[error("move keys lock conflict")]
    MoveKeysConflict,
    #[error("broken promise")]
    BrokenPromise,
    #[error("data move cancelled")]
    DataMoveCancelled,
    #[error("data move destination team not found")]
    DataMoveDestTeamNotFound,
    #[error("failed to disable tlog pops for snapshot")]
    SnapDisableTlogPopFailed,
    #[error("storage snapshot failed")]
    SnapStorageFailed,
    #[error("tlog snapshot failed")]
    SnapTlogFailed,
    #[error("failed to re-enable tlog pops after snapshot")]
    SnapEnableTlogPopFailed,
    #[error("coordinator snapshot failed")]
    SnapCoordFailed,
    #[error("snapshot during recovery is unsupported")]
    SnapWithRecoveryUnsupported,
    #[error("worker removed")]
    WorkerRemoved,
    #[error("reboot requested")]
    PleaseReboot,
    /// A system-store commit raced another writer; always retryable.
    #[error("system transaction conflict")]
    TransactionConflict,
    #[error("system store error: {0}")]
    Storage(String),
    #[error("corrupt system metadata: {0}")]
    CorruptMetadata(String),
}

impl DdError {
    /// Errors the system-store retry loops absorb with back-off.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DdError::TransactionConflict)
    }

    /// Collaborator errors that tear down and restart the inner
    /// data-distribution stack instead of killing the distributor.
    pub fn is_normal_dd_queue_error(&self) -> bool {
        matches!(
            self,
            DdError::MoveKeysConflict
                | DdError::BrokenPromise
                | DdError::DataMoveCancelled
                | DdError::DataMoveDestTeamNotFound
        )
    }

    /// Errors that end the distributor quietly rather than propagating.
    pub fn is_normal_distributor_error(&self) -> bool {
        self.is_normal_dd_queue_error()
            || matches!(
                self,
                DdError::WorkerRemoved | DdError::PleaseReboot | DdError::OperationCancelled
            )
    }
}

impl From<fjall::Error> for DdError {
    fn from(err: fjall::Error) -> Self {
        DdError::Storage(err.to_string())
    }
}
