//! Error taxonomy for the distributor.
//!
//! Errors fall into four kinds with different propagation rules:
//! - transient/retryable: absorbed by the transaction retry loop
//! - expected control: unwinds the distributor back to its bootstrap loop
//! - client visible: surfaced on the request reply channel
//! - everything else: fatal, kills the distributor

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    // Transaction layer
    #[error("transaction conflict")]
    TxnConflict,
    #[error("commit result unknown")]
    CommitUnknown,

    // Control-flow errors that restart the distributor
    #[error("move keys lock conflict")]
    MoveKeysConflict,
    #[error("distributor configuration changed")]
    ConfigChanged,
    #[error("data move cancelled")]
    DataMoveCancelled,
    #[error("destination team not found")]
    DestTeamNotFound,

    // Audit
    #[error("audit storage failed")]
    AuditStorageFailed,
    #[error("audit storage found inconsistency")]
    AuditStorageError,
    #[error("audit storage cancelled")]
    AuditStorageCancelled,
    #[error("audit storage exceeded request limit")]
    AuditExceededRequestLimit,
    #[error("cancel audit storage failed")]
    CancelAuditStorageFailed,
    #[error("failed to persist new audit metadata")]
    PersistNewAuditMetadata,

    // Tenants
    #[error("tenant already exists")]
    TenantAlreadyExists,
    #[error("tenant not found")]
    TenantNotFound,
    #[error("tenant not empty")]
    TenantNotEmpty,
    #[error("tenant locked")]
    TenantLocked,
    #[error("invalid tenant name")]
    InvalidTenantName,
    #[error("invalid tenant group name")]
    InvalidTenantGroupName,
    #[error("cluster has no capacity for another tenant")]
    ClusterNoCapacity,
    #[error("tenants are disabled on this cluster")]
    TenantsDisabled,
    #[error("invalid metacluster operation")]
    InvalidMetaclusterOperation,
    #[error("tenant prefix overlaps existing data")]
    TenantPrefixAllocatorConflict,
    #[error("tenant creation blocked by tombstone")]
    TenantCreationBlocked,
    #[error("tenant creation permanently failed")]
    TenantCreationPermanentlyFailed,

    // Snapshot
    #[error("duplicate snapshot request")]
    DuplicateSnapshotRequest,
    #[error("storage snapshot failed")]
    SnapStorageFailed,
    #[error("tlog snapshot failed")]
    SnapTlogFailed,
    #[error("coordinator snapshot failed")]
    SnapCoordFailed,
    #[error("failed to disable tlog pops for snapshot")]
    SnapDisableTlogPopFailed,
    #[error("snapshot not supported during recovery")]
    SnapWithRecoveryUnsupported,

    #[error("operation timed out")]
    TimedOut,
    #[error("operation failed")]
    OperationFailed,
    #[error("not implemented")]
    NotImplemented,
    #[error("storage layer error: {0}")]
    Storage(String),
    #[error("internal invariant violation: {0}")]
    Internal(String),
}

impl Error {
    /// Errors the transaction retry loop absorbs and retries.
    pub fn is_txn_retryable(&self) -> bool {
        matches!(self, Error::TxnConflict | Error::CommitUnknown)
    }

    /// Errors that unwind the distributor to its bootstrap loop instead of
    /// killing it.
    pub fn is_expected_control(&self) -> bool {
        matches!(
            self,
            Error::MoveKeysConflict
                | Error::ConfigChanged
                | Error::DataMoveCancelled
                | Error::DestTeamNotFound
                | Error::AuditStorageFailed
                | Error::AuditStorageCancelled
        )
    }
}

impl From<fjall::Error> for Error {
    fn from(err: fjall::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Storage(format!("metadata codec: {err}"))
    }
}
