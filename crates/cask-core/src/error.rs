use std::path::PathBuf;

use cask_domain::{Identity, IdentityError, ResultStatus};

pub mod codes {
    pub const MIGRATION_BLOCKED: &str = "CS301";
    pub const LINK_CONFLICT: &str = "CS302";
    pub const SOURCE_UNAVAILABLE: &str = "CS303";
    pub const INVALID_MIGRATION: &str = "CS304";
    pub const INVALID_IDENTITY: &str = "CS305";
    pub const COMPUTE_FAILED: &str = "CS401";
    pub const WAIT_TIMEOUT: &str = "CS402";
    pub const CORRUPT_RECORD: &str = "CS501";
}

/// Errors surfaced by the store. They travel inside `anyhow::Error`; callers
/// recover them with `downcast_ref::<StoreError>()`.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    #[error(
        "[CS301] {dir} is an active alias of {anchor}; read through the anchor or force \
         recomputation to detach"
    )]
    MigrationBlocked { dir: PathBuf, anchor: PathBuf },
    #[error("[CS302] cannot migrate into {dir}: {reason}")]
    LinkConflict { dir: PathBuf, reason: String },
    #[error("[CS303] migration source {dir} has status {status}, expected success")]
    SourceUnavailable { dir: PathBuf, status: ResultStatus },
    #[error("[CS304] invalid migration: {0}")]
    InvalidMigration(String),
    #[error("[CS305] invalid identity {identity}: {reason}")]
    InvalidIdentity { identity: String, reason: String },
    #[error("[CS401] compute failed for {dir}: {message}")]
    ComputeFailed { dir: PathBuf, message: String },
    #[error("[CS402] gave up after {waited_secs}s waiting for the attempt running in {dir}")]
    WaitTimeout { dir: PathBuf, waited_secs: u64 },
    #[error("[CS501] record {path} is corrupt: {error}")]
    CorruptRecord { path: PathBuf, error: String },
}

impl StoreError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::MigrationBlocked { .. } => codes::MIGRATION_BLOCKED,
            Self::LinkConflict { .. } => codes::LINK_CONFLICT,
            Self::SourceUnavailable { .. } => codes::SOURCE_UNAVAILABLE,
            Self::InvalidMigration(_) => codes::INVALID_MIGRATION,
            Self::InvalidIdentity { .. } => codes::INVALID_IDENTITY,
            Self::ComputeFailed { .. } => codes::COMPUTE_FAILED,
            Self::WaitTimeout { .. } => codes::WAIT_TIMEOUT,
            Self::CorruptRecord { .. } => codes::CORRUPT_RECORD,
        }
    }
}

impl StoreError {
    pub(crate) fn invalid_identity(identity: &Identity, err: &IdentityError) -> Self {
        Self::InvalidIdentity {
            identity: identity.to_string(),
            reason: err.to_string(),
        }
    }
}

/// Find a [`StoreError`] anywhere in an error chain.
pub fn store_error(err: &anyhow::Error) -> Option<&StoreError> {
    err.chain().find_map(|cause| cause.downcast_ref::<StoreError>())
}
