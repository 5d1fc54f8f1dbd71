//! Alias resolution.
//!
//! Whether a pointer is live is never stored. It is derived on every call
//! from two facts on disk: the `overwritten_at` marker of the link (on either
//! side) and the status of the anchor directory. Invalidating an anchor
//! therefore detaches every pointer to it without touching them.

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::Result;
use cask_domain::{MigrationKind, MigrationRecord, ResultStatus, StateRecord};
use serde::Serialize;

use crate::error::StoreError;
use crate::layout;
use crate::persistence::read_state;
use crate::records::{read_record, resolve_anchor};

/// Why a pointer no longer defers to its anchor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "anchor_status", rename_all = "snake_case")]
pub enum DetachReason {
    /// The pointer's own record carries `overwritten_at`.
    Overwritten,
    /// Only the anchor's copy of the link was marked, e.g. after a crash
    /// between the two writes of a detach.
    AnchorOverwritten,
    AnchorNotSuccessful(ResultStatus),
}

impl fmt::Display for DetachReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Overwritten => f.write_str("link overwritten"),
            Self::AnchorOverwritten => f.write_str("link overwritten at the anchor"),
            Self::AnchorNotSuccessful(status) => write!(f, "anchor status is {status}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum LinkState {
    /// Not a pointer; the directory stands for itself.
    Plain,
    Active {
        record: MigrationRecord,
    },
    Detached {
        record: MigrationRecord,
        reason: DetachReason,
    },
}

impl LinkState {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active { .. })
    }

    pub fn record(&self) -> Option<&MigrationRecord> {
        match self {
            Self::Plain => None,
            Self::Active { record } | Self::Detached { record, .. } => Some(record),
        }
    }

    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Plain => "plain",
            Self::Active { .. } => "active",
            Self::Detached { .. } => "detached",
        }
    }
}

/// Outcome of resolving one requested directory.
#[derive(Clone, Debug, PartialEq)]
pub struct Resolution {
    pub requested: PathBuf,
    /// Directory used for payload reads and writes.
    pub effective: PathBuf,
    /// Status of the requested directory itself.
    pub status: ResultStatus,
    /// Status of the effective directory.
    pub effective_status: ResultStatus,
    pub link: LinkState,
}

impl Resolution {
    pub fn is_active_alias(&self) -> bool {
        self.link.is_active()
    }

    /// True when a successful result can be served for the request.
    pub fn exists(&self) -> bool {
        self.effective_status == ResultStatus::Success
    }
}

pub fn resolve_dir(dir: &Path) -> Result<Resolution> {
    let state = read_state(dir)?;
    resolve_with_state(dir, &state)
}

/// Resolve `dir` given a state record the caller already read.
pub(crate) fn resolve_with_state(dir: &Path, state: &StateRecord) -> Result<Resolution> {
    let status = state.status();
    let plain = |link| Resolution {
        requested: dir.to_path_buf(),
        effective: dir.to_path_buf(),
        status,
        effective_status: status,
        link,
    };
    if status != ResultStatus::Migrated {
        return Ok(plain(LinkState::Plain));
    }

    let record = pointer_record(dir)?;
    if record.is_overwritten() {
        return Ok(plain(LinkState::Detached {
            record,
            reason: DetachReason::Overwritten,
        }));
    }

    let anchor = resolve_anchor(&record).to_path_buf();
    if read_record(&anchor)?.is_some_and(|seen| seen.same_link(&record) && seen.is_overwritten()) {
        return Ok(plain(LinkState::Detached {
            record,
            reason: DetachReason::AnchorOverwritten,
        }));
    }

    let anchor_status = read_state(&anchor)?.status();
    if anchor_status != ResultStatus::Success {
        return Ok(plain(LinkState::Detached {
            record,
            reason: DetachReason::AnchorNotSuccessful(anchor_status),
        }));
    }

    Ok(Resolution {
        requested: dir.to_path_buf(),
        effective: anchor,
        status,
        effective_status: anchor_status,
        link: LinkState::Active { record },
    })
}

/// The pointer record a `migrated` directory must carry.
fn pointer_record(dir: &Path) -> Result<MigrationRecord> {
    let path = layout::migration_path(dir);
    let corrupt = |error: &str| StoreError::CorruptRecord {
        path: path.clone(),
        error: error.to_string(),
    };
    let record = read_record(dir)?.ok_or_else(|| corrupt("migrated directory has no link record"))?;
    if record.kind != MigrationKind::Pointer {
        return Err(corrupt(&format!(
            "migrated directory carries a {} record, expected pointer",
            record.kind
        ))
        .into());
    }
    if resolve_anchor(&record) == dir {
        return Err(corrupt("link points back at its own directory").into());
    }
    Ok(record)
}
