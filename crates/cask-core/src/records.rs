//! Migration link records (`migration.json`).

use std::path::Path;

use anyhow::Result;
use cask_domain::MigrationRecord;
use tracing::debug;

use crate::fs::{read_json_optional, write_json_atomic, FileLock};
use crate::layout;

/// What [`mark_overwritten`] found on disk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OverwriteOutcome {
    /// `overwritten_at` was null and is now set.
    Marked,
    /// The record was already overwritten; nothing changed.
    AlreadySet,
    /// The directory has no record.
    Missing,
    /// The directory carries a record for a different link.
    Superseded,
}

pub fn read_record(dir: &Path) -> Result<Option<MigrationRecord>> {
    read_json_optional(&layout::migration_path(dir))
}

pub fn write_record(dir: &Path, record: &MigrationRecord) -> Result<()> {
    write_json_atomic(&layout::migration_path(dir), record)?;
    debug!(
        dir = %dir.display(),
        kind = %record.kind,
        policy = %record.policy,
        "migration record written"
    );
    Ok(())
}

/// Set `overwritten_at` on the record of `dir` if it is still null.
/// Repeating the call never moves an existing timestamp.
pub fn mark_overwritten(dir: &Path, at: &str) -> Result<OverwriteOutcome> {
    mark(dir, at, None)
}

/// Like [`mark_overwritten`], but only touches the record if it belongs to
/// the same link as `link`.
pub fn mark_link_overwritten(
    dir: &Path,
    link: &MigrationRecord,
    at: &str,
) -> Result<OverwriteOutcome> {
    mark(dir, at, Some(link))
}

fn mark(dir: &Path, at: &str, link: Option<&MigrationRecord>) -> Result<OverwriteOutcome> {
    if !layout::migration_path(dir).is_file() {
        return Ok(OverwriteOutcome::Missing);
    }
    let _lock = FileLock::acquire(&layout::lock_path(dir))?;
    let Some(mut record) = read_record(dir)? else {
        return Ok(OverwriteOutcome::Missing);
    };
    if link.is_some_and(|link| !link.same_link(&record)) {
        return Ok(OverwriteOutcome::Superseded);
    }
    if record.is_overwritten() {
        return Ok(OverwriteOutcome::AlreadySet);
    }
    record.overwritten_at = Some(at.to_string());
    write_record(dir, &record)?;
    Ok(OverwriteOutcome::Marked)
}

/// Directory on the anchor side of a link, whichever policy created it.
pub fn resolve_anchor(record: &MigrationRecord) -> &Path {
    record.anchor_root()
}
