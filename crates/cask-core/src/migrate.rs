//! Explicit migrations between identities.
//!
//! Every step is safe to repeat. Re-running a migration whose destination
//! already carries a live record for the same endpoints completes whatever
//! a previous run left undone and reuses that record.

use std::path::{Path, PathBuf};

use anyhow::Result;
use cask_domain::{
    EventKind, Identity, Metadata, MigrationKind, MigrationPolicy, MigrationRecord, ObjectRef,
    ResultStatus, StateResult,
};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info};

use crate::attempt;
use crate::clock;
use crate::error::StoreError;
use crate::events;
use crate::fs::{clear_payload, copy_payload};
use crate::persistence;
use crate::records;
use crate::resolution::{self, LinkState};
use crate::store::ObjectStore;

#[derive(Clone, Debug, Default)]
pub struct MigrateOptions {
    /// Free-form provenance, e.g. the tool or person running the migration.
    pub origin: Option<String>,
    pub note: Option<String>,
    /// Replace a successful result or a live alias at the destination.
    pub overwrite: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MigrationReport {
    /// The record stored at the destination.
    pub record: MigrationRecord,
    pub from_dir: PathBuf,
    pub to_dir: PathBuf,
    /// True when an earlier run of the same migration was completed.
    pub resumed: bool,
    pub files_copied: usize,
}

fn destination_kind(policy: MigrationPolicy) -> MigrationKind {
    match policy {
        MigrationPolicy::Alias => MigrationKind::Pointer,
        MigrationPolicy::Move | MigrationPolicy::Copy => MigrationKind::Anchor,
    }
}

impl ObjectStore {
    /// Link `from` to the object described by `to`.
    ///
    /// * `alias`: `to` becomes a pointer deferring to `from`.
    /// * `move`: `to` receives the payload and becomes the anchor; `from`
    ///   becomes a pointer to it. The payload bytes stay in `from`.
    /// * `copy`: `to` becomes an independent result with a lineage record;
    ///   `from` only gains an event.
    pub fn migrate(
        &self,
        from: &Identity,
        to: &Metadata,
        policy: MigrationPolicy,
        options: &MigrateOptions,
    ) -> Result<MigrationReport> {
        let to_identity = to.identity();
        let from_dir = self.object_dir(from)?;
        let to_dir = self.object_dir(&to_identity)?;
        if from_dir == to_dir {
            return Err(StoreError::InvalidMigration(format!(
                "{from} and {to_identity} share the directory {}",
                from_dir.display()
            ))
            .into());
        }

        let mut record = new_record(from, &from_dir, &to_identity, &to_dir, policy, options)?;
        let previous = records::read_record(&to_dir)?.filter(|existing| {
            existing.kind == record.kind
                && existing.same_endpoints(&record)
                && !existing.is_overwritten()
        });
        let resumed = previous.is_some();
        if let Some(previous) = previous {
            debug!(to = %to_dir.display(), %policy, "resuming migration");
            record = previous;
        }

        let source = persistence::read_state(&from_dir)?.status();
        let source_ready = source == ResultStatus::Success
            || (resumed && policy == MigrationPolicy::Move && source == ResultStatus::Migrated);
        if !source_ready {
            return Err(StoreError::SourceUnavailable {
                dir: from_dir,
                status: source,
            }
            .into());
        }
        self.check_destination(&to_dir, options.overwrite, resumed)?;

        persistence::write_metadata(&to_dir, to)?;
        let files_copied = match policy {
            MigrationPolicy::Alias => {
                link_alias(&from_dir, &to_dir, &record)?;
                0
            }
            MigrationPolicy::Move => link_move(&from_dir, &to_dir, &record, resumed)?,
            MigrationPolicy::Copy => stage_payload(&from_dir, &to_dir, &record, resumed)?,
        };

        let payload = json!({
            "policy": policy,
            "from": record.from,
            "to": record.to,
            "origin": record.origin,
            "note": record.note,
            "migrated_at": record.migrated_at,
        });
        for dir in [&from_dir, &to_dir] {
            if !migration_logged(dir, &record)? {
                events::append(dir, EventKind::Migration, payload.clone())?;
            }
        }
        info!(
            from = %from,
            to = %to_identity,
            %policy,
            resumed,
            files_copied,
            "migration applied"
        );
        Ok(MigrationReport {
            record,
            from_dir,
            to_dir,
            resumed,
            files_copied,
        })
    }

    /// Refuse to clobber work at the destination unless asked to. A resumed
    /// migration only checks for a live attempt.
    fn check_destination(&self, dir: &Path, overwrite: bool, resumed: bool) -> Result<()> {
        let state = persistence::read_state(dir)?;
        let conflict = |reason: String| StoreError::LinkConflict {
            dir: dir.to_path_buf(),
            reason,
        };
        match state.status() {
            ResultStatus::Pending => {
                if let Some(running) = state
                    .attempt
                    .as_ref()
                    .filter(|current| attempt::is_live(current, &self.config().attempts))
                {
                    return Err(conflict(format!(
                        "attempt {} owned by pid {} is still running",
                        running.id, running.owner.pid
                    ))
                    .into());
                }
            }
            _ if resumed => {}
            ResultStatus::Success if !overwrite => {
                return Err(conflict(
                    "it already holds a successful result; pass overwrite to replace it".into(),
                )
                .into());
            }
            ResultStatus::Migrated => {
                let resolution = resolution::resolve_with_state(dir, &state)?;
                if let LinkState::Active { record } = &resolution.link {
                    if !overwrite {
                        return Err(conflict(format!(
                            "it is an active alias of {}",
                            resolution.effective.display()
                        ))
                        .into());
                    }
                    self.detach(dir, record, "migration")?;
                }
            }
            _ => {}
        }
        Ok(())
    }
}

fn link_alias(from_dir: &Path, to_dir: &Path, record: &MigrationRecord) -> Result<()> {
    records::write_record(from_dir, &record.counterpart(MigrationKind::Anchor))?;
    records::write_record(to_dir, record)?;
    mark_pointer(to_dir)
}

fn new_record(
    from: &Identity,
    from_dir: &Path,
    to: &Identity,
    to_dir: &Path,
    policy: MigrationPolicy,
    options: &MigrateOptions,
) -> Result<MigrationRecord> {
    Ok(MigrationRecord {
        kind: destination_kind(policy),
        policy,
        from: ObjectRef::new(from, from_dir),
        to: ObjectRef::new(to, to_dir),
        migrated_at: clock::timestamp()?,
        overwritten_at: None,
        origin: options.origin.clone(),
        note: options.note.clone(),
    })
}

fn link_move(
    from_dir: &Path,
    to_dir: &Path,
    record: &MigrationRecord,
    resumed: bool,
) -> Result<usize> {
    let copied = stage_payload(from_dir, to_dir, record, resumed)?;
    records::write_record(from_dir, &record.counterpart(MigrationKind::Pointer))?;
    mark_pointer(from_dir)?;
    Ok(copied)
}

/// Give `to_dir` its record, then the payload. The destination is not a
/// success until the copy finishes, so a rerun finds the record and resumes.
fn stage_payload(
    from_dir: &Path,
    to_dir: &Path,
    record: &MigrationRecord,
    resumed: bool,
) -> Result<usize> {
    if resumed {
        if persistence::read_state(to_dir)?.status() == ResultStatus::Success
            && persistence::has_success_marker(to_dir)
        {
            debug!(to = %to_dir.display(), "payload already transferred");
            return Ok(0);
        }
    } else {
        persistence::update_state(to_dir, |state| {
            state.result = StateResult::none();
            state.attempt = None;
            persistence::remove_success_marker(to_dir)?;
            Ok(())
        })?;
        records::write_record(to_dir, record)?;
    }
    transfer_payload(from_dir, to_dir)
}

/// Replace the payload of `to_dir` with the one in `from_dir` and mark it a
/// success of its own.
fn transfer_payload(from_dir: &Path, to_dir: &Path) -> Result<usize> {
    let created_at = persistence::read_state(from_dir)?.result.created_at;
    clear_payload(to_dir)?;
    let copied = copy_payload(from_dir, to_dir)?;
    persistence::update_state(to_dir, |state| {
        state.result = StateResult::success(match created_at {
            Some(at) => at,
            None => clock::timestamp()?,
        });
        state.attempt = None;
        persistence::write_success_marker(to_dir, None)
    })?;
    Ok(copied)
}

/// Whether the log of `dir` already holds the event for this link.
fn migration_logged(dir: &Path, record: &MigrationRecord) -> Result<bool> {
    Ok(events::read_events(dir)?.iter().any(|event| {
        event.is(EventKind::Migration) && event.payload["migrated_at"] == record.migrated_at
    }))
}

fn mark_pointer(dir: &Path) -> Result<()> {
    persistence::update_state(dir, |state| {
        state.result = StateResult::with_status(ResultStatus::Migrated);
        state.attempt = None;
        persistence::remove_success_marker(dir)?;
        Ok(())
    })?;
    Ok(())
}
