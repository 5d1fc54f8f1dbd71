//! Durable per-directory records: metadata, state and the success marker.

use std::path::Path;

use anyhow::{Context, Result};
use cask_domain::{Metadata, SchemaRegistry, SchemaVersion, StateRecord};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::clock;
use crate::fs::{read_json_optional, remove_file_if_exists, write_json_atomic, FileLock};
use crate::layout;

/// Contents of `SUCCESS.json`. Only its presence is load-bearing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuccessMarker {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt_id: Option<String>,
    pub created_at: String,
}

/// State of `dir`; a directory without a state file is `none`.
pub fn read_state(dir: &Path) -> Result<StateRecord> {
    Ok(read_state_optional(dir)?.unwrap_or_default())
}

pub fn read_state_optional(dir: &Path) -> Result<Option<StateRecord>> {
    read_json_optional(&layout::state_path(dir))
}

/// Replace the state of `dir`, stamping `updated_at`. Returns what was written.
pub fn write_state(dir: &Path, mut record: StateRecord) -> Result<StateRecord> {
    record.updated_at = Some(clock::timestamp()?);
    write_json_atomic(&layout::state_path(dir), &record)?;
    debug!(dir = %dir.display(), status = %record.status(), "state written");
    Ok(record)
}

/// Read-modify-write of the state under the directory lock.
///
/// Must not be called while the caller already holds the lock of `dir`.
pub fn update_state<F>(dir: &Path, apply: F) -> Result<StateRecord>
where
    F: FnOnce(&mut StateRecord) -> Result<()>,
{
    let _lock = FileLock::acquire(&layout::lock_path(dir))?;
    let mut record = read_state(dir)?;
    apply(&mut record)?;
    write_state(dir, record)
}

pub fn read_metadata(dir: &Path) -> Result<Option<Metadata>> {
    read_json_optional(&layout::metadata_path(dir))
}

/// Write metadata once. Returns `false` without touching the file when the
/// directory already has metadata.
pub fn write_metadata(dir: &Path, metadata: &Metadata) -> Result<bool> {
    let path = layout::metadata_path(dir);
    if path.exists() {
        if let Ok(Some(existing)) = read_json_optional::<Metadata>(&path) {
            if existing.hash != metadata.hash || existing.namespace != metadata.namespace {
                warn!(
                    dir = %dir.display(),
                    stored = %existing.identity(),
                    requested = %metadata.identity(),
                    "keeping existing metadata for a different identity"
                );
            }
        }
        return Ok(false);
    }
    write_json_atomic(&path, metadata)?;
    Ok(true)
}

/// Read metadata and, when `target` differs from the stored version, bring
/// its config up to date through `registry`. The stored file is never
/// rewritten; the returned record describes the upgraded object and carries
/// the hash of the upgraded config.
pub fn load_metadata(
    dir: &Path,
    registry: &SchemaRegistry,
    target: SchemaVersion,
) -> Result<Option<Metadata>> {
    let Some(stored) = read_metadata(dir)? else {
        return Ok(None);
    };
    if stored.version.key() == target.key() {
        return Ok(Some(stored));
    }
    let upgraded = registry
        .upgrade(&stored, target)
        .with_context(|| format!("failed to upgrade metadata in {}", dir.display()))?;
    debug!(
        dir = %dir.display(),
        from = %upgraded.from,
        to = %upgraded.to,
        hops = upgraded.hops,
        "metadata upgraded"
    );
    Ok(Some(Metadata::new(stored.namespace, upgraded.config, target)))
}

pub fn write_success_marker(dir: &Path, attempt_id: Option<&str>) -> Result<()> {
    let marker = SuccessMarker {
        attempt_id: attempt_id.map(ToOwned::to_owned),
        created_at: clock::timestamp()?,
    };
    write_json_atomic(&layout::success_marker_path(dir), &marker)
}

pub fn has_success_marker(dir: &Path) -> bool {
    layout::success_marker_path(dir).is_file()
}

pub fn remove_success_marker(dir: &Path) -> Result<bool> {
    remove_file_if_exists(&layout::success_marker_path(dir))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cask_domain::{Config, ResultStatus, StateResult};
    use serde_json::json;
    use tempfile::tempdir;

    fn metadata(version: SchemaVersion) -> Metadata {
        let mut config = Config::new();
        config.insert("lr".into(), json!(0.5));
        Metadata::new("train.Model", config, version)
    }

    #[test]
    fn missing_state_reads_as_none() -> Result<()> {
        let temp = tempdir()?;
        assert!(read_state_optional(temp.path())?.is_none());
        assert_eq!(read_state(temp.path())?.status(), ResultStatus::None);
        Ok(())
    }

    #[test]
    fn write_state_stamps_update_time() -> Result<()> {
        let temp = tempdir()?;
        let record = StateRecord {
            result: StateResult::with_status(ResultStatus::Failed),
            ..StateRecord::default()
        };
        let written = write_state(temp.path(), record)?;
        assert!(written.updated_at.is_some());
        assert_eq!(read_state(temp.path())?, written);

        let updated = update_state(temp.path(), |state| {
            state.result = StateResult::success("2025-01-01T00:00:00Z");
            Ok(())
        })?;
        assert_eq!(updated.status(), ResultStatus::Success);
        let stamp = |record: &StateRecord| record.updated_at.as_deref().and_then(clock::parse);
        assert!(stamp(&updated) > stamp(&written));
        Ok(())
    }

    #[test]
    fn metadata_is_write_once_and_omits_default_version() -> Result<()> {
        let temp = tempdir()?;
        let meta = metadata(SchemaVersion::DEFAULT);
        assert!(write_metadata(temp.path(), &meta)?);
        assert!(!write_metadata(temp.path(), &metadata(SchemaVersion::new(2.0)))?);

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(layout::metadata_path(temp.path()))?)?;
        assert!(raw.get("version").is_none());
        let read = read_metadata(temp.path())?.expect("metadata");
        assert_eq!(read.version, SchemaVersion::DEFAULT);
        assert_eq!(read, meta);
        Ok(())
    }

    #[test]
    fn metadata_is_upgraded_in_memory() -> Result<()> {
        let temp = tempdir()?;
        let meta = metadata(SchemaVersion::DEFAULT);
        write_metadata(temp.path(), &meta)?;
        let mut registry = SchemaRegistry::new();
        registry.register(
            "train.Model",
            SchemaVersion::DEFAULT,
            SchemaVersion::new(2.0),
            |config| {
                config.insert("warmup".into(), json!(10));
                Ok(())
            },
        );

        let upgraded = load_metadata(temp.path(), &registry, SchemaVersion::new(2.0))?
            .expect("metadata");
        assert_eq!(upgraded.version, SchemaVersion::new(2.0));
        assert_eq!(upgraded.config["warmup"], json!(10));
        assert_ne!(upgraded.hash, meta.hash);
        assert!(upgraded.hash_is_consistent());
        assert_eq!(read_metadata(temp.path())?, Some(meta));
        Ok(())
    }

    #[test]
    fn success_marker_lifecycle() -> Result<()> {
        let temp = tempdir()?;
        assert!(!has_success_marker(temp.path()));
        write_success_marker(temp.path(), Some("tok"))?;
        assert!(has_success_marker(temp.path()));
        assert!(remove_success_marker(temp.path())?);
        assert!(!remove_success_marker(temp.path())?);
        Ok(())
    }
}
