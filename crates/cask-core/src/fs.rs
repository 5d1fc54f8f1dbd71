use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use fs4::FileExt;
use serde::{de::DeserializeOwned, Serialize};
use tempfile::NamedTempFile;

use crate::error::StoreError;
use crate::layout::INTERNAL_DIR;

/// Replace `path` with the JSON encoding of `value`: write a temp file in
/// the same directory, flush it, then rename over the destination.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow!("{} has no parent directory", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create {}", parent.display()))?;
    let mut json = serde_json::to_vec_pretty(value)?;
    json.push(b'\n');

    let mut tmp = NamedTempFile::new_in(parent)
        .with_context(|| format!("failed to create temp file in {}", parent.display()))?;
    tmp.write_all(&json)
        .with_context(|| format!("failed to write temp file for {}", path.display()))?;
    tmp.as_file()
        .sync_all()
        .with_context(|| format!("failed to flush temp file for {}", path.display()))?;
    tmp.persist(path)
        .map_err(|err| err.error)
        .with_context(|| format!("failed to move record into place at {}", path.display()))?;
    fsync_dir(parent).ok();
    Ok(())
}

/// Read a JSON record. A missing file is `None`; an unreadable or
/// undecodable one is a [`StoreError::CorruptRecord`].
pub(crate) fn read_json_optional<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read {}", path.display()));
        }
    };
    serde_json::from_str(&contents)
        .map(Some)
        .map_err(|err| {
            StoreError::CorruptRecord {
                path: path.to_path_buf(),
                error: err.to_string(),
            }
            .into()
        })
}

pub(crate) fn remove_file_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err).with_context(|| format!("failed to remove {}", path.display())),
    }
}

fn fsync_dir(dir: &Path) -> Result<()> {
    let file = File::open(dir)?;
    file.sync_all()?;
    Ok(())
}

/// Exclusive advisory lock on a file, released on drop. Works across
/// processes sharing the same storage.
#[derive(Debug)]
pub(crate) struct FileLock {
    _file: File,
}

impl FileLock {
    pub(crate) fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("failed to open lock {}", path.display()))?;
        file.lock_exclusive()
            .with_context(|| format!("failed to lock {}", path.display()))?;
        Ok(Self { _file: file })
    }
}

/// Copy every payload entry of `src` into `dest`, leaving both internal
/// bookkeeping directories alone. Returns the number of files copied.
pub(crate) fn copy_payload(src: &Path, dest: &Path) -> Result<usize> {
    fs::create_dir_all(dest).with_context(|| format!("failed to create {}", dest.display()))?;
    let mut copied = 0;
    let walker = walkdir::WalkDir::new(src)
        .into_iter()
        .filter_entry(|entry| !(entry.depth() == 1 && entry.file_name() == INTERNAL_DIR));
    for entry in walker {
        let entry = entry.with_context(|| format!("failed to walk {}", src.display()))?;
        let Ok(rel) = entry.path().strip_prefix(src) else {
            continue;
        };
        if rel.as_os_str().is_empty() {
            continue;
        }
        let target = dest.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)
                .with_context(|| format!("failed to create {}", target.display()))?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(entry.path(), &target).with_context(|| {
            format!(
                "failed to copy {} -> {}",
                entry.path().display(),
                target.display()
            )
        })?;
        copied += 1;
    }
    Ok(copied)
}

/// Remove payload entries from `dir`, keeping its internal directory.
pub(crate) fn clear_payload(dir: &Path) -> Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err).with_context(|| format!("failed to read {}", dir.display())),
    };
    for entry in entries {
        let entry = entry?;
        if entry.file_name() == INTERNAL_DIR {
            continue;
        }
        let path: PathBuf = entry.path();
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(&path)
                .with_context(|| format!("failed to remove {}", path.display()))?;
        } else {
            fs::remove_file(&path)
                .with_context(|| format!("failed to remove {}", path.display()))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use tempfile::tempdir;

    #[test]
    fn atomic_write_replaces_contents() -> Result<()> {
        let temp = tempdir()?;
        let path = temp.path().join("nested").join("record.json");
        write_json_atomic(&path, &json!({"a": 1}))?;
        write_json_atomic(&path, &json!({"a": 2}))?;
        let value: Option<Value> = read_json_optional(&path)?;
        assert_eq!(value, Some(json!({"a": 2})));
        let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap())?
            .flatten()
            .filter(|entry| entry.path() != path)
            .collect();
        assert!(leftovers.is_empty(), "temp files must not linger");
        Ok(())
    }

    #[test]
    fn missing_record_reads_as_none_and_garbage_as_corrupt() -> Result<()> {
        let temp = tempdir()?;
        let path = temp.path().join("state.json");
        assert!(read_json_optional::<Value>(&path)?.is_none());
        fs::write(&path, "{not json")?;
        let err = read_json_optional::<Value>(&path).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::CorruptRecord { .. })
        ));
        Ok(())
    }

    #[test]
    fn payload_copy_skips_internal_dir() -> Result<()> {
        let src = tempdir()?;
        let dest = tempdir()?;
        fs::write(src.path().join("value.json"), "1")?;
        fs::create_dir_all(src.path().join("nested"))?;
        fs::write(src.path().join("nested").join("more.txt"), "x")?;
        fs::create_dir_all(src.path().join(INTERNAL_DIR))?;
        fs::write(src.path().join(INTERNAL_DIR).join("state.json"), "{}")?;

        let copied = copy_payload(src.path(), dest.path())?;
        assert_eq!(copied, 2);
        assert!(dest.path().join("nested").join("more.txt").is_file());
        assert!(!dest.path().join(INTERNAL_DIR).exists());

        clear_payload(dest.path())?;
        assert!(fs::read_dir(dest.path())?.next().is_none());
        Ok(())
    }
}
