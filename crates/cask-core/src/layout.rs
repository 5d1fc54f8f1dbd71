//! File names inside an object directory.
//!
//! ```text
//! <root>/<namespace segments>/<hash>/
//!     <payload files written by the task>
//!     .cask/metadata.json
//!     .cask/state.json
//!     .cask/SUCCESS.json
//!     .cask/migration.json
//!     .cask/events.jsonl
//!     .cask/state.lock
//! ```

use std::path::{Path, PathBuf};

pub const INTERNAL_DIR: &str = ".cask";
pub const METADATA_FILE: &str = "metadata.json";
pub const STATE_FILE: &str = "state.json";
pub const SUCCESS_MARKER: &str = "SUCCESS.json";
pub const MIGRATION_FILE: &str = "migration.json";
pub const EVENTS_FILE: &str = "events.jsonl";
pub const LOCK_FILE: &str = "state.lock";

pub fn internal_dir(dir: &Path) -> PathBuf {
    dir.join(INTERNAL_DIR)
}

pub fn metadata_path(dir: &Path) -> PathBuf {
    internal_dir(dir).join(METADATA_FILE)
}

pub fn state_path(dir: &Path) -> PathBuf {
    internal_dir(dir).join(STATE_FILE)
}

pub fn success_marker_path(dir: &Path) -> PathBuf {
    internal_dir(dir).join(SUCCESS_MARKER)
}

pub fn migration_path(dir: &Path) -> PathBuf {
    internal_dir(dir).join(MIGRATION_FILE)
}

pub fn events_path(dir: &Path) -> PathBuf {
    internal_dir(dir).join(EVENTS_FILE)
}

pub(crate) fn lock_path(dir: &Path) -> PathBuf {
    internal_dir(dir).join(LOCK_FILE)
}
