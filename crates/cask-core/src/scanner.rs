//! Read-only views of a storage root for dashboards and the CLI.
//!
//! Nothing here writes to disk. The `resolved` view reports what a reader of
//! an identity would get (anchor data for active aliases); the `original`
//! view reports each directory's own records.

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use cask_domain::{
    AttemptPhase, Event, Identity, Metadata, MigrationKind, MigrationRecord, ResultStatus,
    StateRecord,
};
use serde::Serialize;
use tracing::debug;
use walkdir::WalkDir;

use crate::clock;
use crate::error::StoreError;
use crate::events::read_events;
use crate::layout;
use crate::persistence::{read_metadata, read_state};
use crate::records::{read_record, resolve_anchor};
use crate::resolution::{resolve_with_state, Resolution};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum View {
    #[default]
    Resolved,
    Original,
}

impl FromStr for View {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "resolved" => Ok(Self::Resolved),
            "original" => Ok(Self::Original),
            other => Err(format!("unknown view '{other}' (expected resolved or original)")),
        }
    }
}

impl fmt::Display for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Resolved => "resolved",
            Self::Original => "original",
        })
    }
}

#[derive(Clone, Debug, Default)]
pub struct ScanFilter {
    pub result_status: Option<ResultStatus>,
    pub attempt_phase: Option<AttemptPhase>,
    pub namespace_prefix: Option<String>,
}

impl ScanFilter {
    fn matches(&self, summary: &ObjectSummary) -> bool {
        self.result_status
            .map_or(true, |status| summary.result_status == status)
            && self
                .attempt_phase
                .map_or(true, |phase| summary.attempt_phase == Some(phase))
            && self
                .namespace_prefix
                .as_deref()
                .map_or(true, |prefix| summary.namespace.starts_with(prefix))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ObjectSummary {
    pub namespace: String,
    pub hash: String,
    pub directory: PathBuf,
    pub result_status: ResultStatus,
    /// Phase of the attempt working on the directory, only while pending.
    pub attempt_phase: Option<AttemptPhase>,
    pub attempt_number: Option<u32>,
    pub updated_at: Option<String>,
    pub migration_kind: Option<MigrationKind>,
    /// `plain`, `active` or `detached`.
    pub link: String,
    pub effective_directory: PathBuf,
    /// Set when the directory's records could not be read.
    pub error: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ObjectDetail {
    pub namespace: String,
    pub hash: String,
    pub directory: PathBuf,
    pub view: View,
    pub link: String,
    pub effective_directory: PathBuf,
    /// Own status of the anchor when the directory is a pointer.
    pub anchor_status: Option<ResultStatus>,
    pub state: StateRecord,
    pub metadata: Option<Metadata>,
    pub migration: Option<MigrationRecord>,
    pub events: Vec<Event>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct DashboardStats {
    pub total: usize,
    pub by_result_status: BTreeMap<ResultStatus, usize>,
    pub by_attempt_phase: BTreeMap<AttemptPhase, usize>,
    pub running: usize,
    pub queued: usize,
    pub success: usize,
    pub failed: usize,
    pub active_aliases: usize,
    pub detached_aliases: usize,
    pub unreadable: usize,
}

/// Every object directory under `root`: directories holding a state file
/// in their internal directory.
fn object_dirs(root: &Path) -> Result<Vec<PathBuf>> {
    if !root.is_dir() {
        return Ok(Vec::new());
    }
    let mut found = Vec::new();
    let walker = WalkDir::new(root)
        .min_depth(1)
        .into_iter()
        .filter_entry(|entry| entry.file_name() != layout::INTERNAL_DIR);
    for entry in walker {
        let entry = entry.with_context(|| format!("failed to walk {}", root.display()))?;
        if entry.file_type().is_dir() && layout::state_path(entry.path()).is_file() {
            found.push(entry.into_path());
        }
    }
    Ok(found)
}

/// Namespace and hash encoded in the path of `dir` below `root`.
fn parse_identity(root: &Path, dir: &Path) -> (String, String) {
    let relative = dir.strip_prefix(root).unwrap_or(dir);
    let parts: Vec<String> = relative
        .components()
        .map(|part| part.as_os_str().to_string_lossy().into_owned())
        .collect();
    match parts.split_last() {
        Some((hash, namespace)) if !namespace.is_empty() => (namespace.join("."), hash.clone()),
        _ => (relative.to_string_lossy().into_owned(), String::new()),
    }
}

struct Snapshot {
    state: StateRecord,
    record: Option<MigrationRecord>,
    resolution: Resolution,
    effective_state: StateRecord,
}

fn snapshot(dir: &Path, view: View) -> Result<Snapshot> {
    let state = read_state(dir)?;
    let record = read_record(dir)?;
    let resolution = resolve_with_state(dir, &state)?;
    let effective_state = if view == View::Resolved && resolution.effective != dir {
        read_state(&resolution.effective)?
    } else {
        state.clone()
    };
    Ok(Snapshot {
        state,
        record,
        resolution,
        effective_state,
    })
}

fn summarize(root: &Path, dir: &Path, view: View) -> ObjectSummary {
    let (namespace, hash) = parse_identity(root, dir);
    match snapshot(dir, view) {
        Ok(snap) => {
            let shown = &snap.effective_state;
            let attempt = shown
                .attempt
                .as_ref()
                .filter(|_| shown.status() == ResultStatus::Pending);
            ObjectSummary {
                namespace,
                hash,
                directory: dir.to_path_buf(),
                result_status: shown.status(),
                attempt_phase: attempt.map(|attempt| attempt.phase),
                attempt_number: attempt.map(|attempt| attempt.number),
                updated_at: snap.state.updated_at.clone(),
                migration_kind: snap.record.as_ref().map(|record| record.kind),
                link: snap.resolution.link.label().to_string(),
                effective_directory: snap.resolution.effective,
                error: None,
            }
        }
        Err(err) => {
            debug!(dir = %dir.display(), %err, "unreadable object directory");
            ObjectSummary {
                namespace,
                hash,
                directory: dir.to_path_buf(),
                result_status: ResultStatus::Failed,
                attempt_phase: None,
                attempt_number: None,
                updated_at: None,
                migration_kind: None,
                link: "unknown".to_string(),
                effective_directory: dir.to_path_buf(),
                error: Some(format!("{err:#}")),
            }
        }
    }
}

/// Objects under `root` matching `filter`, newest update first. Objects
/// without a readable update time come last.
pub fn scan(root: &Path, filter: &ScanFilter, view: View) -> Result<Vec<ObjectSummary>> {
    let mut summaries: Vec<ObjectSummary> = object_dirs(root)?
        .iter()
        .map(|dir| summarize(root, dir, view))
        .filter(|summary| filter.matches(summary))
        .collect();
    summaries.sort_by_key(|summary| Reverse(summary.updated_at.as_deref().and_then(clock::parse)));
    Ok(summaries)
}

/// Full records of one object, or `None` if it has never been stored.
pub fn detail(root: &Path, identity: &Identity, view: View) -> Result<Option<ObjectDetail>> {
    identity
        .validate()
        .map_err(|err| StoreError::invalid_identity(identity, &err))?;
    let dir = root.join(identity.relative_dir());
    if !layout::state_path(&dir).is_file() {
        return Ok(None);
    }
    let snap = snapshot(&dir, view)?;
    let anchor_status = match &snap.record {
        Some(record) if record.kind == MigrationKind::Pointer => {
            Some(read_state(resolve_anchor(record))?.status())
        }
        _ => None,
    };
    let (state, metadata) = match view {
        View::Resolved => (
            snap.effective_state,
            read_metadata(&snap.resolution.effective)?,
        ),
        View::Original => (snap.state, read_metadata(&dir)?),
    };
    Ok(Some(ObjectDetail {
        namespace: identity.namespace.clone(),
        hash: identity.hash.clone(),
        directory: dir.clone(),
        view,
        link: snap.resolution.link.label().to_string(),
        effective_directory: snap.resolution.effective,
        anchor_status,
        state,
        metadata,
        migration: snap.record,
        events: read_events(&dir)?,
    }))
}

/// Totals over every directory's own records.
pub fn stats(root: &Path) -> Result<DashboardStats> {
    let mut stats = DashboardStats::default();
    for summary in scan(root, &ScanFilter::default(), View::Original)? {
        stats.total += 1;
        if summary.error.is_some() {
            stats.unreadable += 1;
            continue;
        }
        *stats.by_result_status.entry(summary.result_status).or_default() += 1;
        match summary.result_status {
            ResultStatus::Success => stats.success += 1,
            ResultStatus::Failed => stats.failed += 1,
            _ => {}
        }
        if let Some(phase) = summary.attempt_phase {
            *stats.by_attempt_phase.entry(phase).or_default() += 1;
            match phase {
                AttemptPhase::Running => stats.running += 1,
                AttemptPhase::Queued => stats.queued += 1,
            }
        }
        match summary.link.as_str() {
            "active" => stats.active_aliases += 1,
            "detached" => stats.detached_aliases += 1,
            _ => {}
        }
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::write_state;
    use cask_domain::StateResult;
    use std::fs;
    use tempfile::tempdir;

    fn put(root: &Path, rel: &str, status: ResultStatus) -> Result<PathBuf> {
        let dir = root.join(rel);
        write_state(
            &dir,
            StateRecord {
                result: StateResult::with_status(status),
                ..StateRecord::default()
            },
        )?;
        Ok(dir)
    }

    #[test]
    fn identity_is_parsed_from_path() {
        let root = Path::new("/data");
        assert_eq!(
            parse_identity(root, Path::new("/data/proj/pipelines/Train/abc123")),
            ("proj.pipelines.Train".to_string(), "abc123".to_string())
        );
        assert_eq!(
            parse_identity(root, Path::new("/data/lonely")),
            ("lonely".to_string(), String::new())
        );
    }

    #[test]
    fn scan_filters_and_orders_newest_first() -> Result<()> {
        let temp = tempdir()?;
        put(temp.path(), "a/Train/h1", ResultStatus::Success)?;
        put(temp.path(), "a/Eval/h2", ResultStatus::Failed)?;
        put(temp.path(), "b/Train/h3", ResultStatus::Success)?;

        let all = scan(temp.path(), &ScanFilter::default(), View::Original)?;
        let hashes: Vec<&str> = all.iter().map(|s| s.hash.as_str()).collect();
        assert_eq!(hashes, ["h3", "h2", "h1"]);

        let filter = ScanFilter {
            result_status: Some(ResultStatus::Success),
            namespace_prefix: Some("a.".into()),
            ..ScanFilter::default()
        };
        let hits = scan(temp.path(), &filter, View::Original)?;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].namespace, "a.Train");
        Ok(())
    }

    #[test]
    fn corrupt_state_is_reported_not_fatal() -> Result<()> {
        let temp = tempdir()?;
        put(temp.path(), "a/Train/good", ResultStatus::Success)?;
        let bad = put(temp.path(), "a/Train/bad", ResultStatus::Success)?;
        fs::write(layout::state_path(&bad), "{oops")?;

        let all = scan(temp.path(), &ScanFilter::default(), View::Original)?;
        assert_eq!(all.len(), 2);
        let broken = all.iter().find(|s| s.hash == "bad").expect("bad listed");
        assert!(broken.error.is_some());
        assert_eq!(all.last().map(|s| s.hash.as_str()), Some("bad"));

        let stats = stats(temp.path())?;
        assert_eq!(stats.total, 2);
        assert_eq!(stats.unreadable, 1);
        assert_eq!(stats.success, 1);
        Ok(())
    }

    #[test]
    fn missing_root_scans_empty() -> Result<()> {
        let temp = tempdir()?;
        let missing = temp.path().join("nope");
        assert!(scan(&missing, &ScanFilter::default(), View::Resolved)?.is_empty());
        assert_eq!(stats(&missing)?.total, 0);
        assert!(detail(&missing, &Identity::new("a", "b"), View::Original)?.is_none());
        Ok(())
    }
}
