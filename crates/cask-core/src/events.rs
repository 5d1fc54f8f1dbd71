use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::Path;

use anyhow::{Context, Result};
use cask_domain::{Event, EventKind};
use serde_json::Value;
use tracing::{debug, warn};

use crate::clock;
use crate::layout;

/// Append one event to the log of `dir`. The line is written with a single
/// `write_all` on an `O_APPEND` handle so concurrent writers interleave
/// whole records.
pub fn append(dir: &Path, kind: EventKind, payload: Value) -> Result<Event> {
    let event = Event {
        kind: kind.as_str().to_string(),
        timestamp: clock::timestamp()?,
        payload,
    };
    let path = layout::events_path(dir);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let mut line = serde_json::to_vec(&event)?;
    line.push(b'\n');
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    file.write_all(&line)
        .with_context(|| format!("failed to append to {}", path.display()))?;
    debug!(dir = %dir.display(), event = %kind, "event appended");
    Ok(event)
}

/// Every decodable event of `dir`, oldest first.
pub fn read_events(dir: &Path) -> Result<Vec<Event>> {
    let path = layout::events_path(dir);
    let contents = match fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err).with_context(|| format!("failed to read {}", path.display())),
    };
    let mut events = Vec::new();
    for (idx, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Event>(line) {
            Ok(event) => events.push(event),
            Err(err) => warn!(
                path = %path.display(),
                line = idx + 1,
                %err,
                "skipping undecodable event"
            ),
        }
    }
    Ok(events)
}
