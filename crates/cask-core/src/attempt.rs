//! Compute attempt ownership.
//!
//! At most one attempt owns a directory. Claiming is a conditional write
//! under the directory lock: the claim fails while another attempt holds an
//! unexpired lease with a fresh heartbeat. Every later write by the owner
//! checks that the state still carries its token.

use std::env;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{bail, Result};
use cask_domain::{
    Attempt, AttemptPhase, ErrorDetail, EventKind, Owner, ResultStatus, StateRecord, StateResult,
};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::clock;
use crate::config::AttemptConfig;
use crate::events;
use crate::fs::FileLock;
use crate::layout;
use crate::persistence::{read_state, remove_success_marker, write_state, write_success_marker};
use crate::resolution::resolve_with_state;

pub(crate) const LOCAL_BACKEND: &str = "local";

pub(crate) fn current_owner() -> Owner {
    let lookup = |keys: &[&str]| {
        keys.iter()
            .find_map(|key| env::var(key).ok().filter(|value| !value.is_empty()))
    };
    Owner {
        pid: std::process::id(),
        host: lookup(&["HOSTNAME", "COMPUTERNAME"]),
        user: lookup(&["USER", "USERNAME"]),
    }
}

fn new_token() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

/// True while `attempt` may still be making progress.
pub(crate) fn is_live(attempt: &Attempt, config: &AttemptConfig) -> bool {
    let now = clock::now();
    let (Some(lease), Some(heartbeat)) = (
        clock::parse(&attempt.lease_expires_at),
        clock::parse(&attempt.heartbeat_at),
    ) else {
        warn!(attempt = %attempt.id, "attempt has unreadable timestamps; treating it as stale");
        return false;
    };
    lease > now && clock::after(heartbeat, config.stale_after) > now
}

/// Result of one claim attempt.
#[derive(Debug)]
pub(crate) enum Claim {
    Acquired(AttemptHandle),
    /// Another live attempt owns the directory.
    Busy(Attempt),
    /// The directory already reached one of the requested stop statuses.
    Finished(StateRecord),
    /// The directory became an active alias since the caller resolved it.
    Linked(PathBuf),
}

/// Try to become the owner of `dir`, unless its status is one of `stop_on`.
pub(crate) fn try_claim(
    dir: &Path,
    config: &AttemptConfig,
    backend: &str,
    phase: AttemptPhase,
    stop_on: &[ResultStatus],
) -> Result<Claim> {
    let _lock = FileLock::acquire(&layout::lock_path(dir))?;
    let state = read_state(dir)?;
    let status = state.status();
    if stop_on.contains(&status) {
        return Ok(Claim::Finished(state));
    }
    if status == ResultStatus::Migrated {
        let resolution = resolve_with_state(dir, &state)?;
        if resolution.is_active_alias() {
            return Ok(Claim::Linked(resolution.effective));
        }
    }
    if status == ResultStatus::Pending {
        match &state.attempt {
            Some(current) if is_live(current, config) => {
                return Ok(Claim::Busy(current.clone()));
            }
            Some(stale) => {
                warn!(
                    dir = %dir.display(),
                    attempt = %stale.id,
                    pid = stale.owner.pid,
                    "reclaiming stale attempt"
                );
                events::append(
                    dir,
                    EventKind::AttemptReclaimed,
                    json!({
                        "attempt_id": stale.id,
                        "number": stale.number,
                        "owner": stale.owner,
                        "heartbeat_at": stale.heartbeat_at,
                        "lease_expires_at": stale.lease_expires_at,
                    }),
                )?;
            }
            None => warn!(dir = %dir.display(), "pending state has no attempt; reclaiming"),
        }
    }

    let now = clock::now();
    let started_at = clock::format(now)?;
    let attempt = Attempt {
        id: new_token(),
        number: state.next_attempt_number(),
        phase,
        backend: backend.to_string(),
        owner: current_owner(),
        started_at: started_at.clone(),
        heartbeat_at: started_at,
        lease_expires_at: clock::format(clock::after(now, config.lease_duration))?,
    };
    remove_success_marker(dir)?;
    write_state(
        dir,
        StateRecord {
            result: StateResult::with_status(ResultStatus::Pending),
            attempt: Some(attempt.clone()),
            ..state
        },
    )?;
    info!(
        dir = %dir.display(),
        attempt = %attempt.id,
        number = attempt.number,
        "attempt claimed"
    );
    let heartbeat = Heartbeat::start(dir, &attempt.id, config);
    Ok(Claim::Acquired(AttemptHandle {
        dir: dir.to_path_buf(),
        attempt,
        heartbeat: Some(heartbeat),
        finished: false,
    }))
}

/// Extend the lease of `token` on `dir`. Returns `false` once the token no
/// longer owns a pending attempt.
fn renew(dir: &Path, token: &str, lease: Duration) -> Result<bool> {
    let _lock = FileLock::acquire(&layout::lock_path(dir))?;
    let mut state = read_state(dir)?;
    if state.status() != ResultStatus::Pending {
        return Ok(false);
    }
    let Some(attempt) = state.attempt.as_mut().filter(|attempt| attempt.id == token) else {
        return Ok(false);
    };
    let now = clock::now();
    attempt.heartbeat_at = clock::format(now)?;
    attempt.lease_expires_at = clock::format(clock::after(now, lease))?;
    write_state(dir, state)?;
    Ok(true)
}

#[derive(Debug)]
struct Heartbeat {
    dir: PathBuf,
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Heartbeat {
    fn start(dir: &Path, token: &str, config: &AttemptConfig) -> Self {
        let (stop, stopped) = mpsc::channel::<()>();
        let owned_dir = dir.to_path_buf();
        let dir = dir.to_path_buf();
        let token = token.to_string();
        let interval = config.heartbeat_interval;
        let lease = config.lease_duration;
        let handle = thread::spawn(move || loop {
            match stopped.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => match renew(&dir, &token, lease) {
                    Ok(true) => debug!(dir = %dir.display(), attempt = %token, "lease renewed"),
                    Ok(false) => {
                        warn!(dir = %dir.display(), attempt = %token, "attempt lost ownership");
                        break;
                    }
                    Err(err) => warn!(dir = %dir.display(), %err, "failed to renew lease"),
                },
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        });
        Self {
            dir: owned_dir,
            stop: Some(stop),
            handle: Some(handle),
        }
    }

    /// Stop and join the renewal thread. Returns `false` if it panicked.
    fn stop(&mut self) -> bool {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        let Some(handle) = self.handle.take() else {
            return true;
        };
        match handle.join() {
            Ok(()) => true,
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(ToString::to_string)
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                warn!(dir = %self.dir.display(), %reason, "heartbeat thread panicked");
                false
            }
        }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

/// Ownership of one running attempt. Dropping it without calling
/// [`AttemptHandle::succeed`] or [`AttemptHandle::fail`] marks the directory
/// failed with a `cancelled` error.
#[derive(Debug)]
pub(crate) struct AttemptHandle {
    dir: PathBuf,
    attempt: Attempt,
    heartbeat: Option<Heartbeat>,
    finished: bool,
}

impl AttemptHandle {
    pub(crate) fn id(&self) -> &str {
        &self.attempt.id
    }

    pub(crate) fn number(&self) -> u32 {
        self.attempt.number
    }

    pub(crate) fn succeed(mut self) -> Result<StateRecord> {
        let created_at = clock::timestamp()?;
        self.finish(|dir, attempt_id| {
            write_success_marker(dir, Some(attempt_id))?;
            Ok(StateResult::success(created_at))
        })
    }

    pub(crate) fn fail(mut self, error: ErrorDetail) -> Result<StateRecord> {
        self.finish(|_, _| Ok(StateResult::failed(error)))
    }

    fn finish<F>(&mut self, result: F) -> Result<StateRecord>
    where
        F: FnOnce(&Path, &str) -> Result<StateResult>,
    {
        self.finished = true;
        if let Some(mut heartbeat) = self.heartbeat.take() {
            heartbeat.stop();
        }
        let _lock = FileLock::acquire(&layout::lock_path(&self.dir))?;
        let state = read_state(&self.dir)?;
        let owned = state.status() == ResultStatus::Pending
            && state
                .attempt
                .as_ref()
                .is_some_and(|attempt| attempt.id == self.attempt.id);
        if !owned {
            bail!(
                "attempt {} no longer owns {} (status {})",
                self.attempt.id,
                self.dir.display(),
                state.status()
            );
        }
        let result = result(&self.dir, &self.attempt.id)?;
        let written = write_state(&self.dir, StateRecord { result, ..state })?;
        info!(
            dir = %self.dir.display(),
            attempt = %self.attempt.id,
            status = %written.status(),
            "attempt finished"
        );
        Ok(written)
    }
}

impl Drop for AttemptHandle {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        warn!(dir = %self.dir.display(), attempt = %self.attempt.id, "attempt abandoned");
        let error = ErrorDetail::new("cancelled", "attempt ended before reporting a result");
        if let Err(err) = self.finish(|_, _| Ok(StateResult::failed(error))) {
            warn!(dir = %self.dir.display(), %err, "failed to record cancelled attempt");
        }
    }
}
