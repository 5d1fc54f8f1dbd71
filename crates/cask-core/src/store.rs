use std::path::{Path, PathBuf};
use std::thread;
use std::time::Instant;

use anyhow::{bail, Result};
use cask_domain::{
    Attempt, AttemptPhase, ErrorDetail, Event, EventKind, Identity, Metadata, MigrationRecord,
    ResultStatus, SchemaRegistry, SchemaVersion, StateRecord, StateResult,
};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::attempt::{self, AttemptHandle, Claim, LOCAL_BACKEND};
use crate::clock;
use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::events;
use crate::persistence;
use crate::records::{self, OverwriteOutcome};
use crate::resolution::{self, DetachReason, LinkState, Resolution};

/// The compute collaborator for one object.
pub trait Task {
    type Output;

    /// Identity and configuration of the object this task produces.
    fn metadata(&self) -> Metadata;

    /// Compute the payload into `dir` and return it.
    fn create(&self, dir: &Path) -> Result<Self::Output>;

    /// Read a previously computed payload from `dir`.
    fn load(&self, dir: &Path) -> Result<Self::Output>;

    fn backend(&self) -> &str {
        LOCAL_BACKEND
    }

    /// Phase recorded for new attempts. Backends that hand work to a queue
    /// report [`AttemptPhase::Queued`].
    fn attempt_phase(&self) -> AttemptPhase {
        AttemptPhase::Running
    }
}

#[derive(Debug, Clone)]
pub struct ObjectStore {
    config: StoreConfig,
}

impl ObjectStore {
    #[must_use]
    pub fn new(config: StoreConfig) -> Self {
        Self { config }
    }

    /// Store rooted at `root` with default settings.
    pub fn open(root: impl Into<PathBuf>) -> Self {
        Self::new(StoreConfig::with_root(root))
    }

    pub fn from_env() -> Result<Self> {
        Ok(Self::new(StoreConfig::from_env()?))
    }

    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.config.root
    }

    /// Directory an identity maps to, whether or not it exists yet.
    /// Identities whose names would escape the root are `InvalidIdentity`.
    pub fn object_dir(&self, identity: &Identity) -> Result<PathBuf> {
        identity
            .validate()
            .map_err(|err| StoreError::invalid_identity(identity, &err))?;
        Ok(self.config.root.join(identity.relative_dir()))
    }

    /// Resolve an identity to the directory that serves it, repairing a
    /// half-applied detach on the way.
    pub fn resolve(&self, identity: &Identity) -> Result<Resolution> {
        self.resolve_dir(&self.object_dir(identity)?)
    }

    pub fn exists(&self, identity: &Identity) -> Result<bool> {
        Ok(self.resolve(identity)?.exists())
    }

    pub fn effective_directory(&self, identity: &Identity) -> Result<PathBuf> {
        Ok(self.resolve(identity)?.effective)
    }

    pub fn state(&self, identity: &Identity) -> Result<StateRecord> {
        persistence::read_state(&self.object_dir(identity)?)
    }

    /// The attempt currently working on `identity`, if any.
    pub fn attempt(&self, identity: &Identity) -> Result<Option<Attempt>> {
        let state = self.state(identity)?;
        Ok(state.attempt.filter(|_| state.result.status == ResultStatus::Pending))
    }

    pub fn metadata(&self, identity: &Identity) -> Result<Option<Metadata>> {
        persistence::read_metadata(&self.object_dir(identity)?)
    }

    pub fn migration_record(&self, identity: &Identity) -> Result<Option<MigrationRecord>> {
        records::read_record(&self.object_dir(identity)?)
    }

    pub fn events(&self, identity: &Identity) -> Result<Vec<Event>> {
        events::read_events(&self.object_dir(identity)?)
    }

    /// Metadata of `identity` brought up to `target` through `registry`,
    /// ready to be used as the destination of a migration.
    pub fn upgrade_metadata(
        &self,
        identity: &Identity,
        registry: &SchemaRegistry,
        target: SchemaVersion,
    ) -> Result<Metadata> {
        let dir = self.object_dir(identity)?;
        match persistence::load_metadata(&dir, registry, target)? {
            Some(metadata) => Ok(metadata),
            None => bail!("no metadata stored for {identity} in {}", dir.display()),
        }
    }

    /// Serve the object described by `task`, computing it only when no
    /// usable result exists.
    ///
    /// An active alias is served from its anchor. With `force_recompute`
    /// (or a namespace listed in `CASK_FORCE_RECOMPUTE`) the alias is
    /// detached first and the object is recomputed in its own directory.
    pub fn load_or_create<T: Task>(&self, task: &T, force_recompute: bool) -> Result<T::Output> {
        let metadata = task.metadata();
        let identity = metadata.identity();
        let force = force_recompute || self.config.forces(&identity.namespace);
        let dir = self.object_dir(&identity)?;
        let resolution = self.resolve_dir(&dir)?;

        if let LinkState::Active { record } = &resolution.link {
            if !force {
                debug!(
                    %identity,
                    anchor = %resolution.effective.display(),
                    "serving alias from anchor"
                );
                return task.load(&resolution.effective);
            }
            self.detach(&dir, record, "force_recompute")?;
        }
        self.compute(task, &metadata, &dir, force)
    }

    /// Compute `task` in its own directory, ignoring any cached result.
    /// Refuses to touch a directory that is an active alias.
    pub fn create<T: Task>(&self, task: &T) -> Result<T::Output> {
        let metadata = task.metadata();
        let dir = self.object_dir(&metadata.identity())?;
        let resolution = self.resolve_dir(&dir)?;
        if resolution.is_active_alias() {
            return Err(StoreError::MigrationBlocked {
                dir,
                anchor: resolution.effective,
            }
            .into());
        }
        self.compute(task, &metadata, &dir, true)
    }

    /// Force a directory to `failed` and drop its success marker. Aliases
    /// of it detach on their next resolution. Returns the previous status.
    pub fn invalidate(&self, identity: &Identity, reason: &str) -> Result<ResultStatus> {
        let dir = self.object_dir(identity)?;
        if !dir.is_dir() {
            bail!("no object stored for {identity} at {}", dir.display());
        }
        let mut previous = ResultStatus::None;
        persistence::update_state(&dir, |state| {
            previous = state.status();
            if previous == ResultStatus::Migrated {
                return Err(StoreError::InvalidMigration(format!(
                    "{} is a migration pointer; invalidate its anchor or force recomputation",
                    dir.display()
                ))
                .into());
            }
            state.result = StateResult::failed(ErrorDetail::new("invalidated", reason));
            state.attempt = None;
            persistence::remove_success_marker(&dir)?;
            Ok(())
        })?;
        events::append(
            &dir,
            EventKind::Invalidate,
            json!({"reason": reason, "previous_status": previous}),
        )?;
        info!(%identity, %previous, reason, "object invalidated");
        Ok(previous)
    }

    fn resolve_dir(&self, dir: &Path) -> Result<Resolution> {
        let resolution = resolution::resolve_dir(dir)?;
        self.converge(&resolution)?;
        Ok(resolution)
    }

    /// Finish a detach that stopped after marking only one side of a link.
    fn converge(&self, resolution: &Resolution) -> Result<()> {
        let LinkState::Detached { record, reason } = &resolution.link else {
            return Ok(());
        };
        let (target, at) = match reason {
            DetachReason::Overwritten => (
                records::resolve_anchor(record).to_path_buf(),
                record.overwritten_at.clone(),
            ),
            DetachReason::AnchorOverwritten => (
                resolution.requested.clone(),
                records::read_record(records::resolve_anchor(record))?
                    .filter(|seen| seen.same_link(record))
                    .and_then(|seen| seen.overwritten_at),
            ),
            DetachReason::AnchorNotSuccessful(_) => return Ok(()),
        };
        let Some(at) = at else {
            return Ok(());
        };
        if records::mark_link_overwritten(&target, record, &at)? == OverwriteOutcome::Marked {
            warn!(
                dir = %target.display(),
                policy = %record.policy,
                overwritten_at = %at,
                "repaired half-applied detach"
            );
        }
        Ok(())
    }

    /// Sever a live link: mark the pointer, then the anchor, then record the
    /// overwrite in both logs.
    pub(crate) fn detach(
        &self,
        pointer: &Path,
        record: &MigrationRecord,
        reason: &str,
    ) -> Result<()> {
        let at = clock::timestamp()?;
        let anchor = records::resolve_anchor(record);
        let pointer_outcome = records::mark_link_overwritten(pointer, record, &at)?;
        let anchor_outcome = records::mark_link_overwritten(anchor, record, &at)?;
        info!(
            pointer = %pointer.display(),
            anchor = %anchor.display(),
            policy = %record.policy,
            reason,
            ?pointer_outcome,
            ?anchor_outcome,
            "link detached"
        );
        if pointer_outcome != OverwriteOutcome::Marked {
            return Ok(());
        }
        let payload = json!({
            "policy": record.policy,
            "from": record.from,
            "to": record.to,
            "reason": reason,
            "overwritten_at": at,
        });
        events::append(pointer, EventKind::MigrationOverwrite, payload.clone())?;
        events::append(anchor, EventKind::MigrationOverwrite, payload)?;
        Ok(())
    }

    fn compute<T: Task>(
        &self,
        task: &T,
        metadata: &Metadata,
        dir: &Path,
        force: bool,
    ) -> Result<T::Output> {
        persistence::write_metadata(dir, metadata)?;
        let settings = &self.config.attempts;
        let started = Instant::now();
        // A forced request ignores the cached result until it has seen
        // another owner at work; that owner's outcome is then final.
        let mut stop_on: &[ResultStatus] = if force {
            &[]
        } else {
            &[ResultStatus::Success]
        };
        loop {
            let claim = attempt::try_claim(
                dir,
                settings,
                task.backend(),
                task.attempt_phase(),
                stop_on,
            )?;
            match claim {
                Claim::Acquired(handle) => return Self::run(task, metadata, dir, handle),
                Claim::Finished(state) if state.status() == ResultStatus::Success => {
                    debug!(dir = %dir.display(), "serving cached result");
                    return task.load(dir);
                }
                Claim::Finished(state) => {
                    let message = state
                        .result
                        .error
                        .map_or_else(|| format!("status {}", state.result.status), |e| e.message);
                    return Err(StoreError::ComputeFailed {
                        dir: dir.to_path_buf(),
                        message,
                    }
                    .into());
                }
                Claim::Linked(anchor) => {
                    return Err(StoreError::MigrationBlocked {
                        dir: dir.to_path_buf(),
                        anchor,
                    }
                    .into());
                }
                Claim::Busy(current) => {
                    stop_on = &[ResultStatus::Success, ResultStatus::Failed];
                    let waited = started.elapsed();
                    if settings.max_wait.is_some_and(|limit| waited >= limit) {
                        return Err(StoreError::WaitTimeout {
                            dir: dir.to_path_buf(),
                            waited_secs: waited.as_secs(),
                        }
                        .into());
                    }
                    debug!(
                        dir = %dir.display(),
                        attempt = %current.id,
                        phase = %current.phase,
                        pid = current.owner.pid,
                        "waiting for attempt owned elsewhere"
                    );
                    let pause = settings.max_wait.map_or(settings.poll_interval, |limit| {
                        settings.poll_interval.min(limit.saturating_sub(waited))
                    });
                    thread::sleep(pause);
                }
            }
        }
    }

    fn run<T: Task>(
        task: &T,
        metadata: &Metadata,
        dir: &Path,
        handle: AttemptHandle,
    ) -> Result<T::Output> {
        let attempt_id = handle.id().to_string();
        info!(
            identity = %metadata.identity(),
            dir = %dir.display(),
            attempt = %attempt_id,
            number = handle.number(),
            "computing object"
        );
        match task.create(dir) {
            Ok(output) => {
                handle.succeed()?;
                events::append(
                    dir,
                    EventKind::Create,
                    json!({
                        "attempt_id": attempt_id,
                        "namespace": metadata.namespace,
                        "hash": metadata.hash,
                    }),
                )?;
                Ok(output)
            }
            Err(err) => {
                let message = format!("{err:#}");
                handle.fail(ErrorDetail::new("compute", message.clone()))?;
                events::append(
                    dir,
                    EventKind::CreateFailed,
                    json!({"attempt_id": attempt_id, "error": message}),
                )?;
                warn!(dir = %dir.display(), error = %message, "compute failed");
                Err(err.context(StoreError::ComputeFailed {
                    dir: dir.to_path_buf(),
                    message,
                }))
            }
        }
    }
}
