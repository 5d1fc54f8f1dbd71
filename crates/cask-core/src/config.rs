use std::collections::{BTreeSet, HashMap};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};

pub const ROOT_ENV: &str = "CASK_PATH";
pub const POLL_INTERVAL_ENV: &str = "CASK_POLL_INTERVAL_SECS";
pub const MAX_WAIT_ENV: &str = "CASK_MAX_WAIT_SECS";
pub const LEASE_ENV: &str = "CASK_LEASE_SECS";
pub const HEARTBEAT_ENV: &str = "CASK_HEARTBEAT_SECS";
pub const STALE_AFTER_ENV: &str = "CASK_STALE_AFTER_SECS";
pub const FORCE_RECOMPUTE_ENV: &str = "CASK_FORCE_RECOMPUTE";

const DEFAULT_ROOT_DIR: &str = "data-cask";
const DEFAULT_POLL_SECS: f64 = 10.0;
const DEFAULT_LEASE_SECS: f64 = 120.0;
const DEFAULT_STALE_SECS: f64 = 30.0 * 60.0;

#[derive(Debug, Clone)]
pub(crate) struct EnvSnapshot {
    vars: HashMap<String, String>,
}

impl EnvSnapshot {
    pub(crate) fn capture() -> Self {
        Self {
            vars: env::vars().collect(),
        }
    }

    pub(crate) fn var(&self, key: &str) -> Option<&str> {
        self.vars
            .get(key)
            .map(String::as_str)
            .filter(|value| !value.trim().is_empty())
    }

    fn seconds(&self, key: &str) -> Result<Option<Duration>> {
        let Some(raw) = self.var(key) else {
            return Ok(None);
        };
        let secs: f64 = raw
            .trim()
            .parse()
            .with_context(|| format!("{key} must be a number of seconds, got {raw:?}"))?;
        if !secs.is_finite() || secs < 0.0 {
            bail!("{key} must be a non-negative number of seconds, got {raw:?}");
        }
        let duration = Duration::try_from_secs_f64(secs)
            .with_context(|| format!("{key} is out of range, got {raw:?}"))?;
        Ok(Some(duration))
    }

    #[cfg(test)]
    pub(crate) fn testing(pairs: &[(&str, &str)]) -> Self {
        let vars = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Self { vars }
    }
}

/// Timing knobs for attempt ownership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptConfig {
    pub poll_interval: Duration,
    pub max_wait: Option<Duration>,
    pub lease_duration: Duration,
    pub heartbeat_interval: Duration,
    pub stale_after: Duration,
}

impl Default for AttemptConfig {
    fn default() -> Self {
        let lease_duration = Duration::from_secs_f64(DEFAULT_LEASE_SECS);
        Self {
            poll_interval: Duration::from_secs_f64(DEFAULT_POLL_SECS),
            max_wait: None,
            lease_duration,
            heartbeat_interval: default_heartbeat(lease_duration),
            stale_after: Duration::from_secs_f64(DEFAULT_STALE_SECS),
        }
    }
}

fn default_heartbeat(lease: Duration) -> Duration {
    (lease / 3).max(Duration::from_secs(1))
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub root: PathBuf,
    pub attempts: AttemptConfig,
    /// Namespaces that always recompute, as if `force_recompute` were set.
    pub force_recompute: BTreeSet<String>,
}

impl StoreConfig {
    /// Defaults rooted at `root`, ignoring the environment.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            attempts: AttemptConfig::default(),
            force_recompute: BTreeSet::new(),
        }
    }

    /// Builds a configuration from the current process environment.
    ///
    /// # Errors
    /// Returns an error if a variable holds an invalid value or the working
    /// directory cannot be determined.
    pub fn from_env() -> Result<Self> {
        Self::from_snapshot(&EnvSnapshot::capture())
    }

    pub(crate) fn from_snapshot(snapshot: &EnvSnapshot) -> Result<Self> {
        let root = match snapshot.var(ROOT_ENV) {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_ROOT_DIR),
        };
        let root = if root.is_absolute() {
            root
        } else {
            env::current_dir()
                .context("failed to resolve the working directory")?
                .join(root)
        };

        let defaults = AttemptConfig::default();
        let lease_duration = snapshot
            .seconds(LEASE_ENV)?
            .unwrap_or(defaults.lease_duration);
        let attempts = AttemptConfig {
            poll_interval: snapshot
                .seconds(POLL_INTERVAL_ENV)?
                .unwrap_or(defaults.poll_interval),
            max_wait: snapshot.seconds(MAX_WAIT_ENV)?,
            lease_duration,
            heartbeat_interval: snapshot
                .seconds(HEARTBEAT_ENV)?
                .unwrap_or_else(|| default_heartbeat(lease_duration)),
            stale_after: snapshot
                .seconds(STALE_AFTER_ENV)?
                .unwrap_or(defaults.stale_after),
        };

        let force_recompute = snapshot
            .var(FORCE_RECOMPUTE_ENV)
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|item| !item.is_empty())
                    .map(ToOwned::to_owned)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            root,
            attempts,
            force_recompute,
        })
    }

    #[must_use]
    pub fn forces(&self, namespace: &str) -> bool {
        self.force_recompute.contains(namespace)
    }
}
