//! Version-keyed config transforms applied when reading metadata written
//! under an older schema.
//!
//! Single-hop transforms are preferred. When no direct step exists the
//! registry refuses unless chains were explicitly allowed, and even then it
//! warns about every multi-hop upgrade it performs.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

use tracing::warn;

use crate::identity::SchemaVersion;
use crate::metadata::{Config, Metadata};

type Transform = Box<dyn Fn(&mut Config) -> anyhow::Result<()> + Send + Sync>;

struct Step {
    to: SchemaVersion,
    transform: Transform,
}

#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("no schema upgrade registered for {namespace} from {from} to {to}")]
    NoPath {
        namespace: String,
        from: SchemaVersion,
        to: SchemaVersion,
    },
    #[error(
        "schema upgrade for {namespace} from {from} to {to} needs {hops} steps; \
         multi-hop upgrades must be enabled explicitly"
    )]
    ChainRequired {
        namespace: String,
        from: SchemaVersion,
        to: SchemaVersion,
        hops: usize,
    },
    #[error("schema transform {from} -> {to} for {namespace} failed: {error:#}")]
    TransformFailed {
        namespace: String,
        from: SchemaVersion,
        to: SchemaVersion,
        error: anyhow::Error,
    },
}

/// Result of bringing a stored config up to a target version.
#[derive(Clone, Debug, PartialEq)]
pub struct UpgradedConfig {
    pub config: Config,
    pub from: SchemaVersion,
    pub to: SchemaVersion,
    pub hops: usize,
}

#[derive(Default)]
pub struct SchemaRegistry {
    steps: HashMap<(String, u64), Vec<Step>>,
    allow_chains: bool,
}

impl fmt::Debug for SchemaRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemaRegistry")
            .field("steps", &self.steps.len())
            .field("allow_chains", &self.allow_chains)
            .finish()
    }
}

impl SchemaRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Permit upgrades that need more than one registered step.
    #[must_use]
    pub fn allow_chains(mut self, allow: bool) -> Self {
        self.allow_chains = allow;
        self
    }

    pub fn register<F>(
        &mut self,
        namespace: impl Into<String>,
        from: SchemaVersion,
        to: SchemaVersion,
        transform: F,
    ) -> &mut Self
    where
        F: Fn(&mut Config) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.steps
            .entry((namespace.into(), from.key()))
            .or_default()
            .push(Step {
                to,
                transform: Box::new(transform),
            });
        self
    }

    fn steps_from(&self, namespace: &str, from: SchemaVersion) -> &[Step] {
        self.steps
            .get(&(namespace.to_string(), from.key()))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Shortest sequence of versions leading from `from` to `to`.
    fn plan(
        &self,
        namespace: &str,
        from: SchemaVersion,
        to: SchemaVersion,
    ) -> Option<Vec<SchemaVersion>> {
        let mut queue = VecDeque::from([vec![from]]);
        let mut seen = HashSet::from([from.key()]);
        while let Some(path) = queue.pop_front() {
            let current = *path.last()?;
            for step in self.steps_from(namespace, current) {
                if !seen.insert(step.to.key()) {
                    continue;
                }
                let mut next = path.clone();
                next.push(step.to);
                if step.to.key() == to.key() {
                    return Some(next);
                }
                queue.push_back(next);
            }
        }
        None
    }

    /// Upgrade the config in `metadata` to `target`. The stored record is
    /// never rewritten; callers get the transformed copy.
    pub fn upgrade(
        &self,
        metadata: &Metadata,
        target: SchemaVersion,
    ) -> Result<UpgradedConfig, SchemaError> {
        let from = metadata.version;
        if from.key() == target.key() {
            return Ok(UpgradedConfig {
                config: metadata.config.clone(),
                from,
                to: target,
                hops: 0,
            });
        }
        let namespace = metadata.namespace.as_str();
        let path = self
            .plan(namespace, from, target)
            .ok_or_else(|| SchemaError::NoPath {
                namespace: namespace.to_string(),
                from,
                to: target,
            })?;
        let hops = path.len() - 1;
        if hops > 1 {
            if !self.allow_chains {
                return Err(SchemaError::ChainRequired {
                    namespace: namespace.to_string(),
                    from,
                    to: target,
                    hops,
                });
            }
            warn!(namespace, %from, to = %target, hops, "applying multi-hop schema upgrade");
        }

        let mut config = metadata.config.clone();
        for pair in path.windows(2) {
            let (step_from, step_to) = (pair[0], pair[1]);
            let step = self
                .steps_from(namespace, step_from)
                .iter()
                .find(|step| step.to.key() == step_to.key())
                .ok_or_else(|| SchemaError::NoPath {
                    namespace: namespace.to_string(),
                    from: step_from,
                    to: step_to,
                })?;
            (step.transform)(&mut config).map_err(|error| SchemaError::TransformFailed {
                namespace: namespace.to_string(),
                from: step_from,
                to: step_to,
                error,
            })?;
        }
        Ok(UpgradedConfig {
            config,
            from,
            to: target,
            hops,
        })
    }
}
