#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Result};
use cask_core::{
    AttemptConfig, AttemptPhase, Config, Identity, Metadata, ObjectStore, SchemaVersion,
    StoreConfig, Task,
};
use serde_json::{json, Value};

pub const PAYLOAD_FILE: &str = "value.json";

/// Test task: writes `value.json` holding its seed and how many times it
/// has been computed.
#[derive(Clone)]
pub struct Exp {
    metadata: Metadata,
    calls: Arc<AtomicUsize>,
    fail: Arc<AtomicBool>,
    panic: bool,
    delay: Duration,
    phase: AttemptPhase,
}

impl Exp {
    pub fn new(namespace: &str, seed: i64) -> Self {
        Self::versioned(namespace, seed, SchemaVersion::DEFAULT)
    }

    pub fn versioned(namespace: &str, seed: i64, version: SchemaVersion) -> Self {
        let mut config = Config::new();
        config.insert("seed".into(), json!(seed));
        Self {
            metadata: Metadata::new(namespace, config, version),
            calls: Arc::new(AtomicUsize::new(0)),
            fail: Arc::new(AtomicBool::new(false)),
            panic: false,
            delay: Duration::ZERO,
            phase: AttemptPhase::Running,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing(self) -> Self {
        self.fail.store(true, Ordering::SeqCst);
        self
    }

    pub fn panicking(mut self) -> Self {
        self.panic = true;
        self
    }

    pub fn queued(mut self) -> Self {
        self.phase = AttemptPhase::Queued;
        self
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn meta(&self) -> &Metadata {
        &self.metadata
    }

    pub fn identity(&self) -> Identity {
        self.metadata.identity()
    }
}

impl Task for Exp {
    type Output = Value;

    fn metadata(&self) -> Metadata {
        self.metadata.clone()
    }

    fn create(&self, dir: &Path) -> Result<Value> {
        let run = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        if self.panic {
            panic!("task panicked mid-compute");
        }
        if self.fail.load(Ordering::SeqCst) {
            bail!("seed {} refused to converge", self.metadata.config["seed"]);
        }
        let value = json!({
            "namespace": self.metadata.namespace,
            "seed": self.metadata.config["seed"],
            "run": run,
        });
        fs::create_dir_all(dir)?;
        fs::write(dir.join(PAYLOAD_FILE), serde_json::to_vec(&value)?)?;
        Ok(value)
    }

    fn load(&self, dir: &Path) -> Result<Value> {
        let raw = fs::read(dir.join(PAYLOAD_FILE))?;
        Ok(serde_json::from_slice(&raw)?)
    }

    fn attempt_phase(&self) -> AttemptPhase {
        self.phase
    }
}

pub fn quick_config(root: impl Into<PathBuf>) -> StoreConfig {
    let mut config = StoreConfig::with_root(root);
    config.attempts = AttemptConfig {
        poll_interval: Duration::from_millis(20),
        max_wait: None,
        lease_duration: Duration::from_secs(30),
        heartbeat_interval: Duration::from_secs(10),
        stale_after: Duration::from_secs(600),
    };
    config
}

pub fn store(root: &Path) -> ObjectStore {
    ObjectStore::new(quick_config(root))
}

pub fn payload_in(dir: &Path) -> Value {
    let raw = fs::read(dir.join(PAYLOAD_FILE)).expect("payload present");
    serde_json::from_slice(&raw).expect("payload json")
}
