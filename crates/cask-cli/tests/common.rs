#![allow(dead_code)]

use std::fs;
use std::path::Path;

use anyhow::Result;
use assert_cmd::assert::Assert;
use cask_core::{Config, Identity, Metadata, ObjectStore, SchemaVersion, StoreConfig, Task};
use serde_json::{json, Value};

/// Minimal task that stores its config as `value.json`.
pub struct Seed {
    metadata: Metadata,
}

impl Seed {
    pub fn new(namespace: &str, value: i64) -> Self {
        let mut config = Config::new();
        config.insert("value".into(), json!(value));
        Self {
            metadata: Metadata::new(namespace, config, SchemaVersion::DEFAULT),
        }
    }

    pub fn identity(&self) -> Identity {
        self.metadata.identity()
    }
}

impl Task for Seed {
    type Output = Value;

    fn metadata(&self) -> Metadata {
        self.metadata.clone()
    }

    fn create(&self, dir: &Path) -> Result<Value> {
        let value = json!({ "value": self.metadata.config["value"] });
        fs::create_dir_all(dir)?;
        fs::write(dir.join("value.json"), serde_json::to_vec(&value)?)?;
        Ok(value)
    }

    fn load(&self, dir: &Path) -> Result<Value> {
        Ok(serde_json::from_slice(&fs::read(dir.join("value.json"))?)?)
    }
}

pub fn store(root: &Path) -> ObjectStore {
    ObjectStore::new(StoreConfig::with_root(root))
}

/// Compute `seed` under `root` and return its identity.
pub fn seed(root: &Path, namespace: &str, value: i64) -> Identity {
    let task = Seed::new(namespace, value);
    store(root).load_or_create(&task, false).expect("seed object");
    task.identity()
}

pub fn parse_json(assert: &Assert) -> Value {
    serde_json::from_slice(&assert.get_output().stdout).expect("valid json")
}
