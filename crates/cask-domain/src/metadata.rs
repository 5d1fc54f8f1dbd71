use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::identity::{config_hash, Identity, SchemaVersion};

/// Configuration fields of an object, in declaration order.
pub type Config = IndexMap<String, Value>;

/// Identity plus configuration, written once when a directory is created.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub namespace: String,
    pub hash: String,
    #[serde(default, skip_serializing_if = "SchemaVersion::is_default")]
    pub version: SchemaVersion,
    #[serde(default)]
    pub config: Config,
}

impl Metadata {
    /// Build metadata for a configuration, deriving its content hash.
    pub fn new(namespace: impl Into<String>, config: Config, version: SchemaVersion) -> Self {
        let hash = config_hash(&config, version);
        Self {
            namespace: namespace.into(),
            hash,
            version,
            config,
        }
    }

    pub fn identity(&self) -> Identity {
        Identity {
            namespace: self.namespace.clone(),
            hash: self.hash.clone(),
            version: self.version,
        }
    }

    /// True when the stored hash still matches the configuration.
    pub fn hash_is_consistent(&self) -> bool {
        config_hash(&self.config, self.version) == self.hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config() -> Config {
        let mut config = Config::new();
        config.insert("name".into(), json!("mnist"));
        config.insert("steps".into(), json!(100));
        config
    }

    #[test]
    fn default_version_is_omitted_and_restored() {
        let meta = Metadata::new("data.Prepare", config(), SchemaVersion::DEFAULT);
        let encoded = serde_json::to_value(&meta).expect("encode");
        assert!(encoded.get("version").is_none());
        let decoded: Metadata = serde_json::from_value(encoded).expect("decode");
        assert_eq!(decoded.version, SchemaVersion::DEFAULT);
        assert_eq!(decoded, meta);
    }

    #[test]
    fn non_default_version_is_written() {
        let meta = Metadata::new("data.Prepare", config(), SchemaVersion::new(2.0));
        let encoded = serde_json::to_value(&meta).expect("encode");
        assert_eq!(encoded["version"], json!(2.0));
        assert!(meta.hash_is_consistent());
    }

    #[test]
    fn field_order_does_not_affect_hash() {
        let mut reversed = Config::new();
        reversed.insert("steps".into(), json!(100));
        reversed.insert("name".into(), json!("mnist"));
        let a = Metadata::new("ns", config(), SchemaVersion::DEFAULT);
        let b = Metadata::new("ns", reversed, SchemaVersion::DEFAULT);
        assert_eq!(a.hash, b.hash);
    }
}
