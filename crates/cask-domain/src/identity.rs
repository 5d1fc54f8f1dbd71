use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Number of hex characters kept from the config digest.
pub const HASH_LEN: usize = 20;

const VERSION_KEY: &str = "__version__";

/// Schema version of an object's configuration. Records omit it when it
/// equals [`SchemaVersion::DEFAULT`].
#[derive(Clone, Copy, Debug, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SchemaVersion(f64);

impl SchemaVersion {
    pub const DEFAULT: SchemaVersion = SchemaVersion(1.0);

    #[must_use]
    pub const fn new(value: f64) -> Self {
        Self(value)
    }

    #[must_use]
    pub fn value(self) -> f64 {
        self.0
    }

    #[must_use]
    pub fn is_default(&self) -> bool {
        (self.0 - Self::DEFAULT.0).abs() < f64::EPSILON
    }

    /// Bit-exact key for maps; `-0.0` and `0.0` are folded together.
    #[must_use]
    pub fn key(self) -> u64 {
        if self.0 == 0.0 {
            0
        } else {
            self.0.to_bits()
        }
    }
}

impl Default for SchemaVersion {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.fract() == 0.0 {
            write!(f, "{:.1}", self.0)
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl std::str::FromStr for SchemaVersion {
    type Err = std::num::ParseFloatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<f64>().map(Self)
    }
}

/// `(namespace, hash, version)`: the name of one stored object.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub namespace: String,
    pub hash: String,
    #[serde(default, skip_serializing_if = "SchemaVersion::is_default")]
    pub version: SchemaVersion,
}

impl Identity {
    pub fn new(namespace: impl Into<String>, hash: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            hash: hash.into(),
            version: SchemaVersion::DEFAULT,
        }
    }

    #[must_use]
    pub fn with_version(mut self, version: SchemaVersion) -> Self {
        self.version = version;
        self
    }

    /// Directory of this object relative to a storage root: one path
    /// component per dotted namespace segment, then the hash.
    pub fn relative_dir(&self) -> PathBuf {
        let mut path: PathBuf = self
            .namespace
            .split('.')
            .filter(|segment| !segment.is_empty())
            .collect();
        path.push(&self.hash);
        path
    }

    /// Check that every namespace segment and the hash are plain names, so
    /// [`Identity::relative_dir`] stays below the storage root.
    pub fn validate(&self) -> Result<(), IdentityError> {
        if self.namespace.is_empty() {
            return Err(IdentityError::EmptyNamespace);
        }
        if let Some(segment) = self
            .namespace
            .split('.')
            .find(|segment| !is_plain_name(segment))
        {
            return Err(IdentityError::Segment {
                namespace: self.namespace.clone(),
                segment: segment.to_string(),
            });
        }
        if !is_plain_name(&self.hash) {
            return Err(IdentityError::Hash(self.hash.clone()));
        }
        Ok(())
    }

    /// Last namespace segment, used as a display name.
    pub fn short_name(&self) -> &str {
        self.namespace.rsplit('.').next().unwrap_or(&self.namespace)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.hash)?;
        if !self.version.is_default() {
            write!(f, "@{}", self.version)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    #[error("namespace is empty")]
    EmptyNamespace,
    #[error("namespace {namespace:?} has segment {segment:?}; segments must be non-empty names")]
    Segment { namespace: String, segment: String },
    #[error("hash {0:?} must be a non-empty name without separators")]
    Hash(String),
}

fn is_plain_name(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '-')
}

/// Serialize a JSON value with object keys sorted at every level.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (idx, key) in keys.into_iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Content hash of a configuration. The version participates only when it
/// is not the default, so existing default-version hashes never move.
pub fn config_hash<'a, I>(fields: I, version: SchemaVersion) -> String
where
    I: IntoIterator<Item = (&'a String, &'a Value)>,
{
    let mut map: serde_json::Map<String, Value> = fields
        .into_iter()
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    if !version.is_default() {
        map.insert(VERSION_KEY.to_string(), serde_json::json!(version.value()));
    }
    let canonical = canonical_json(&Value::Object(map));
    let digest = hex::encode(Sha256::digest(canonical.as_bytes()));
    digest[..HASH_LEN].to_string()
}
