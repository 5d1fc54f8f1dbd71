use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::identity::{Identity, SchemaVersion};

/// Role of a directory in a migration link.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationKind {
    /// Status is `migrated`; reads defer to the anchor while the link is live.
    Pointer,
    /// Holds (or once held) the payload a pointer defers to.
    Anchor,
}

impl MigrationKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pointer => "pointer",
            Self::Anchor => "anchor",
        }
    }
}

impl fmt::Display for MigrationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationPolicy {
    Alias,
    Move,
    Copy,
}

impl MigrationPolicy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Alias => "alias",
            Self::Move => "move",
            Self::Copy => "copy",
        }
    }
}

impl fmt::Display for MigrationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MigrationPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "alias" => Ok(Self::Alias),
            "move" => Ok(Self::Move),
            "copy" => Ok(Self::Copy),
            other => Err(format!("unknown migration policy '{other}'")),
        }
    }
}

/// One side of a link: full identity plus the directory it lives in.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ObjectRef {
    pub namespace: String,
    pub hash: String,
    #[serde(default, skip_serializing_if = "SchemaVersion::is_default")]
    pub version: SchemaVersion,
    pub root: PathBuf,
}

impl ObjectRef {
    pub fn new(identity: &Identity, root: impl Into<PathBuf>) -> Self {
        Self {
            namespace: identity.namespace.clone(),
            hash: identity.hash.clone(),
            version: identity.version,
            root: root.into(),
        }
    }

    pub fn identity(&self) -> Identity {
        Identity {
            namespace: self.namespace.clone(),
            hash: self.hash.clone(),
            version: self.version,
        }
    }
}

/// Link written by one `migrate` call. Both sides of an alias or move carry
/// a copy that differs only in `kind`; a copy destination carries a
/// lineage-only record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub kind: MigrationKind,
    pub policy: MigrationPolicy,
    pub from: ObjectRef,
    pub to: ObjectRef,
    pub migrated_at: String,
    #[serde(default)]
    pub overwritten_at: Option<String>,
    #[serde(default)]
    pub origin: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
}

impl MigrationRecord {
    /// Directory holding the authoritative payload for this link.
    pub fn anchor_root(&self) -> &Path {
        match self.policy {
            MigrationPolicy::Alias | MigrationPolicy::Copy => &self.from.root,
            MigrationPolicy::Move => &self.to.root,
        }
    }

    pub fn anchor_ref(&self) -> &ObjectRef {
        match self.policy {
            MigrationPolicy::Alias | MigrationPolicy::Copy => &self.from,
            MigrationPolicy::Move => &self.to,
        }
    }

    /// Directory that defers to the anchor; copies have none.
    pub fn pointer_root(&self) -> Option<&Path> {
        match self.policy {
            MigrationPolicy::Alias => Some(&self.to.root),
            MigrationPolicy::Move => Some(&self.from.root),
            MigrationPolicy::Copy => None,
        }
    }

    pub fn is_overwritten(&self) -> bool {
        self.overwritten_at.is_some()
    }

    /// True when `other` was written by the same `migrate` call.
    pub fn same_link(&self, other: &MigrationRecord) -> bool {
        self.policy == other.policy
            && self.from.root == other.from.root
            && self.to.root == other.to.root
            && self.migrated_at == other.migrated_at
    }

    /// True when `other` describes the same endpoints and policy, whenever
    /// it was written.
    pub fn same_endpoints(&self, other: &MigrationRecord) -> bool {
        self.policy == other.policy
            && self.from.root == other.from.root
            && self.to.root == other.to.root
    }

    /// The record for the opposite side of the same link.
    #[must_use]
    pub fn counterpart(&self, kind: MigrationKind) -> Self {
        Self {
            kind,
            ..self.clone()
        }
    }
}
