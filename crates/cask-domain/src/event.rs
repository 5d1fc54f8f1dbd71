use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event types written by the store. Logs may contain others written by
/// external tools, so [`Event::kind`] stays a plain string.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    Create,
    CreateFailed,
    Migration,
    MigrationOverwrite,
    Invalidate,
    AttemptReclaimed,
}

impl EventKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::CreateFailed => "create_failed",
            Self::Migration => "migration",
            Self::MigrationOverwrite => "migration_overwrite",
            Self::Invalidate => "invalidate",
            Self::AttemptReclaimed => "attempt_reclaimed",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: String,
    pub timestamp: String,
    #[serde(default)]
    pub payload: Value,
}

impl Event {
    pub fn is(&self, kind: EventKind) -> bool {
        self.kind == kind.as_str()
    }
}
