use std::fmt;

use serde::{Deserialize, Serialize};

pub const STATE_SCHEMA_VERSION: u32 = 1;

/// Lifecycle status of the result held by one directory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    None,
    Pending,
    Success,
    Failed,
    Migrated,
}

impl ResultStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Migrated => "migrated",
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Migrated)
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "none" => Some(Self::None),
            "pending" => Some(Self::Pending),
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            "migrated" => Some(Self::Migrated),
            _ => None,
        }
    }
}

impl fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
}

impl ErrorDetail {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

/// The `result` section of a state record.
///
/// Decoding never coerces an unrecognised status into success: unknown or
/// legacy strings become `failed` with a `decode` error attached.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawStateResult")]
pub struct StateResult {
    pub status: ResultStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
}

#[derive(Deserialize)]
struct RawStateResult {
    status: String,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    error: Option<ErrorDetail>,
}

impl From<RawStateResult> for StateResult {
    fn from(raw: RawStateResult) -> Self {
        match ResultStatus::parse(&raw.status) {
            Some(status) => Self {
                status,
                created_at: raw.created_at,
                error: raw.error,
            },
            None => Self {
                status: ResultStatus::Failed,
                created_at: None,
                error: Some(ErrorDetail::new(
                    "decode",
                    format!("unrecognised result status '{}'", raw.status),
                )),
            },
        }
    }
}

impl StateResult {
    #[must_use]
    pub fn none() -> Self {
        Self::with_status(ResultStatus::None)
    }

    #[must_use]
    pub fn with_status(status: ResultStatus) -> Self {
        Self {
            status,
            created_at: None,
            error: None,
        }
    }

    pub fn success(created_at: impl Into<String>) -> Self {
        Self {
            status: ResultStatus::Success,
            created_at: Some(created_at.into()),
            error: None,
        }
    }

    #[must_use]
    pub fn failed(error: ErrorDetail) -> Self {
        Self {
            status: ResultStatus::Failed,
            created_at: None,
            error: Some(error),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptPhase {
    Queued,
    Running,
}

impl AttemptPhase {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
        }
    }
}

impl fmt::Display for AttemptPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Process that owns an attempt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Owner {
    pub pid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

/// In-flight compute bookkeeping. `id` is the ownership token.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attempt {
    pub id: String,
    pub number: u32,
    pub phase: AttemptPhase,
    pub backend: String,
    pub owner: Owner,
    pub started_at: String,
    pub heartbeat_at: String,
    pub lease_expires_at: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateRecord {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub result: StateResult,
    #[serde(default)]
    pub attempt: Option<Attempt>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

fn default_schema_version() -> u32 {
    STATE_SCHEMA_VERSION
}

impl Default for StateRecord {
    fn default() -> Self {
        Self {
            schema_version: STATE_SCHEMA_VERSION,
            result: StateResult::none(),
            attempt: None,
            updated_at: None,
        }
    }
}

impl StateRecord {
    #[must_use]
    pub fn status(&self) -> ResultStatus {
        self.result.status
    }

    /// Number to give the next attempt started on this record.
    #[must_use]
    pub fn next_attempt_number(&self) -> u32 {
        self.attempt.as_ref().map_or(1, |attempt| attempt.number + 1)
    }
}
