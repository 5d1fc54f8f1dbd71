#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate
)]

pub mod event;
pub mod identity;
pub mod metadata;
pub mod migration;
pub mod schema;
pub mod state;

pub use event::{Event, EventKind};
pub use identity::{canonical_json, config_hash, Identity, IdentityError, SchemaVersion, HASH_LEN};
pub use metadata::{Config, Metadata};
pub use migration::{MigrationKind, MigrationPolicy, MigrationRecord, ObjectRef};
pub use schema::{SchemaError, SchemaRegistry, UpgradedConfig};
pub use state::{
    Attempt, AttemptPhase, ErrorDetail, Owner, ResultStatus, StateRecord, StateResult,
    STATE_SCHEMA_VERSION,
};
