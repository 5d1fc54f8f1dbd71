#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate
)]

mod attempt;
mod clock;
pub mod config;
mod error;
pub mod events;
mod fs;
pub mod layout;
mod migrate;
pub mod persistence;
pub mod records;
pub mod resolution;
pub mod scanner;
mod store;

pub use crate::config::{AttemptConfig, StoreConfig};
pub use crate::error::{codes, store_error, StoreError};
pub use crate::migrate::{MigrateOptions, MigrationReport};
pub use crate::records::OverwriteOutcome;
pub use crate::resolution::{DetachReason, LinkState, Resolution};
pub use crate::scanner::{DashboardStats, ObjectDetail, ObjectSummary, ScanFilter, View};
pub use crate::store::{ObjectStore, Task};

pub use cask_domain::{
    Attempt, AttemptPhase, Config, ErrorDetail, Event, EventKind, Identity, Metadata,
    MigrationKind, MigrationPolicy, MigrationRecord, ResultStatus, SchemaRegistry, SchemaVersion,
    StateRecord,
};
