//! Additive, idempotent schema adjustments applied after an update's files
//! are in place.

mod runner;
mod steps;
mod store;

pub use runner::{MigrationRecord, MigrationRunner, MigrationSummary, StepOutcome};
pub use steps::{MigrationAction, MigrationStep, MIGRATION_STEPS};
pub use store::{ColumnSpec, SchemaStore, SqliteSchemaStore};
