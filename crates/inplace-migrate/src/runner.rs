use anyhow::Result;
use tracing::{debug, info, warn};

use crate::steps::{MigrationAction, MigrationStep, MIGRATION_STEPS};
use crate::store::SchemaStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Applied,
    AlreadyPresent,
    Skipped(String),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationRecord {
    pub step_id: &'static str,
    pub outcome: StepOutcome,
}

impl MigrationRecord {
    pub fn log_line(&self) -> String {
        match &self.outcome {
            StepOutcome::Applied => format!("migration {}: applied", self.step_id),
            StepOutcome::AlreadyPresent => {
                format!("migration {}: already present", self.step_id)
            }
            StepOutcome::Skipped(reason) => {
                format!("migration {}: skipped ({reason})", self.step_id)
            }
            StepOutcome::Failed(message) => format!(
                "MigrationStepWarning: migration {} failed: {message}",
                self.step_id
            ),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationSummary {
    pub records: Vec<MigrationRecord>,
}

impl MigrationSummary {
    pub fn log_lines(&self) -> Vec<String> {
        self.records.iter().map(MigrationRecord::log_line).collect()
    }

    pub fn applied(&self) -> usize {
        self.records
            .iter()
            .filter(|record| record.outcome == StepOutcome::Applied)
            .count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &MigrationRecord> {
        self.records
            .iter()
            .filter(|record| matches!(record.outcome, StepOutcome::Failed(_)))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MigrationRunner<'a> {
    steps: &'a [MigrationStep],
}

impl Default for MigrationRunner<'static> {
    fn default() -> Self {
        Self {
            steps: MIGRATION_STEPS,
        }
    }
}

impl<'a> MigrationRunner<'a> {
    pub fn with_steps(steps: &'a [MigrationStep]) -> Self {
        Self { steps }
    }

    /// Applies every step in order. A failing step is recorded and the
    /// remaining steps still run.
    pub fn run(&self, store: &dyn SchemaStore) -> MigrationSummary {
        let mut summary = MigrationSummary::default();
        for step in self.steps {
            let outcome = match apply_step(store, step) {
                Ok(outcome) => outcome,
                Err(err) => StepOutcome::Failed(format!("{err:#}")),
            };
            match &outcome {
                StepOutcome::Applied => info!(step = step.id, "migration applied"),
                StepOutcome::AlreadyPresent => debug!(step = step.id, "migration already present"),
                StepOutcome::Skipped(reason) => debug!(step = step.id, %reason, "migration skipped"),
                StepOutcome::Failed(message) => {
                    warn!(step = step.id, error = %message, "migration step failed; continuing")
                }
            }
            summary.records.push(MigrationRecord {
                step_id: step.id,
                outcome,
            });
        }
        summary
    }
}

fn apply_step(store: &dyn SchemaStore, step: &MigrationStep) -> Result<StepOutcome> {
    match step.action {
        MigrationAction::CreateTable { table, columns } => {
            if store.table_exists(table)? {
                return Ok(StepOutcome::AlreadyPresent);
            }
            store.create_table(table, columns)?;
            Ok(StepOutcome::Applied)
        }
        MigrationAction::AddColumn { table, column } => {
            if !store.table_exists(table)? {
                return Ok(StepOutcome::Skipped(format!("table '{table}' does not exist")));
            }
            if store.column_exists(table, column.name)? {
                return Ok(StepOutcome::AlreadyPresent);
            }
            store.add_column(table, &column)?;
            Ok(StepOutcome::Applied)
        }
        MigrationAction::SeedSetting { key, value } => {
            if store.setting_exists(key)? {
                return Ok(StepOutcome::AlreadyPresent);
            }
            store.insert_setting(key, value)?;
            Ok(StepOutcome::Applied)
        }
    }
}
