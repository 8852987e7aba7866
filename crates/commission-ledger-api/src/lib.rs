use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::Result;
use commission_ledger_core::{
    Amount, CommissionEngine, CommissionError, ConfirmationEvent, DayAssignment, LedgerState,
    LedgerView, Lookup, OperatorId, ProductionRecord, WeekWindow, WeeklyAggregate, WindowOutcome,
};
use commission_ledger_store_sqlite::{ExportManifest, IntegrityReport, SchemaStatus, SqliteStore};
use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};
use tracing::debug;

mod config;

pub use config::{CommissionConfig, ConfigError};

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecordProductionRequest {
    pub records: Vec<ProductionRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecordProductionResult {
    pub recorded: usize,
    /// Monday of every week touched by the batch, ascending.
    pub weeks: Vec<Date>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegisterOperatorRequest {
    pub operator_id: OperatorId,
    #[serde(default)]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OperatorListing {
    pub operator_id: OperatorId,
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SaveLedgerRequest {
    pub operator_id: OperatorId,
    pub week_start: Date,
    pub entries: Vec<DayAssignment>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConfirmRequest {
    pub operator_id: OperatorId,
    pub week_start: Date,
    pub confirmed_amount: Amount,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub confirmed_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerStatus {
    pub operator_id: OperatorId,
    pub week_start: Date,
    pub state: LedgerState,
}

/// Library facade bound to one database file and one commission configuration.
///
/// Every call opens its own store session and applies pending migrations, so
/// concurrent callers never share a connection.
#[derive(Debug, Clone)]
pub struct CommissionLedgerApi {
    db_path: PathBuf,
    config: CommissionConfig,
}

impl CommissionLedgerApi {
    #[must_use]
    pub fn new(db_path: PathBuf, config: CommissionConfig) -> Self {
        Self { db_path, config }
    }

    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    #[must_use]
    pub fn config(&self) -> &CommissionConfig {
        &self.config
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    fn open_migrated_store(&self) -> Result<SqliteStore> {
        let mut store = self.open_store()?;
        store.migrate()?;
        Ok(store)
    }

    fn with_engine<T>(
        &self,
        call: impl FnOnce(&CommissionEngine<&SqliteStore>) -> Result<T, CommissionError>,
    ) -> Result<T> {
        let store = self.open_migrated_store()?;
        let engine = CommissionEngine::new(
            &store,
            self.config.schedule.clone(),
            self.config.max_commission,
        )?;
        Ok(call(&engine)?)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                inferred_from_legacy: before.inferred_from_legacy,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            inferred_from_legacy: before.inferred_from_legacy,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// # Errors
    /// Returns an error when integrity probes fail to run.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let store = self.open_store()?;
        store.integrity_check()
    }

    /// # Errors
    /// Returns an error when the snapshot cannot be written.
    pub fn export_snapshot(&self, out_dir: &Path) -> Result<ExportManifest> {
        let store = self.open_migrated_store()?;
        store.export_snapshot(out_dir)
    }

    /// Ingest raw production records.
    ///
    /// # Errors
    /// Returns an error when the batch is empty or cannot be persisted.
    pub fn record_production(
        &self,
        input: RecordProductionRequest,
    ) -> Result<RecordProductionResult> {
        if input.records.is_empty() {
            return Err(CommissionError::Validation(
                "records MUST contain at least one production record".to_string(),
            )
            .into());
        }

        let weeks = input
            .records
            .iter()
            .map(|record| WeekWindow::containing(record.date).map(WeekWindow::start_date))
            .collect::<Result<BTreeSet<_>, CommissionError>>()?;

        let store = self.open_migrated_store()?;
        let recorded = store.append_production_records(&input.records)?;
        debug!(recorded, weeks = weeks.len(), "recorded production batch");
        Ok(RecordProductionResult { recorded, weeks: weeks.into_iter().collect() })
    }

    /// # Errors
    /// Returns an error when the roster row cannot be written.
    pub fn register_operator(&self, input: RegisterOperatorRequest) -> Result<OperatorListing> {
        let store = self.open_migrated_store()?;
        store.register_operator(&input.operator_id, input.display_name.as_deref())?;
        let display_name = store
            .roster()?
            .into_iter()
            .find(|entry| entry.operator_id == input.operator_id)
            .and_then(|entry| entry.display_name);
        Ok(OperatorListing { operator_id: input.operator_id, display_name })
    }

    /// Operators with a saved ledger or a roster entry, with roster display names.
    ///
    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn list_operators(&self) -> Result<Vec<OperatorListing>> {
        let store = self.open_migrated_store()?;
        let roster = store.roster()?;
        let known = CommissionEngine::new(
            &store,
            self.config.schedule.clone(),
            self.config.max_commission,
        )?
        .list_operators()?;

        Ok(known
            .into_iter()
            .map(|operator_id| {
                let display_name = roster
                    .iter()
                    .find(|entry| entry.operator_id == operator_id)
                    .and_then(|entry| entry.display_name.clone());
                OperatorListing { operator_id, display_name }
            })
            .collect())
    }

    /// # Errors
    /// Returns an error for a non-Monday `week_start`, out-of-window records, or
    /// store failures.
    pub fn aggregate(&self, week_start: Date) -> Result<WindowOutcome<WeeklyAggregate>> {
        self.with_engine(|engine| engine.aggregate(WeekWindow::starting(week_start)?))
    }

    /// Drafts for every active operator, with derived totals.
    ///
    /// # Errors
    /// Returns an error for a non-Monday `week_start`, out-of-window records, or
    /// store failures.
    pub fn reconcile(&self, week_start: Date) -> Result<WindowOutcome<Vec<LedgerView>>> {
        self.with_engine(|engine| {
            let drafts = engine.reconcile(WeekWindow::starting(week_start)?)?;
            Ok(drafts.map(|ledgers| ledgers.iter().map(|ledger| ledger.view()).collect()))
        })
    }

    /// # Errors
    /// Returns the [`CommissionError`] raised by validation, or a store failure.
    pub fn save(&self, input: SaveLedgerRequest) -> Result<LedgerView> {
        self.with_engine(|engine| {
            engine
                .save(&input.operator_id, input.week_start, &input.entries)
                .map(|ledger| ledger.view())
        })
    }

    /// # Errors
    /// Returns an error for a non-Monday `week_start` or a store failure.
    pub fn load(&self, operator_id: &OperatorId, week_start: Date) -> Result<Lookup<LedgerView>> {
        self.with_engine(|engine| {
            Ok(engine.load(operator_id, week_start)?.map(|ledger| ledger.view()))
        })
    }

    /// Append a confirmation; `confirmed_at` defaults to now.
    ///
    /// # Errors
    /// Returns an error for a non-Monday `week_start`, a negative amount, or a
    /// store failure.
    pub fn confirm(&self, input: ConfirmRequest) -> Result<Lookup<ConfirmationEvent>> {
        let confirmed_at = input.confirmed_at.unwrap_or_else(OffsetDateTime::now_utc);
        self.with_engine(|engine| {
            engine.confirm(&input.operator_id, input.week_start, input.confirmed_amount, confirmed_at)
        })
    }

    /// # Errors
    /// Returns an error for a non-Monday `week_start` or a store failure.
    pub fn confirmations(
        &self,
        operator_id: &OperatorId,
        week_start: Date,
    ) -> Result<Vec<ConfirmationEvent>> {
        self.with_engine(|engine| engine.confirmations(operator_id, week_start))
    }

    /// # Errors
    /// Returns an error for a non-Monday `week_start` or a store failure.
    pub fn status(&self, operator_id: &OperatorId, week_start: Date) -> Result<LedgerStatus> {
        self.with_engine(|engine| {
            let state = engine.status(operator_id, WeekWindow::starting(week_start)?)?;
            Ok(LedgerStatus { operator_id: operator_id.clone(), week_start, state })
        })
    }
}
