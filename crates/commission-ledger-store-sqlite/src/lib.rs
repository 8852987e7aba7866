use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use commission_ledger_core::{
    format_date, parse_date, AdapterError, Amount, CommissionEntry, ConfirmationEvent,
    ConfirmationId, LedgerStore, OperatorId, OrderId, ProductionRecord, WeekWindow, WeeklyLedger,
};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::{Date, OffsetDateTime, UtcOffset};
use tracing::{debug, info};
use ulid::Ulid;

const LATEST_SCHEMA_VERSION: i64 = 2;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS production_records (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  operator_id TEXT NOT NULL CHECK (length(operator_id) > 0),
  order_id TEXT NOT NULL CHECK (length(order_id) > 0),
  record_date TEXT NOT NULL,
  stitch_count INTEGER NOT NULL CHECK (stitch_count >= 0),
  recorded_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS commission_entries (
  operator_id TEXT NOT NULL,
  week_start TEXT NOT NULL,
  entry_date TEXT NOT NULL,
  suggested_cents INTEGER NOT NULL CHECK (suggested_cents >= 0),
  assigned_cents INTEGER NOT NULL CHECK (assigned_cents >= 0),
  stitch_count INTEGER NOT NULL CHECK (stitch_count >= 0),
  order_count INTEGER NOT NULL CHECK (order_count >= 0),
  updated_at TEXT NOT NULL,
  PRIMARY KEY (operator_id, week_start, entry_date)
);

CREATE TABLE IF NOT EXISTS confirmations (
  confirmation_id TEXT PRIMARY KEY,
  operator_id TEXT NOT NULL,
  week_start TEXT NOT NULL,
  confirmed_cents INTEGER NOT NULL CHECK (confirmed_cents >= 0),
  confirmed_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_production_records_date ON production_records(record_date);
";

const MIGRATION_002_SQL: &str = r"
CREATE TABLE IF NOT EXISTS operator_roster (
  operator_id TEXT PRIMARY KEY CHECK (length(operator_id) > 0),
  display_name TEXT,
  registered_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_commission_entries_week ON commission_entries(week_start, operator_id);
CREATE INDEX IF NOT EXISTS idx_confirmations_operator_week ON confirmations(operator_id, week_start);
";

/// `LedgerStore` backed by one `SQLite` connection.
///
/// Each session opens its own store; WAL journaling and the busy timeout let
/// several sessions share one database file.
pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportFileDigest {
    pub path: String,
    pub sha256: String,
    pub records: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportManifest {
    pub schema_version: i64,
    pub exported_at: String,
    pub files: Vec<ExportFileDigest>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    /// Confirmations whose operator and week have no saved ledger entries.
    pub orphaned_confirmations: usize,
    pub schema_status: SchemaStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RosterEntry {
    pub operator_id: OperatorId,
    pub display_name: Option<String>,
    pub registered_at: String,
}

impl SqliteStore {
    /// Open a SQLite-backed ledger store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let (current_version, inferred_from_legacy) = detect_effective_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
            inferred_from_legacy,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when any migration step fails or the database reports a
    /// version newer than this build understands.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let (mut version, inferred) = detect_effective_schema_version(&self.conn)?;
        if inferred {
            for known in 1..=version {
                record_schema_version(&self.conn, known)?;
            }
        }

        if version > LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected at most {LATEST_SCHEMA_VERSION}"
            ));
        }

        for (target, sql) in [(1_i64, MIGRATION_001_SQL), (2_i64, MIGRATION_002_SQL)] {
            if version >= target {
                continue;
            }
            let tx = self.conn.transaction().context("failed to start migration transaction")?;
            tx.execute_batch(sql).with_context(|| format!("failed to apply migration v{target}"))?;
            tx.execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![target, now_rfc3339()?],
            )
            .with_context(|| format!("failed to record migration version {target}"))?;
            tx.commit().with_context(|| format!("failed to commit migration v{target}"))?;
            info!(version = target, "applied ledger schema migration");
            version = target;
        }

        Ok(())
    }

    /// Append raw production records; they are never updated or deleted afterwards.
    ///
    /// # Errors
    /// Returns an error when any insert fails; no record is stored in that case.
    pub fn append_production_records(&self, records: &[ProductionRecord]) -> Result<usize> {
        let tx = self.conn.unchecked_transaction().context("failed to start transaction")?;
        let recorded_at = now_rfc3339()?;
        for record in records {
            tx.execute(
                "INSERT INTO production_records(
                    operator_id, order_id, record_date, stitch_count, recorded_at
                ) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    record.operator_id.as_str(),
                    record.order_id.as_str(),
                    format_date(record.date),
                    to_sql_count(record.stitch_count)?,
                    recorded_at,
                ],
            )
            .context("failed to insert production record")?;
        }
        tx.commit().context("failed to commit production records")?;
        debug!(records = records.len(), "appended production records");
        Ok(records.len())
    }

    /// Add an operator to the roster, or update the display name of a known one.
    ///
    /// # Errors
    /// Returns an error when the roster row cannot be written.
    pub fn register_operator(
        &self,
        operator_id: &OperatorId,
        display_name: Option<&str>,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO operator_roster(operator_id, display_name, registered_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(operator_id) DO UPDATE SET
                   display_name = COALESCE(excluded.display_name, operator_roster.display_name)",
                params![operator_id.as_str(), display_name, now_rfc3339()?],
            )
            .with_context(|| format!("failed to register operator {operator_id}"))?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when roster rows cannot be read or decoded.
    pub fn roster(&self) -> Result<Vec<RosterEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT operator_id, display_name, registered_at
             FROM operator_roster
             ORDER BY operator_id ASC",
        )?;
        let mut rows = stmt.query([])?;
        let mut roster = Vec::new();
        while let Some(row) = rows.next()? {
            roster.push(RosterEntry {
                operator_id: parse_operator_id(&row.get::<_, String>(0)?)?,
                display_name: row.get(1)?,
                registered_at: row.get(2)?,
            });
        }
        Ok(roster)
    }

    /// Export ledger entries and confirmations as deterministic NDJSON plus manifest.
    ///
    /// # Errors
    /// Returns an error when export files cannot be created, written, or serialized.
    pub fn export_snapshot(&self, out_dir: &Path) -> Result<ExportManifest> {
        fs::create_dir_all(out_dir)
            .with_context(|| format!("failed to create export directory {}", out_dir.display()))?;

        let entries = self.all_ledger_entries()?;
        let confirmations = self.confirmations_where(None)?;

        let entries_path = out_dir.join("commission_entries.ndjson");
        let entries_digest = write_ndjson_file(&entries_path, &entries)?;

        let confirmations_path = out_dir.join("confirmations.ndjson");
        let confirmations_digest = write_ndjson_file(&confirmations_path, &confirmations)?;

        let manifest = ExportManifest {
            schema_version: LATEST_SCHEMA_VERSION,
            exported_at: now_rfc3339()?,
            files: vec![
                ExportFileDigest {
                    path: "commission_entries.ndjson".to_string(),
                    sha256: entries_digest.0,
                    records: entries_digest.1,
                },
                ExportFileDigest {
                    path: "confirmations.ndjson".to_string(),
                    sha256: confirmations_digest.0,
                    records: confirmations_digest.1,
                },
            ],
        };

        let manifest_path = out_dir.join("manifest.json");
        let manifest_json =
            serde_json::to_vec_pretty(&manifest).context("failed to serialize export manifest")?;
        fs::write(&manifest_path, manifest_json).with_context(|| {
            format!("failed to write export manifest {}", manifest_path.display())
        })?;

        info!(
            out_dir = %out_dir.display(),
            entries = entries.len(),
            confirmations = confirmations.len(),
            "exported ledger snapshot"
        );
        Ok(manifest)
    }

    /// Run quick-check, orphaned-confirmation and schema status health probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let orphaned: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM confirmations c
                 WHERE NOT EXISTS (
                     SELECT 1 FROM commission_entries e
                     WHERE e.operator_id = c.operator_id AND e.week_start = c.week_start
                 )",
                [],
                |row| row.get(0),
            )
            .context("failed to count orphaned confirmations")?;
        let orphaned_confirmations =
            usize::try_from(orphaned).context("orphaned confirmation count out of range")?;

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            orphaned_confirmations,
            schema_status,
        })
    }

    fn records_in_window(&self, window: WeekWindow) -> Result<Vec<ProductionRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT operator_id, order_id, record_date, stitch_count
             FROM production_records
             WHERE record_date >= ?1 AND record_date <= ?2
             ORDER BY id ASC",
        )?;
        let mut rows = stmt
            .query(params![format_date(window.start_date()), format_date(window.end_date())])?;

        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            let order_raw: String = row.get(1)?;
            records.push(ProductionRecord {
                operator_id: parse_operator_id(&row.get::<_, String>(0)?)?,
                order_id: OrderId::parse(&order_raw)
                    .with_context(|| format!("invalid stored order_id: {order_raw:?}"))?,
                date: parse_stored_date(&row.get::<_, String>(2)?)?,
                stitch_count: from_sql_count(row.get(3)?)?,
            });
        }
        Ok(records)
    }

    fn ledger_entries(
        &self,
        operator_id: &OperatorId,
        week_start: Date,
    ) -> Result<Vec<CommissionEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT operator_id, week_start, entry_date, suggested_cents, assigned_cents,
                    stitch_count, order_count
             FROM commission_entries
             WHERE operator_id = ?1 AND week_start = ?2
             ORDER BY entry_date ASC",
        )?;
        let rows = stmt.query(params![operator_id.as_str(), format_date(week_start)])?;
        decode_entries(rows)
    }

    fn all_ledger_entries(&self) -> Result<Vec<CommissionEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT operator_id, week_start, entry_date, suggested_cents, assigned_cents,
                    stitch_count, order_count
             FROM commission_entries
             ORDER BY week_start ASC, operator_id ASC, entry_date ASC",
        )?;
        let rows = stmt.query([])?;
        decode_entries(rows)
    }

    fn write_ledger_entries(
        &self,
        operator_id: &OperatorId,
        week_start: Date,
        entries: &[CommissionEntry],
    ) -> Result<()> {
        let tx = self.conn.unchecked_transaction().context("failed to start transaction")?;
        let updated_at = now_rfc3339()?;
        for entry in entries {
            tx.execute(
                "INSERT INTO commission_entries(
                    operator_id, week_start, entry_date, suggested_cents, assigned_cents,
                    stitch_count, order_count, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ON CONFLICT(operator_id, week_start, entry_date) DO UPDATE SET
                    suggested_cents = excluded.suggested_cents,
                    assigned_cents = excluded.assigned_cents,
                    stitch_count = excluded.stitch_count,
                    order_count = excluded.order_count,
                    updated_at = excluded.updated_at",
                params![
                    operator_id.as_str(),
                    format_date(week_start),
                    format_date(entry.date),
                    entry.suggested_amount.cents(),
                    entry.assigned_amount.cents(),
                    to_sql_count(entry.stitch_count)?,
                    i64::from(entry.order_count),
                    updated_at,
                ],
            )
            .with_context(|| format!("failed to upsert ledger entry for {}", entry.date))?;
        }
        tx.commit().context("failed to commit ledger upsert")?;
        debug!(
            operator_id = %operator_id,
            week_start = %week_start,
            entries = entries.len(),
            "upserted ledger entries"
        );
        Ok(())
    }

    fn insert_confirmation(&self, event: &ConfirmationEvent) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO confirmations(
                    confirmation_id, operator_id, week_start, confirmed_cents, confirmed_at
                ) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    event.confirmation_id.to_string(),
                    event.operator_id.as_str(),
                    format_date(event.week_start),
                    event.confirmed_amount.cents(),
                    rfc3339(event.confirmed_at.to_offset(UtcOffset::UTC))?,
                ],
            )
            .context("failed to insert confirmation")?;
        Ok(())
    }

    fn confirmations_where(
        &self,
        scope: Option<(&OperatorId, Date)>,
    ) -> Result<Vec<ConfirmationEvent>> {
        let mut stmt = self.conn.prepare(
            "SELECT confirmation_id, operator_id, week_start, confirmed_cents, confirmed_at
             FROM confirmations
             WHERE (?1 IS NULL OR operator_id = ?1) AND (?2 IS NULL OR week_start = ?2)",
        )?;
        let (operator_filter, week_filter) = match scope {
            Some((operator_id, week_start)) => {
                (Some(operator_id.as_str().to_string()), Some(format_date(week_start)))
            }
            None => (None, None),
        };
        let mut rows = stmt.query(params![operator_filter, week_filter])?;

        let mut events = Vec::new();
        while let Some(row) = rows.next()? {
            let id_raw: String = row.get(0)?;
            events.push(ConfirmationEvent {
                confirmation_id: ConfirmationId(
                    Ulid::from_string(&id_raw).with_context(|| format!("invalid ULID: {id_raw}"))?,
                ),
                operator_id: parse_operator_id(&row.get::<_, String>(1)?)?,
                week_start: parse_stored_date(&row.get::<_, String>(2)?)?,
                confirmed_amount: Amount::from_cents(row.get(3)?),
                confirmed_at: parse_rfc3339(&row.get::<_, String>(4)?)?,
            });
        }
        events.sort_by(|lhs, rhs| {
            lhs.week_start
                .cmp(&rhs.week_start)
                .then_with(|| lhs.operator_id.cmp(&rhs.operator_id))
                .then_with(|| lhs.confirmed_at.cmp(&rhs.confirmed_at))
                .then_with(|| lhs.confirmation_id.cmp(&rhs.confirmation_id))
        });
        Ok(events)
    }

    fn known_operators(&self) -> Result<BTreeSet<OperatorId>> {
        let mut stmt = self.conn.prepare(
            "SELECT operator_id FROM operator_roster
             UNION
             SELECT DISTINCT operator_id FROM commission_entries",
        )?;
        let mut rows = stmt.query([])?;
        let mut operators = BTreeSet::new();
        while let Some(row) = rows.next()? {
            operators.insert(parse_operator_id(&row.get::<_, String>(0)?)?);
        }
        Ok(operators)
    }
}

impl LedgerStore for SqliteStore {
    fn fetch_records(&self, window: WeekWindow) -> Result<Vec<ProductionRecord>, AdapterError> {
        adapter("fetch_records", self.records_in_window(window))
    }

    fn fetch_ledger(
        &self,
        operator_id: &OperatorId,
        week_start: Date,
    ) -> Result<Option<WeeklyLedger>, AdapterError> {
        let entries = adapter("fetch_ledger", self.ledger_entries(operator_id, week_start))?;
        if entries.is_empty() {
            return Ok(None);
        }
        Ok(Some(WeeklyLedger::new(operator_id.clone(), week_start, entries)))
    }

    fn upsert_ledger_entries(
        &self,
        operator_id: &OperatorId,
        week_start: Date,
        entries: &[CommissionEntry],
    ) -> Result<(), AdapterError> {
        adapter(
            "upsert_ledger_entries",
            self.write_ledger_entries(operator_id, week_start, entries),
        )
    }

    fn append_confirmation(&self, event: &ConfirmationEvent) -> Result<(), AdapterError> {
        adapter("append_confirmation", self.insert_confirmation(event))
    }

    fn list_confirmations(
        &self,
        operator_id: &OperatorId,
        week_start: Date,
    ) -> Result<Vec<ConfirmationEvent>, AdapterError> {
        adapter("list_confirmations", self.confirmations_where(Some((operator_id, week_start))))
    }

    fn list_known_operators(&self) -> Result<BTreeSet<OperatorId>, AdapterError> {
        adapter("list_known_operators", self.known_operators())
    }
}

fn adapter<T>(operation: &'static str, result: Result<T>) -> Result<T, AdapterError> {
    result.map_err(|err| AdapterError::new(operation, err))
}

fn decode_entries(mut rows: rusqlite::Rows<'_>) -> Result<Vec<CommissionEntry>> {
    let mut entries = Vec::new();
    while let Some(row) = rows.next()? {
        entries.push(CommissionEntry {
            operator_id: parse_operator_id(&row.get::<_, String>(0)?)?,
            week_start: parse_stored_date(&row.get::<_, String>(1)?)?,
            date: parse_stored_date(&row.get::<_, String>(2)?)?,
            suggested_amount: Amount::from_cents(row.get(3)?),
            assigned_amount: Amount::from_cents(row.get(4)?),
            stitch_count: from_sql_count(row.get(5)?)?,
            order_count: u32::try_from(row.get::<_, i64>(6)?)
                .context("stored order_count is out of range")?,
        });
    }
    Ok(entries)
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

// Databases created before migrations were tracked carry the tables but no
// schema_migrations rows; infer their version from what exists.
fn detect_effective_schema_version(conn: &Connection) -> Result<(i64, bool)> {
    let recorded = current_schema_version(conn)?;
    if recorded > 0 {
        return Ok((recorded, false));
    }

    if table_exists(conn, "operator_roster")? {
        return Ok((2, true));
    }

    if table_exists(conn, "commission_entries")? {
        return Ok((1, true));
    }

    Ok((0, false))
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}

fn parse_stored_date(raw: &str) -> Result<Date> {
    parse_date(raw).with_context(|| format!("invalid stored date: {raw:?}"))
}

fn parse_operator_id(raw: &str) -> Result<OperatorId> {
    OperatorId::parse(raw).with_context(|| format!("invalid stored operator_id: {raw:?}"))
}

fn to_sql_count(value: u64) -> Result<i64> {
    i64::try_from(value).with_context(|| format!("count {value} exceeds sqlite integer range"))
}

fn from_sql_count(value: i64) -> Result<u64> {
    u64::try_from(value).with_context(|| format!("stored count {value} is negative"))
}

fn write_ndjson_file<T: Serialize>(path: &Path, values: &[T]) -> Result<(String, usize)> {
    let file = File::create(path)
        .with_context(|| format!("failed to create export file {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    let mut hasher = Sha256::new();

    for value in values {
        let line = serde_json::to_string(value).context("failed to serialize NDJSON row")?;
        writer
            .write_all(line.as_bytes())
            .with_context(|| format!("failed to write export file {}", path.display()))?;
        writer
            .write_all(b"\n")
            .with_context(|| format!("failed to write export file {}", path.display()))?;
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }

    writer.flush().with_context(|| format!("failed to flush export file {}", path.display()))?;

    Ok((format!("{:x}", hasher.finalize()), values.len()))
}
