use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use commission_ledger_api::{
    CommissionConfig, CommissionLedgerApi, ConfirmRequest, RecordProductionRequest,
    RegisterOperatorRequest, SaveLedgerRequest,
};
use commission_ledger_core::{
    parse_date, Amount, DayAssignment, OperatorId, OrderId, ProductionRecord, WindowOutcome,
};
use serde::Serialize;
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::{Date, OffsetDateTime};
use tracing::debug;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "cl")]
#[command(about = "Weekly commission ledger CLI")]
struct Cli {
    #[arg(long, default_value = "./commission_ledger.sqlite3")]
    db: PathBuf,

    /// YAML commission schedule; built-in defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    Production {
        #[command(subcommand)]
        command: Box<ProductionCommand>,
    },
    Operator {
        #[command(subcommand)]
        command: Box<OperatorCommand>,
    },
    Week {
        #[command(subcommand)]
        command: Box<WeekCommand>,
    },
    Ledger {
        #[command(subcommand)]
        command: Box<LedgerCommand>,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    IntegrityCheck,
    Export(DbExportArgs),
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbExportArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Subcommand)]
enum ProductionCommand {
    Add(ProductionAddArgs),
    /// Import newline-delimited JSON production records.
    Import(ProductionImportArgs),
}

#[derive(Debug, Args)]
struct ProductionAddArgs {
    #[arg(long, value_parser = parse_operator_arg)]
    operator: OperatorId,
    #[arg(long, value_parser = parse_order_arg)]
    order: OrderId,
    #[arg(long, value_parser = parse_date_arg)]
    date: Date,
    #[arg(long)]
    stitches: u64,
}

#[derive(Debug, Args)]
struct ProductionImportArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Subcommand)]
enum OperatorCommand {
    Add(OperatorAddArgs),
    List,
}

#[derive(Debug, Args)]
struct OperatorAddArgs {
    #[arg(long, value_parser = parse_operator_arg)]
    operator: OperatorId,
    #[arg(long)]
    name: Option<String>,
}

#[derive(Debug, Subcommand)]
enum WeekCommand {
    Aggregate(WeekArgs),
    Draft(WeekArgs),
}

#[derive(Debug, Args)]
struct WeekArgs {
    #[arg(long, value_parser = parse_date_arg)]
    week_start: Date,
}

#[derive(Debug, Subcommand)]
enum LedgerCommand {
    Save(LedgerSaveArgs),
    Show(LedgerArgs),
    Confirm(LedgerConfirmArgs),
    Confirmations(LedgerArgs),
    Status(LedgerArgs),
}

#[derive(Debug, Args)]
struct LedgerArgs {
    #[arg(long, value_parser = parse_operator_arg)]
    operator: OperatorId,
    #[arg(long, value_parser = parse_date_arg)]
    week_start: Date,
}

#[derive(Debug, Args)]
struct LedgerSaveArgs {
    #[command(flatten)]
    ledger: LedgerArgs,
    /// Day assignment as `YYYY-MM-DD=AMOUNT`, e.g. `2024-06-03=50.00`.
    #[arg(long = "assign", value_parser = parse_assignment_arg)]
    assignments: Vec<DayAssignment>,
    /// Start from the current draft amounts; explicit `--assign` values win.
    #[arg(long, default_value_t = false)]
    accept_suggested: bool,
}

#[derive(Debug, Args)]
struct LedgerConfirmArgs {
    #[command(flatten)]
    ledger: LedgerArgs,
    #[arg(long)]
    amount: Amount,
    /// RFC 3339 timestamp; defaults to now.
    #[arg(long, value_parser = parse_timestamp_arg)]
    at: Option<OffsetDateTime>,
}

fn parse_operator_arg(raw: &str) -> Result<OperatorId, String> {
    OperatorId::parse(raw).map_err(|err| err.to_string())
}

fn parse_order_arg(raw: &str) -> Result<OrderId, String> {
    OrderId::parse(raw).map_err(|err| err.to_string())
}

fn parse_date_arg(raw: &str) -> Result<Date, String> {
    parse_date(raw).map_err(|err| err.to_string())
}

fn parse_timestamp_arg(raw: &str) -> Result<OffsetDateTime, String> {
    OffsetDateTime::parse(raw, &Rfc3339)
        .map_err(|err| format!("invalid RFC 3339 timestamp: {err}"))
}

fn parse_assignment_arg(raw: &str) -> Result<DayAssignment, String> {
    let (date, amount) = raw
        .split_once('=')
        .ok_or_else(|| format!("assignment {raw:?} MUST look like YYYY-MM-DD=AMOUNT"))?;
    Ok(DayAssignment {
        date: parse_date_arg(date)?,
        assigned_amount: amount.parse::<Amount>().map_err(|err| err.to_string())?,
    })
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn emit<T: Serialize>(value: &T) -> Result<()> {
    emit_json(serde_json::to_value(value).context("failed to serialize command output")?)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let config = CommissionConfig::load_or_builtin(cli.config.as_deref())
        .context("failed to load commission config")?;
    let api = CommissionLedgerApi::new(cli.db, config);

    match cli.command {
        Command::Db { command } => run_db(*command, &api),
        Command::Production { command } => run_production(*command, &api),
        Command::Operator { command } => run_operator(*command, &api),
        Command::Week { command } => run_week(*command, &api),
        Command::Ledger { command } => run_ledger(*command, &api),
    }
}

fn run_db(command: DbCommand, api: &CommissionLedgerApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty(),
                "inferred_from_legacy": status.inferred_from_legacy
            }))
        }
        DbCommand::Migrate(args) => emit(&api.migrate(args.dry_run)?),
        DbCommand::IntegrityCheck => emit(&api.integrity_check()?),
        DbCommand::Export(args) => {
            let manifest = api.export_snapshot(&args.out)?;
            emit_json(serde_json::json!({
                "out_dir": args.out,
                "manifest": manifest
            }))
        }
    }
}

fn run_production(command: ProductionCommand, api: &CommissionLedgerApi) -> Result<()> {
    let records = match command {
        ProductionCommand::Add(args) => vec![ProductionRecord {
            operator_id: args.operator,
            order_id: args.order,
            date: args.date,
            stitch_count: args.stitches,
        }],
        ProductionCommand::Import(args) => read_production_ndjson(&args.input)?,
    };
    emit(&api.record_production(RecordProductionRequest { records })?)
}

fn read_production_ndjson(path: &std::path::Path) -> Result<Vec<ProductionRecord>> {
    let body = fs::read_to_string(path)
        .with_context(|| format!("failed to read production file {}", path.display()))?;

    let records = body
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| {
            serde_json::from_str::<ProductionRecord>(line).with_context(|| {
                format!("invalid production record at {}:{}", path.display(), index + 1)
            })
        })
        .collect::<Result<Vec<_>>>()?;
    debug!(path = %path.display(), records = records.len(), "parsed production import");
    Ok(records)
}

fn run_operator(command: OperatorCommand, api: &CommissionLedgerApi) -> Result<()> {
    match command {
        OperatorCommand::Add(args) => emit(&api.register_operator(RegisterOperatorRequest {
            operator_id: args.operator,
            display_name: args.name,
        })?),
        OperatorCommand::List => {
            let operators = api.list_operators()?;
            emit_json(serde_json::json!({ "operators": operators }))
        }
    }
}

fn run_week(command: WeekCommand, api: &CommissionLedgerApi) -> Result<()> {
    match command {
        WeekCommand::Aggregate(args) => emit(&api.aggregate(args.week_start)?),
        WeekCommand::Draft(args) => emit(&api.reconcile(args.week_start)?),
    }
}

fn run_ledger(command: LedgerCommand, api: &CommissionLedgerApi) -> Result<()> {
    match command {
        LedgerCommand::Save(args) => run_ledger_save(args, api),
        LedgerCommand::Show(args) => emit(&api.load(&args.operator, args.week_start)?),
        LedgerCommand::Confirm(args) => emit(&api.confirm(ConfirmRequest {
            operator_id: args.ledger.operator,
            week_start: args.ledger.week_start,
            confirmed_amount: args.amount,
            confirmed_at: args.at,
        })?),
        LedgerCommand::Confirmations(args) => {
            let confirmations = api.confirmations(&args.operator, args.week_start)?;
            emit_json(serde_json::json!({ "confirmations": confirmations }))
        }
        LedgerCommand::Status(args) => emit(&api.status(&args.operator, args.week_start)?),
    }
}

fn run_ledger_save(args: LedgerSaveArgs, api: &CommissionLedgerApi) -> Result<()> {
    let mut by_day = BTreeMap::new();
    for assignment in args.assignments {
        if by_day.insert(assignment.date, assignment.assigned_amount).is_some() {
            return Err(anyhow!(
                "day {} appears more than once in --assign",
                assignment.date
            ));
        }
    }

    if args.accept_suggested {
        if let WindowOutcome::Ready(drafts) = api.reconcile(args.ledger.week_start)? {
            let draft =
                drafts.into_iter().find(|draft| draft.operator_id == args.ledger.operator);
            if let Some(draft) = draft {
                for entry in draft.entries {
                    by_day.entry(entry.date).or_insert(entry.assigned_amount);
                }
            }
        }
    }
    if by_day.is_empty() {
        return Err(anyhow!(
            "nothing to save for operator {} week {}: pass --assign or --accept-suggested",
            args.ledger.operator,
            args.ledger.week_start
        ));
    }

    let saved = api.save(SaveLedgerRequest {
        operator_id: args.ledger.operator,
        week_start: args.ledger.week_start,
        entries: by_day
            .into_iter()
            .map(|(date, assigned_amount)| DayAssignment { date, assigned_amount })
            .collect(),
    })?;
    emit(&saved)
}
