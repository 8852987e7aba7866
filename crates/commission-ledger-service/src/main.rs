use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use commission_ledger_api::{
    CommissionConfig, CommissionLedgerApi, ConfirmRequest, LedgerStatus, MigrateResult,
    OperatorListing, RecordProductionRequest, RecordProductionResult, RegisterOperatorRequest,
    SaveLedgerRequest, API_CONTRACT_VERSION,
};
use commission_ledger_core::{
    parse_date, Amount, CommissionError, ConfirmationEvent, DayAssignment, LedgerView, Lookup,
    OperatorId, WeeklyAggregate, WindowOutcome,
};
use commission_ledger_store_sqlite::SchemaStatus;
use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const STORE_UNAVAILABLE_MESSAGE: &str = "ledger store is unavailable, retry later";

#[derive(Debug, Clone)]
struct ServiceState {
    api: CommissionLedgerApi,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    #[serde(skip)]
    status: StatusCode,
    service_contract_version: &'static str,
    error: String,
}

type ServiceResult<T> = Result<Json<ServiceEnvelope<T>>, ServiceError>;

#[derive(Debug, Clone, Deserialize)]
struct MigrateRequest {
    #[serde(default)]
    dry_run: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct SaveLedgerBody {
    entries: Vec<DayAssignment>,
}

#[derive(Debug, Clone, Deserialize)]
struct ConfirmBody {
    confirmed_amount: Amount,
    #[serde(default, with = "time::serde::rfc3339::option")]
    confirmed_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Parser)]
#[command(name = "commission-ledger-service")]
#[command(about = "Local HTTP service for the weekly commission ledger")]
struct Args {
    #[arg(long, default_value = "./commission_ledger.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4010")]
    bind: SocketAddr,
    /// YAML commission schedule; built-in defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,
}

impl ServiceError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self { status, service_contract_version: SERVICE_CONTRACT_VERSION, error: message.into() }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn unavailable() -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, STORE_UNAVAILABLE_MESSAGE)
    }
}

impl From<anyhow::Error> for ServiceError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast_ref::<CommissionError>() {
            Some(CommissionError::AdapterFailure(source)) => {
                warn!(operation = source.operation(), error = %source, "ledger store call failed");
                Self::unavailable()
            }
            Some(commission) => Self::new(StatusCode::UNPROCESSABLE_ENTITY, commission.to_string()),
            None => {
                warn!(error = %format!("{err:#}"), "ledger store session failed");
                Self::unavailable()
            }
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

fn envelope<T>(data: T) -> Json<ServiceEnvelope<T>>
where
    T: Serialize,
{
    Json(ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    })
}

fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ServiceError> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| ServiceError::bad_request(rejection.body_text()))
}

fn week_start_param(raw: &str) -> Result<Date, ServiceError> {
    parse_date(raw).map_err(|err| ServiceError::bad_request(err.to_string()))
}

fn operator_param(raw: &str) -> Result<OperatorId, ServiceError> {
    OperatorId::parse(raw).map_err(|err| ServiceError::bad_request(err.to_string()))
}

fn ledger_params(raw: &(String, String)) -> Result<(OperatorId, Date), ServiceError> {
    Ok((operator_param(&raw.0)?, week_start_param(&raw.1)?))
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/production", post(production_record))
        .route("/v1/operators", get(operators_list).post(operators_register))
        .route("/v1/weeks/:week_start/aggregate", get(week_aggregate))
        .route("/v1/weeks/:week_start/draft", get(week_draft))
        .route("/v1/ledgers/:operator_id/:week_start", get(ledger_show).put(ledger_save))
        .route("/v1/ledgers/:operator_id/:week_start/status", get(ledger_status))
        .route(
            "/v1/ledgers/:operator_id/:week_start/confirmations",
            get(confirmations_list).post(confirmations_add),
        )
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = CommissionConfig::load_or_builtin(args.config.as_deref())?;
    let state = ServiceState { api: CommissionLedgerApi::new(args.db.clone(), config) };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    info!(bind = %args.bind, db = %args.db.display(), "commission ledger service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    envelope(HealthResponse { status: "ok" })
}

async fn db_schema_version(State(state): State<ServiceState>) -> ServiceResult<SchemaStatus> {
    Ok(envelope(state.api.schema_status()?))
}

async fn db_migrate(
    State(state): State<ServiceState>,
    payload: Result<Json<MigrateRequest>, JsonRejection>,
) -> ServiceResult<MigrateResult> {
    let request = json_body(payload)?;
    Ok(envelope(state.api.migrate(request.dry_run)?))
}

async fn production_record(
    State(state): State<ServiceState>,
    payload: Result<Json<RecordProductionRequest>, JsonRejection>,
) -> ServiceResult<RecordProductionResult> {
    let request = json_body(payload)?;
    Ok(envelope(state.api.record_production(request)?))
}

async fn operators_list(State(state): State<ServiceState>) -> ServiceResult<Vec<OperatorListing>> {
    Ok(envelope(state.api.list_operators()?))
}

async fn operators_register(
    State(state): State<ServiceState>,
    payload: Result<Json<RegisterOperatorRequest>, JsonRejection>,
) -> ServiceResult<OperatorListing> {
    let request = json_body(payload)?;
    Ok(envelope(state.api.register_operator(request)?))
}

async fn week_aggregate(
    State(state): State<ServiceState>,
    Path(week_start): Path<String>,
) -> ServiceResult<WindowOutcome<WeeklyAggregate>> {
    let week_start = week_start_param(&week_start)?;
    Ok(envelope(state.api.aggregate(week_start)?))
}

async fn week_draft(
    State(state): State<ServiceState>,
    Path(week_start): Path<String>,
) -> ServiceResult<WindowOutcome<Vec<LedgerView>>> {
    let week_start = week_start_param(&week_start)?;
    Ok(envelope(state.api.reconcile(week_start)?))
}

async fn ledger_show(
    State(state): State<ServiceState>,
    Path(params): Path<(String, String)>,
) -> ServiceResult<Lookup<LedgerView>> {
    let (operator_id, week_start) = ledger_params(&params)?;
    Ok(envelope(state.api.load(&operator_id, week_start)?))
}

async fn ledger_save(
    State(state): State<ServiceState>,
    Path(params): Path<(String, String)>,
    payload: Result<Json<SaveLedgerBody>, JsonRejection>,
) -> ServiceResult<LedgerView> {
    let (operator_id, week_start) = ledger_params(&params)?;
    let body = json_body(payload)?;
    let saved =
        state.api.save(SaveLedgerRequest { operator_id, week_start, entries: body.entries })?;
    Ok(envelope(saved))
}

async fn ledger_status(
    State(state): State<ServiceState>,
    Path(params): Path<(String, String)>,
) -> ServiceResult<LedgerStatus> {
    let (operator_id, week_start) = ledger_params(&params)?;
    Ok(envelope(state.api.status(&operator_id, week_start)?))
}

async fn confirmations_list(
    State(state): State<ServiceState>,
    Path(params): Path<(String, String)>,
) -> ServiceResult<Vec<ConfirmationEvent>> {
    let (operator_id, week_start) = ledger_params(&params)?;
    Ok(envelope(state.api.confirmations(&operator_id, week_start)?))
}

async fn confirmations_add(
    State(state): State<ServiceState>,
    Path(params): Path<(String, String)>,
    payload: Result<Json<ConfirmBody>, JsonRejection>,
) -> ServiceResult<Lookup<ConfirmationEvent>> {
    let (operator_id, week_start) = ledger_params(&params)?;
    let body = json_body(payload)?;
    let outcome = state.api.confirm(ConfirmRequest {
        operator_id,
        week_start,
        confirmed_amount: body.confirmed_amount,
        confirmed_at: body.confirmed_at,
    })?;
    Ok(envelope(outcome))
}
