//! Weekly commission engine: aggregation of production records, suggested
//! commissions, reconciliation against persisted ledgers, and the operator
//! confirmation trail.

use std::error::Error as StdError;

use serde::{Deserialize, Serialize};
use time::Date;

mod aggregate;
mod engine;
mod model;
mod reconcile;
mod schedule;
mod store;

pub use aggregate::{aggregate_week, OperatorActivity, WeeklyAggregate};
pub use engine::CommissionEngine;
pub use model::{
    format_date, parse_date, Amount, CommissionEntry, ConfirmationEvent, ConfirmationId,
    DailySummary, DayAssignment, LedgerState, LedgerView, OperatorId, OrderId, ProductionRecord,
    WeekWindow, WeeklyLedger,
};
pub use reconcile::{prepare_save, reconcile_week};
pub use schedule::{CommissionSchedule, CommissionTier, InterpolationMode};
pub use store::{InMemoryStore, LedgerStore};

#[derive(Debug, thiserror::Error)]
pub enum CommissionError {
    #[error("out of range input: date {date} is outside window {window}")]
    OutOfRangeInput { date: Date, window: WeekWindow },
    #[error("invalid amount: {amount} is outside the allowed range [0.00, {max}]")]
    InvalidAmount { amount: Amount, max: Amount },
    #[error("invalid window: week start {0} is not a Monday")]
    InvalidWindow(Date),
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),
    #[error("operator {operator_id} has no production recorded on {date}")]
    NoActivity { operator_id: OperatorId, date: Date },
    #[error("validation error: {0}")]
    Validation(String),
    #[error(transparent)]
    AdapterFailure(#[from] AdapterError),
}

impl CommissionError {
    /// True for errors caused by caller input rather than the store.
    #[must_use]
    pub fn is_validation(&self) -> bool {
        !matches!(self, Self::AdapterFailure(_))
    }
}

/// Failure reported by a [`LedgerStore`] implementation, passed through unchanged.
#[derive(Debug, thiserror::Error)]
#[error("store operation `{operation}` failed: {source}")]
pub struct AdapterError {
    operation: &'static str,
    #[source]
    source: Box<dyn StdError + Send + Sync>,
}

impl AdapterError {
    pub fn new(operation: &'static str, source: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        Self { operation, source: source.into() }
    }

    #[must_use]
    pub fn operation(&self) -> &'static str {
        self.operation
    }
}

/// Result of a window-scoped read: either data or the expected "nothing yet" state.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "status", content = "data", rename_all = "snake_case")]
pub enum WindowOutcome<T> {
    NoDataForWindow,
    Ready(T),
}

impl<T> WindowOutcome<T> {
    #[must_use]
    pub fn ready(self) -> Option<T> {
        match self {
            Self::Ready(value) => Some(value),
            Self::NoDataForWindow => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> WindowOutcome<U> {
        match self {
            Self::Ready(value) => WindowOutcome::Ready(f(value)),
            Self::NoDataForWindow => WindowOutcome::NoDataForWindow,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "status", content = "data", rename_all = "snake_case")]
pub enum Lookup<T> {
    Found(T),
    NotFound,
}

impl<T> Lookup<T> {
    #[must_use]
    pub fn found(self) -> Option<T> {
        match self {
            Self::Found(value) => Some(value),
            Self::NotFound => None,
        }
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Lookup<U> {
        match self {
            Self::Found(value) => Lookup::Found(f(value)),
            Self::NotFound => Lookup::NotFound,
        }
    }
}
