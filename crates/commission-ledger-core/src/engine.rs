use std::collections::{BTreeMap, BTreeSet};

use time::{Date, OffsetDateTime};
use tracing::{debug, info, warn};

use crate::{
    aggregate_week, prepare_save, reconcile_week, AdapterError, Amount, CommissionError,
    CommissionSchedule, ConfirmationEvent, ConfirmationId, DayAssignment, LedgerState, LedgerStore,
    Lookup, OperatorId, WeekWindow, WeeklyAggregate, WeeklyLedger, WindowOutcome,
};

/// Aggregation, reconciliation and confirmation over an injected [`LedgerStore`].
///
/// The engine holds no state between calls beyond its configuration. Two engines
/// over the same store see each other's writes, and concurrent saves to the same
/// day resolve as last-writer-wins inside the store.
#[derive(Debug, Clone)]
pub struct CommissionEngine<S> {
    store: S,
    schedule: CommissionSchedule,
    max_commission: Amount,
}

impl<S: LedgerStore> CommissionEngine<S> {
    /// # Errors
    /// Returns [`CommissionError::Validation`] when `max_commission` is negative.
    pub fn new(
        store: S,
        schedule: CommissionSchedule,
        max_commission: Amount,
    ) -> Result<Self, CommissionError> {
        if max_commission.is_negative() {
            return Err(CommissionError::Validation(format!(
                "max_commission MUST be non-negative (got {max_commission})"
            )));
        }
        Ok(Self { store, schedule, max_commission })
    }

    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    #[must_use]
    pub fn schedule(&self) -> &CommissionSchedule {
        &self.schedule
    }

    #[must_use]
    pub fn max_commission(&self) -> Amount {
        self.max_commission
    }

    /// Fetch the window's records and group them per operator and day.
    ///
    /// # Errors
    /// Returns [`CommissionError::OutOfRangeInput`] when the store hands back a record
    /// outside the window, or [`CommissionError::AdapterFailure`] when the fetch fails.
    pub fn aggregate(
        &self,
        window: WeekWindow,
    ) -> Result<WindowOutcome<WeeklyAggregate>, CommissionError> {
        let records = through_store(self.store.fetch_records(window))?;
        let aggregate = aggregate_week(window, &records)?;
        debug!(
            window = %window,
            records = records.len(),
            operators = aggregate.operators.len(),
            "aggregated production records"
        );
        if aggregate.is_empty() {
            return Ok(WindowOutcome::NoDataForWindow);
        }
        Ok(WindowOutcome::Ready(aggregate))
    }

    /// Build editable drafts for every active operator, keeping persisted overrides.
    ///
    /// # Errors
    /// Same as [`Self::aggregate`], plus adapter failures while reading ledgers.
    pub fn reconcile(
        &self,
        window: WeekWindow,
    ) -> Result<WindowOutcome<Vec<WeeklyLedger>>, CommissionError> {
        let WindowOutcome::Ready(aggregate) = self.aggregate(window)? else {
            return Ok(WindowOutcome::NoDataForWindow);
        };

        let mut persisted = BTreeMap::new();
        for activity in &aggregate.operators {
            let fetched = through_store(
                self.store.fetch_ledger(&activity.operator_id, window.start_date()),
            )?;
            if let Some(ledger) = fetched {
                persisted.insert(activity.operator_id.clone(), ledger);
            }
        }

        let drafts = reconcile_week(&aggregate, &persisted, &self.schedule);
        debug!(
            window = %window,
            drafts = drafts.len(),
            persisted = persisted.len(),
            "reconciled weekly drafts"
        );
        Ok(WindowOutcome::Ready(drafts))
    }

    /// Persist supervisor-final amounts and return the ledger as stored.
    ///
    /// Validation covers every day before the single upsert call; a rejected save
    /// leaves the store untouched.
    ///
    /// # Errors
    /// - [`CommissionError::InvalidWindow`] when `week_start` is not a Monday.
    /// - [`CommissionError::Validation`], [`CommissionError::OutOfRangeInput`],
    ///   [`CommissionError::InvalidAmount`], [`CommissionError::NoActivity`] from
    ///   day validation.
    /// - [`CommissionError::AdapterFailure`] when the store cannot be read or written.
    pub fn save(
        &self,
        operator_id: &OperatorId,
        week_start: Date,
        assignments: &[DayAssignment],
    ) -> Result<WeeklyLedger, CommissionError> {
        let window = WeekWindow::starting(week_start)?;
        let records = through_store(self.store.fetch_records(window))?;
        let aggregate = aggregate_week(window, &records)?;
        let entries = prepare_save(
            window,
            operator_id,
            aggregate.operator(operator_id),
            assignments,
            &self.schedule,
            self.max_commission,
        )?;

        through_store(self.store.upsert_ledger_entries(operator_id, week_start, &entries))?;
        let ledger = through_store(self.store.fetch_ledger(operator_id, week_start))?
            .ok_or_else(|| {
                CommissionError::AdapterFailure(AdapterError::new(
                    "fetch_ledger",
                    "ledger missing immediately after upsert",
                ))
            })?;

        info!(
            operator_id = %operator_id,
            week_start = %week_start,
            days = entries.len(),
            total_amount = %ledger.total_amount(),
            "saved commission ledger"
        );
        Ok(ledger)
    }

    /// Read the persisted ledger without recomputation.
    ///
    /// # Errors
    /// Returns [`CommissionError::InvalidWindow`] for a non-Monday `week_start`, or
    /// [`CommissionError::AdapterFailure`] when the read fails.
    pub fn load(
        &self,
        operator_id: &OperatorId,
        week_start: Date,
    ) -> Result<Lookup<WeeklyLedger>, CommissionError> {
        WeekWindow::starting(week_start)?;
        match through_store(self.store.fetch_ledger(operator_id, week_start))? {
            Some(ledger) if !ledger.is_empty() => Ok(Lookup::Found(ledger)),
            _ => Ok(Lookup::NotFound),
        }
    }

    /// Record that the operator reviewed `confirmed_amount` for the week.
    ///
    /// The amount is stored as reported; ledger entries are never touched. Weeks
    /// without a saved ledger cannot be confirmed and yield [`Lookup::NotFound`].
    ///
    /// # Errors
    /// Returns [`CommissionError::InvalidWindow`] for a non-Monday `week_start`,
    /// [`CommissionError::InvalidAmount`] for a negative amount, or
    /// [`CommissionError::AdapterFailure`] when the store fails.
    pub fn confirm(
        &self,
        operator_id: &OperatorId,
        week_start: Date,
        confirmed_amount: Amount,
        confirmed_at: OffsetDateTime,
    ) -> Result<Lookup<ConfirmationEvent>, CommissionError> {
        WeekWindow::starting(week_start)?;
        if confirmed_amount.is_negative() {
            return Err(CommissionError::InvalidAmount {
                amount: confirmed_amount,
                max: self.max_commission,
            });
        }
        if self.load(operator_id, week_start)?.is_not_found() {
            return Ok(Lookup::NotFound);
        }

        let event = ConfirmationEvent {
            confirmation_id: ConfirmationId::new(),
            operator_id: operator_id.clone(),
            week_start,
            confirmed_amount,
            confirmed_at,
        };
        through_store(self.store.append_confirmation(&event))?;
        info!(
            operator_id = %operator_id,
            week_start = %week_start,
            confirmation_id = %event.confirmation_id,
            confirmed_amount = %confirmed_amount,
            "recorded ledger confirmation"
        );
        Ok(Lookup::Found(event))
    }

    /// # Errors
    /// Returns [`CommissionError::InvalidWindow`] for a non-Monday `week_start`, or
    /// [`CommissionError::AdapterFailure`] when the read fails.
    pub fn confirmations(
        &self,
        operator_id: &OperatorId,
        week_start: Date,
    ) -> Result<Vec<ConfirmationEvent>, CommissionError> {
        WeekWindow::starting(week_start)?;
        through_store(self.store.list_confirmations(operator_id, week_start))
    }

    /// Where the operator's week stands: no records, draft only, saved, or confirmed.
    ///
    /// # Errors
    /// Same as [`Self::aggregate`] and [`Self::load`].
    pub fn status(
        &self,
        operator_id: &OperatorId,
        window: WeekWindow,
    ) -> Result<LedgerState, CommissionError> {
        let week_start = window.start_date();
        let confirmations = self.confirmations(operator_id, week_start)?.len();
        if confirmations > 0 {
            return Ok(LedgerState::Confirmed { confirmations });
        }
        if !self.load(operator_id, week_start)?.is_not_found() {
            return Ok(LedgerState::Saved);
        }
        let active = match self.aggregate(window)? {
            WindowOutcome::Ready(aggregate) => aggregate.operator(operator_id).is_some(),
            WindowOutcome::NoDataForWindow => false,
        };
        Ok(if active { LedgerState::Draft } else { LedgerState::NoData })
    }

    /// # Errors
    /// Returns [`CommissionError::AdapterFailure`] when the read fails.
    pub fn list_operators(&self) -> Result<BTreeSet<OperatorId>, CommissionError> {
        through_store(self.store.list_known_operators())
    }
}

fn through_store<T>(result: Result<T, AdapterError>) -> Result<T, CommissionError> {
    result.map_err(|err| {
        warn!(operation = err.operation(), error = %err, "ledger store call failed");
        CommissionError::AdapterFailure(err)
    })
}
