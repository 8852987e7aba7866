use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use time::Date;

use crate::{
    AdapterError, CommissionEntry, ConfirmationEvent, OperatorId, ProductionRecord, WeekWindow,
    WeeklyLedger,
};

/// Persistence contract the engine is written against.
///
/// Implementations own their own timeouts and retry policy; the engine surfaces
/// any [`AdapterError`] unchanged.
pub trait LedgerStore {
    /// Production records dated inside `window`.
    ///
    /// # Errors
    /// Returns [`AdapterError`] when the records cannot be read.
    fn fetch_records(&self, window: WeekWindow) -> Result<Vec<ProductionRecord>, AdapterError>;

    /// Persisted ledger for one operator and week, or `None` when nothing was saved.
    ///
    /// # Errors
    /// Returns [`AdapterError`] when the ledger cannot be read.
    fn fetch_ledger(
        &self,
        operator_id: &OperatorId,
        week_start: Date,
    ) -> Result<Option<WeeklyLedger>, AdapterError>;

    /// Insert or overwrite every entry keyed by `(operator_id, week_start, date)`.
    /// All entries are applied atomically.
    ///
    /// # Errors
    /// Returns [`AdapterError`] when the write fails; nothing is persisted in that case.
    fn upsert_ledger_entries(
        &self,
        operator_id: &OperatorId,
        week_start: Date,
        entries: &[CommissionEntry],
    ) -> Result<(), AdapterError>;

    /// # Errors
    /// Returns [`AdapterError`] when the event cannot be appended.
    fn append_confirmation(&self, event: &ConfirmationEvent) -> Result<(), AdapterError>;

    /// Confirmation events for one operator and week, oldest first.
    ///
    /// # Errors
    /// Returns [`AdapterError`] when the events cannot be read.
    fn list_confirmations(
        &self,
        operator_id: &OperatorId,
        week_start: Date,
    ) -> Result<Vec<ConfirmationEvent>, AdapterError>;

    /// # Errors
    /// Returns [`AdapterError`] when the operator set cannot be read.
    fn list_known_operators(&self) -> Result<BTreeSet<OperatorId>, AdapterError>;
}

impl<T: LedgerStore + ?Sized> LedgerStore for &T {
    fn fetch_records(&self, window: WeekWindow) -> Result<Vec<ProductionRecord>, AdapterError> {
        (**self).fetch_records(window)
    }

    fn fetch_ledger(
        &self,
        operator_id: &OperatorId,
        week_start: Date,
    ) -> Result<Option<WeeklyLedger>, AdapterError> {
        (**self).fetch_ledger(operator_id, week_start)
    }

    fn upsert_ledger_entries(
        &self,
        operator_id: &OperatorId,
        week_start: Date,
        entries: &[CommissionEntry],
    ) -> Result<(), AdapterError> {
        (**self).upsert_ledger_entries(operator_id, week_start, entries)
    }

    fn append_confirmation(&self, event: &ConfirmationEvent) -> Result<(), AdapterError> {
        (**self).append_confirmation(event)
    }

    fn list_confirmations(
        &self,
        operator_id: &OperatorId,
        week_start: Date,
    ) -> Result<Vec<ConfirmationEvent>, AdapterError> {
        (**self).list_confirmations(operator_id, week_start)
    }

    fn list_known_operators(&self) -> Result<BTreeSet<OperatorId>, AdapterError> {
        (**self).list_known_operators()
    }
}

impl<T: LedgerStore + ?Sized> LedgerStore for Arc<T> {
    fn fetch_records(&self, window: WeekWindow) -> Result<Vec<ProductionRecord>, AdapterError> {
        (**self).fetch_records(window)
    }

    fn fetch_ledger(
        &self,
        operator_id: &OperatorId,
        week_start: Date,
    ) -> Result<Option<WeeklyLedger>, AdapterError> {
        (**self).fetch_ledger(operator_id, week_start)
    }

    fn upsert_ledger_entries(
        &self,
        operator_id: &OperatorId,
        week_start: Date,
        entries: &[CommissionEntry],
    ) -> Result<(), AdapterError> {
        (**self).upsert_ledger_entries(operator_id, week_start, entries)
    }

    fn append_confirmation(&self, event: &ConfirmationEvent) -> Result<(), AdapterError> {
        (**self).append_confirmation(event)
    }

    fn list_confirmations(
        &self,
        operator_id: &OperatorId,
        week_start: Date,
    ) -> Result<Vec<ConfirmationEvent>, AdapterError> {
        (**self).list_confirmations(operator_id, week_start)
    }

    fn list_known_operators(&self) -> Result<BTreeSet<OperatorId>, AdapterError> {
        (**self).list_known_operators()
    }
}

type EntryKey = (OperatorId, Date, Date);

#[derive(Debug, Default)]
struct MemoryState {
    records: Vec<ProductionRecord>,
    entries: BTreeMap<EntryKey, CommissionEntry>,
    confirmations: Vec<ConfirmationEvent>,
    roster: BTreeSet<OperatorId>,
}

/// Process-local [`LedgerStore`]; every call runs under a single mutex.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<MemoryState>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_records(records: Vec<ProductionRecord>) -> Self {
        Self { state: Mutex::new(MemoryState { records, ..MemoryState::default() }) }
    }

    /// # Errors
    /// Returns [`AdapterError`] when the store mutex is poisoned.
    pub fn append_records(
        &self,
        records: impl IntoIterator<Item = ProductionRecord>,
    ) -> Result<(), AdapterError> {
        self.lock("append_records")?.records.extend(records);
        Ok(())
    }

    /// # Errors
    /// Returns [`AdapterError`] when the store mutex is poisoned.
    pub fn register_operator(&self, operator_id: OperatorId) -> Result<(), AdapterError> {
        self.lock("register_operator")?.roster.insert(operator_id);
        Ok(())
    }

    fn lock(&self, operation: &'static str) -> Result<MutexGuard<'_, MemoryState>, AdapterError> {
        self.state.lock().map_err(|_| AdapterError::new(operation, "in-memory store mutex poisoned"))
    }
}

impl LedgerStore for InMemoryStore {
    fn fetch_records(&self, window: WeekWindow) -> Result<Vec<ProductionRecord>, AdapterError> {
        let state = self.lock("fetch_records")?;
        Ok(state.records.iter().filter(|record| window.contains(record.date)).cloned().collect())
    }

    fn fetch_ledger(
        &self,
        operator_id: &OperatorId,
        week_start: Date,
    ) -> Result<Option<WeeklyLedger>, AdapterError> {
        let state = self.lock("fetch_ledger")?;
        let entries = state
            .entries
            .iter()
            .filter(|((operator, week, _), _)| operator == operator_id && *week == week_start)
            .map(|(_, entry)| entry.clone())
            .collect::<Vec<_>>();
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
        let mut state = self.lock("upsert_ledger_entries")?;
        for entry in entries {
            state.entries.insert((operator_id.clone(), week_start, entry.date), entry.clone());
        }
        Ok(())
    }

    fn append_confirmation(&self, event: &ConfirmationEvent) -> Result<(), AdapterError> {
        self.lock("append_confirmation")?.confirmations.push(event.clone());
        Ok(())
    }

    fn list_confirmations(
        &self,
        operator_id: &OperatorId,
        week_start: Date,
    ) -> Result<Vec<ConfirmationEvent>, AdapterError> {
        let state = self.lock("list_confirmations")?;
        let mut events = state
            .confirmations
            .iter()
            .filter(|event| &event.operator_id == operator_id && event.week_start == week_start)
            .cloned()
            .collect::<Vec<_>>();
        events.sort_by(|lhs, rhs| {
            lhs.confirmed_at
                .cmp(&rhs.confirmed_at)
                .then_with(|| lhs.confirmation_id.cmp(&rhs.confirmation_id))
        });
        Ok(events)
    }

    fn list_known_operators(&self) -> Result<BTreeSet<OperatorId>, AdapterError> {
        let state = self.lock("list_known_operators")?;
        let mut operators = state.roster.clone();
        operators.extend(state.entries.keys().map(|(operator_id, _, _)| operator_id.clone()));
        Ok(operators)
    }
}

#[cfg(test)]
mod tests {
    use time::macros::{date, datetime};

    use super::*;
    use crate::{Amount, ConfirmationId, OrderId};

    fn operator(raw: &str) -> OperatorId {
        match OperatorId::parse(raw) {
            Ok(id) => id,
            Err(err) => panic!("invalid fixture operator {raw}: {err}"),
        }
    }

    fn record(operator_id: &str, date: Date) -> ProductionRecord {
        ProductionRecord {
            operator_id: operator(operator_id),
            order_id: match OrderId::parse("ord-1") {
                Ok(id) => id,
                Err(err) => panic!("invalid fixture order: {err}"),
            },
            date,
            stitch_count: 100,
        }
    }

    fn entry(operator_id: &str, date: Date, assigned_major: i64) -> CommissionEntry {
        CommissionEntry {
            operator_id: operator(operator_id),
            week_start: date!(2024 - 06 - 03),
            date,
            suggested_amount: Amount::ZERO,
            assigned_amount: Amount::from_major(assigned_major),
            stitch_count: 100,
            order_count: 1,
        }
    }

    fn fixture_window() -> WeekWindow {
        match WeekWindow::starting(date!(2024 - 06 - 03)) {
            Ok(window) => window,
            Err(err) => panic!("fixture window should be valid: {err}"),
        }
    }

    #[test]
    fn fetch_records_filters_to_the_window() {
        let store = InMemoryStore::with_records(vec![
            record("A", date!(2024 - 06 - 02)),
            record("A", date!(2024 - 06 - 03)),
            record("B", date!(2024 - 06 - 09)),
            record("B", date!(2024 - 06 - 10)),
        ]);

        let fetched = match store.fetch_records(fixture_window()) {
            Ok(records) => records,
            Err(err) => panic!("fetch should succeed: {err}"),
        };
        let dates = fetched.iter().map(|record| record.date).collect::<Vec<_>>();
        assert_eq!(dates, vec![date!(2024 - 06 - 03), date!(2024 - 06 - 09)]);
    }

    #[test]
    fn upsert_overwrites_by_day_key_and_keeps_other_days() {
        let store = InMemoryStore::new();
        let week_start = date!(2024 - 06 - 03);
        let operator_id = operator("A");

        let first = [entry("A", date!(2024 - 06 - 03), 10), entry("A", date!(2024 - 06 - 04), 20)];
        let second = [entry("A", date!(2024 - 06 - 04), 35)];
        for batch in [&first[..], &second[..]] {
            if let Err(err) = store.upsert_ledger_entries(&operator_id, week_start, batch) {
                panic!("upsert should succeed: {err}");
            }
        }

        let ledger = match store.fetch_ledger(&operator_id, week_start) {
            Ok(Some(ledger)) => ledger,
            other => panic!("expected persisted ledger, got {other:?}"),
        };
        assert_eq!(ledger.entries().len(), 2);
        assert_eq!(ledger.total_amount(), Amount::from_major(45));

        match store.fetch_ledger(&operator("B"), week_start) {
            Ok(None) => {}
            other => panic!("expected no ledger for B, got {other:?}"),
        }
    }

    #[test]
    fn confirmations_are_append_only_and_ordered() {
        let store = InMemoryStore::new();
        let later = ConfirmationEvent {
            confirmation_id: ConfirmationId::new(),
            operator_id: operator("A"),
            week_start: date!(2024 - 06 - 03),
            confirmed_amount: Amount::from_major(85),
            confirmed_at: datetime!(2024-06-10 12:00 UTC),
        };
        let earlier = ConfirmationEvent {
            confirmation_id: ConfirmationId::new(),
            confirmed_amount: Amount::from_major(80),
            confirmed_at: datetime!(2024-06-10 09:00 UTC),
            ..later.clone()
        };
        for event in [&later, &earlier, &later] {
            if let Err(err) = store.append_confirmation(event) {
                panic!("append should succeed: {err}");
            }
        }

        let events = match store.list_confirmations(&operator("A"), date!(2024 - 06 - 03)) {
            Ok(events) => events,
            Err(err) => panic!("listing should succeed: {err}"),
        };
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].confirmed_amount, Amount::from_major(80));
    }

    #[test]
    fn known_operators_union_roster_and_ledgers() {
        let store = InMemoryStore::new();
        if let Err(err) = store.register_operator(operator("roster-only")) {
            panic!("register should succeed: {err}");
        }
        if let Err(err) = store.upsert_ledger_entries(
            &operator("A"),
            date!(2024 - 06 - 03),
            &[entry("A", date!(2024 - 06 - 03), 5)],
        ) {
            panic!("upsert should succeed: {err}");
        }

        let known = match store.list_known_operators() {
            Ok(known) => known,
            Err(err) => panic!("listing should succeed: {err}"),
        };
        let names = known.iter().map(OperatorId::as_str).collect::<Vec<_>>();
        assert_eq!(names, vec!["A", "roster-only"]);
    }

    #[test]
    fn shared_references_implement_the_store_contract() {
        fn count_records(store: impl LedgerStore, window: WeekWindow) -> usize {
            store.fetch_records(window).map_or(0, |records| records.len())
        }

        let store = Arc::new(InMemoryStore::with_records(vec![record("A", date!(2024 - 06 - 05))]));
        assert_eq!(count_records(&*store, fixture_window()), 1);
        assert_eq!(count_records(Arc::clone(&store), fixture_window()), 1);
    }
}
