use std::collections::{BTreeMap, BTreeSet};

use crate::{
    Amount, CommissionEntry, CommissionError, CommissionSchedule, DayAssignment, OperatorActivity,
    OperatorId, WeekWindow, WeeklyAggregate, WeeklyLedger,
};

/// Merge fresh suggestions with persisted ledgers into editable drafts.
///
/// A persisted `assigned_amount` wins over the recomputed suggestion for the same
/// day. `suggested_amount`, `stitch_count`, and `order_count` always come from the
/// aggregate. Persisted days with no current activity are left out of the draft.
#[must_use]
pub fn reconcile_week(
    aggregate: &WeeklyAggregate,
    persisted: &BTreeMap<OperatorId, WeeklyLedger>,
    schedule: &CommissionSchedule,
) -> Vec<WeeklyLedger> {
    let week_start = aggregate.window.start_date();

    aggregate
        .operators
        .iter()
        .map(|activity| {
            let prior = persisted.get(&activity.operator_id);
            let entries = activity
                .days
                .iter()
                .map(|day| {
                    let suggested_amount = schedule.suggest(day.total_stitches);
                    let assigned_amount = prior
                        .and_then(|ledger| ledger.entry(day.date))
                        .map_or(suggested_amount, |entry| entry.assigned_amount);
                    CommissionEntry {
                        operator_id: activity.operator_id.clone(),
                        week_start,
                        date: day.date,
                        suggested_amount,
                        assigned_amount,
                        stitch_count: day.total_stitches,
                        order_count: day.order_count,
                    }
                })
                .collect();
            WeeklyLedger::new(activity.operator_id.clone(), week_start, entries)
        })
        .collect()
}

/// Validate a supervisor save and build the rows to upsert.
///
/// Every check runs before anything is returned, so a rejected save never yields
/// a partial set of rows.
///
/// # Errors
/// - [`CommissionError::Validation`] for an empty or duplicated day list.
/// - [`CommissionError::OutOfRangeInput`] for a date outside the window.
/// - [`CommissionError::InvalidAmount`] for an amount outside `[0, max_commission]`.
/// - [`CommissionError::NoActivity`] for a day without production for the operator.
pub fn prepare_save(
    window: WeekWindow,
    operator_id: &OperatorId,
    activity: Option<&OperatorActivity>,
    assignments: &[DayAssignment],
    schedule: &CommissionSchedule,
    max_commission: Amount,
) -> Result<Vec<CommissionEntry>, CommissionError> {
    if assignments.is_empty() {
        return Err(CommissionError::Validation(
            "save MUST include at least one day entry".to_string(),
        ));
    }

    let mut seen = BTreeSet::new();
    for assignment in assignments {
        if !window.contains(assignment.date) {
            return Err(CommissionError::OutOfRangeInput { date: assignment.date, window });
        }
        if assignment.assigned_amount.is_negative() || assignment.assigned_amount > max_commission
        {
            return Err(CommissionError::InvalidAmount {
                amount: assignment.assigned_amount,
                max: max_commission,
            });
        }
        if !seen.insert(assignment.date) {
            return Err(CommissionError::Validation(format!(
                "day {} appears more than once in the save",
                assignment.date
            )));
        }
    }

    assignments
        .iter()
        .map(|assignment| {
            let day = activity.and_then(|activity| activity.day(assignment.date)).ok_or_else(
                || CommissionError::NoActivity {
                    operator_id: operator_id.clone(),
                    date: assignment.date,
                },
            )?;
            Ok(CommissionEntry {
                operator_id: operator_id.clone(),
                week_start: window.start_date(),
                date: assignment.date,
                suggested_amount: schedule.suggest(day.total_stitches),
                assigned_amount: assignment.assigned_amount,
                stitch_count: day.total_stitches,
                order_count: day.order_count,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use time::macros::date;
    use time::Date;

    use super::*;
    use crate::{aggregate_week, CommissionTier, InterpolationMode, OrderId, ProductionRecord};

    fn fixture_window() -> WeekWindow {
        match WeekWindow::starting(date!(2024 - 06 - 03)) {
            Ok(window) => window,
            Err(err) => panic!("fixture window should be valid: {err}"),
        }
    }

    fn fixture_schedule() -> CommissionSchedule {
        let tiers = [(0, 0), (500, 25), (1000, 60), (1400, 70)]
            .into_iter()
            .map(|(threshold, major)| CommissionTier { threshold, amount: Amount::from_major(major) })
            .collect();
        match CommissionSchedule::new(InterpolationMode::Step, tiers) {
            Ok(schedule) => schedule,
            Err(err) => panic!("fixture schedule should validate: {err}"),
        }
    }

    fn operator(raw: &str) -> OperatorId {
        match OperatorId::parse(raw) {
            Ok(id) => id,
            Err(err) => panic!("invalid fixture operator {raw}: {err}"),
        }
    }

    fn record(operator_id: &str, date: Date, stitch_count: u64) -> ProductionRecord {
        ProductionRecord {
            operator_id: operator(operator_id),
            order_id: match OrderId::parse("ord-1") {
                Ok(id) => id,
                Err(err) => panic!("invalid fixture order: {err}"),
            },
            date,
            stitch_count,
        }
    }

    fn fixture_aggregate(records: &[ProductionRecord]) -> WeeklyAggregate {
        match aggregate_week(fixture_window(), records) {
            Ok(aggregate) => aggregate,
            Err(err) => panic!("fixture aggregation should succeed: {err}"),
        }
    }

    fn persisted_entry(operator_id: &str, date: Date, assigned_major: i64) -> CommissionEntry {
        CommissionEntry {
            operator_id: operator(operator_id),
            week_start: fixture_window().start_date(),
            date,
            suggested_amount: Amount::from_major(1),
            assigned_amount: Amount::from_major(assigned_major),
            stitch_count: 1,
            order_count: 1,
        }
    }

    // Test IDs: TREC-001
    #[test]
    fn reconcile_without_persisted_data_assigns_suggestions() {
        let aggregate = fixture_aggregate(&[
            record("A", date!(2024 - 06 - 03), 1000),
            record("A", date!(2024 - 06 - 05), 500),
        ]);

        let ledgers = reconcile_week(&aggregate, &BTreeMap::new(), &fixture_schedule());

        assert_eq!(ledgers.len(), 1);
        let ledger = &ledgers[0];
        assert_eq!(ledger.entries().len(), 2);
        for entry in ledger.entries() {
            assert_eq!(entry.assigned_amount, entry.suggested_amount);
        }
        assert_eq!(ledger.total_amount(), Amount::from_major(85));
    }

    // Test IDs: TREC-002
    #[test]
    fn persisted_overrides_are_sticky_while_suggestions_are_recomputed() {
        let aggregate = fixture_aggregate(&[record("A", date!(2024 - 06 - 04), 1400)]);
        let mut persisted = BTreeMap::new();
        persisted.insert(
            operator("A"),
            WeeklyLedger::new(
                operator("A"),
                fixture_window().start_date(),
                vec![persisted_entry("A", date!(2024 - 06 - 04), 50)],
            ),
        );

        let ledgers = reconcile_week(&aggregate, &persisted, &fixture_schedule());
        let entry = match ledgers[0].entry(date!(2024 - 06 - 04)) {
            Some(entry) => entry,
            None => panic!("reconciled ledger should contain Tuesday"),
        };

        assert_eq!(entry.assigned_amount, Amount::from_major(50));
        assert_eq!(entry.suggested_amount, Amount::from_major(70));
        assert_eq!(entry.stitch_count, 1400);
    }

    // Test IDs: TREC-003
    #[test]
    fn persisted_days_without_current_activity_are_not_drafted() {
        let aggregate = fixture_aggregate(&[record("A", date!(2024 - 06 - 03), 500)]);
        let mut persisted = BTreeMap::new();
        persisted.insert(
            operator("A"),
            WeeklyLedger::new(
                operator("A"),
                fixture_window().start_date(),
                vec![
                    persisted_entry("A", date!(2024 - 06 - 03), 30),
                    persisted_entry("A", date!(2024 - 06 - 08), 99),
                ],
            ),
        );

        let ledgers = reconcile_week(&aggregate, &persisted, &fixture_schedule());

        assert_eq!(ledgers[0].entries().len(), 1);
        assert_eq!(ledgers[0].total_amount(), Amount::from_major(30));
    }

    // Test IDs: TREC-004
    #[test]
    fn prepare_save_validates_before_building_rows() {
        let aggregate = fixture_aggregate(&[record("A", date!(2024 - 06 - 03), 1000)]);
        let activity = aggregate.operator(&operator("A"));
        let schedule = fixture_schedule();
        let max = Amount::from_major(500);
        let save = |assignments: &[DayAssignment]| {
            prepare_save(fixture_window(), &operator("A"), activity, assignments, &schedule, max)
        };

        assert!(matches!(save(&[]), Err(CommissionError::Validation(_))));
        assert!(matches!(
            save(&[DayAssignment {
                date: date!(2024 - 06 - 03),
                assigned_amount: Amount::from_major(-5)
            }]),
            Err(CommissionError::InvalidAmount { .. })
        ));
        assert!(matches!(
            save(&[DayAssignment {
                date: date!(2024 - 06 - 03),
                assigned_amount: Amount::from_cents(50_001)
            }]),
            Err(CommissionError::InvalidAmount { .. })
        ));
        assert!(matches!(
            save(&[DayAssignment {
                date: date!(2024 - 06 - 10),
                assigned_amount: Amount::from_major(5)
            }]),
            Err(CommissionError::OutOfRangeInput { .. })
        ));
        assert!(matches!(
            save(&[
                DayAssignment { date: date!(2024 - 06 - 03), assigned_amount: Amount::ZERO },
                DayAssignment { date: date!(2024 - 06 - 03), assigned_amount: Amount::ZERO },
            ]),
            Err(CommissionError::Validation(_))
        ));
        assert!(matches!(
            save(&[DayAssignment { date: date!(2024 - 06 - 04), assigned_amount: Amount::ZERO }]),
            Err(CommissionError::NoActivity { .. })
        ));

        let rows = match save(&[DayAssignment {
            date: date!(2024 - 06 - 03),
            assigned_amount: Amount::from_major(500),
        }]) {
            Ok(rows) => rows,
            Err(err) => panic!("boundary amount should be accepted: {err}"),
        };
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].suggested_amount, Amount::from_major(60));
        assert_eq!(rows[0].stitch_count, 1000);
    }
}
