use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use time::Date;

use crate::{CommissionError, DailySummary, OperatorId, OrderId, ProductionRecord, WeekWindow};

/// Days with production for one operator, ascending by date.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct OperatorActivity {
    pub operator_id: OperatorId,
    pub days: Vec<DailySummary>,
}

impl OperatorActivity {
    #[must_use]
    pub fn day(&self, date: Date) -> Option<&DailySummary> {
        self.days.iter().find(|day| day.date == date)
    }

    #[must_use]
    pub fn total_stitches(&self) -> u64 {
        self.days.iter().fold(0_u64, |acc, day| acc.saturating_add(day.total_stitches))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct WeeklyAggregate {
    pub window: WeekWindow,
    /// Operators in order of first appearance in the input.
    pub operators: Vec<OperatorActivity>,
}

impl WeeklyAggregate {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.operators.is_empty()
    }

    #[must_use]
    pub fn operator(&self, operator_id: &OperatorId) -> Option<&OperatorActivity> {
        self.operators.iter().find(|activity| &activity.operator_id == operator_id)
    }
}

#[derive(Default)]
struct DayBucket<'a> {
    stitches: u64,
    orders: BTreeSet<&'a OrderId>,
}

/// Group production records into per-operator, per-day totals for one window.
///
/// # Errors
/// Returns [`CommissionError::OutOfRangeInput`] when any record falls outside the
/// window, and [`CommissionError::Validation`] when a day's stitch total overflows.
pub fn aggregate_week(
    window: WeekWindow,
    records: &[ProductionRecord],
) -> Result<WeeklyAggregate, CommissionError> {
    let mut first_seen: Vec<&OperatorId> = Vec::new();
    let mut buckets: BTreeMap<&OperatorId, BTreeMap<Date, DayBucket<'_>>> = BTreeMap::new();

    for record in records {
        if !window.contains(record.date) {
            return Err(CommissionError::OutOfRangeInput { date: record.date, window });
        }

        let days = match buckets.entry(&record.operator_id) {
            Entry::Vacant(slot) => {
                first_seen.push(&record.operator_id);
                slot.insert(BTreeMap::new())
            }
            Entry::Occupied(slot) => slot.into_mut(),
        };
        let bucket = days.entry(record.date).or_default();
        bucket.stitches = bucket.stitches.checked_add(record.stitch_count).ok_or_else(|| {
            CommissionError::Validation(format!(
                "stitch total overflows for operator {} on {}",
                record.operator_id, record.date
            ))
        })?;
        bucket.orders.insert(&record.order_id);
    }

    let operators = first_seen
        .into_iter()
        .filter_map(|operator_id| {
            let days = buckets.remove(operator_id)?;
            Some(OperatorActivity {
                operator_id: operator_id.clone(),
                days: days
                    .into_iter()
                    .map(|(date, bucket)| DailySummary {
                        date,
                        total_stitches: bucket.stitches,
                        order_count: u32::try_from(bucket.orders.len()).unwrap_or(u32::MAX),
                    })
                    .collect(),
            })
        })
        .collect();

    Ok(WeeklyAggregate { window, operators })
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use time::macros::date;
    use time::Duration;

    use super::*;

    fn fixture_window() -> WeekWindow {
        match WeekWindow::starting(date!(2024 - 06 - 03)) {
            Ok(window) => window,
            Err(err) => panic!("fixture window should be valid: {err}"),
        }
    }

    fn operator(raw: &str) -> OperatorId {
        match OperatorId::parse(raw) {
            Ok(id) => id,
            Err(err) => panic!("invalid fixture operator {raw}: {err}"),
        }
    }

    fn record(operator_id: &str, order_id: &str, date: Date, stitch_count: u64) -> ProductionRecord {
        ProductionRecord {
            operator_id: operator(operator_id),
            order_id: match OrderId::parse(order_id) {
                Ok(id) => id,
                Err(err) => panic!("invalid fixture order {order_id}: {err}"),
            },
            date,
            stitch_count,
        }
    }

    // Test IDs: TAGG-001
    #[test]
    fn aggregation_sums_stitches_and_counts_distinct_orders() {
        let records = vec![
            record("A", "ord-1", date!(2024 - 06 - 03), 600),
            record("A", "ord-1", date!(2024 - 06 - 03), 150),
            record("A", "ord-2", date!(2024 - 06 - 03), 250),
            record("A", "ord-3", date!(2024 - 06 - 05), 500),
        ];

        let aggregate = match aggregate_week(fixture_window(), &records) {
            Ok(aggregate) => aggregate,
            Err(err) => panic!("aggregation should succeed: {err}"),
        };

        assert_eq!(aggregate.operators.len(), 1);
        let activity = &aggregate.operators[0];
        assert_eq!(
            activity.days,
            vec![
                DailySummary { date: date!(2024 - 06 - 03), total_stitches: 1000, order_count: 2 },
                DailySummary { date: date!(2024 - 06 - 05), total_stitches: 500, order_count: 1 },
            ]
        );
        assert_eq!(activity.total_stitches(), 1500);
    }

    // Test IDs: TAGG-002
    #[test]
    fn aggregation_orders_days_ascending_and_operators_by_first_appearance() {
        let records = vec![
            record("B", "ord-9", date!(2024 - 06 - 07), 10),
            record("A", "ord-1", date!(2024 - 06 - 06), 20),
            record("B", "ord-8", date!(2024 - 06 - 04), 30),
            record("A", "ord-2", date!(2024 - 06 - 03), 40),
        ];

        let aggregate = match aggregate_week(fixture_window(), &records) {
            Ok(aggregate) => aggregate,
            Err(err) => panic!("aggregation should succeed: {err}"),
        };

        let operators =
            aggregate.operators.iter().map(|activity| activity.operator_id.as_str()).collect::<Vec<_>>();
        assert_eq!(operators, vec!["B", "A"]);
        for activity in &aggregate.operators {
            assert!(activity.days.windows(2).all(|pair| pair[0].date < pair[1].date));
        }
    }

    // Test IDs: TAGG-003
    #[test]
    fn aggregation_rejects_records_outside_the_window() {
        let records = vec![
            record("A", "ord-1", date!(2024 - 06 - 03), 100),
            record("A", "ord-2", date!(2024 - 06 - 10), 100),
        ];

        match aggregate_week(fixture_window(), &records) {
            Err(CommissionError::OutOfRangeInput { date, window }) => {
                assert_eq!(date, date!(2024 - 06 - 10));
                assert_eq!(window, fixture_window());
            }
            other => panic!("expected OutOfRangeInput, got {other:?}"),
        }
    }

    #[test]
    fn aggregation_of_no_records_is_empty() {
        match aggregate_week(fixture_window(), &[]) {
            Ok(aggregate) => assert!(aggregate.is_empty()),
            Err(err) => panic!("empty aggregation should succeed: {err}"),
        }
    }

    // Test IDs: TAGG-004
    proptest! {
        #[test]
        fn property_daily_totals_equal_exact_record_sums(
            raw in proptest::collection::vec((0_usize..4, 0_i64..7, 0_u64..10_000, 0_u8..5), 0..60)
        ) {
            let names = ["A", "B", "C", "D"];
            let window = fixture_window();
            let records = raw
                .iter()
                .map(|(who, offset, stitches, order)| {
                    record(
                        names[*who],
                        &format!("ord-{order}"),
                        window.start_date() + Duration::days(*offset),
                        *stitches,
                    )
                })
                .collect::<Vec<_>>();

            let aggregate = aggregate_week(window, &records);
            prop_assert!(aggregate.is_ok());
            let aggregate = aggregate.unwrap_or_else(|_| unreachable!());

            for activity in &aggregate.operators {
                prop_assert!(!activity.days.is_empty());
                for day in &activity.days {
                    let expected = records
                        .iter()
                        .filter(|r| r.operator_id == activity.operator_id && r.date == day.date)
                        .map(|r| r.stitch_count)
                        .sum::<u64>();
                    prop_assert_eq!(day.total_stitches, expected);
                }
            }

            for name in names {
                let has_records = records.iter().any(|r| r.operator_id.as_str() == name);
                prop_assert_eq!(aggregate.operator(&operator(name)).is_some(), has_records);
            }
        }
    }
}
