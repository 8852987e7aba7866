use serde::{Deserialize, Serialize};

use crate::{Amount, CommissionError};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum InterpolationMode {
    /// Amount of the greatest threshold at or below the stitch count.
    #[default]
    Step,
    /// Straight line between neighbouring tiers, flat after the last one.
    Linear,
}

impl InterpolationMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Step => "step",
            Self::Linear => "linear",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "step" => Some(Self::Step),
            "linear" => Some(Self::Linear),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub struct CommissionTier {
    pub threshold: u64,
    pub amount: Amount,
}

/// Piecewise mapping from daily stitch volume to a suggested commission.
///
/// Construction validates the tier table so that `suggest` is monotonically
/// non-decreasing and `suggest(0)` is always zero.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(try_from = "ScheduleRepr", into = "ScheduleRepr")]
pub struct CommissionSchedule {
    mode: InterpolationMode,
    tiers: Vec<CommissionTier>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ScheduleRepr {
    #[serde(default)]
    mode: InterpolationMode,
    tiers: Vec<CommissionTier>,
}

impl CommissionSchedule {
    /// Validate and build a schedule.
    ///
    /// # Errors
    /// Returns [`CommissionError::InvalidSchedule`] when the table is empty, thresholds
    /// are not strictly increasing, amounts are negative or decreasing, or a zero
    /// threshold carries a non-zero amount.
    pub fn new(mode: InterpolationMode, tiers: Vec<CommissionTier>) -> Result<Self, CommissionError> {
        if tiers.is_empty() {
            return Err(CommissionError::InvalidSchedule(
                "schedule MUST define at least one tier".to_string(),
            ));
        }

        for tier in &tiers {
            if tier.amount.is_negative() {
                return Err(CommissionError::InvalidSchedule(format!(
                    "tier amounts MUST be non-negative (threshold {} has {})",
                    tier.threshold, tier.amount
                )));
            }
            if tier.threshold == 0 && tier.amount != Amount::ZERO {
                return Err(CommissionError::InvalidSchedule(
                    "a tier at threshold 0 MUST have amount 0.00".to_string(),
                ));
            }
        }

        for pair in tiers.windows(2) {
            let (lower, upper) = (pair[0], pair[1]);
            if upper.threshold <= lower.threshold {
                return Err(CommissionError::InvalidSchedule(format!(
                    "tier thresholds MUST be strictly increasing ({} then {})",
                    lower.threshold, upper.threshold
                )));
            }
            if upper.amount < lower.amount {
                return Err(CommissionError::InvalidSchedule(format!(
                    "tier amounts MUST be non-decreasing ({} then {})",
                    lower.amount, upper.amount
                )));
            }
        }

        Ok(Self { mode, tiers })
    }

    #[must_use]
    pub fn mode(&self) -> InterpolationMode {
        self.mode
    }

    #[must_use]
    pub fn tiers(&self) -> &[CommissionTier] {
        &self.tiers
    }

    /// Suggested commission for one day's stitch count, rounded to the cent.
    #[must_use]
    pub fn suggest(&self, stitch_count: u64) -> Amount {
        let reached = self.tiers.partition_point(|tier| tier.threshold <= stitch_count);
        let floor = reached
            .checked_sub(1)
            .and_then(|index| self.tiers.get(index))
            .copied()
            .unwrap_or(CommissionTier { threshold: 0, amount: Amount::ZERO });

        match self.mode {
            InterpolationMode::Step => floor.amount,
            InterpolationMode::Linear => match self.tiers.get(reached) {
                Some(ceiling) => interpolate(floor, *ceiling, stitch_count),
                None => floor.amount,
            },
        }
    }
}

impl TryFrom<ScheduleRepr> for CommissionSchedule {
    type Error = CommissionError;

    fn try_from(value: ScheduleRepr) -> Result<Self, Self::Error> {
        Self::new(value.mode, value.tiers)
    }
}

impl From<CommissionSchedule> for ScheduleRepr {
    fn from(value: CommissionSchedule) -> Self {
        Self { mode: value.mode, tiers: value.tiers }
    }
}

// floor.threshold <= stitch_count < ceiling.threshold; rounds half up.
// rise < 2^63 and offset < 2^64, so the product always fits in u128.
fn interpolate(floor: CommissionTier, ceiling: CommissionTier, stitch_count: u64) -> Amount {
    let (Some(span), Some(offset)) = (
        ceiling.threshold.checked_sub(floor.threshold),
        stitch_count.checked_sub(floor.threshold),
    ) else {
        return floor.amount;
    };
    let Ok(rise) =
        u128::try_from(i128::from(ceiling.amount.cents()) - i128::from(floor.amount.cents()))
    else {
        return floor.amount;
    };
    if span == 0 || offset == 0 {
        return floor.amount;
    }

    let product = rise * u128::from(offset);
    let span = u128::from(span);
    let remainder = product % span;
    let mut scaled = product / span;
    if remainder >= span - remainder {
        scaled += 1;
    }

    i64::try_from(scaled)
        .ok()
        .and_then(|scaled| floor.amount.cents().checked_add(scaled))
        .map_or(ceiling.amount, |cents| Amount::from_cents(cents.min(ceiling.amount.cents())))
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn tier(threshold: u64, major: i64) -> CommissionTier {
        CommissionTier { threshold, amount: Amount::from_major(major) }
    }

    fn fixture_schedule(mode: InterpolationMode) -> CommissionSchedule {
        match CommissionSchedule::new(mode, vec![tier(0, 0), tier(500, 25), tier(1000, 60)]) {
            Ok(schedule) => schedule,
            Err(err) => panic!("fixture schedule should validate: {err}"),
        }
    }

    fn assert_schedule_error_contains(tiers: Vec<CommissionTier>, expected_substring: &str) {
        let err = match CommissionSchedule::new(InterpolationMode::Step, tiers) {
            Ok(_) => panic!("expected schedule error containing: {expected_substring}"),
            Err(err) => err,
        };
        assert!(
            err.to_string().contains(expected_substring),
            "schedule error `{err}` did not contain `{expected_substring}`"
        );
    }

    // Test IDs: TSUG-001
    #[test]
    fn step_schedule_uses_floor_match() {
        let schedule = fixture_schedule(InterpolationMode::Step);

        assert_eq!(schedule.suggest(0), Amount::ZERO);
        assert_eq!(schedule.suggest(499), Amount::ZERO);
        assert_eq!(schedule.suggest(500), Amount::from_major(25));
        assert_eq!(schedule.suggest(999), Amount::from_major(25));
        assert_eq!(schedule.suggest(1000), Amount::from_major(60));
        assert_eq!(schedule.suggest(u64::MAX), Amount::from_major(60));
    }

    // Test IDs: TSUG-002
    #[test]
    fn linear_schedule_interpolates_and_rounds_half_up() {
        let schedule = fixture_schedule(InterpolationMode::Linear);

        assert_eq!(schedule.suggest(0), Amount::ZERO);
        assert_eq!(schedule.suggest(250), Amount::from_cents(1250));
        assert_eq!(schedule.suggest(500), Amount::from_major(25));
        assert_eq!(schedule.suggest(750), Amount::from_cents(4250));
        assert_eq!(schedule.suggest(1000), Amount::from_major(60));
        assert_eq!(schedule.suggest(5000), Amount::from_major(60));

        // 7 stitches of a 0..500 ramp to 25.00 is 0.35 exactly; 1 stitch is 0.05.
        assert_eq!(schedule.suggest(7), Amount::from_cents(35));
        assert_eq!(schedule.suggest(1), Amount::from_cents(5));
    }

    // Test IDs: TSUG-003
    #[test]
    fn linear_schedule_anchors_at_zero_when_first_tier_is_positive() {
        let schedule = match CommissionSchedule::new(
            InterpolationMode::Linear,
            vec![tier(3, 1)],
        ) {
            Ok(schedule) => schedule,
            Err(err) => panic!("schedule should validate: {err}"),
        };

        assert_eq!(schedule.suggest(0), Amount::ZERO);
        assert_eq!(schedule.suggest(1), Amount::from_cents(33));
        assert_eq!(schedule.suggest(2), Amount::from_cents(67));
        assert_eq!(schedule.suggest(3), Amount::from_major(1));
    }

    // Test IDs: TSUG-004
    #[test]
    fn schedule_validation_rejects_malformed_tables() {
        assert_schedule_error_contains(vec![], "at least one tier");
        assert_schedule_error_contains(vec![tier(0, 5)], "threshold 0 MUST have amount 0.00");
        assert_schedule_error_contains(
            vec![tier(500, 25), tier(500, 30)],
            "strictly increasing",
        );
        assert_schedule_error_contains(vec![tier(500, 25), tier(1000, 20)], "non-decreasing");
        assert_schedule_error_contains(
            vec![CommissionTier { threshold: 10, amount: Amount::from_cents(-1) }],
            "non-negative",
        );
    }

    // Test IDs: TSUG-006
    #[test]
    fn linear_schedule_handles_extreme_tiers_without_overflow() {
        let top = Amount::from_cents(i64::MAX);
        let schedule = match CommissionSchedule::new(
            InterpolationMode::Linear,
            vec![CommissionTier { threshold: u64::MAX, amount: top }],
        ) {
            Ok(schedule) => schedule,
            Err(err) => panic!("schedule should validate: {err}"),
        };

        assert_eq!(schedule.suggest(u64::MAX - 1), top);
        assert_eq!(schedule.suggest(u64::MAX), top);

        let points =
            [0, 1, 1_000, u64::MAX / 4, u64::MAX / 2, u64::MAX - 2, u64::MAX - 1, u64::MAX];
        let suggestions =
            points.iter().map(|&stitches| schedule.suggest(stitches)).collect::<Vec<_>>();
        assert_eq!(suggestions[0], Amount::ZERO);
        for pair in suggestions.windows(2) {
            assert!(pair[0] <= pair[1], "suggestions not monotonic: {suggestions:?}");
        }
        assert!(suggestions.iter().all(|amount| *amount <= top));
    }

    #[test]
    fn schedule_deserializes_with_default_step_mode() {
        let parsed = serde_json::from_str::<CommissionSchedule>(
            r#"{"tiers":[{"threshold":0,"amount":0},{"threshold":500,"amount":2500}]}"#,
        );
        match parsed {
            Ok(schedule) => {
                assert_eq!(schedule.mode(), InterpolationMode::Step);
                assert_eq!(schedule.suggest(600), Amount::from_major(25));
            }
            Err(err) => panic!("schedule should deserialize: {err}"),
        }

        let invalid = serde_json::from_str::<CommissionSchedule>(
            r#"{"mode":"linear","tiers":[{"threshold":500,"amount":2500},{"threshold":100,"amount":3000}]}"#,
        );
        assert!(invalid.is_err());
    }

    fn arb_schedule() -> impl Strategy<Value = CommissionSchedule> {
        (
            prop_oneof![Just(InterpolationMode::Step), Just(InterpolationMode::Linear)],
            proptest::collection::vec((1_u64..5_000, 0_i64..10_000), 1..8),
        )
            .prop_map(|(mode, steps)| {
                let mut threshold = 0_u64;
                let mut amount = 0_i64;
                let tiers = steps
                    .into_iter()
                    .map(|(threshold_step, amount_step)| {
                        threshold += threshold_step;
                        amount += amount_step;
                        CommissionTier { threshold, amount: Amount::from_cents(amount) }
                    })
                    .collect::<Vec<_>>();
                CommissionSchedule::new(mode, tiers)
                    .unwrap_or_else(|err| unreachable!("generated schedule is valid: {err}"))
            })
    }

    // Test IDs: TSUG-005
    proptest! {
        #[test]
        fn property_suggest_is_monotonic_and_zero_at_zero(
            schedule in arb_schedule(),
            lhs in 0_u64..50_000,
            rhs in 0_u64..50_000,
        ) {
            prop_assert_eq!(schedule.suggest(0), Amount::ZERO);
            let (low, high) = if lhs <= rhs { (lhs, rhs) } else { (rhs, lhs) };
            prop_assert!(schedule.suggest(low) <= schedule.suggest(high));
            prop_assert!(!schedule.suggest(high).is_negative());
        }

        #[test]
        fn property_suggest_is_monotonic_over_full_range(
            lower in 1_u64..u64::MAX / 2,
            upper in u64::MAX / 2..=u64::MAX,
            top in 0_i64..=i64::MAX,
            lhs in any::<u64>(),
            rhs in any::<u64>(),
        ) {
            let schedule = CommissionSchedule::new(
                InterpolationMode::Linear,
                vec![
                    CommissionTier { threshold: lower, amount: Amount::from_cents(top / 2) },
                    CommissionTier { threshold: upper, amount: Amount::from_cents(top) },
                ],
            )
            .unwrap_or_else(|err| unreachable!("generated schedule is valid: {err}"));
            let (low, high) = if lhs <= rhs { (lhs, rhs) } else { (rhs, lhs) };
            prop_assert!(schedule.suggest(low) <= schedule.suggest(high));
            prop_assert!(schedule.suggest(high) <= Amount::from_cents(top));
        }
    }
}
