use std::fmt::{Display, Formatter};
use std::iter::Sum;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::macros::format_description;
use time::{Date, Duration, OffsetDateTime, Weekday};
use ulid::Ulid;

use crate::CommissionError;

/// Parse an ISO calendar date (`YYYY-MM-DD`).
///
/// # Errors
/// Returns [`CommissionError::Validation`] when the input is not a valid date.
pub fn parse_date(raw: &str) -> Result<Date, CommissionError> {
    Date::parse(raw.trim(), format_description!("[year]-[month]-[day]"))
        .map_err(|err| CommissionError::Validation(format!("invalid date {raw:?}: {err}")))
}

#[must_use]
pub fn format_date(date: Date) -> String {
    date.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct OperatorId(String);

impl OperatorId {
    /// # Errors
    /// Returns [`CommissionError::Validation`] when the identifier is blank.
    pub fn parse(raw: &str) -> Result<Self, CommissionError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(CommissionError::Validation("operator_id MUST be non-empty".to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for OperatorId {
    type Error = CommissionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<OperatorId> for String {
    fn from(value: OperatorId) -> Self {
        value.0
    }
}

impl Display for OperatorId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct OrderId(String);

impl OrderId {
    /// # Errors
    /// Returns [`CommissionError::Validation`] when the identifier is blank.
    pub fn parse(raw: &str) -> Result<Self, CommissionError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(CommissionError::Validation("order_id MUST be non-empty".to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for OrderId {
    type Error = CommissionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<OrderId> for String {
    fn from(value: OrderId) -> Self {
        value.0
    }
}

impl Display for OrderId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Monetary amount held in minor currency units (cents).
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash,
)]
#[serde(transparent)]
pub struct Amount(i64);

impl Amount {
    pub const ZERO: Self = Self(0);

    #[must_use]
    pub const fn from_cents(cents: i64) -> Self {
        Self(cents)
    }

    #[must_use]
    pub const fn from_major(units: i64) -> Self {
        Self(units.saturating_mul(100))
    }

    #[must_use]
    pub const fn cents(self) -> i64 {
        self.0
    }

    #[must_use]
    pub const fn is_negative(self) -> bool {
        self.0 < 0
    }

    #[must_use]
    pub fn saturating_add(self, other: Self) -> Self {
        Self(self.0.saturating_add(other.0))
    }
}

impl Display for Amount {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let magnitude = self.0.unsigned_abs();
        write!(f, "{sign}{}.{:02}", magnitude / 100, magnitude % 100)
    }
}

impl FromStr for Amount {
    type Err = CommissionError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let invalid = || {
            CommissionError::Validation(format!(
                "amount MUST be a decimal with at most two fractional digits: {raw:?}"
            ))
        };

        let trimmed = raw.trim();
        let (negative, digits) = match trimmed.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, trimmed),
        };
        let (whole, fraction) = digits.split_once('.').unwrap_or((digits, ""));
        let is_digits = |value: &str| value.bytes().all(|byte| byte.is_ascii_digit());
        if whole.is_empty()
            || !is_digits(whole)
            || fraction.len() > 2
            || !is_digits(fraction)
            || (digits.contains('.') && fraction.is_empty())
        {
            return Err(invalid());
        }

        let whole = whole.parse::<i64>().map_err(|_| invalid())?;
        let fraction_cents = match fraction.len() {
            0 => 0,
            1 => fraction.parse::<i64>().map_err(|_| invalid())? * 10,
            _ => fraction.parse::<i64>().map_err(|_| invalid())?,
        };
        let cents = whole
            .checked_mul(100)
            .and_then(|value| value.checked_add(fraction_cents))
            .ok_or_else(invalid)?;

        Ok(Self(if negative { -cents } else { cents }))
    }
}

impl Sum for Amount {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::ZERO, Self::saturating_add)
    }
}

/// A Monday-anchored seven day commission period.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "WeekWindowRepr", into = "WeekWindowRepr")]
pub struct WeekWindow {
    start_date: Date,
    end_date: Date,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct WeekWindowRepr {
    start_date: Date,
    #[serde(default)]
    end_date: Option<Date>,
}

impl WeekWindow {
    /// # Errors
    /// Returns [`CommissionError::InvalidWindow`] when `start_date` is not a Monday.
    pub fn starting(start_date: Date) -> Result<Self, CommissionError> {
        if start_date.weekday() != Weekday::Monday {
            return Err(CommissionError::InvalidWindow(start_date));
        }
        let end_date = start_date
            .checked_add(Duration::days(6))
            .ok_or(CommissionError::InvalidWindow(start_date))?;
        Ok(Self { start_date, end_date })
    }

    /// Window anchored at the Monday on or before `date`.
    ///
    /// # Errors
    /// Returns [`CommissionError::InvalidWindow`] when the week falls outside the
    /// representable calendar.
    pub fn containing(date: Date) -> Result<Self, CommissionError> {
        let offset = i64::from(date.weekday().number_days_from_monday());
        let start_date =
            date.checked_sub(Duration::days(offset)).ok_or(CommissionError::InvalidWindow(date))?;
        Self::starting(start_date)
    }

    #[must_use]
    pub fn start_date(self) -> Date {
        self.start_date
    }

    #[must_use]
    pub fn end_date(self) -> Date {
        self.end_date
    }

    #[must_use]
    pub fn contains(self, date: Date) -> bool {
        self.start_date <= date && date <= self.end_date
    }

    pub fn days(self) -> impl Iterator<Item = Date> {
        (0..7).filter_map(move |offset| self.start_date.checked_add(Duration::days(offset)))
    }
}

impl TryFrom<WeekWindowRepr> for WeekWindow {
    type Error = CommissionError;

    fn try_from(value: WeekWindowRepr) -> Result<Self, Self::Error> {
        let window = Self::starting(value.start_date)?;
        if let Some(end_date) = value.end_date {
            if end_date != window.end_date {
                return Err(CommissionError::Validation(format!(
                    "end_date MUST be start_date + 6 days (expected {}, got {end_date})",
                    window.end_date
                )));
            }
        }
        Ok(window)
    }
}

impl From<WeekWindow> for WeekWindowRepr {
    fn from(value: WeekWindow) -> Self {
        Self { start_date: value.start_date, end_date: Some(value.end_date) }
    }
}

impl Display for WeekWindow {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..{}", self.start_date, self.end_date)
    }
}

/// One raw production event logged upstream.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ProductionRecord {
    pub operator_id: OperatorId,
    pub order_id: OrderId,
    pub date: Date,
    pub stitch_count: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct DailySummary {
    pub date: Date,
    pub total_stitches: u64,
    pub order_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CommissionEntry {
    pub operator_id: OperatorId,
    pub week_start: Date,
    pub date: Date,
    pub suggested_amount: Amount,
    pub assigned_amount: Amount,
    pub stitch_count: u64,
    pub order_count: u32,
}

/// An operator's per-day commission entries for one window.
///
/// Totals are always derived from the entries; there is no stored total that
/// could drift from its components.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct WeeklyLedger {
    pub operator_id: OperatorId,
    pub week_start: Date,
    entries: Vec<CommissionEntry>,
}

impl WeeklyLedger {
    #[must_use]
    pub fn new(operator_id: OperatorId, week_start: Date, mut entries: Vec<CommissionEntry>) -> Self {
        entries.sort_by_key(|entry| entry.date);
        Self { operator_id, week_start, entries }
    }

    #[must_use]
    pub fn entries(&self) -> &[CommissionEntry] {
        &self.entries
    }

    #[must_use]
    pub fn entry(&self, date: Date) -> Option<&CommissionEntry> {
        self.entries.iter().find(|entry| entry.date == date)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn total_amount(&self) -> Amount {
        self.entries.iter().map(|entry| entry.assigned_amount).sum()
    }

    #[must_use]
    pub fn total_suggested(&self) -> Amount {
        self.entries.iter().map(|entry| entry.suggested_amount).sum()
    }

    #[must_use]
    pub fn total_stitches(&self) -> u64 {
        self.entries.iter().fold(0_u64, |acc, entry| acc.saturating_add(entry.stitch_count))
    }

    #[must_use]
    pub fn total_orders(&self) -> u64 {
        self.entries.iter().map(|entry| u64::from(entry.order_count)).sum()
    }

    #[must_use]
    pub fn view(&self) -> LedgerView {
        LedgerView {
            operator_id: self.operator_id.clone(),
            week_start: self.week_start,
            entries: self.entries.clone(),
            total_amount: self.total_amount(),
            total_suggested: self.total_suggested(),
            total_stitches: self.total_stitches(),
            total_orders: self.total_orders(),
        }
    }
}

/// Render-time snapshot of a [`WeeklyLedger`] with its derived totals.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct LedgerView {
    pub operator_id: OperatorId,
    pub week_start: Date,
    pub entries: Vec<CommissionEntry>,
    pub total_amount: Amount,
    pub total_suggested: Amount,
    pub total_stitches: u64,
    pub total_orders: u64,
}

/// Supervisor's final value for one day of a ledger.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct DayAssignment {
    pub date: Date,
    pub assigned_amount: Amount,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ConfirmationId(pub Ulid);

impl ConfirmationId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for ConfirmationId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for ConfirmationId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Append-only attestation that an operator reviewed a weekly total.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ConfirmationEvent {
    pub confirmation_id: ConfirmationId,
    pub operator_id: OperatorId,
    pub week_start: Date,
    pub confirmed_amount: Amount,
    #[serde(with = "time::serde::rfc3339")]
    pub confirmed_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LedgerState {
    NoData,
    Draft,
    Saved,
    Confirmed { confirmations: usize },
}

impl LedgerState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoData => "no_data",
            Self::Draft => "draft",
            Self::Saved => "saved",
            Self::Confirmed { .. } => "confirmed",
        }
    }
}
