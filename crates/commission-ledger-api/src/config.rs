//! Commission configuration loaded from YAML.

use std::path::Path;

use commission_ledger_core::{
    Amount, CommissionError, CommissionSchedule, CommissionTier, InterpolationMode,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const BUILTIN_CONFIG_YAML: &str = r#"
max_commission: "500.00"
schedule:
  mode: step
  tiers:
    - threshold: 0
      amount: "0.00"
    - threshold: 500
      amount: "25.00"
    - threshold: 1000
      amount: "60.00"
"#;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("config YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Validation(String),
}

impl From<CommissionError> for ConfigError {
    fn from(value: CommissionError) -> Self {
        Self::Validation(value.to_string())
    }
}

/// Suggestion schedule plus the per-day cap on assigned amounts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommissionConfig {
    pub max_commission: Amount,
    pub schedule: CommissionSchedule,
}

/// Decimal amount as written in YAML: `"25.00"`, `25`, or `25.5`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum AmountInput {
    Whole(i64),
    Decimal(f64),
    Text(String),
}

impl AmountInput {
    fn resolve(&self, field: &str) -> Result<Amount, ConfigError> {
        let parsed = match self {
            Self::Whole(units) => return Ok(Amount::from_major(*units)),
            Self::Decimal(value) => value.to_string().parse::<Amount>(),
            Self::Text(raw) => raw.parse::<Amount>(),
        };
        parsed.map_err(|err| ConfigError::Validation(format!("{field}: {err}")))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    max_commission: AmountInput,
    schedule: ScheduleFile,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct ScheduleFile {
    #[serde(default)]
    mode: InterpolationMode,
    tiers: Vec<TierFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct TierFile {
    threshold: u64,
    amount: AmountInput,
}

impl CommissionConfig {
    /// Built-in step schedule `{0: 0.00, 500: 25.00, 1000: 60.00}` capped at 500.00.
    ///
    /// # Errors
    /// Never fails for the shipped defaults; the signature matches [`Self::parse`].
    pub fn builtin() -> Result<Self, ConfigError> {
        Self::parse(BUILTIN_CONFIG_YAML)
    }

    /// Load from `path`, or the built-in defaults when no path is given.
    ///
    /// # Errors
    /// Returns [`ConfigError`] when the file cannot be read, parsed, or validated.
    pub fn load_or_builtin(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => Self::builtin(),
        }
    }

    /// # Errors
    /// Returns [`ConfigError`] when the file cannot be read, parsed, or validated.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// # Errors
    /// Returns [`ConfigError`] when the YAML is malformed or the values are invalid.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = serde_yaml::from_str(yaml)?;

        let max_commission = file.max_commission.resolve("max_commission")?;
        if max_commission.is_negative() {
            return Err(ConfigError::Validation(format!(
                "max_commission MUST be non-negative (got {max_commission})"
            )));
        }

        let tiers = file
            .schedule
            .tiers
            .iter()
            .map(|tier| {
                Ok(CommissionTier {
                    threshold: tier.threshold,
                    amount: tier.amount.resolve(&format!("tier {}", tier.threshold))?,
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;
        let schedule = CommissionSchedule::new(file.schedule.mode, tiers)?;

        if let Some(top) = schedule.tiers().last() {
            if top.amount > max_commission {
                return Err(ConfigError::Validation(format!(
                    "highest tier amount {} MUST NOT exceed max_commission {max_commission}",
                    top.amount
                )));
            }
        }

        Ok(Self { max_commission, schedule })
    }
}
