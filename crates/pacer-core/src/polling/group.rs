use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// A polling cadence such as `500ms`, `5s`, `1.5m`, `1h` or `1d`.
///
/// The original label is kept for display and event payloads.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PollingGroup {
    label: String,
    period: Duration,
}

impl PollingGroup {
    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

impl FromStr for PollingGroup {
    type Err = ValidationError;

    fn from_str(label: &str) -> Result<Self, Self::Err> {
        let invalid = || {
            ValidationError::new(format!(
                "invalid polling group `{label}`, expected <number>(ms|s|m|h|d)"
            ))
        };

        let split = label
            .find(|c: char| c.is_ascii_alphabetic())
            .ok_or_else(invalid)?;
        let (number, unit) = label.split_at(split);
        let value: f64 = number.parse().map_err(|_| invalid())?;
        let millis_per_unit = match unit {
            "ms" => 1.0,
            "s" => 1_000.0,
            "m" => 60_000.0,
            "h" => 3_600_000.0,
            "d" => 86_400_000.0,
            _ => return Err(invalid()),
        };

        let millis = value * millis_per_unit;
        if !millis.is_finite() || millis < 1.0 {
            return Err(ValidationError::new(format!(
                "polling group `{label}` must be at least 1ms"
            )));
        }
        Ok(Self {
            label: label.to_string(),
            period: Duration::from_millis(millis.round() as u64),
        })
    }
}

impl TryFrom<String> for PollingGroup {
    type Error = ValidationError;

    fn try_from(label: String) -> Result<Self, Self::Error> {
        label.parse()
    }
}

impl From<PollingGroup> for String {
    fn from(group: PollingGroup) -> Self {
        group.label
    }
}

impl fmt::Display for PollingGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}
