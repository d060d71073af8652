//! Alert levels and the threshold evaluator.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::model::Thresholds;

/// Alert level of one evaluation, ordered by severity.
///
/// A device that has never been evaluated has no level at all; callers model
/// that as `Option<AlertLevel>` (`None` is the "no data" state).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    /// Both avg and max below amber.
    Normal,
    /// avg or max at or above amber, both below red.
    Amber,
    /// avg or max at or above red.
    Red,
}

impl AlertLevel {
    /// All levels, lowest first.
    pub const ALL: [AlertLevel; 3] = [Self::Normal, Self::Amber, Self::Red];

    /// Stable lowercase name, used in storage and templates.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Amber => "amber",
            Self::Red => "red",
        }
    }

    /// Whether this level warrants notifying contacts.
    #[must_use]
    pub fn is_elevated(&self) -> bool {
        *self >= Self::Amber
    }

    /// The legacy `(amber_alert, red_alert)` flag pair.
    ///
    /// Red implies amber: a red bucket was also at or above amber.
    #[must_use]
    pub fn flags(&self) -> (bool, bool) {
        match self {
            Self::Normal => (false, false),
            Self::Amber => (true, false),
            Self::Red => (true, true),
        }
    }
}

impl fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlertLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "normal" => Ok(Self::Normal),
            "amber" => Ok(Self::Amber),
            "red" => Ok(Self::Red),
            other => Err(format!("unknown alert level '{other}'")),
        }
    }
}

/// Map bucket statistics onto an alert level.
///
/// Red wins over amber, amber over normal. Comparisons are inclusive.
#[must_use]
pub fn evaluate(avg: f64, max: f64, amber: f64, red: f64) -> AlertLevel {
    if avg >= red || max >= red {
        AlertLevel::Red
    } else if avg >= amber || max >= amber {
        AlertLevel::Amber
    } else {
        AlertLevel::Normal
    }
}

/// [`evaluate`] against a device's thresholds.
#[must_use]
pub fn evaluate_with(avg: f64, max: f64, thresholds: &Thresholds) -> AlertLevel {
    evaluate(avg, max, thresholds.amber, thresholds.red)
}
