use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

/// Value of an item as published on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemValue {
    /// Position of a rollershutter-like item (0 = fully up, 100 = fully down).
    Percent(u8),

    /// Numeric reading, e.g. a temperature.
    Decimal(Decimal),

    /// Anything else, passed through verbatim.
    String(String),
}

impl fmt::Display for ItemValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemValue::Percent(p) => write!(f, "{}", p),
            ItemValue::Decimal(d) => write!(f, "{}", d),
            ItemValue::String(s) => f.write_str(s),
        }
    }
}

/// Decimal number kept in the exact textual form the device reported
///
/// Serialized as a string so no digits are lost on the way to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Decimal(String);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("{0:?} is not a finite decimal number")]
pub struct InvalidDecimal(String);

impl Decimal {
    /// Nearest `f64`; may round values with many significant digits
    pub fn as_f64(&self) -> f64 {
        // Validated in from_str
        self.0.parse().unwrap_or(f64::NAN)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Decimal {
    type Err = InvalidDecimal;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.parse::<f64>() {
            Ok(d) if d.is_finite() => Ok(Self(s.to_string())),
            _ => Err(InvalidDecimal(s.to_string())),
        }
    }
}

impl TryFrom<String> for Decimal {
    type Error = InvalidDecimal;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Decimal> for String {
    fn from(d: Decimal) -> Self {
        d.0
    }
}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Centralized snapshot of the entire engine state.
#[derive(Debug, Clone, Default, Serialize)]
pub struct State {
    pub items: HashMap<String, ItemValue>,
}
