//! Core domain types
//!
//! Defines the vocabulary shared across the workspace:
//! - The two agent kinds and the operations they perform
//! - Fixed-point monetary amounts
//! - String identifiers for business records and ledger references

use crate::error::CoreError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Autonomous agent kinds governed by Custos
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    /// Carrier-failover agent
    Paolo,
    /// Dispute-resolution agent
    Giulia,
}

impl AgentKind {
    /// All agent kinds, in declaration order
    pub const ALL: [AgentKind; 2] = [AgentKind::Paolo, AgentKind::Giulia];

    /// Persistence tag
    #[inline]
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Paolo => "paolo",
            Self::Giulia => "giulia",
        }
    }

    /// Actor identifier used in audit rows for AI-originated events
    #[inline]
    #[must_use]
    pub fn ai_actor(self) -> String {
        format!("ai:{}", self.as_str())
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "paolo" => Ok(Self::Paolo),
            "giulia" => Ok(Self::Giulia),
            other => Err(CoreError::UnknownTag {
                kind: "agent",
                value: other.to_string(),
            }),
        }
    }
}

/// Operation performed by a governed action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Move a shipment to another carrier
    CarrierFailover,
    /// Settle a customer dispute
    DisputeResolution,
    /// Emergency failover issued by a blacklist
    Containment,
}

impl OperationKind {
    /// Persistence tag
    #[inline]
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CarrierFailover => "carrier_failover",
            Self::DisputeResolution => "dispute_resolution",
            Self::Containment => "containment",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "carrier_failover" => Ok(Self::CarrierFailover),
            "dispute_resolution" => Ok(Self::DisputeResolution),
            "containment" => Ok(Self::Containment),
            other => Err(CoreError::UnknownTag {
                kind: "operation",
                value: other.to_string(),
            }),
        }
    }
}

/// Euro amount held as integer cents
///
/// Parses and prints with two decimals (`"7500.00"`). Configuration files may
/// also give whole euros as integers (`5000`) or plain floats.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Money(i64);

impl Money {
    /// Zero euros
    pub const ZERO: Money = Money(0);

    /// Create from cents
    #[inline]
    #[must_use]
    pub const fn from_cents(cents: i64) -> Self {
        Self(cents)
    }

    /// Create from whole euros
    #[inline]
    #[must_use]
    pub const fn from_euros(euros: i64) -> Self {
        Self(euros * 100)
    }

    /// Amount in cents
    #[inline]
    #[must_use]
    pub const fn cents(self) -> i64 {
        self.0
    }

    /// Amount in euros as a float, for logging and ratios only
    #[inline]
    #[must_use]
    pub fn as_f64(self) -> f64 {
        self.0 as f64 / 100.0
    }

    /// Saturating addition
    #[inline]
    #[must_use]
    pub const fn saturating_add(self, other: Money) -> Money {
        Money(self.0.saturating_add(other.0))
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{sign}{}.{:02}", abs / 100, abs % 100)
    }
}

/// Failure to parse a monetary amount
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid amount '{input}': {reason}")]
pub struct MoneyParseError {
    /// Offending input
    pub input: String,
    /// What was wrong
    pub reason: &'static str,
}

impl FromStr for Money {
    type Err = MoneyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = |reason| MoneyParseError {
            input: s.to_string(),
            reason,
        };
        let trimmed = s
            .trim()
            .trim_start_matches('€')
            .trim_end_matches("EUR")
            .trim()
            .replace('_', "");
        let (negative, digits) = match trimmed.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, trimmed.as_str()),
        };
        let (whole, frac) = digits.split_once('.').unwrap_or((digits, ""));
        if whole.is_empty() || !whole.chars().all(|c| c.is_ascii_digit()) {
            return Err(err("expected digits before the decimal point"));
        }
        if frac.len() > 2 || !frac.chars().all(|c| c.is_ascii_digit()) {
            return Err(err("at most two decimal digits are allowed"));
        }
        let euros: i64 = whole.parse().map_err(|_| err("amount out of range"))?;
        let cents: i64 = match frac.len() {
            0 => 0,
            1 => frac.parse::<i64>().map_err(|_| err("bad cents"))? * 10,
            _ => frac.parse().map_err(|_| err("bad cents"))?,
        };
        let total = euros
            .checked_mul(100)
            .and_then(|v| v.checked_add(cents))
            .ok_or_else(|| err("amount out of range"))?;
        Ok(Money(if negative { -total } else { total }))
    }
}

impl Serialize for Money {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Money {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Whole(i64),
            Float(f64),
            Text(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Whole(euros) => Ok(Money::from_euros(euros)),
            Repr::Float(value) => Ok(Money((value * 100.0).round() as i64)),
            Repr::Text(text) => text.parse().map_err(serde::de::Error::custom),
        }
    }
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Create from any string-like value
            #[inline]
            #[must_use]
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Borrow the raw identifier
            #[inline]
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Shipment reference (business key for failovers)
    ShipmentId
);
string_id!(
    /// Carrier (counterparty) reference
    CarrierId
);
string_id!(
    /// Dispute reference (business key for resolutions)
    DisputeId
);
string_id!(
    /// Transaction hash returned by the external ledger
    LedgerHash
);

/// Veto session identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Generate new session ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn money_parses_common_forms() {
        assert_eq!("7500".parse::<Money>().unwrap(), Money::from_euros(7_500));
        assert_eq!("7500.5".parse::<Money>().unwrap(), Money::from_cents(750_050));
        assert_eq!("€2,000".replace(',', "").parse::<Money>().unwrap(), Money::from_euros(2_000));
        assert_eq!("-3.20".parse::<Money>().unwrap(), Money::from_cents(-320));
        assert!("12.345".parse::<Money>().is_err());
        assert!("abc".parse::<Money>().is_err());
    }

    #[test]
    fn money_display_has_two_decimals() {
        assert_eq!(Money::from_euros(60_000).to_string(), "60000.00");
        assert_eq!(Money::from_cents(-5).to_string(), "-0.05");
    }

    #[test]
    fn money_deserializes_from_numbers_and_strings() {
        let whole: Money = serde_json::from_str("5000").unwrap();
        let float: Money = serde_json::from_str("10.25").unwrap();
        let text: Money = serde_json::from_str("\"50000.00\"").unwrap();
        assert_eq!(whole, Money::from_euros(5_000));
        assert_eq!(float, Money::from_cents(1_025));
        assert_eq!(text, Money::from_euros(50_000));
    }

    #[test]
    fn agent_kind_tags() {
        assert_eq!("PAOLO".parse::<AgentKind>().unwrap(), AgentKind::Paolo);
        assert_eq!(AgentKind::Giulia.ai_actor(), "ai:giulia");
        assert!("marco".parse::<AgentKind>().is_err());
    }

    #[test]
    fn operation_kind_round_trips_through_tag() {
        for op in [
            OperationKind::CarrierFailover,
            OperationKind::DisputeResolution,
            OperationKind::Containment,
        ] {
            assert_eq!(op.as_str().parse::<OperationKind>().unwrap(), op);
        }
    }
}
