//! Big-integer token amounts.
//!
//! Amounts are decimal strings on disk and on the wire, and [`ethnum::U256`]
//! in memory.  They never pass through floats, so canonical JSON hashing
//! sees the same bytes on every node.

use std::fmt;
use std::str::FromStr;

use ethnum::U256;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::errors::ParseError;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Amount(U256);

impl Amount {
    pub const ZERO: Amount = Amount(U256::ZERO);

    pub fn new(v: u64) -> Self {
        Self(U256::from(v))
    }

    pub fn is_zero(&self) -> bool {
        self.0 == U256::ZERO
    }

    pub fn checked_add(&self, other: Amount) -> Option<Amount> {
        self.0.checked_add(other.0).map(Amount)
    }

    pub fn checked_sub(&self, other: Amount) -> Option<Amount> {
        self.0.checked_sub(other.0).map(Amount)
    }
}

impl From<u64> for Amount {
    fn from(v: u64) -> Self {
        Amount::new(v)
    }
}

impl FromStr for Amount {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        U256::from_str_radix(s, 10)
            .map(Amount)
            .map_err(|_| ParseError::InvalidAmount(s.to_owned()))
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // Legacy documents sometimes carry plain integers; accept them on
        // read, always write strings.
        let v = serde_json::Value::deserialize(deserializer)?;
        amount_from_value(&v).map_err(serde::de::Error::custom)
    }
}

/// Parses an amount out of a JSON value, accepting a decimal string or a
/// non-negative integer.
pub fn amount_from_value(v: &serde_json::Value) -> Result<Amount, ParseError> {
    match v {
        serde_json::Value::String(s) => s.parse(),
        serde_json::Value::Number(n) => n
            .as_u64()
            .map(Amount::new)
            .ok_or_else(|| ParseError::InvalidAmount(n.to_string())),
        other => Err(ParseError::InvalidAmount(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decimal_string_roundtrip() {
        let a: Amount = "340282366920938463463374607431768211456".parse().unwrap();
        let s = serde_json::to_string(&a).unwrap();
        assert_eq!(s, "\"340282366920938463463374607431768211456\"");
        let back: Amount = serde_json::from_str(&s).unwrap();
        assert_eq!(back, a);
    }

    #[test]
    fn test_accepts_integer_json() {
        let a: Amount = serde_json::from_str("42").unwrap();
        assert_eq!(a, Amount::new(42));
    }

    #[test]
    fn test_rejects_negative_and_garbage() {
        assert!(serde_json::from_str::<Amount>("-1").is_err());
        assert!(serde_json::from_str::<Amount>("\"12x\"").is_err());
    }

    #[test]
    fn test_checked_math() {
        let a = Amount::new(5);
        assert_eq!(a.checked_add(Amount::new(7)), Some(Amount::new(12)));
        assert_eq!(a.checked_sub(Amount::new(7)), None);
    }
}
