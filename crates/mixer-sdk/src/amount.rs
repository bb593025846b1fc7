//! Amounts travel as decimal strings of minor units so that no JSON number
//! ever goes through a float.

use crate::error::{Result, SdkError};

/// Parses a decimal-string amount. Signs, whitespace, fractions and
/// values that overflow `u64` are rejected.
pub fn parse_amount(s: &str) -> Result<u64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(SdkError::InvalidAmount(format!("malformed: {:?}", s)));
    }
    s.parse::<u64>()
        .map_err(|_| SdkError::InvalidAmount(format!("out of range: {}", s)))
}

pub fn format_amount(amount: u64) -> String {
    amount.to_string()
}

/// `#[serde(with = "mixer_sdk::amount::decimal")]` for `u64` fields.
pub mod decimal {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        let s = String::deserialize(deserializer)?;
        super::parse_amount(&s).map_err(de::Error::custom)
    }
}
