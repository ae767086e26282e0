//! Serde adapters that store integers as decimal strings.
//!
//! Cache records only hold strings and chain integers exceed the range a
//! JavaScript or JSON double can carry, so every numeric field is written as
//! an exact base-10 string and parsed back without any float round trip.

use alloy_primitives::U256;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serializer};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecimalError {
    #[error("empty decimal string")]
    Empty,
    #[error("invalid decimal digit in {0:?}")]
    InvalidDigit(String),
    #[error("decimal {0:?} overflows the target integer")]
    Overflow(String),
}

pub fn parse_u256(raw: &str) -> Result<U256, DecimalError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(DecimalError::Empty);
    }
    if !trimmed.bytes().all(|byte| byte.is_ascii_digit()) {
        return Err(DecimalError::InvalidDigit(trimmed.to_string()));
    }
    U256::from_str_radix(trimmed, 10).map_err(|_| DecimalError::Overflow(trimmed.to_string()))
}

pub fn parse_u64(raw: &str) -> Result<u64, DecimalError> {
    let value = parse_u256(raw)?;
    u64::try_from(value).map_err(|_| DecimalError::Overflow(raw.trim().to_string()))
}

pub mod u256 {
    use super::*;

    pub fn serialize<S: Serializer>(value: &U256, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<U256, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse_u256(&raw).map_err(D::Error::custom)
    }
}

pub mod option_u256 {
    use super::*;

    pub fn serialize<S: Serializer>(value: &Option<U256>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(inner) => serializer.collect_str(inner),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<U256>, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        raw.map(|value| parse_u256(&value).map_err(D::Error::custom))
            .transpose()
    }
}

pub mod u64 {
    use super::*;

    pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse_u64(&raw).map_err(D::Error::custom)
    }
}
