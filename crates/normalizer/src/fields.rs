//! Small accessors shared by the per-exchange mappers.

use crate::error::NormalizeError;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde_json::Value;
use std::str::FromStr;

pub(crate) fn field<'a>(
    row: &'a Value,
    name: &str,
    context: &str,
) -> Result<&'a Value, NormalizeError> {
    row.get(name)
        .filter(|value| !value.is_null())
        .ok_or_else(|| NormalizeError::MissingField {
            field: name.to_string(),
            context: context.to_string(),
        })
}

pub(crate) fn string(row: &Value, name: &str, context: &str) -> Result<String, NormalizeError> {
    match field(row, name, context)? {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(NormalizeError::InvalidShape(format!(
            "`{name}` in {context} is {other}"
        ))),
    }
}

/// A stable handle for a row in rejection reports: its `key` field, or its
/// position in the payload.
pub(crate) fn row_reference(row: &Value, key: &str, index: usize) -> String {
    optional_string(row, key).unwrap_or_else(|| format!("#{index}"))
}

pub(crate) fn optional_string(row: &Value, name: &str) -> Option<String> {
    match row.get(name) {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

/// Parses a JSON string or number as a decimal without going through `f64`.
pub(crate) fn parse_decimal(value: &Value, name: &str) -> Result<Decimal, NormalizeError> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    };
    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .map_err(|_| NormalizeError::InvalidNumber {
            field: name.to_string(),
            value: text,
        })
}

pub(crate) fn decimal(row: &Value, name: &str, context: &str) -> Result<Decimal, NormalizeError> {
    parse_decimal(field(row, name, context)?, name)
}

pub(crate) fn optional_decimal(row: &Value, name: &str) -> Result<Option<Decimal>, NormalizeError> {
    match row.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.is_empty() => Ok(None),
        Some(value) => parse_decimal(value, name).map(Some),
    }
}

pub(crate) fn from_millis(millis: i64) -> Result<DateTime<Utc>, NormalizeError> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| NormalizeError::InvalidTimestamp(format!("{millis} ms")))
}

pub(crate) fn millis(
    row: &Value,
    name: &str,
    context: &str,
) -> Result<DateTime<Utc>, NormalizeError> {
    let value = decimal(row, name, context)?;
    let millis = value
        .trunc()
        .to_i64()
        .ok_or_else(|| NormalizeError::InvalidTimestamp(value.to_string()))?;
    from_millis(millis)
}

/// Fractional epoch seconds, as Kraken sends them.
pub(crate) fn fractional_seconds(
    row: &Value,
    name: &str,
    context: &str,
) -> Result<DateTime<Utc>, NormalizeError> {
    let seconds = decimal(row, name, context)?;
    let millis = seconds
        .checked_mul(Decimal::ONE_THOUSAND)
        .and_then(|millis| millis.trunc().to_i64())
        .ok_or_else(|| NormalizeError::InvalidTimestamp(seconds.to_string()))?;
    from_millis(millis)
}

/// RFC 3339 with offset, or `YYYY-MM-DD HH:MM:SS` taken as UTC.
pub(crate) fn datetime(
    row: &Value,
    name: &str,
    context: &str,
) -> Result<DateTime<Utc>, NormalizeError> {
    let text = string(row, name, context)?;
    if let Ok(parsed) = DateTime::parse_from_rfc3339(&text) {
        return Ok(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(&text, "%Y-%m-%d %H:%M:%S")
        .map(|naive| naive.and_utc())
        .map_err(|_| NormalizeError::InvalidTimestamp(text))
}
