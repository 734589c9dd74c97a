//! Compose-style duration values
//!
//! Accepts `500ms`, `5s`, `1m30s`, `2h` or a bare integer number of seconds.

use crate::error::{Result, WardenError};
use serde::{Deserialize, Deserializer, Serializer};
use std::time::Duration;

/// Parse a compose duration string
pub fn parse_duration(input: &str) -> Result<Duration> {
    let text = input.trim();
    if text.is_empty() {
        return Err(WardenError::ConfigParse("empty duration".to_string()));
    }

    if let Ok(secs) = text.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut rest = text;
    while !rest.is_empty() {
        let digits = rest.chars().take_while(|c| c.is_ascii_digit()).count();
        if digits == 0 {
            return Err(WardenError::ConfigParse(format!("invalid duration '{}'", input)));
        }
        let value: u64 = rest[..digits]
            .parse()
            .map_err(|_| WardenError::ConfigParse(format!("invalid duration '{}'", input)))?;
        rest = &rest[digits..];

        let unit_len = rest.chars().take_while(|c| c.is_ascii_alphabetic()).count();
        let unit = &rest[..unit_len];
        rest = &rest[unit_len..];

        let part = match unit {
            "ms" => Some(Duration::from_millis(value)),
            "s" => Some(Duration::from_secs(value)),
            "m" => value.checked_mul(60).map(Duration::from_secs),
            "h" => value.checked_mul(3600).map(Duration::from_secs),
            _ => {
                return Err(WardenError::ConfigParse(format!(
                    "invalid duration unit '{}' in '{}'",
                    unit, input
                )))
            }
        };
        total = part
            .and_then(|part| total.checked_add(part))
            .ok_or_else(|| WardenError::ConfigParse(format!("duration '{}' is too large", input)))?;
    }

    Ok(total)
}

/// Render a duration the way it would be written in a project file
pub fn format_duration(duration: Duration) -> String {
    let millis = duration.as_millis();
    if millis == 0 {
        return "0s".to_string();
    }
    if millis % 1000 != 0 {
        return format!("{}ms", millis);
    }

    let mut secs = duration.as_secs();
    let mut out = String::new();
    for (unit, size) in [("h", 3600), ("m", 60)] {
        if secs >= size {
            out.push_str(&format!("{}{}", secs / size, unit));
            secs %= size;
        }
    }
    if secs > 0 {
        out.push_str(&format!("{}s", secs));
    }
    out
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Seconds(u64),
    Text(String),
}

/// serde adapter for `Option<Duration>` fields
pub mod option {
    use super::*;

    pub fn serialize<S>(value: &Option<Duration>, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(d) => serializer.serialize_some(&format_duration(*d)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Option::<RawDuration>::deserialize(deserializer)?;
        match raw {
            None => Ok(None),
            Some(RawDuration::Seconds(secs)) => Ok(Some(Duration::from_secs(secs))),
            Some(RawDuration::Text(text)) => parse_duration(&text)
                .map(Some)
                .map_err(serde::de::Error::custom),
        }
    }
}
