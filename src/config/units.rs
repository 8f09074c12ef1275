// Human-friendly units used in ecosystem files: "10s", "500ms", "1G", or bare numbers

use crate::error::{CorralError, Result};
use chrono::format::{Item, StrftimeItems};
use serde::{Deserialize, Deserializer};
use std::time::Duration;

/// Parse a duration string. Bare numbers are milliseconds, matching PM2.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let s = input.trim();
    if s.is_empty() {
        return Err(CorralError::ConfigError("empty duration".to_string()));
    }

    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);

    let value: u64 = digits
        .parse()
        .map_err(|_| CorralError::ConfigError(format!("invalid duration: '{}'", input)))?;

    let duration = match unit.trim() {
        "" | "ms" => Duration::from_millis(value),
        "s" => Duration::from_secs(value),
        "m" => Duration::from_secs(value.saturating_mul(60)),
        "h" => Duration::from_secs(value.saturating_mul(3600)),
        other => {
            return Err(CorralError::ConfigError(format!(
                "unknown duration unit '{}' in '{}'",
                other, input
            )))
        }
    };

    Ok(duration)
}

/// Parse a memory size. Suffixes are binary multiples (K, M, G), case-insensitive.
pub fn parse_memory(input: &str) -> Result<u64> {
    let s = input.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);

    let value: u64 = digits
        .parse()
        .map_err(|_| CorralError::ConfigError(format!("invalid memory size: '{}'", input)))?;

    let multiplier: u64 = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" => 1024,
        "M" | "MB" => 1024 * 1024,
        "G" | "GB" => 1024 * 1024 * 1024,
        other => {
            return Err(CorralError::ConfigError(format!(
                "unknown memory unit '{}' in '{}'",
                other, input
            )))
        }
    };

    value
        .checked_mul(multiplier)
        .ok_or_else(|| CorralError::ConfigError(format!("memory size overflows: '{}'", input)))
}

/// moment.js tokens accepted in `log_date_format`, longest first
const MOMENT_TOKENS: [(&str, &str); 21] = [
    ("YYYY", "%Y"),
    ("YY", "%y"),
    ("MMMM", "%B"),
    ("MMM", "%b"),
    ("MM", "%m"),
    ("M", "%-m"),
    ("dddd", "%A"),
    ("ddd", "%a"),
    ("DD", "%d"),
    ("D", "%-d"),
    ("HH", "%H"),
    ("H", "%-H"),
    ("hh", "%I"),
    ("h", "%-I"),
    ("mm", "%M"),
    ("ss", "%S"),
    ("SSS", "%3f"),
    ("ZZ", "%z"),
    ("Z", "%:z"),
    ("A", "%p"),
    ("a", "%P"),
];

/// Normalize a log timestamp format to strftime.
///
/// A format containing `%` is taken as strftime already. Anything else is
/// read as a moment.js pattern such as `YYYY-MM-DD HH:mm:ss Z`, with
/// `[...]` quoting literal text.
pub fn parse_date_format(input: &str) -> Result<String> {
    if input.trim().is_empty() {
        return Err(CorralError::ConfigError("empty log_date_format".to_string()));
    }

    let strftime = if input.contains('%') {
        input.to_string()
    } else {
        moment_to_strftime(input)?
    };

    if StrftimeItems::new(&strftime).any(|item| matches!(item, Item::Error)) {
        return Err(CorralError::ConfigError(format!(
            "invalid log_date_format: '{}'",
            input
        )));
    }
    Ok(strftime)
}

fn moment_to_strftime(input: &str) -> Result<String> {
    let mut out = String::with_capacity(input.len() * 2);
    let mut rest = input;

    while let Some(c) = rest.chars().next() {
        if c == '[' {
            let end = rest.find(']').ok_or_else(|| {
                CorralError::ConfigError(format!("unclosed '[' in log_date_format '{}'", input))
            })?;
            out.push_str(&rest[1..end]);
            rest = &rest[end + 1..];
            continue;
        }

        match MOMENT_TOKENS.iter().find(|(token, _)| rest.starts_with(token)) {
            Some((token, strftime)) => {
                out.push_str(strftime);
                rest = &rest[token.len()..];
            }
            None => {
                out.push(c);
                rest = &rest[c.len_utf8()..];
            }
        }
    }

    Ok(out)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrString {
    Number(u64),
    Text(String),
}

/// Serde helpers for `Duration` fields
pub mod duration {
    use super::*;

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        match NumberOrString::deserialize(deserializer)? {
            NumberOrString::Number(ms) => Ok(Duration::from_millis(ms)),
            NumberOrString::Text(s) => parse_duration(&s).map_err(serde::de::Error::custom),
        }
    }

    pub fn serialize<S>(value: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u64(value.as_millis() as u64)
    }
}

/// Serde helpers for `Option<Duration>` fields
pub mod opt_duration {
    use super::*;

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        super::duration::deserialize(deserializer).map(Some)
    }

    pub fn serialize<S>(
        value: &Option<Duration>,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }
}

/// Serde helpers for optional memory ceilings
pub mod opt_memory {
    use super::*;

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Option<u64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match NumberOrString::deserialize(deserializer)? {
            NumberOrString::Number(bytes) => Ok(Some(bytes)),
            NumberOrString::Text(s) => parse_memory(&s).map(Some).map_err(serde::de::Error::custom),
        }
    }

    pub fn serialize<S>(value: &Option<u64>, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match value {
            Some(bytes) => serializer.serialize_some(bytes),
            None => serializer.serialize_none(),
        }
    }
}
