//! Human-readable durations for config files.
//!
//! Accepted forms: `"250ms"`, `"30s"`, `"5m"`, `"1h"`, or a bare integer
//! meaning seconds (either as a TOML integer or a string like `"30"`).

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serializer};

use crate::error::{ConfigError, ConfigResult};

pub fn parse_duration(input: &str) -> ConfigResult<Duration> {
    let s = input.trim();
    let err = |reason: &str| ConfigError::Duration {
        input: input.to_string(),
        reason: reason.to_string(),
    };
    if s.is_empty() {
        return Err(err("empty"));
    }

    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    let value: u64 = digits.parse().map_err(|_| err("expected a number"))?;

    match unit {
        "" | "s" => Ok(Duration::from_secs(value)),
        "ms" => Ok(Duration::from_millis(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        _ => Err(err("unknown unit, expected ms, s, m or h")),
    }
}

/// Shortest exact rendering accepted by [`parse_duration`].
pub fn format_duration(d: Duration) -> String {
    let millis = d.as_millis();
    if millis % 1000 != 0 {
        return format!("{millis}ms");
    }
    let secs = d.as_secs();
    if secs != 0 && secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs != 0 && secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{secs}s")
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Raw {
    Text(String),
    Secs(u64),
}

impl Raw {
    fn into_duration(self) -> ConfigResult<Duration> {
        match self {
            Raw::Text(s) => parse_duration(&s),
            Raw::Secs(secs) => Ok(Duration::from_secs(secs)),
        }
    }
}

/// `#[serde(with = "bulwark_core::duration::human")]`
pub mod human {
    use super::*;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Raw::deserialize(d)?
            .into_duration()
            .map_err(serde::de::Error::custom)
    }
}

/// Same as [`human`] for `Option<Duration>`.
pub mod human_opt {
    use super::*;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&format_duration(*d)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<Raw>::deserialize(d)?
            .map(Raw::into_duration)
            .transpose()
            .map_err(serde::de::Error::custom)
    }
}
